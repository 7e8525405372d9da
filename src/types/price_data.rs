use ethers::types::Address;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;

use super::conversions::address_to_string;
use super::pool_data::TokenInfo;

fn checksummed<S: Serializer>(addr: &Address, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&address_to_string(*addr))
}

fn checksummed_keys<S: Serializer, V: Serialize>(
    map: &BTreeMap<Address, V>,
    s: S,
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeMap;
    let mut out = s.serialize_map(Some(map.len()))?;
    for (k, v) in map {
        out.serialize_entry(&address_to_string(*k), v)?;
    }
    out.end()
}

/// Display-truncated prices for one pool, at the reference and adjustment amounts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolPrices {
    pub eth_to_token_price: String,
    pub token_to_eth_price: String,
    /// Adjustment amount used, in the reference asset's smallest unit.
    pub adjustment: String,
    pub eth_to_token_price_price_adjust: String,
    pub token_to_eth_price_price_adjust: String,
}

/// Latest prices of one token across all pools pairing it with the reference asset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceEntry {
    pub name: String,
    pub symbol: String,
    #[serde(serialize_with = "checksummed")]
    pub address: Address,
    pub decimals: u8,
    #[serde(serialize_with = "checksummed_keys")]
    pub pools: BTreeMap<Address, PoolPrices>,
}

impl PriceEntry {
    pub fn for_token(token: &TokenInfo) -> Self {
        Self {
            name: token.name.clone(),
            symbol: token.symbol.clone(),
            address: token.address,
            decimals: token.decimals,
            pools: BTreeMap::new(),
        }
    }
}

/// Head of the chain as seen by this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockState {
    pub current_block: u64,
    /// Unix milliseconds of the last accepted block notification.
    pub current_block_time: i64,
}

impl BlockState {
    /// Moves the head forward. Returns false (and changes nothing) for blocks at or below it.
    pub fn advance(&mut self, block: u64, now_ms: i64) -> bool {
        if block <= self.current_block {
            return false;
        }
        self.current_block = block;
        self.current_block_time = now_ms;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_state_never_goes_back() {
        let mut state = BlockState::default();
        assert!(state.advance(10, 1_000));
        assert!(!state.advance(9, 2_000));
        assert!(!state.advance(10, 3_000));
        assert_eq!(state.current_block, 10);
        assert_eq!(state.current_block_time, 1_000);
        assert!(state.advance(11, 4_000));
        assert_eq!(state.current_block_time, 4_000);
    }

    #[test]
    fn test_price_entry_json_shape() {
        let token = TokenInfo {
            address: Address::repeat_byte(0xab),
            symbol: "ABC".into(),
            name: "Abc Token".into(),
            decimals: 9,
        };
        let mut entry = PriceEntry::for_token(&token);
        entry.pools.insert(
            Address::repeat_byte(0x01),
            PoolPrices {
                eth_to_token_price: "42.1234".into(),
                token_to_eth_price: "43.0000".into(),
                adjustment: "1000000000000000000".into(),
                eth_to_token_price_price_adjust: "40.1".into(),
                token_to_eth_price_price_adjust: "44.2".into(),
            },
        );

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["symbol"], "ABC");
        assert_eq!(json["decimals"], 9);
        let pool = &json["pools"]["0x0101010101010101010101010101010101010101"];
        assert_eq!(pool["ethToTokenPrice"], "42.1234");
        assert_eq!(pool["tokenToEthPricePriceAdjust"], "44.2");

        let block = serde_json::to_value(BlockState {
            current_block: 7,
            current_block_time: 99,
        })
        .unwrap();
        assert_eq!(block["currentBlock"], 7);
        assert_eq!(block["currentBlockTime"], 99);
    }
}
