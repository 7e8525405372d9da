use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// ERC-20 metadata of one side of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: Address,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
}

/// A validated pool pairing some token against the reference asset.
///
/// `fee` is the V3 fee tier (hundredths of a bip, e.g. 3000 = 0.3%) and is `None`
/// for constant-product pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolRecord {
    pub chain_id: u64,
    pub address: Address,
    pub token0: TokenInfo,
    pub token1: TokenInfo,
    pub fee: Option<u32>,
}

impl PoolRecord {
    /// Builds a record from the non-reference token and the reference asset, ordering the
    /// two sides the way the pool contract does (lower address first).
    pub fn new(
        chain_id: u64,
        address: Address,
        token: TokenInfo,
        reference: TokenInfo,
        fee: Option<u32>,
    ) -> Self {
        let (token0, token1) = if token.address < reference.address {
            (token, reference)
        } else {
            (reference, token)
        };
        Self {
            chain_id,
            address,
            token0,
            token1,
            fee,
        }
    }

    /// True when exactly one side is `reference`.
    pub fn pairs_reference(&self, reference: Address) -> bool {
        (self.token0.address == reference) != (self.token1.address == reference)
    }

    /// Whether the non-reference token sits in slot 0.
    pub fn is_token_first(&self, reference: Address) -> bool {
        self.token1.address == reference
    }

    /// The non-reference side.
    pub fn token(&self, reference: Address) -> &TokenInfo {
        if self.is_token_first(reference) {
            &self.token0
        } else {
            &self.token1
        }
    }

    /// Catalog label: token symbol followed or preceded by the reference symbol, in pool order.
    pub fn quote(&self) -> String {
        format!("{}{}", self.token0.symbol, self.token1.symbol)
    }
}

/// Raw reserves in pool order (token0, token1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reserves {
    pub reserve0: U256,
    pub reserve1: U256,
}

impl Reserves {
    pub fn new(reserve0: U256, reserve1: U256) -> Self {
        Self { reserve0, reserve1 }
    }

    /// Splits into `(reference_reserve, token_reserve)` given which slot holds the token.
    pub fn oriented(&self, token_first: bool) -> (U256, U256) {
        if token_first {
            (self.reserve1, self.reserve0)
        } else {
            (self.reserve0, self.reserve1)
        }
    }
}
