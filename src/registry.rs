use ethers::types::Address;
use std::collections::HashMap;

use crate::types::{PoolRecord, Reserves};

/// A known pool and the freshest reserves seen for it.
#[derive(Debug, Clone)]
pub struct PoolState {
    pub record: PoolRecord,
    pub reserves: Option<Reserves>,
    /// Bumped on every reserve update.
    pub reserves_seq: u64,
}

/// In-memory catalog of admitted pools plus the set of addresses proven invalid.
///
/// Both maps only grow: pools are never removed and ignored addresses stay ignored for the
/// lifetime of the process.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: HashMap<Address, PoolState>,
    ignored: HashMap<Address, String>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pool. Returns false if the address is already registered or ignored.
    pub fn register(&mut self, record: PoolRecord) -> bool {
        if self.ignored.contains_key(&record.address) || self.pools.contains_key(&record.address) {
            return false;
        }
        self.pools.insert(
            record.address,
            PoolState {
                record,
                reserves: None,
                reserves_seq: 0,
            },
        );
        true
    }

    pub fn ignore(&mut self, address: Address, reason: impl Into<String>) {
        self.ignored.entry(address).or_insert_with(|| reason.into());
    }

    pub fn get(&self, address: &Address) -> Option<&PoolState> {
        self.pools.get(address)
    }

    pub fn is_known(&self, address: &Address) -> bool {
        self.pools.contains_key(address)
    }

    pub fn is_ignored(&self, address: &Address) -> bool {
        self.ignored.contains_key(address)
    }

    pub fn ignore_reason(&self, address: &Address) -> Option<&str> {
        self.ignored.get(address).map(String::as_str)
    }

    /// Stores new reserves for a registered pool. Unknown addresses are left alone.
    pub fn update_reserves(&mut self, address: &Address, reserves: Reserves) -> bool {
        match self.pools.get_mut(address) {
            Some(state) => {
                state.reserves = Some(reserves);
                state.reserves_seq += 1;
                true
            }
            None => false,
        }
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.pools.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Reserve sequence of a registered pool, to tell later whether it was updated since.
    pub fn reserves_seq(&self, address: &Address) -> Option<u64> {
        self.pools.get(address).map(|state| state.reserves_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenInfo;
    use ethers::types::U256;

    fn record(byte: u8) -> PoolRecord {
        let info = |b: u8, s: &str| TokenInfo {
            address: Address::repeat_byte(b),
            symbol: s.into(),
            name: s.into(),
            decimals: 18,
        };
        PoolRecord::new(1, Address::repeat_byte(byte), info(0x10, "TKN"), info(0xee, "WETH"), None)
    }

    #[test]
    fn test_ignored_address_cannot_be_registered() {
        let mut registry = PoolRegistry::new();
        registry.ignore(Address::repeat_byte(1), "not_reference_pair");
        assert!(!registry.register(record(1)));
        assert!(registry.is_ignored(&Address::repeat_byte(1)));
        assert_eq!(
            registry.ignore_reason(&Address::repeat_byte(1)),
            Some("not_reference_pair")
        );
        // first reason sticks
        registry.ignore(Address::repeat_byte(1), "other");
        assert_eq!(
            registry.ignore_reason(&Address::repeat_byte(1)),
            Some("not_reference_pair")
        );
    }

    #[test]
    fn test_register_and_update_reserves() {
        let mut registry = PoolRegistry::new();
        assert!(registry.register(record(2)));
        assert!(!registry.register(record(2)));
        assert_eq!(registry.len(), 1);

        let r = Reserves::new(U256::from(5u64), U256::from(7u64));
        assert!(registry.update_reserves(&Address::repeat_byte(2), r));
        assert!(!registry.update_reserves(&Address::repeat_byte(3), r));
        assert_eq!(registry.get(&Address::repeat_byte(2)).unwrap().reserves, Some(r));
        assert_eq!(registry.reserves_seq(&Address::repeat_byte(2)), Some(1));
        assert_eq!(registry.reserves_seq(&Address::repeat_byte(3)), None);

        registry.update_reserves(&Address::repeat_byte(2), r);
        assert_eq!(registry.reserves_seq(&Address::repeat_byte(2)), Some(2));
    }
}
