//! Shared data model: pools, reserves, price entries and block state.

pub mod conversions;
pub mod pool_data;
pub mod price_data;

pub use pool_data::{PoolRecord, Reserves, TokenInfo};
pub use price_data::{BlockState, PoolPrices, PriceEntry};
