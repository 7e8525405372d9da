// Read-only contract bindings used by the price feed

pub mod erc20;
pub mod fee_detector;
pub mod i_uniswap_v2_pair;
pub mod i_uniswap_v3_pool;
pub mod quoter;

pub use erc20::Erc20;
pub use fee_detector::FeeOnTransferDetector;
pub use i_uniswap_v2_pair::{IUniswapV2Pair, SyncFilter};
pub use i_uniswap_v3_pool::{IUniswapV3Pool, SwapFilter};
pub use quoter::UniswapV3Quoter;
