use ethers::prelude::*;

// Exact Solidity widths matter here: int24/uint24/uint160/uint128 decode differently from uint256.
abigen!(
    IUniswapV3Pool,
    r#"[
        event Swap(address indexed sender, address indexed recipient, int256 amount0, int256 amount1, uint160 sqrtPriceX96, uint128 liquidity, int24 tick)
        function token0() external view returns (address)
        function token1() external view returns (address)
        function fee() external view returns (uint24)
    ]"#
);
