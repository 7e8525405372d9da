use ethers::prelude::abigen;

// `validate` returns a static struct (buyFeeBps, sellFeeBps), which encodes the same as two words.
abigen!(
    FeeOnTransferDetector,
    r#"[
        function validate(address token, address baseToken, uint256 amountToBorrow) external returns (uint256 buyFeeBps, uint256 sellFeeBps)
    ]"#
);
