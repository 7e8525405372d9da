use dashmap::DashMap;
use ethers::types::{Address, U256};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::chain_client::ChainClient;
use crate::metrics;

/// Buy and sell transfer fees of a token, in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferFees {
    pub buy_fee_bps: u32,
    pub sell_fee_bps: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum FeeOracleError {
    #[error("fee detector call failed: {0}")]
    Call(String),
    #[error("fee detector timed out after {0:?}")]
    Timeout(Duration),
    #[error("fee detector returned out-of-range fee {0}")]
    OutOfRange(U256),
}

#[derive(Debug, Clone)]
pub struct FeeOracleConfig {
    pub reference: Address,
    pub probe_amount: U256,
    pub fallback_buy_fee_bps: u32,
    pub fallback_sell_fee_bps: u32,
    pub min_buy_fee_bps: u32,
    pub timeout: Duration,
}

/// Per-token transfer fees from the fee-on-transfer detector contract.
///
/// Detection is best-effort: [`FeeOracle::fees_or_fallback`] never fails, substituting the
/// configured buy fee and the last sell fee seen for that token.
pub struct FeeOracle {
    client: Arc<dyn ChainClient>,
    config: FeeOracleConfig,
    last_sell_fee: DashMap<Address, u32>,
}

fn bps(value: U256) -> Result<u32, FeeOracleError> {
    if value > U256::from(u32::MAX) {
        return Err(FeeOracleError::OutOfRange(value));
    }
    Ok(value.as_u32())
}

impl FeeOracle {
    pub fn new(client: Arc<dyn ChainClient>, config: FeeOracleConfig) -> Self {
        Self {
            client,
            config,
            last_sell_fee: DashMap::new(),
        }
    }

    /// Queries the detector. A detected buy fee of zero is raised to the configured minimum.
    pub async fn fetch(&self, token: Address) -> Result<TransferFees, FeeOracleError> {
        let call = self
            .client
            .transfer_fees(token, self.config.reference, self.config.probe_amount);
        let (buy, sell) = tokio::time::timeout(self.config.timeout, call)
            .await
            .map_err(|_| FeeOracleError::Timeout(self.config.timeout))?
            .map_err(|e| FeeOracleError::Call(e.to_string()))?;

        let mut fees = TransferFees {
            buy_fee_bps: bps(buy)?,
            sell_fee_bps: bps(sell)?,
        };
        if fees.buy_fee_bps == 0 {
            fees.buy_fee_bps = self.config.min_buy_fee_bps;
        }
        self.last_sell_fee.insert(token, fees.sell_fee_bps);
        Ok(fees)
    }

    pub async fn fees_or_fallback(&self, token: Address) -> TransferFees {
        match self.fetch(token).await {
            Ok(fees) => {
                debug!("Transfer fees for {:?}: {:?}", token, fees);
                fees
            }
            Err(e) => {
                warn!("Error while fetching transfer fees for {:?}: {}", token, e);
                metrics::increment_fee_oracle_fallbacks();
                self.fallback(token)
            }
        }
    }

    pub fn fallback(&self, token: Address) -> TransferFees {
        TransferFees {
            buy_fee_bps: self.config.fallback_buy_fee_bps,
            sell_fee_bps: self
                .last_sell_fee
                .get(&token)
                .map(|v| *v)
                .unwrap_or(self.config.fallback_sell_fee_bps),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reserves;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use ethers::types::{Log, H256};
    use std::sync::Mutex;

    /// Only answers the fee probe; replies are consumed front to back.
    struct FeeOnly {
        replies: Mutex<Vec<Result<(U256, U256)>>>,
    }

    #[async_trait]
    impl ChainClient for FeeOnly {
        async fn block_logs(&self, _: u64, _: H256) -> Result<Vec<Log>> {
            Ok(vec![])
        }
        async fn pool_tokens(&self, _: Address) -> Result<(Address, Address)> {
            Err(anyhow!("unused"))
        }
        async fn pool_fee(&self, _: Address) -> Result<u32> {
            Err(anyhow!("unused"))
        }
        async fn token_decimals(&self, _: Address) -> Result<u8> {
            Err(anyhow!("unused"))
        }
        async fn token_symbol(&self, _: Address) -> Result<String> {
            Err(anyhow!("unused"))
        }
        async fn token_name(&self, _: Address) -> Result<String> {
            Err(anyhow!("unused"))
        }
        async fn reserves_batch(&self, _: &[Address]) -> Result<Vec<Option<Reserves>>> {
            Ok(vec![])
        }
        async fn quote_exact_input(&self, _: Address, _: Address, _: u32, _: U256) -> Result<U256> {
            Err(anyhow!("unused"))
        }
        async fn quote_exact_output(&self, _: Address, _: Address, _: u32, _: U256) -> Result<U256> {
            Err(anyhow!("unused"))
        }
        async fn transfer_fees(&self, _: Address, _: Address, _: U256) -> Result<(U256, U256)> {
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn oracle(replies: Vec<Result<(U256, U256)>>) -> FeeOracle {
        FeeOracle::new(
            Arc::new(FeeOnly {
                replies: Mutex::new(replies),
            }),
            FeeOracleConfig {
                reference: Address::repeat_byte(0xee),
                probe_amount: U256::from(10_000u64),
                fallback_buy_fee_bps: 25,
                fallback_sell_fee_bps: 0,
                min_buy_fee_bps: 25,
                timeout: Duration::from_secs(1),
            },
        )
    }

    #[tokio::test]
    async fn test_zero_buy_fee_is_raised_to_minimum() {
        let oracle = oracle(vec![Ok((U256::zero(), U256::from(300u64)))]);
        let fees = oracle.fetch(Address::repeat_byte(1)).await.unwrap();
        assert_eq!(
            fees,
            TransferFees {
                buy_fee_bps: 25,
                sell_fee_bps: 300
            }
        );
    }

    #[tokio::test]
    async fn test_failure_falls_back_to_last_known_sell_fee() {
        let token = Address::repeat_byte(1);
        let oracle = oracle(vec![
            Err(anyhow!("execution reverted")),
            Ok((U256::from(100u64), U256::from(400u64))),
            Err(anyhow!("execution reverted")),
        ]);

        let first = oracle.fees_or_fallback(token).await;
        assert_eq!(
            first,
            TransferFees {
                buy_fee_bps: 25,
                sell_fee_bps: 0
            }
        );

        let detected = oracle.fees_or_fallback(token).await;
        assert_eq!(detected.buy_fee_bps, 100);

        let after = oracle.fees_or_fallback(token).await;
        assert_eq!(
            after,
            TransferFees {
                buy_fee_bps: 25,
                sell_fee_bps: 400
            }
        );
    }

    #[tokio::test]
    async fn test_out_of_range_fee_is_an_error() {
        let oracle = oracle(vec![Ok((U256::MAX, U256::zero()))]);
        let err = oracle.fetch(Address::repeat_byte(1)).await.unwrap_err();
        assert!(matches!(err, FeeOracleError::OutOfRange(_)));
    }
}
