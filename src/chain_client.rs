//! Narrow seam over the chain: log queries, pool/token metadata reads, reserve batches,
//! quoter simulations and the transfer-fee probe.
//!
//! The engine and validator only see [`ChainClient`]; [`EthersChainClient`] is the production
//! implementation and tests plug in in-memory doubles.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::abi::{AbiDecode, AbiEncode};
use ethers::prelude::*;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::contracts::i_uniswap_v2_pair::{GetReservesCall, GetReservesReturn};
use crate::contracts::{Erc20, FeeOnTransferDetector, IUniswapV2Pair, IUniswapV3Pool, UniswapV3Quoter};
use crate::multicall::{Call, Multicall};
use crate::types::Reserves;

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// All logs emitted in exactly `block` whose first topic is `topic`.
    async fn block_logs(&self, block: u64, topic: H256) -> Result<Vec<Log>>;

    /// `(token0, token1)` as reported by the pool contract.
    async fn pool_tokens(&self, pool: Address) -> Result<(Address, Address)>;

    /// Fee tier of a quoter-based pool.
    async fn pool_fee(&self, pool: Address) -> Result<u32>;

    async fn token_decimals(&self, token: Address) -> Result<u8>;
    async fn token_symbol(&self, token: Address) -> Result<String>;
    async fn token_name(&self, token: Address) -> Result<String>;

    /// Reserves for each pool, in input order. A pool whose read failed maps to `None`.
    async fn reserves_batch(&self, pools: &[Address]) -> Result<Vec<Option<Reserves>>>;

    async fn quote_exact_input(
        &self,
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_in: U256,
    ) -> Result<U256>;

    async fn quote_exact_output(
        &self,
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_out: U256,
    ) -> Result<U256>;

    /// Raw `(buyFeeBps, sellFeeBps)` from the fee-on-transfer detector.
    async fn transfer_fees(&self, token: Address, base: Address, amount: U256) -> Result<(U256, U256)>;
}

#[derive(Debug, Clone, Copy)]
pub struct ContractAddresses {
    pub multicall: Address,
    pub quoter: Address,
    pub fee_detector: Address,
}

pub struct EthersChainClient<M: Middleware> {
    provider: Arc<M>,
    multicall: Multicall<M>,
    quoter: UniswapV3Quoter<M>,
    fee_detector: FeeOnTransferDetector<M>,
    timeout: Duration,
}

impl<M: Middleware + 'static> EthersChainClient<M> {
    pub fn new(
        provider: Arc<M>,
        addresses: ContractAddresses,
        batch_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            multicall: Multicall::new(provider.clone(), addresses.multicall, batch_size)
                .with_timeout(timeout),
            quoter: UniswapV3Quoter::new(addresses.quoter, provider.clone()),
            fee_detector: FeeOnTransferDetector::new(addresses.fee_detector, provider.clone()),
            provider,
            timeout,
        }
    }

    async fn timed<T, E, F>(&self, what: &str, fut: F) -> Result<T>
    where
        E: Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(anyhow!("{} failed: {}", what, e)),
            Err(_) => Err(anyhow!("{} timed out after {:?}", what, self.timeout)),
        }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for EthersChainClient<M> {
    async fn block_logs(&self, block: u64, topic: H256) -> Result<Vec<Log>> {
        let filter = Filter::new().from_block(block).to_block(block).topic0(topic);
        self.timed("eth_getLogs", self.provider.get_logs(&filter)).await
    }

    async fn pool_tokens(&self, pool: Address) -> Result<(Address, Address)> {
        let pair = IUniswapV2Pair::new(pool, self.provider.clone());
        let t0 = pair.token_0();
        let t1 = pair.token_1();
        let (token0, token1) =
            futures::try_join!(self.timed("token0", t0.call()), self.timed("token1", t1.call()))?;
        Ok((token0, token1))
    }

    async fn pool_fee(&self, pool: Address) -> Result<u32> {
        let v3 = IUniswapV3Pool::new(pool, self.provider.clone());
        let fee = v3.fee();
        self.timed("fee", fee.call()).await
    }

    async fn token_decimals(&self, token: Address) -> Result<u8> {
        let erc20 = Erc20::new(token, self.provider.clone());
        let call = erc20.decimals();
        self.timed("decimals", call.call()).await
    }

    async fn token_symbol(&self, token: Address) -> Result<String> {
        let erc20 = Erc20::new(token, self.provider.clone());
        let call = erc20.symbol();
        self.timed("symbol", call.call()).await
    }

    async fn token_name(&self, token: Address) -> Result<String> {
        let erc20 = Erc20::new(token, self.provider.clone());
        let call = erc20.name();
        self.timed("name", call.call()).await
    }

    async fn reserves_batch(&self, pools: &[Address]) -> Result<Vec<Option<Reserves>>> {
        let call_data: Bytes = GetReservesCall.encode().into();
        let calls = pools
            .iter()
            .map(|pool| Call {
                target: *pool,
                call_data: call_data.clone(),
            })
            .collect();

        let results = self.multicall.run(calls, None).await?;
        Ok(results
            .into_iter()
            .map(|slot| {
                slot.and_then(|bytes| GetReservesReturn::decode(bytes.as_ref()).ok())
                    .map(|r| Reserves::new(U256::from(r.reserve_0), U256::from(r.reserve_1)))
            })
            .collect())
    }

    async fn quote_exact_input(
        &self,
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_in: U256,
    ) -> Result<U256> {
        let call = self
            .quoter
            .quote_exact_input_single(token_in, token_out, fee, amount_in, U256::zero());
        self.timed("quoteExactInputSingle", call.call()).await
    }

    async fn quote_exact_output(
        &self,
        token_in: Address,
        token_out: Address,
        fee: u32,
        amount_out: U256,
    ) -> Result<U256> {
        let call = self
            .quoter
            .quote_exact_output_single(token_in, token_out, fee, amount_out, U256::zero());
        self.timed("quoteExactOutputSingle", call.call()).await
    }

    async fn transfer_fees(&self, token: Address, base: Address, amount: U256) -> Result<(U256, U256)> {
        let call = self.fee_detector.validate(token, base, amount);
        self.timed("validate", call.call()).await
    }
}
