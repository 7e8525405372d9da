//! In-memory doubles shared by the integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dex_price_feed::chain_client::ChainClient;
use dex_price_feed::contracts::{SwapFilter, SyncFilter};
use dex_price_feed::engine::EngineConfig;
use dex_price_feed::fee_oracle::{FeeOracle, FeeOracleConfig};
use dex_price_feed::pool_address::{v2_pair_address, v3_pool_address};
use dex_price_feed::settings::PipelineKind;
use dex_price_feed::types::{Reserves, TokenInfo};
use dex_price_feed::validator::FactoryConfig;
use ethers::contract::EthEvent;
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

pub const ONE: u64 = 1_000_000_000_000_000_000;

pub fn weth() -> TokenInfo {
    TokenInfo {
        address: Address::repeat_byte(0xee),
        symbol: "WETH".into(),
        name: "Wrapped Ether".into(),
        decimals: 18,
    }
}

pub fn token(byte: u8, symbol: &str) -> TokenInfo {
    TokenInfo {
        address: Address::repeat_byte(byte),
        symbol: symbol.into(),
        name: format!("{} Token", symbol),
        decimals: 18,
    }
}

pub fn factory() -> FactoryConfig {
    FactoryConfig {
        factory: Address::repeat_byte(0xfa),
        init_code_hash: H256::repeat_byte(0x42),
    }
}

/// Address the test factory deploys for `token`/WETH.
pub fn v2_pool(token: &TokenInfo) -> Address {
    let f = factory();
    v2_pair_address(f.factory, f.init_code_hash, token.address, weth().address)
}

pub fn v3_pool(token: &TokenInfo, fee: u32) -> Address {
    let f = factory();
    v3_pool_address(f.factory, f.init_code_hash, token.address, weth().address, fee)
}

pub fn units(n: u64) -> U256 {
    U256::from(n) * U256::from(ONE)
}

pub fn sync_log(pool: Address, block: u64, index: u64, reserve0: U256, reserve1: U256) -> Log {
    let mut data = [0u8; 64];
    reserve0.to_big_endian(&mut data[..32]);
    reserve1.to_big_endian(&mut data[32..]);
    Log {
        address: pool,
        topics: vec![SyncFilter::signature()],
        data: Bytes::from(data.to_vec()),
        block_number: Some(U64::from(block)),
        transaction_index: Some(U64::from(index)),
        log_index: Some(U256::from(index)),
        removed: Some(false),
        ..Default::default()
    }
}

pub fn swap_log(pool: Address, block: u64, index: u64) -> Log {
    Log {
        address: pool,
        topics: vec![
            SwapFilter::signature(),
            H256::repeat_byte(0x01),
            H256::repeat_byte(0x02),
        ],
        data: Bytes::from(vec![0u8; 160]),
        block_number: Some(U64::from(block)),
        transaction_index: Some(U64::from(index)),
        log_index: Some(U256::from(index)),
        removed: Some(false),
        ..Default::default()
    }
}

/// Scriptable chain. Unknown pools and tokens make the corresponding reads fail.
#[derive(Default)]
pub struct MockChain {
    logs: Mutex<HashMap<u64, Vec<Log>>>,
    log_fetches: Mutex<HashMap<u64, usize>>,
    pools: Mutex<HashMap<Address, (Address, Address)>>,
    pool_fees: Mutex<HashMap<Address, u32>>,
    tokens: Mutex<HashMap<Address, TokenInfo>>,
    reserves: Mutex<HashMap<Address, Reserves>>,
    token_lookups: Mutex<HashMap<Address, usize>>,
    /// Tokens per reference unit returned by both quoter calls.
    quote_rate: Mutex<Option<u64>>,
    fee_calls: Mutex<usize>,
    reserve_batches: Mutex<usize>,
    fee_delay: Mutex<Option<Duration>>,
    lookup_delay: Mutex<Option<Duration>>,
    reserves_delay: Mutex<Option<Duration>>,
}

impl MockChain {
    pub fn new() -> Self {
        let chain = Self::default();
        chain.add_token(&weth());
        chain
    }

    pub fn add_token(&self, info: &TokenInfo) {
        self.tokens.lock().unwrap().insert(info.address, info.clone());
    }

    pub fn add_pool(&self, pool: Address, a: Address, b: Address) {
        let (token0, token1) = if a < b { (a, b) } else { (b, a) };
        self.pools.lock().unwrap().insert(pool, (token0, token1));
    }

    pub fn add_v3_pool(&self, pool: Address, a: Address, b: Address, fee: u32) {
        self.add_pool(pool, a, b);
        self.pool_fees.lock().unwrap().insert(pool, fee);
    }

    pub fn set_logs(&self, block: u64, logs: Vec<Log>) {
        self.logs.lock().unwrap().insert(block, logs);
    }

    pub fn set_reserves(&self, pool: Address, reserves: Reserves) {
        self.reserves.lock().unwrap().insert(pool, reserves);
    }

    pub fn set_quote_rate(&self, rate: u64) {
        *self.quote_rate.lock().unwrap() = Some(rate);
    }

    /// Holds every detector call for `delay`, keeping pricing runs in flight.
    pub fn set_fee_delay(&self, delay: Duration) {
        *self.fee_delay.lock().unwrap() = Some(delay);
    }

    /// Holds every `token0`/`token1` lookup for `delay`, keeping candidates under validation.
    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_reserves_delay(&self, delay: Duration) {
        *self.reserves_delay.lock().unwrap() = Some(delay);
    }

    pub fn fee_calls(&self) -> usize {
        *self.fee_calls.lock().unwrap()
    }

    pub fn reserve_batches(&self) -> usize {
        *self.reserve_batches.lock().unwrap()
    }

    pub fn log_fetches(&self, block: u64) -> usize {
        self.log_fetches.lock().unwrap().get(&block).copied().unwrap_or(0)
    }

    pub fn token_lookups(&self, pool: Address) -> usize {
        self.token_lookups.lock().unwrap().get(&pool).copied().unwrap_or(0)
    }

    fn token_info(&self, token: Address) -> Result<TokenInfo> {
        self.tokens
            .lock()
            .unwrap()
            .get(&token)
            .cloned()
            .ok_or_else(|| anyhow!("execution reverted"))
    }

    fn quote(&self, amount: U256) -> Result<U256> {
        match *self.quote_rate.lock().unwrap() {
            Some(rate) => Ok(amount * U256::from(rate)),
            None => Err(anyhow!("quoter reverted")),
        }
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn block_logs(&self, block: u64, _topic: H256) -> Result<Vec<Log>> {
        *self.log_fetches.lock().unwrap().entry(block).or_insert(0) += 1;
        Ok(self.logs.lock().unwrap().get(&block).cloned().unwrap_or_default())
    }

    async fn pool_tokens(&self, pool: Address) -> Result<(Address, Address)> {
        *self.token_lookups.lock().unwrap().entry(pool).or_insert(0) += 1;
        let delay = *self.lookup_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.pools
            .lock()
            .unwrap()
            .get(&pool)
            .copied()
            .ok_or_else(|| anyhow!("execution reverted"))
    }

    async fn pool_fee(&self, pool: Address) -> Result<u32> {
        self.pool_fees
            .lock()
            .unwrap()
            .get(&pool)
            .copied()
            .ok_or_else(|| anyhow!("execution reverted"))
    }

    async fn token_decimals(&self, token: Address) -> Result<u8> {
        Ok(self.token_info(token)?.decimals)
    }

    async fn token_symbol(&self, token: Address) -> Result<String> {
        Ok(self.token_info(token)?.symbol)
    }

    async fn token_name(&self, token: Address) -> Result<String> {
        Ok(self.token_info(token)?.name)
    }

    async fn reserves_batch(&self, pools: &[Address]) -> Result<Vec<Option<Reserves>>> {
        *self.reserve_batches.lock().unwrap() += 1;
        let delay = *self.reserves_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let reserves = self.reserves.lock().unwrap();
        Ok(pools.iter().map(|p| reserves.get(p).copied()).collect())
    }

    async fn quote_exact_input(&self, _: Address, _: Address, _: u32, amount_in: U256) -> Result<U256> {
        self.quote(amount_in)
    }

    async fn quote_exact_output(&self, _: Address, _: Address, _: u32, amount_out: U256) -> Result<U256> {
        self.quote(amount_out)
    }

    async fn transfer_fees(&self, _: Address, _: Address, _: U256) -> Result<(U256, U256)> {
        *self.fee_calls.lock().unwrap() += 1;
        let delay = *self.fee_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok((U256::zero(), U256::zero()))
    }
}

pub fn fee_config() -> FeeOracleConfig {
    FeeOracleConfig {
        reference: weth().address,
        probe_amount: U256::from(10_000u64),
        fallback_buy_fee_bps: 25,
        fallback_sell_fee_bps: 0,
        min_buy_fee_bps: 25,
        timeout: Duration::from_secs(1),
    }
}

pub fn fee_oracle(client: std::sync::Arc<dyn ChainClient>) -> FeeOracle {
    FeeOracle::new(client, fee_config())
}

pub fn engine_config(kind: PipelineKind) -> EngineConfig {
    EngineConfig {
        kind,
        chain_id: 1,
        reference: weth(),
        reference_amount: U256::from(ONE),
        custom_amount: U256::from(ONE),
        handled_block_window: 64,
        reload_batch_size: 100,
        reload_interval: Duration::from_millis(20),
        command_capacity: 16,
        runtime_file: None,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
