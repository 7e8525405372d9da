//! The price-feed scheduler.
//!
//! One loop owns every piece of mutable state ([`EngineState`]): the pool registry, the published
//! prices, the block head and the bookkeeping of work in flight. Chain notifications and API
//! commands arrive on mpsc queues; network work (log fetches, discovery, pricing, reserve batches)
//! runs as futures in a `FuturesUnordered` whose outcomes come back into the same loop. Nothing is
//! shared behind a lock.
//!
//! A pool is never priced twice concurrently. A newer event for a pool that is still being priced
//! marks it pending, and it is priced once more with the freshest reserves when the current run
//! finishes.

use anyhow::{anyhow, Result};
use ethers::types::{Address, Log, U256};
use ethers::utils::{parse_units, ParseUnits};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::chain_client::ChainClient;
use crate::database::PoolCatalog;
use crate::fee_oracle::FeeOracle;
use crate::metrics;
use crate::pricing::{self, SwapPrices};
use crate::reconciler::{fetch_block_logs, ReconcileError, Reconciler};
use crate::registry::PoolRegistry;
use crate::settings::{persist_custom_amount, PipelineKind, Settings};
use crate::types::{BlockState, PoolPrices, PoolRecord, PriceEntry, Reserves, TokenInfo};
use crate::validator::{DiscoveryOutcome, PoolDiscoveryValidator};

/// Notifications from the chain subscriptions.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    NewBlock(u64),
    Log(Log),
    /// A subscription ended. Fatal.
    Closed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("invalid amount: {0}")]
    Malformed(String),
    #[error("amount must not be negative")]
    Negative,
    #[error("amount must be greater than zero")]
    Zero,
    #[error("failed to persist amount: {0}")]
    Persist(String),
    #[error("engine is not running")]
    Unavailable,
}

/// Parses a human amount of the reference asset into its smallest unit.
pub fn parse_amount(text: &str, decimals: u8) -> Result<U256, AmountError> {
    match parse_units(text.trim(), decimals as u32) {
        Ok(ParseUnits::U256(v)) if v.is_zero() => Err(AmountError::Zero),
        Ok(ParseUnits::U256(v)) => Ok(v),
        Ok(ParseUnits::I256(_)) => Err(AmountError::Negative),
        Err(e) => Err(AmountError::Malformed(e.to_string())),
    }
}

#[derive(Debug)]
pub enum Command {
    Snapshot(oneshot::Sender<Vec<PriceEntry>>),
    Block(oneshot::Sender<BlockState>),
    SetAmount {
        amount: String,
        reply: oneshot::Sender<Result<String, AmountError>>,
    },
    Kill(oneshot::Sender<()>),
}

/// Query surface handed to the (external) API layer.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub async fn prices(&self) -> Result<Vec<PriceEntry>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .await
            .map_err(|_| anyhow!("engine stopped"))?;
        Ok(rx.await?)
    }

    pub async fn block(&self) -> Result<BlockState> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Block(tx))
            .await
            .map_err(|_| anyhow!("engine stopped"))?;
        Ok(rx.await?)
    }

    /// Replaces the adjustment amount. Returns the new amount in smallest units.
    pub async fn set_amount(&self, amount: &str) -> Result<String, AmountError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SetAmount {
                amount: amount.to_string(),
                reply,
            })
            .await
            .map_err(|_| AmountError::Unavailable)?;
        rx.await.map_err(|_| AmountError::Unavailable)?
    }

    /// Stops the engine loop. The caller is expected to terminate the process.
    pub async fn kill(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Kill(tx))
            .await
            .map_err(|_| anyhow!("engine stopped"))?;
        Ok(rx.await?)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub kind: PipelineKind,
    pub chain_id: u64,
    pub reference: TokenInfo,
    /// Reference trade amount, smallest unit.
    pub reference_amount: U256,
    /// Adjustment amount, smallest unit.
    pub custom_amount: U256,
    pub handled_block_window: u64,
    pub reload_batch_size: usize,
    pub reload_interval: Duration,
    pub command_capacity: usize,
    /// Where a changed adjustment amount is persisted. `None` keeps it in memory only.
    pub runtime_file: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let reference = TokenInfo {
            address: settings.chain.reference.address,
            symbol: settings.chain.reference.symbol.clone(),
            name: settings.chain.reference.name.clone(),
            decimals: settings.chain.reference.decimals,
        };
        let reference_amount = parse_amount(&settings.pricing.reference_amount, reference.decimals)
            .map_err(|e| anyhow!("pricing.reference_amount: {}", e))?;
        let custom_amount = U256::from_dec_str(settings.pricing.custom_amount.trim())
            .map_err(|e| anyhow!("pricing.custom_amount: {}", e))?;
        Ok(Self {
            kind: settings.pipeline.kind,
            chain_id: settings.chain.chain_id,
            reference,
            reference_amount,
            custom_amount,
            handled_block_window: settings.pipeline.handled_block_window,
            reload_batch_size: settings.pipeline.reload_batch_size.max(1),
            reload_interval: Duration::from_millis(settings.pipeline.reload_interval_ms.max(1)),
            command_capacity: settings.pipeline.event_queue_capacity.max(1),
            runtime_file: Some(settings.runtime_file.clone()),
        })
    }
}

/// Everything the scheduler loop mutates.
#[derive(Debug, Default)]
pub struct EngineState {
    pub registry: PoolRegistry,
    /// Keyed by the non-reference token.
    pub prices: BTreeMap<Address, PriceEntry>,
    pub block: BlockState,
    pub custom_amount: U256,
    /// Bumped whenever the adjustment amount changes; older pricing results are dropped.
    pub generation: u64,
    in_flight: HashSet<Address>,
    pending: HashSet<Address>,
    /// Candidates under validation, with the latest reserves seen for them meanwhile.
    validating: HashMap<Address, Option<Reserves>>,
    reload_queue: VecDeque<Address>,
}

impl EngineState {
    fn has_price(&self, record: &PoolRecord, reference: Address) -> bool {
        self.prices
            .get(&record.token(reference).address)
            .map(|entry| entry.pools.contains_key(&record.address))
            .unwrap_or(false)
    }

    fn set_price(&mut self, record: &PoolRecord, reference: Address, prices: PoolPrices) {
        let token = record.token(reference);
        self.prices
            .entry(token.address)
            .or_insert_with(|| PriceEntry::for_token(token))
            .pools
            .insert(record.address, prices);
    }

    fn remove_price(&mut self, record: &PoolRecord, reference: Address) {
        let token = record.token(reference).address;
        if let Some(entry) = self.prices.get_mut(&token) {
            if entry.pools.remove(&record.address).is_some() {
                metrics::increment_price_removals();
            }
            if entry.pools.is_empty() {
                self.prices.remove(&token);
            }
        }
    }
}

enum TaskOutcome {
    BlockLogs {
        block: u64,
        result: Result<Vec<Log>, ReconcileError>,
    },
    Priced {
        pool: Address,
        generation: u64,
        prices: Option<PoolPrices>,
    },
    Discovered {
        pool: Address,
        outcome: DiscoveryOutcome,
    },
    Reserves {
        /// Each pool with its reserve sequence when the batch was issued.
        pools: Vec<(Address, u64)>,
        result: Result<Vec<Option<Reserves>>>,
    },
}

/// Read-only inputs of one pricing run.
struct PricingContext {
    client: Arc<dyn ChainClient>,
    fees: Arc<FeeOracle>,
    kind: PipelineKind,
    reference: Address,
    reference_amount: U256,
}

impl PricingContext {
    async fn quote(&self, token: Address, fee: u32, amount: U256, decimals: u8) -> Option<(U256, U256)> {
        let (out, needed) = futures::join!(
            self.client
                .quote_exact_input(self.reference, token, fee, amount),
            self.client
                .quote_exact_output(token, self.reference, fee, pricing::sell_side_amount(amount)),
        );
        match (out, needed) {
            (Ok(out), Ok(needed)) => Some((out, needed)),
            (Err(e), _) | (_, Err(e)) => {
                debug!("quote failed for {:?} ({} decimals): {}", token, decimals, e);
                None
            }
        }
    }

    async fn price(
        &self,
        record: PoolRecord,
        reserves: Option<Reserves>,
        custom_amount: U256,
    ) -> Option<PoolPrices> {
        let token = record.token(self.reference).clone();
        let (base, adjusted): (Option<SwapPrices>, Option<SwapPrices>) = match self.kind {
            PipelineKind::V2 => {
                let (reserve_ref, reserve_token) =
                    reserves?.oriented(record.is_token_first(self.reference));
                let fees = self.fees.fees_or_fallback(token.address).await;
                (
                    pricing::constant_product_prices(
                        self.reference_amount,
                        reserve_ref,
                        reserve_token,
                        token.decimals,
                        fees,
                    ),
                    pricing::constant_product_prices(
                        custom_amount,
                        reserve_ref,
                        reserve_token,
                        token.decimals,
                        fees,
                    ),
                )
            }
            PipelineKind::V3 => {
                let fee = record.fee?;
                let (fees, base, adjusted) = futures::join!(
                    self.fees.fees_or_fallback(token.address),
                    self.quote(token.address, fee, self.reference_amount, token.decimals),
                    self.quote(token.address, fee, custom_amount, token.decimals),
                );
                let priced = |q: Option<(U256, U256)>| {
                    q.and_then(|(out, needed)| pricing::quoted_prices(out, needed, token.decimals, fees))
                };
                (priced(base), priced(adjusted))
            }
        };
        Some(pricing::publish(base?, adjusted?, custom_amount))
    }
}

pub struct Engine {
    config: EngineConfig,
    client: Arc<dyn ChainClient>,
    catalog: Arc<dyn PoolCatalog>,
    validator: Arc<PoolDiscoveryValidator>,
    pricing: Arc<PricingContext>,
    reconciler: Reconciler,
    state: EngineState,
    tasks: FuturesUnordered<BoxFuture<'static, TaskOutcome>>,
    commands: mpsc::Receiver<Command>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        client: Arc<dyn ChainClient>,
        catalog: Arc<dyn PoolCatalog>,
        fees: Arc<FeeOracle>,
        validator: Arc<PoolDiscoveryValidator>,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(config.command_capacity);
        let pricing = Arc::new(PricingContext {
            client: client.clone(),
            fees,
            kind: config.kind,
            reference: config.reference.address,
            reference_amount: config.reference_amount,
        });
        let state = EngineState {
            custom_amount: config.custom_amount,
            ..Default::default()
        };
        let engine = Self {
            reconciler: Reconciler::new(config.kind, config.handled_block_window),
            config,
            client,
            catalog,
            validator,
            pricing,
            state,
            tasks: FuturesUnordered::new(),
            commands: rx,
        };
        (engine, EngineHandle { commands: tx })
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Registers every catalog pool for this chain and queues it for the first pricing pass.
    pub async fn load_catalog(&mut self) -> Result<usize> {
        let records = self.catalog.load_pools(self.config.chain_id).await?;
        let mut loaded = 0;
        for record in records {
            if !record.pairs_reference(self.config.reference.address) {
                warn!("Catalog pool {:?} does not pair the reference asset, skipping", record.address);
                continue;
            }
            let address = record.address;
            if self.state.registry.register(record) {
                self.state.reload_queue.push_back(address);
                loaded += 1;
            }
        }
        metrics::set_known_pools(self.state.registry.len());
        info!("Loaded {} pools from catalog", loaded);
        Ok(loaded)
    }

    /// Runs until killed (`Ok`) or until the chain subscriptions fail (`Err`).
    pub async fn run(mut self, mut events: mpsc::Receiver<ChainEvent>) -> Result<()> {
        let mut reload = tokio::time::interval(self.config.reload_interval);
        reload.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(ChainEvent::NewBlock(number)) => self.on_new_block(number),
                    Some(ChainEvent::Log(log)) => self.on_log(log),
                    Some(ChainEvent::Closed(reason)) => {
                        error!("Chain subscription closed: {}", reason);
                        return Err(anyhow!("chain subscription closed: {}", reason));
                    }
                    None => return Err(anyhow!("chain event stream ended")),
                },
                Some(command) = self.commands.recv() => {
                    if self.on_command(command) {
                        info!("Kill requested, stopping engine");
                        return Ok(());
                    }
                }
                Some(outcome) = self.tasks.next(), if !self.tasks.is_empty() => {
                    self.on_outcome(outcome);
                }
                _ = reload.tick() => self.on_reload_tick(),
            }
        }
    }

    fn on_new_block(&mut self, number: u64) {
        self.reconciler.block_seen(number);
        let now = chrono::Utc::now().timestamp_millis();
        if self.state.block.advance(number, now) {
            info!("NEW_BLOCK {}", number);
        }
    }

    fn on_log(&mut self, log: Log) {
        let Some(block) = log.block_number.map(|n| n.as_u64()) else {
            return;
        };
        if !self.reconciler.claim(block) {
            return;
        }
        self.reconciler.block_seen(block);
        let client = self.client.clone();
        let topic = self.reconciler.topic();
        self.tasks.push(
            async move {
                let result = fetch_block_logs(client.as_ref(), block, topic).await;
                TaskOutcome::BlockLogs { block, result }
            }
            .boxed(),
        );
    }

    /// Returns true when the engine should stop.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.state.prices.values().cloned().collect());
            }
            Command::Block(reply) => {
                let _ = reply.send(self.state.block);
            }
            Command::SetAmount { amount, reply } => {
                let _ = reply.send(self.set_amount(&amount));
            }
            Command::Kill(reply) => {
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn set_amount(&mut self, text: &str) -> Result<String, AmountError> {
        let amount = parse_amount(text, self.config.reference.decimals)?;
        let smallest = amount.to_string();
        if let Some(path) = &self.config.runtime_file {
            persist_custom_amount(path, &smallest).map_err(|e| AmountError::Persist(e.to_string()))?;
        }

        self.state.custom_amount = amount;
        self.state.generation += 1;
        self.state.prices.clear();
        self.state.reload_queue = self.state.registry.addresses().into_iter().collect();
        metrics::set_price_entries(0);
        info!(
            "Adjustment amount set to {} ({} pools queued for recompute)",
            smallest,
            self.state.reload_queue.len()
        );
        Ok(smallest)
    }

    fn on_outcome(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::BlockLogs { block, result } => match result {
                Ok(logs) => self.apply_block_logs(block, logs),
                Err(e) => error!("{}", e),
            },
            TaskOutcome::Priced {
                pool,
                generation,
                prices,
            } => self.apply_prices(pool, generation, prices),
            TaskOutcome::Discovered { pool, outcome } => self.apply_discovery(pool, outcome),
            TaskOutcome::Reserves { pools, result } => self.apply_reserves_batch(pools, result),
        }
    }

    fn apply_block_logs(&mut self, block: u64, logs: Vec<Log>) {
        let plan = self.reconciler.plan(block, logs, &self.state.registry);
        debug!(
            "Block {}: {} updates, {} candidates",
            block,
            plan.updates.len(),
            plan.candidates.len()
        );
        for update in plan.updates {
            self.schedule_pricing(update.pool, update.reserves);
        }
        for candidate in plan.candidates {
            self.start_discovery(candidate.pool, candidate.reserves);
        }
        self.reconciler.finish(block);
    }

    fn schedule_pricing(&mut self, pool: Address, reserves: Option<Reserves>) {
        if let Some(reserves) = reserves {
            self.state.registry.update_reserves(&pool, reserves);
        }
        if self.state.in_flight.contains(&pool) {
            self.state.pending.insert(pool);
            return;
        }
        let Some(pool_state) = self.state.registry.get(&pool) else {
            return;
        };
        if self.config.kind == PipelineKind::V2 && pool_state.reserves.is_none() {
            return;
        }

        let record = pool_state.record.clone();
        let reserves = pool_state.reserves;
        let generation = self.state.generation;
        let custom_amount = self.state.custom_amount;
        let ctx = self.pricing.clone();
        self.state.in_flight.insert(pool);
        self.tasks.push(
            async move {
                let prices = ctx.price(record, reserves, custom_amount).await;
                TaskOutcome::Priced {
                    pool,
                    generation,
                    prices,
                }
            }
            .boxed(),
        );
    }

    fn apply_prices(&mut self, pool: Address, generation: u64, prices: Option<PoolPrices>) {
        self.state.in_flight.remove(&pool);

        if generation == self.state.generation {
            if let Some(record) = self.state.registry.get(&pool).map(|s| s.record.clone()) {
                let reference = self.config.reference.address;
                match prices {
                    Some(prices) => self.state.set_price(&record, reference, prices),
                    None => self.state.remove_price(&record, reference),
                }
                metrics::set_price_entries(self.state.prices.len());
            }
        } else {
            debug!("Dropping stale pricing result for {:?}", pool);
        }

        if self.state.pending.remove(&pool) {
            self.schedule_pricing(pool, None);
        }
    }

    fn start_discovery(&mut self, pool: Address, reserves: Option<Reserves>) {
        if let Some(latest) = self.state.validating.get_mut(&pool) {
            if reserves.is_some() {
                *latest = reserves;
            }
            return;
        }
        self.state.validating.insert(pool, reserves);

        let validator = self.validator.clone();
        let catalog = self.catalog.clone();
        self.tasks.push(
            async move {
                let outcome = validator.validate(pool).await;
                if let DiscoveryOutcome::Admitted(record) = &outcome {
                    match catalog.insert_pool_if_absent(record).await {
                        Ok(true) => info!("New pool saved: {:?} ({})", pool, record.quote()),
                        Ok(false) => debug!("Pool {:?} already in catalog", pool),
                        Err(e) => warn!("Failed to save pool {:?}: {}", pool, e),
                    }
                }
                TaskOutcome::Discovered { pool, outcome }
            }
            .boxed(),
        );
    }

    fn apply_discovery(&mut self, pool: Address, outcome: DiscoveryOutcome) {
        let reserves = self.state.validating.remove(&pool).flatten();
        match outcome {
            DiscoveryOutcome::Admitted(record) => {
                if self.state.registry.register(record) {
                    metrics::set_known_pools(self.state.registry.len());
                    self.schedule_pricing(pool, reserves);
                }
            }
            DiscoveryOutcome::Ignored(reason) => {
                self.state.registry.ignore(pool, reason.as_str());
            }
        }
    }

    fn on_reload_tick(&mut self) {
        if self.state.reload_queue.is_empty() {
            return;
        }
        let take = self.config.reload_batch_size.min(self.state.reload_queue.len());
        let batch: Vec<Address> = self.state.reload_queue.drain(..take).collect();
        debug!(
            "Reload batch of {} pools ({} left)",
            batch.len(),
            self.state.reload_queue.len()
        );

        match self.config.kind {
            PipelineKind::V2 => {
                let pools: Vec<(Address, u64)> = batch
                    .into_iter()
                    .filter_map(|pool| Some((pool, self.state.registry.reserves_seq(&pool)?)))
                    .collect();
                let client = self.client.clone();
                self.tasks.push(
                    async move {
                        let addresses: Vec<Address> = pools.iter().map(|(pool, _)| *pool).collect();
                        let result = client.reserves_batch(&addresses).await;
                        TaskOutcome::Reserves { pools, result }
                    }
                    .boxed(),
                );
            }
            PipelineKind::V3 => {
                for pool in batch {
                    self.schedule_pricing(pool, None);
                }
            }
        }
    }

    fn apply_reserves_batch(
        &mut self,
        pools: Vec<(Address, u64)>,
        result: Result<Vec<Option<Reserves>>>,
    ) {
        let reserves = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Reserve batch of {} pools failed: {}", pools.len(), e);
                return;
            }
        };
        let reference = self.config.reference.address;
        for ((pool, seq), slot) in pools.into_iter().zip(reserves) {
            let Some(reserves) = slot else {
                debug!("No reserves for {:?}", pool);
                continue;
            };
            let Some(state) = self.state.registry.get(&pool) else {
                continue;
            };
            // an event brought fresher reserves while the batch was out
            if state.reserves_seq != seq {
                debug!("Dropping reloaded reserves for {:?}, updated since", pool);
                continue;
            }
            if self.state.has_price(&state.record, reference) {
                continue;
            }
            if self.state.in_flight.contains(&pool) {
                self.state.pending.insert(pool);
                continue;
            }
            self.schedule_pricing(pool, Some(reserves));
        }
    }
}
