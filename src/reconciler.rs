//! Turns block and log notifications into one ordered pass per block.
//!
//! A log notification only says "something happened in block N". The first time a block number
//! is seen its full log list is fetched once, replayed most-recent-first and reduced to a single
//! entry per pool address, so the state that applies is the last one the block produced.

use ethers::contract::{parse_log, EthEvent};
use ethers::types::{Address, Log, H256, U256};
use log::info;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};

use crate::chain_client::ChainClient;
use crate::contracts::{SwapFilter, SyncFilter};
use crate::metrics;
use crate::registry::PoolRegistry;
use crate::settings::PipelineKind;
use crate::types::Reserves;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("failed to fetch logs of block {block}: {reason}")]
    LogFetch { block: u64, reason: String },
}

/// First topic of the event each pipeline follows: `Sync` for V2, `Swap` for V3.
pub fn event_topic(kind: PipelineKind) -> H256 {
    match kind {
        PipelineKind::V2 => SyncFilter::signature(),
        PipelineKind::V3 => SwapFilter::signature(),
    }
}

/// Latest in-block state of one pool. V2 logs carry reserves, V3 swaps only name the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolUpdate {
    pub pool: Address,
    pub reserves: Option<Reserves>,
}

pub fn decode_log(kind: PipelineKind, log: &Log) -> Option<PoolUpdate> {
    if log.topics.first() != Some(&event_topic(kind)) {
        return None;
    }
    match kind {
        PipelineKind::V2 => {
            let sync: SyncFilter = parse_log(log.clone()).ok()?;
            Some(PoolUpdate {
                pool: log.address,
                reserves: Some(Reserves::new(
                    U256::from(sync.reserve_0),
                    U256::from(sync.reserve_1),
                )),
            })
        }
        PipelineKind::V3 => Some(PoolUpdate {
            pool: log.address,
            reserves: None,
        }),
    }
}

/// Block numbers already handled, kept to a sliding window below the highest one.
///
/// Anything older than `highest - window` counts as handled, so pruning never lets a block be
/// processed twice.
#[derive(Debug)]
pub struct HandledBlocks {
    window: u64,
    seen: BTreeSet<u64>,
}

impl HandledBlocks {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            seen: BTreeSet::new(),
        }
    }

    fn floor(&self) -> u64 {
        self.seen
            .iter()
            .next_back()
            .map(|h| h.saturating_sub(self.window))
            .unwrap_or(0)
    }

    pub fn is_handled(&self, block: u64) -> bool {
        block < self.floor() || self.seen.contains(&block)
    }

    /// Marks `block` handled. Returns false if it already was.
    pub fn mark(&mut self, block: u64) -> bool {
        if self.is_handled(block) {
            return false;
        }
        self.seen.insert(block);
        let floor = self.floor();
        self.seen = self.seen.split_off(&floor);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Time from first seeing a block to finishing its log pass, with a running average.
#[derive(Debug)]
pub struct LatencyTracker {
    window: u64,
    first_seen: BTreeMap<u64, Instant>,
    total: Duration,
    count: u32,
}

impl LatencyTracker {
    pub fn new(window: u64) -> Self {
        Self {
            window: window.max(1),
            first_seen: BTreeMap::new(),
            total: Duration::ZERO,
            count: 0,
        }
    }

    pub fn seen(&mut self, block: u64, at: Instant) {
        self.first_seen.entry(block).or_insert(at);
        // blocks with no matching logs are never processed
        let floor = block.saturating_sub(self.window);
        self.first_seen = self.first_seen.split_off(&floor);
    }

    /// Returns `(latency, running_average)` if the block's first sighting was recorded.
    pub fn processed(&mut self, block: u64, at: Instant) -> Option<(Duration, Duration)> {
        let start = self.first_seen.remove(&block)?;
        let latency = at.saturating_duration_since(start);
        self.total += latency;
        self.count = self.count.saturating_add(1);
        Some((latency, self.total / self.count.max(1)))
    }
}

/// What a block's logs resolve to.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockPlan {
    pub block: u64,
    /// Registered pools, with their latest in-block state.
    pub updates: Vec<PoolUpdate>,
    /// Unknown, not-yet-ignored addresses to hand to the discovery validator.
    pub candidates: Vec<PoolUpdate>,
}

/// Reduces a block's logs to one entry per pool, latest first.
///
/// Removed logs and logs from other blocks are dropped; ignored addresses produce nothing.
pub fn plan_block(kind: PipelineKind, block: u64, mut logs: Vec<Log>, registry: &PoolRegistry) -> BlockPlan {
    logs.retain(|log| !log.removed.unwrap_or(false));
    logs.retain(|log| log.block_number.map(|n| n.as_u64() == block).unwrap_or(true));
    logs.sort_by(|a, b| {
        let key = |l: &Log| (l.transaction_index, l.log_index);
        key(b).cmp(&key(a))
    });

    let mut seen = HashSet::new();
    let mut plan = BlockPlan {
        block,
        ..Default::default()
    };
    for log in &logs {
        let Some(update) = decode_log(kind, log) else {
            continue;
        };
        if !seen.insert(update.pool) {
            continue;
        }
        if registry.is_known(&update.pool) {
            plan.updates.push(update);
        } else if !registry.is_ignored(&update.pool) {
            plan.candidates.push(update);
        }
    }
    plan
}

/// Owns the per-block bookkeeping of the event pipeline.
#[derive(Debug)]
pub struct Reconciler {
    kind: PipelineKind,
    handled: HandledBlocks,
    latency: LatencyTracker,
}

impl Reconciler {
    pub fn new(kind: PipelineKind, window: u64) -> Self {
        Self {
            kind,
            handled: HandledBlocks::new(window),
            latency: LatencyTracker::new(window),
        }
    }

    pub fn topic(&self) -> H256 {
        event_topic(self.kind)
    }

    pub fn block_seen(&mut self, block: u64) {
        self.latency.seen(block, Instant::now());
    }

    /// Claims `block` for processing. Only the first claim for a block number succeeds.
    pub fn claim(&mut self, block: u64) -> bool {
        self.handled.mark(block)
    }

    pub fn plan(&self, block: u64, logs: Vec<Log>, registry: &PoolRegistry) -> BlockPlan {
        plan_block(self.kind, block, logs, registry)
    }

    pub fn finish(&mut self, block: u64) {
        if let Some((latency, average)) = self.latency.processed(block, Instant::now()) {
            info!(
                "Block {} logs processed in {} ms (avg {} ms)",
                block,
                latency.as_millis(),
                average.as_millis()
            );
            metrics::record_block_processing(latency);
        }
    }
}

/// Fetches the authoritative log list of exactly `block` for `topic`.
pub async fn fetch_block_logs(
    client: &dyn ChainClient,
    block: u64,
    topic: H256,
) -> Result<Vec<Log>, ReconcileError> {
    client
        .block_logs(block, topic)
        .await
        .map_err(|e| ReconcileError::LogFetch {
            block,
            reason: e.to_string(),
        })
}
