//! Liveness monitor for redundant price-feed instances.
//!
//! Each instance is polled for its price data and its block state. The canonical data is the
//! data of the first instance, in configured priority order, that has caught up with the
//! monitor's own chain head. An instance that lags the head and whose last block is older than
//! the kill interval is asked to terminate, once per polling cycle in which it is found stale.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::settings::Monitor as MonitorSettings;
use crate::types::BlockState;

#[async_trait]
pub trait InstanceClient: Send + Sync {
    async fn fetch_data(&self, instance: &str) -> Result<Value>;
    async fn fetch_block(&self, instance: &str) -> Result<BlockState>;
    async fn kill(&self, instance: &str) -> Result<()>;
}

/// Talks to instances over HTTP GET at `<base>/<path>`.
pub struct HttpInstanceClient {
    http: reqwest::Client,
    data_path: String,
    block_path: String,
    kill_path: String,
}

impl HttpInstanceClient {
    pub fn new(settings: &MonitorSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.http_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            data_path: settings.data_path.clone(),
            block_path: settings.block_path.clone(),
            kill_path: settings.kill_path.clone(),
        })
    }

    fn url(base: &str, path: &str) -> String {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    async fn get(&self, url: String) -> Result<reqwest::Response> {
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("GET {} returned {}", url, response.status()));
        }
        Ok(response)
    }
}

#[async_trait]
impl InstanceClient for HttpInstanceClient {
    async fn fetch_data(&self, instance: &str) -> Result<Value> {
        let value: Value = self
            .get(Self::url(instance, &self.data_path))
            .await?
            .json()
            .await?;
        // instances answer `false` when they have nothing to serve
        if value == Value::Bool(false) {
            return Err(anyhow!("{} has no data", instance));
        }
        Ok(value)
    }

    async fn fetch_block(&self, instance: &str) -> Result<BlockState> {
        Ok(self
            .get(Self::url(instance, &self.block_path))
            .await?
            .json()
            .await?)
    }

    async fn kill(&self, instance: &str) -> Result<()> {
        self.get(Self::url(instance, &self.kill_path)).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Unknown,
    Reporting,
    Stale,
    Killed,
}

#[derive(Debug, Clone)]
pub struct InstanceState {
    pub status: InstanceStatus,
    pub last_block: Option<BlockState>,
    pub last_data: Option<Value>,
    /// Unix ms of the last successful poll.
    pub last_seen_at: Option<i64>,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self {
            status: InstanceStatus::Unknown,
            last_block: None,
            last_data: None,
            last_seen_at: None,
        }
    }
}

pub struct LivenessMonitor {
    client: Arc<dyn InstanceClient>,
    instances: IndexMap<String, InstanceState>,
    head: BlockState,
    kill_interval_ms: i64,
}

impl LivenessMonitor {
    pub fn new(client: Arc<dyn InstanceClient>, instances: &[String], kill_interval: Duration) -> Self {
        Self {
            client,
            instances: instances
                .iter()
                .map(|id| (id.clone(), InstanceState::default()))
                .collect(),
            head: BlockState::default(),
            kill_interval_ms: kill_interval.as_millis() as i64,
        }
    }

    pub fn head(&self) -> BlockState {
        self.head
    }

    /// Records a head observed by the monitor's own subscription.
    pub fn observe_head(&mut self, block: u64, now_ms: i64) {
        if self.head.advance(block, now_ms) {
            info!("NEW_BLOCK {}", block);
            metrics::set_monitor_head(block);
        }
    }

    /// Polling only starts once the monitor has seen a head.
    pub fn is_started(&self) -> bool {
        self.head.current_block > 0
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceState> {
        self.instances.get(id)
    }

    /// Data of the first instance (priority order) whose last block is at or past the head.
    pub fn current_data(&self) -> Option<&Value> {
        self.instances.values().find_map(|state| {
            let block = state.last_block?;
            if block.current_block >= self.head.current_block {
                state.last_data.as_ref()
            } else {
                None
            }
        })
    }

    fn is_stale(&self, block: &BlockState, now_ms: i64) -> bool {
        block.current_block < self.head.current_block
            && now_ms - block.current_block_time > self.kill_interval_ms
    }

    /// Polls every instance concurrently, applies the results in priority order, then sends the
    /// kill requests for the stale ones.
    pub async fn poll_all(&mut self, now_ms: i64) {
        if !self.is_started() {
            return;
        }

        let client = self.client.clone();
        let ids: Vec<String> = self.instances.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| {
            let client = client.clone();
            async move {
                let (data, block) = futures::join!(client.fetch_data(id), client.fetch_block(id));
                data.and_then(|d| block.map(|b| (d, b)))
            }
        }))
        .await;

        let mut to_kill = Vec::new();
        for (id, result) in ids.iter().zip(results) {
            if self.apply_poll(id, result, now_ms) {
                to_kill.push(id.clone());
            }
        }

        for id in to_kill {
            self.kill_instance(&id).await;
        }
    }

    /// Returns true when this poll detected the instance as stale. Each detection gets exactly
    /// one kill request, sent after all results of the cycle are applied.
    fn apply_poll(&mut self, id: &str, result: Result<(Value, BlockState)>, now_ms: i64) -> bool {
        let stale = match &result {
            Ok((_, block)) => self.is_stale(block, now_ms),
            Err(_) => false,
        };
        let Some(state) = self.instances.get_mut(id) else {
            return false;
        };

        match result {
            Ok((data, block)) => {
                state.last_data = Some(data);
                state.last_block = Some(block);
                state.last_seen_at = Some(now_ms);

                if !stale {
                    if state.status != InstanceStatus::Reporting {
                        debug!("Instance {} reporting at block {}", id, block.current_block);
                    }
                    state.status = InstanceStatus::Reporting;
                    return false;
                }
                // a stale answer in a new cycle is a new detection
                error!("Block too old; killing instance {}", id);
                state.status = InstanceStatus::Stale;
                true
            }
            Err(e) => {
                warn!("Failed to fetch data from instance {}: {}", id, e);
                if state.status == InstanceStatus::Stale {
                    info!("Instance {} is gone", id);
                    state.status = InstanceStatus::Killed;
                }
                false
            }
        }
    }

    async fn kill_instance(&mut self, id: &str) {
        metrics::increment_monitor_kills(id);
        match self.client.kill(id).await {
            Ok(()) => {
                info!("Instance {} acknowledged kill", id);
                if let Some(state) = self.instances.get_mut(id) {
                    state.status = InstanceStatus::Killed;
                }
            }
            // stays Stale, so the next stale poll sends the kill again
            Err(e) => warn!("Kill request to {} failed: {}", id, e),
        }
    }
}

#[derive(Debug)]
pub enum MonitorCommand {
    CurrentData(oneshot::Sender<Option<Value>>),
    Block(oneshot::Sender<BlockState>),
    Kill(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::Sender<MonitorCommand>,
}

impl MonitorHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MonitorCommand>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { commands: tx }, rx)
    }

    /// Canonical data, or `None` when no instance has caught up with the head.
    pub async fn current_data(&self) -> Result<Option<Value>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MonitorCommand::CurrentData(tx))
            .await
            .map_err(|_| anyhow!("monitor stopped"))?;
        Ok(rx.await?)
    }

    pub async fn block(&self) -> Result<BlockState> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MonitorCommand::Block(tx))
            .await
            .map_err(|_| anyhow!("monitor stopped"))?;
        Ok(rx.await?)
    }

    pub async fn kill(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MonitorCommand::Kill(tx))
            .await
            .map_err(|_| anyhow!("monitor stopped"))?;
        Ok(rx.await?)
    }
}

/// Drives the monitor: heads from the watcher, periodic polls and handle commands.
/// Returns when killed or when the head watcher goes away.
pub async fn run(
    mut monitor: LivenessMonitor,
    mut heads: mpsc::Receiver<u64>,
    mut commands: mpsc::Receiver<MonitorCommand>,
    poll_interval: Duration,
) -> Result<()> {
    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            head = heads.recv() => match head {
                Some(block) => monitor.observe_head(block, chrono::Utc::now().timestamp_millis()),
                None => return Err(anyhow!("head watcher stopped")),
            },
            Some(command) = commands.recv() => match command {
                MonitorCommand::CurrentData(reply) => {
                    let _ = reply.send(monitor.current_data().cloned());
                }
                MonitorCommand::Block(reply) => {
                    let _ = reply.send(monitor.head());
                }
                MonitorCommand::Kill(reply) => {
                    let _ = reply.send(());
                    info!("Kill requested, stopping monitor");
                    return Ok(());
                }
            },
            _ = poll.tick() => monitor.poll_all(chrono::Utc::now().timestamp_millis()).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scripted {
        blocks: Mutex<HashMap<String, BlockState>>,
        down: Mutex<Vec<String>>,
        kills: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InstanceClient for Scripted {
        async fn fetch_data(&self, instance: &str) -> Result<Value> {
            if self.down.lock().unwrap().iter().any(|d| d == instance) {
                return Err(anyhow!("down"));
            }
            Ok(json!({ "from": instance }))
        }

        async fn fetch_block(&self, instance: &str) -> Result<BlockState> {
            self.blocks
                .lock()
                .unwrap()
                .get(instance)
                .copied()
                .ok_or_else(|| anyhow!("no block"))
        }

        async fn kill(&self, instance: &str) -> Result<()> {
            self.kills.lock().unwrap().push(instance.to_string());
            Ok(())
        }
    }

    fn block(current_block: u64, current_block_time: i64) -> BlockState {
        BlockState {
            current_block,
            current_block_time,
        }
    }

    #[tokio::test]
    async fn test_no_polling_before_first_head() {
        let client = Arc::new(Scripted::default());
        client.blocks.lock().unwrap().insert("a".into(), block(5, 0));
        let mut monitor = LivenessMonitor::new(client, &["a".to_string()], Duration::from_secs(60));

        monitor.poll_all(1_000).await;
        assert_eq!(monitor.instance("a").unwrap().status, InstanceStatus::Unknown);
        assert!(monitor.current_data().is_none());
    }

    #[tokio::test]
    async fn test_failed_poll_after_kill_marks_instance_gone() {
        let client = Arc::new(Scripted::default());
        client.blocks.lock().unwrap().insert("a".into(), block(10, 0));
        let mut monitor =
            LivenessMonitor::new(client.clone(), &["a".to_string()], Duration::from_secs(1));
        monitor.observe_head(20, 0);

        monitor.poll_all(5_000).await;
        assert_eq!(client.kills.lock().unwrap().len(), 1);
        assert_eq!(monitor.instance("a").unwrap().status, InstanceStatus::Killed);

        client.down.lock().unwrap().push("a".into());
        monitor.poll_all(6_000).await;
        assert_eq!(monitor.instance("a").unwrap().status, InstanceStatus::Killed);
        assert_eq!(client.kills.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_url_joining() {
        assert_eq!(
            HttpInstanceClient::url("http://a:5000/", "/uniswap2"),
            "http://a:5000/uniswap2"
        );
        assert_eq!(HttpInstanceClient::url("http://a:5000", "block"), "http://a:5000/block");
    }
}
