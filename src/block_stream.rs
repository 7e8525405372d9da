// Chain subscriptions pumped into mpsc queues.
//
// The pipeline needs two feeds (new heads and topic-filtered logs) merged into one ordered queue
// for the engine; the liveness monitor only needs heads, but must survive a silent websocket by
// resubscribing when nothing arrives for a while.

use crate::engine::ChainEvent;
use crate::metrics;
use anyhow::Result;
use ethers::providers::{Middleware, Provider, Ws};
use ethers::types::{Filter, H256};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub async fn connect(ws_url: &str) -> Result<Arc<Provider<Ws>>> {
    let provider = Provider::<Ws>::connect(ws_url).await?;
    info!("Connected to {}", ws_url);
    Ok(Arc::new(provider))
}

/// Forwards new heads and logs matching `topic` as [`ChainEvent`]s.
///
/// When either subscription ends or fails a final `ChainEvent::Closed` is sent and the task exits.
pub fn spawn_pipeline_subscriptions(
    provider: Arc<Provider<Ws>>,
    topic: H256,
    events: mpsc::Sender<ChainEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = match pump(&provider, topic, &events).await {
            Ok(reason) => reason,
            Err(e) => e.to_string(),
        };
        error!("Pipeline subscriptions stopped: {}", reason);
        let _ = events.send(ChainEvent::Closed(reason)).await;
    })
}

async fn pump(
    provider: &Provider<Ws>,
    topic: H256,
    events: &mpsc::Sender<ChainEvent>,
) -> Result<String> {
    let mut blocks = provider.subscribe_blocks().await?;
    info!("blocks subscription init");
    let filter = Filter::new().topic0(topic);
    let mut logs = provider.subscribe_logs(&filter).await?;
    info!("logs subscription init");

    loop {
        let event = tokio::select! {
            block = blocks.next() => match block {
                Some(block) => match block.number {
                    Some(number) => ChainEvent::NewBlock(number.as_u64()),
                    None => continue,
                },
                None => return Ok("block subscription ended".to_string()),
            },
            log = logs.next() => match log {
                Some(log) => ChainEvent::Log(log),
                None => return Ok("log subscription ended".to_string()),
            },
        };
        if events.send(event).await.is_err() {
            return Ok("engine stopped".to_string());
        }
    }
}

/// Follows chain heads for the liveness monitor and sends each block number on `heads`.
///
/// The subscription (and its connection) is dropped and re-established when no block arrives
/// within `reset_interval`. Runs until the receiver is dropped.
pub fn spawn_head_watcher(
    ws_url: String,
    reset_interval: Duration,
    heads: mpsc::Sender<u64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match watch_heads(&ws_url, reset_interval, &heads).await {
                Ok(true) => return,
                Ok(false) => {
                    metrics::increment_monitor_resubscriptions();
                    warn!(
                        "No block within {:?}, resubscribing to heads",
                        reset_interval
                    );
                }
                Err(e) => {
                    warn!("Head subscription failed: {}, retrying", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    })
}

/// Returns `Ok(true)` once the receiver is gone, `Ok(false)` when the feed went quiet or ended.
async fn watch_heads(ws_url: &str, reset_interval: Duration, heads: &mpsc::Sender<u64>) -> Result<bool> {
    let provider = Provider::<Ws>::connect(ws_url).await?;
    let head = provider.get_block_number().await?;
    if heads.send(head.as_u64()).await.is_err() {
        return Ok(true);
    }
    let mut stream = provider.subscribe_blocks().await?;
    info!("monitor blocks subscription init");

    loop {
        match tokio::time::timeout(reset_interval, stream.next()).await {
            Ok(Some(block)) => {
                let Some(number) = block.number else {
                    continue;
                };
                debug!("head {}", number);
                if heads.send(number.as_u64()).await.is_err() {
                    return Ok(true);
                }
            }
            Ok(None) | Err(_) => return Ok(false),
        }
    }
}
