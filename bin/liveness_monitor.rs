//! # Liveness Monitor
//!
//! Supervises redundant price-feed instances. Follows the chain head on its own websocket
//! connection, polls every instance in `monitor.instances` and kills the ones that fall behind.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin liveness_monitor -- --config Config.toml
//! ```

use anyhow::{bail, Result};
use clap::Parser;
use dex_price_feed::{
    block_stream,
    metrics,
    monitor::{self, HttpInstanceClient, LivenessMonitor, MonitorHandle},
    settings::Settings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "liveness_monitor", about = "Failover monitor for price-feed instances")]
struct Args {
    /// Path to the TOML config. Defaults to $PRICEFEED_CONFIG, then Config.toml.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings::new()?,
    };

    #[cfg(feature = "observability")]
    tracing_subscriber::fmt()
        .with_max_level(
            settings
                .log
                .level
                .parse::<tracing::Level>()
                .unwrap_or(tracing::Level::INFO),
        )
        .init();
    #[cfg(not(feature = "observability"))]
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log.level.as_str()),
    )
    .init();
    metrics::describe_metrics();

    let cfg = &settings.monitor;
    if cfg.instances.is_empty() {
        bail!("monitor.instances is empty, nothing to supervise");
    }
    info!("Monitoring {} instances: {:?}", cfg.instances.len(), cfg.instances);

    let client = Arc::new(HttpInstanceClient::new(cfg)?);
    let liveness = LivenessMonitor::new(
        client,
        &cfg.instances,
        Duration::from_millis(cfg.kill_interval_ms),
    );

    let (heads_tx, heads_rx) = mpsc::channel(64);
    block_stream::spawn_head_watcher(
        settings.rpc.ws_url.clone(),
        Duration::from_millis(cfg.reset_interval_ms),
        heads_tx,
    );

    let (handle, commands) = MonitorHandle::channel(64);
    let mut task = tokio::spawn(monitor::run(
        liveness,
        heads_rx,
        commands,
        Duration::from_millis(cfg.poll_interval_ms.max(1)),
    ));

    tokio::select! {
        result = &mut task => match result {
            Ok(Ok(())) => info!("Monitor stopped on kill request"),
            Ok(Err(e)) => error!("Monitor stopped: {}", e),
            Err(e) => error!("Monitor task failed: {}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Ctrl+C received, stopping monitor");
            if let Err(e) = handle.kill().await {
                warn!("Monitor did not acknowledge kill: {}", e);
            }
            let _ = task.await;
        }
    }

    std::process::exit(1);
}
