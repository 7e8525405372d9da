//! # Price Feed Service
//!
//! Runs one pricing pipeline (V2 reserves or V3 quoter, per `pipeline.kind`) against a websocket
//! endpoint until killed.
//!
//! ## Overview
//!
//! This service:
//! - Loads the pool catalog (PostgreSQL when `database.url` is set, in-memory otherwise)
//! - Subscribes to new heads and to `Sync`/`Swap` logs
//! - Keeps a price entry per token paired with the reference asset
//! - Exits with status 1 when killed or when a subscription drops, so a supervisor restarts it
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin price_feed -- --config Config.toml
//! ```

use anyhow::Result;
use clap::Parser;
use dex_price_feed::{
    block_stream,
    chain_client::{ChainClient, ContractAddresses, EthersChainClient},
    database::{self, MemoryPoolCatalog, PgPoolCatalog, PoolCatalog},
    engine::{Engine, EngineConfig},
    fee_oracle::{FeeOracle, FeeOracleConfig},
    metrics,
    reconciler::event_topic,
    settings::{LogSettings, PipelineKind, Settings},
    validator::{FactoryConfig, PoolDiscoveryValidator},
};
use ethers::types::U256;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "price_feed", about = "DEX price feed for tokens paired with the reference asset")]
struct Args {
    /// Path to the TOML config. Defaults to $PRICEFEED_CONFIG, then Config.toml.
    #[arg(long)]
    config: Option<String>,

    /// Address for the Prometheus exporter (observability builds only).
    #[arg(long, default_value = "0.0.0.0:9000")]
    metrics_addr: std::net::SocketAddr,
}

fn init_logging(log: &LogSettings) {
    #[cfg(feature = "observability")]
    {
        let level = log
            .level
            .parse::<tracing::Level>()
            .unwrap_or(tracing::Level::INFO);
        let builder = tracing_subscriber::fmt().with_max_level(level);
        if log.json {
            builder.json().init();
        } else {
            builder.init();
        }
    }
    #[cfg(not(feature = "observability"))]
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log.level.as_str()))
        .init();
}

#[cfg(feature = "observability")]
fn init_metrics(addr: std::net::SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}

#[cfg(not(feature = "observability"))]
fn init_metrics(_addr: std::net::SocketAddr) -> Result<()> {
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();
    let args = Args::parse();

    // 1. Load settings
    let settings = match &args.config {
        Some(path) => Settings::from_path(path)?,
        None => Settings::new()?,
    };
    init_logging(&settings.log);
    init_metrics(args.metrics_addr)?;
    metrics::describe_metrics();
    info!(
        "Starting price feed ({:?} pipeline, chain {})",
        settings.pipeline.kind, settings.chain.chain_id
    );

    // 2. Catalog
    let catalog: Arc<dyn PoolCatalog> = match &settings.database.url {
        Some(url) => {
            let pool = database::connect(url, settings.database.max_connections).await?;
            Arc::new(PgPoolCatalog::new(pool))
        }
        None => {
            warn!("No database configured, discovered pools are kept in memory only");
            Arc::new(MemoryPoolCatalog::new())
        }
    };

    // 3. Chain access
    let provider = block_stream::connect(&settings.rpc.ws_url).await?;
    let client: Arc<dyn ChainClient> = Arc::new(EthersChainClient::new(
        provider.clone(),
        ContractAddresses {
            multicall: settings.contracts.multicall,
            quoter: settings.contracts.v3_quoter,
            fee_detector: settings.contracts.fee_detector,
        },
        settings.pipeline.reload_batch_size,
        Duration::from_secs(settings.rpc.call_timeout_seconds),
    ));

    // 4. Pipeline components
    let config = EngineConfig::from_settings(&settings)?;
    let fees = Arc::new(FeeOracle::new(
        client.clone(),
        FeeOracleConfig {
            reference: config.reference.address,
            probe_amount: U256::from(settings.pricing.fee_probe_amount),
            fallback_buy_fee_bps: settings.pricing.fallback_buy_fee_bps,
            fallback_sell_fee_bps: settings.pricing.fallback_sell_fee_bps,
            min_buy_fee_bps: settings.pricing.min_buy_fee_bps,
            timeout: Duration::from_millis(settings.pricing.fee_oracle_timeout_ms),
        },
    ));
    let factory = match config.kind {
        PipelineKind::V2 => FactoryConfig {
            factory: settings.contracts.v2_factory,
            init_code_hash: settings.contracts.v2_init_code_hash,
        },
        PipelineKind::V3 => FactoryConfig {
            factory: settings.contracts.v3_factory,
            init_code_hash: settings.contracts.v3_init_code_hash,
        },
    };
    let validator = Arc::new(PoolDiscoveryValidator::new(
        client.clone(),
        config.kind,
        config.chain_id,
        config.reference.clone(),
        factory,
    ));

    let topic = event_topic(config.kind);
    let (mut engine, handle) = Engine::new(config, client, catalog, fees, validator);
    engine.load_catalog().await?;

    // 5. Subscriptions
    let (events_tx, events_rx) = mpsc::channel(settings.pipeline.event_queue_capacity.max(1));
    block_stream::spawn_pipeline_subscriptions(provider, topic, events_tx);

    let mut engine_task = tokio::spawn(engine.run(events_rx));
    tokio::select! {
        result = &mut engine_task => match result {
            Ok(Ok(())) => info!("Engine stopped on kill request"),
            Ok(Err(e)) => error!("Engine stopped: {}", e),
            Err(e) => error!("Engine task failed: {}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Ctrl+C received, stopping engine");
            if let Err(e) = handle.kill().await {
                warn!("Engine did not acknowledge kill: {}", e);
            }
            let _ = engine_task.await;
        }
    }

    std::process::exit(1);
}
