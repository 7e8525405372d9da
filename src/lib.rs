//! # DEX Price Feed
//!
//! Real-time prices for every token paired with a chain's reference asset on a Uniswap V2 or
//! V3 style exchange, plus a liveness monitor that fails over between redundant feed instances.
//!
//! ## Overview
//!
//! A feed instance runs one pipeline (V2 reserves or V3 quoter). It:
//!
//! - **Reconciles** `Sync`/`Swap` events block by block, deduplicating per pool
//! - **Discovers** unknown pools from those events and validates them before admission
//! - **Prices** each pool at the reference amount and at an adjustable custom amount,
//!   corrected by the token's transfer fees
//! - **Reloads** the whole known set periodically so quiet pools stay fresh
//!
//! ## Architecture
//!
//! ### Chain Layer
//! Websocket subscriptions, multicall batching and typed contract bindings behind the
//! [`chain_client::ChainClient`] trait.
//!
//! ### Pipeline Layer
//! The [`engine::Engine`] owns all mutable state and serializes every mutation through one task;
//! network work runs in spawned futures whose results come back as messages.
//!
//! ### Monitor
//! [`monitor::LivenessMonitor`] polls instances, serves the freshest data and kills stale ones.

// Core Types
/// Pool, token, price and block types
pub mod types;
/// Typed contract bindings (public ABIs only)
pub mod contracts;

// Chain Layer
/// Websocket subscriptions for heads and pool events
pub mod block_stream;
/// Read-only chain access used by the pipelines
pub mod chain_client;
/// Multicall batch RPC utilities
pub mod multicall;
/// CREATE2 pool address derivation
pub mod pool_address;

// Pipeline Layer
/// Per-block event planning and deduplication
pub mod reconciler;
/// Candidate pool validation
pub mod validator;
/// Transfer-fee lookups with fallbacks
pub mod fee_oracle;
/// Swap price math and display formatting
pub mod pricing;
/// In-memory pool registry
pub mod registry;
/// Pipeline event loop and command handle
pub mod engine;

// Monitor
/// Instance liveness monitor and failover
pub mod monitor;

// Infrastructure
/// PostgreSQL pool catalog
pub mod database;
/// Metrics and observability
pub mod metrics;

// Settings & Configuration
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use chain_client::{ChainClient, EthersChainClient};
pub use engine::{Engine, EngineHandle};
pub use fee_oracle::FeeOracle;
pub use monitor::LivenessMonitor;
pub use registry::PoolRegistry;
pub use settings::Settings;
pub use validator::PoolDiscoveryValidator;
