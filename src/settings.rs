use config::{Config, ConfigError, File, FileFormat};
use ethers::types::{Address, H256};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn default_false() -> bool {
    false
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    pub ws_url: String,
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
}

fn default_call_timeout_seconds() -> u64 {
    8
}

/// Reference asset (wrapped native currency) used as the pricing denominator.
#[derive(Debug, Deserialize, Clone)]
pub struct ReferenceAsset {
    pub address: Address,
    #[serde(default = "default_reference_symbol")]
    pub symbol: String,
    #[serde(default = "default_reference_name")]
    pub name: String,
    #[serde(default = "default_reference_decimals")]
    pub decimals: u8,
}

fn default_reference_symbol() -> String {
    "WETH".to_string()
}
fn default_reference_name() -> String {
    "Wrapped Ether".to_string()
}
fn default_reference_decimals() -> u8 {
    18
}

#[derive(Debug, Deserialize, Clone)]
pub struct Chain {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub reference: ReferenceAsset,
}

fn default_chain_id() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct Contracts {
    #[serde(default = "default_v2_factory")]
    pub v2_factory: Address,
    #[serde(default = "default_v2_init_code_hash")]
    pub v2_init_code_hash: H256,
    #[serde(default = "default_v3_factory")]
    pub v3_factory: Address,
    #[serde(default = "default_v3_init_code_hash")]
    pub v3_init_code_hash: H256,
    #[serde(default = "default_v3_quoter")]
    pub v3_quoter: Address,
    #[serde(default = "default_fee_detector")]
    pub fee_detector: Address,
    #[serde(default = "default_multicall")]
    pub multicall: Address,
}

// Mainnet Uniswap deployments. Parsing constant literals cannot fail.
fn default_v2_factory() -> Address {
    "0x5C69bEe701ef814a2B6a3EDD4B1652CB9cc5aA6f".parse().unwrap_or_default()
}
fn default_v2_init_code_hash() -> H256 {
    "0x96e8ac4277198ff8b6f785478aa9a39f403cb768dd02cbee326c3e7da348845f"
        .parse()
        .unwrap_or_default()
}
fn default_v3_factory() -> Address {
    "0x1F98431c8aD98523631AE4a59f267346ea31F984".parse().unwrap_or_default()
}
fn default_v3_init_code_hash() -> H256 {
    "0xe34f199b19b2b4f47f68442619d555527d244f78a3297ea89325f843f87b8b54"
        .parse()
        .unwrap_or_default()
}
fn default_v3_quoter() -> Address {
    "0xb27308f9F90D607463bb33eA1BeBb41C27CE5AB6".parse().unwrap_or_default()
}
fn default_fee_detector() -> Address {
    "0x19C97dc2a25845C7f9d1d519c8C2d4809c58b43f".parse().unwrap_or_default()
}
fn default_multicall() -> Address {
    "0xcA11bde05977b3631167028862bE2a173976CA11".parse().unwrap_or_default()
}

impl Default for Contracts {
    fn default() -> Self {
        Self {
            v2_factory: default_v2_factory(),
            v2_init_code_hash: default_v2_init_code_hash(),
            v3_factory: default_v3_factory(),
            v3_init_code_hash: default_v3_init_code_hash(),
            v3_quoter: default_v3_quoter(),
            fee_detector: default_fee_detector(),
            multicall: default_multicall(),
        }
    }
}

/// Which reserve-acquisition strategy the pipeline runs.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Sync events + getReserves, priced with the constant-product formula.
    V2,
    /// Swap events, priced through the on-chain quoter.
    V3,
}

impl Default for PipelineKind {
    fn default() -> Self {
        PipelineKind::V2
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pipeline {
    #[serde(default)]
    pub kind: PipelineKind,
    #[serde(default = "default_handled_block_window")]
    pub handled_block_window: u64,
    #[serde(default = "default_reload_batch_size")]
    pub reload_batch_size: usize,
    #[serde(default = "default_reload_interval_ms")]
    pub reload_interval_ms: u64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_handled_block_window() -> u64 {
    2048
}
fn default_reload_batch_size() -> usize {
    100
}
fn default_reload_interval_ms() -> u64 {
    1000
}
fn default_event_queue_capacity() -> usize {
    1024
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            kind: PipelineKind::default(),
            handled_block_window: default_handled_block_window(),
            reload_batch_size: default_reload_batch_size(),
            reload_interval_ms: default_reload_interval_ms(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pricing {
    /// Reference trade amount in human units of the reference asset.
    #[serde(default = "default_reference_amount")]
    pub reference_amount: String,
    /// Adjustment amount in the reference asset's smallest unit.
    #[serde(default = "default_custom_amount")]
    pub custom_amount: String,
    /// Amount handed to the fee detector's `validate` probe.
    #[serde(default = "default_fee_probe_amount")]
    pub fee_probe_amount: u64,
    #[serde(default = "default_fallback_buy_fee_bps")]
    pub fallback_buy_fee_bps: u32,
    #[serde(default = "default_fallback_sell_fee_bps")]
    pub fallback_sell_fee_bps: u32,
    /// A detected buy fee of zero is raised to this value.
    #[serde(default = "default_min_buy_fee_bps")]
    pub min_buy_fee_bps: u32,
    #[serde(default = "default_fee_oracle_timeout_ms")]
    pub fee_oracle_timeout_ms: u64,
}

fn default_reference_amount() -> String {
    "1".to_string()
}
fn default_custom_amount() -> String {
    "1000000000000000000".to_string()
}
fn default_fee_probe_amount() -> u64 {
    10_000
}
fn default_fallback_buy_fee_bps() -> u32 {
    25
}
fn default_fallback_sell_fee_bps() -> u32 {
    0
}
fn default_min_buy_fee_bps() -> u32 {
    25
}
fn default_fee_oracle_timeout_ms() -> u64 {
    3000
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            reference_amount: default_reference_amount(),
            custom_amount: default_custom_amount(),
            fee_probe_amount: default_fee_probe_amount(),
            fallback_buy_fee_bps: default_fallback_buy_fee_bps(),
            fallback_sell_fee_bps: default_fallback_sell_fee_bps(),
            min_buy_fee_bps: default_min_buy_fee_bps(),
            fee_oracle_timeout_ms: default_fee_oracle_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for Database {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Monitor {
    /// Base URLs of the supervised instances, in priority order.
    #[serde(default)]
    pub instances: Vec<String>,
    #[serde(default = "default_data_path")]
    pub data_path: String,
    #[serde(default = "default_block_path")]
    pub block_path: String,
    #[serde(default = "default_kill_path")]
    pub kill_path: String,
    #[serde(default = "default_kill_interval_ms")]
    pub kill_interval_ms: u64,
    #[serde(default = "default_reset_interval_ms")]
    pub reset_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_data_path() -> String {
    "uniswap2".to_string()
}
fn default_block_path() -> String {
    "block".to_string()
}
fn default_kill_path() -> String {
    "kill".to_string()
}
fn default_kill_interval_ms() -> u64 {
    60_000
}
fn default_reset_interval_ms() -> u64 {
    30_000
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_http_timeout_ms() -> u64 {
    5000
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            data_path: default_data_path(),
            block_path: default_block_path(),
            kill_path: default_kill_path(),
            kill_interval_ms: default_kill_interval_ms(),
            reset_interval_ms: default_reset_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_false")]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub rpc: Rpc,
    pub chain: Chain,
    #[serde(default)]
    pub contracts: Contracts,
    #[serde(default)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub pricing: Pricing,
    #[serde(default)]
    pub database: Database,
    #[serde(default)]
    pub monitor: Monitor,
    #[serde(default)]
    pub log: LogSettings,
    /// Where runtime changes (the adjustment amount) are persisted.
    #[serde(default = "default_runtime_file")]
    pub runtime_file: PathBuf,
}

fn default_runtime_file() -> PathBuf {
    PathBuf::from("runtime.json")
}

/// Values changed at runtime and written back so they survive a restart.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOverrides {
    pub pricing: RuntimePricing,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RuntimePricing {
    pub custom_amount: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let path = env::var("PRICEFEED_CONFIG").unwrap_or_else(|_| "Config.toml".to_string());
        Self::from_path(&path)
    }

    /// Loads the TOML file at `path`, then the runtime override file it names, then env overrides.
    /// The TOML is read twice since the override location lives inside it.
    pub fn from_path(path: &str) -> Result<Self, ConfigError> {
        let base = Config::builder()
            .add_source(File::new(path, FileFormat::Toml))
            .build()?;

        let runtime_file: PathBuf = base
            .get_string("runtime_file")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_runtime_file());

        let s = Config::builder()
            .add_source(File::new(path, FileFormat::Toml))
            .add_source(
                File::from(runtime_file.as_path())
                    .format(FileFormat::Json)
                    .required(false),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        if let Ok(ws) = env::var("PRICEFEED_RPC_WS_URL") {
            let trimmed = ws.trim();
            if !trimmed.is_empty() {
                settings.rpc.ws_url = trimmed.to_string();
            }
        }
        if let Ok(url) = env::var("PRICEFEED_DATABASE_URL") {
            let trimmed = url.trim();
            if !trimmed.is_empty() {
                settings.database.url = Some(trimmed.to_string());
            }
        }

        Ok(settings)
    }
}

/// Writes the adjustment amount to the runtime override file.
pub fn persist_custom_amount(path: &Path, custom_amount: &str) -> anyhow::Result<()> {
    let overrides = RuntimeOverrides {
        pricing: RuntimePricing {
            custom_amount: custom_amount.to_string(),
        },
    };
    let json = serde_json::to_string_pretty(&overrides)?;
    fs::write(path, json)?;
    Ok(())
}
