// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations.
// The stubs still evaluate their arguments so callers' bindings count as used.
#[cfg(not(feature = "observability"))]
pub enum Unit {
    Count,
    Milliseconds,
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = (&$label, &$label_value);)*
    }};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        $(let _ = (&$label, &$label_value);)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = (&$label, &$label_value);)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = (&$label, &$label_value);)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        $(let _ = (&$label, &$label_value);)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[allow(unused_imports)]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

/// Registers descriptions for every metric. Call once at startup.
pub fn describe_metrics() {
    describe_histogram!(
        "price_feed_block_processing_ms",
        Unit::Milliseconds,
        "Latency between first seeing a block and finishing its log pass."
    );
    describe_counter!(
        "price_feed_blocks_processed_total",
        Unit::Count,
        "Blocks whose logs were reconciled."
    );
    describe_counter!(
        "price_feed_pool_discoveries_total",
        Unit::Count,
        "Discovery outcomes, labeled by result and reason."
    );
    describe_gauge!("price_feed_price_entries", "Tokens currently carrying a price entry.");
    describe_gauge!("price_feed_known_pools", "Pools in the registry.");
    describe_counter!(
        "price_feed_fee_oracle_fallbacks_total",
        Unit::Count,
        "Transfer-fee lookups that fell back to defaults."
    );
    describe_counter!(
        "price_feed_price_removals_total",
        Unit::Count,
        "Pools dropped from an entry after a failed or below-floor computation."
    );
    describe_histogram!("multicall_batch_size_bucket", "Calls per multicall batch.");
    describe_counter!(
        "liveness_monitor_kills_total",
        Unit::Count,
        "Kill requests sent to stale instances."
    );
    describe_counter!(
        "liveness_monitor_resubscriptions_total",
        Unit::Count,
        "Head subscriptions torn down for inactivity."
    );
    describe_gauge!(
        "liveness_monitor_head_block",
        "Latest block observed by the monitor."
    );
}

// --- Helper functions to update metrics ---

pub fn record_block_processing(duration: std::time::Duration) {
    histogram!("price_feed_block_processing_ms", duration.as_secs_f64() * 1000.0);
    increment_counter!("price_feed_blocks_processed_total");
}

pub fn increment_pool_discoveries(result: &str, reason: &str) {
    counter!("price_feed_pool_discoveries_total", 1, "result" => result.to_string(), "reason" => reason.to_string());
}

pub fn set_price_entries(count: usize) {
    gauge!("price_feed_price_entries", count as f64);
}

pub fn set_known_pools(count: usize) {
    gauge!("price_feed_known_pools", count as f64);
}

pub fn increment_fee_oracle_fallbacks() {
    increment_counter!("price_feed_fee_oracle_fallbacks_total");
}

pub fn increment_price_removals() {
    increment_counter!("price_feed_price_removals_total");
}

pub fn record_multicall_batch_size(size: f64) {
    histogram!("multicall_batch_size_bucket", size);
}

pub fn increment_monitor_kills(instance: &str) {
    counter!("liveness_monitor_kills_total", 1, "instance" => instance.to_string());
}

pub fn increment_monitor_resubscriptions() {
    increment_counter!("liveness_monitor_resubscriptions_total");
}

pub fn set_monitor_head(block: u64) {
    gauge!("liveness_monitor_head_block", block as f64);
}
