//! Metrics module
//!
//! Names of the metrics the aggregation engine reports through its
//! [`MetricsSink`], the size buckets latencies are filed under, and a sink
//! that discards everything.

use std::time::Duration;

use crate::domain::ports::MetricsSink;

// =============================================================================
// Latency operations
// =============================================================================

pub const OP_STRIPE: &str = "stripe";
pub const OP_ENCODE: &str = "encode";
pub const OP_UPDATE: &str = "update";
pub const OP_FETCH: &str = "fetch";
pub const OP_COMMIT: &str = "commit";
pub const OP_PASS: &str = "pass";

// =============================================================================
// Counters
// =============================================================================

pub const STRIPES_REMOVED_STALE: &str = "ec_agg_stripes_removed_stale_total";
pub const STRIPES_ENCODED: &str = "ec_agg_stripes_encoded_total";
pub const STRIPES_SKIPPED: &str = "ec_agg_stripes_skipped_total";
pub const STRIPES_HOLES_RECOVERED: &str = "ec_agg_stripes_holes_recovered_total";
pub const STRIPES_UPDATED_INCREMENTAL: &str = "ec_agg_stripes_updated_incremental_total";
pub const STRIPES_UPDATED_RECALC: &str = "ec_agg_stripes_updated_recalc_total";
pub const OBJECTS_SKIPPED: &str = "ec_agg_objects_skipped_total";
pub const OBJECTS_FAILED: &str = "ec_agg_objects_failed_total";
pub const TX_RETRIES: &str = "ec_agg_tx_retries_total";
pub const FETCH_RETRIES: &str = "ec_agg_fetch_retries_total";
pub const CHECKSUM_ERRORS: &str = "ec_agg_checksum_errors_total";
pub const PASSES_COMPLETED: &str = "ec_agg_passes_completed_total";
pub const PASSES_ABORTED: &str = "ec_agg_passes_aborted_total";

// =============================================================================
// Gauges
// =============================================================================

pub const LOW_WATER_EPOCH: &str = "ec_agg_low_water_epoch";

/// Help text for a metric name.
pub fn help(name: &str) -> &'static str {
    match name {
        STRIPES_REMOVED_STALE => "Stripes whose replicas were older than their parity",
        STRIPES_ENCODED => "Stripes encoded from a full set of replicas",
        STRIPES_SKIPPED => "Stripes left replicated for lack of data",
        STRIPES_HOLES_RECOVERED => "Stripes converted back to replicas after a punch",
        STRIPES_UPDATED_INCREMENTAL => "Partial stripes folded into parity incrementally",
        STRIPES_UPDATED_RECALC => "Partial stripes re-encoded from all cells",
        OBJECTS_SKIPPED => "Objects skipped while leadership was changing",
        OBJECTS_FAILED => "Objects whose aggregation failed",
        TX_RETRIES => "Write-back transactions restarted after a conflict",
        FETCH_RETRIES => "Peer fetches retried after a transport error",
        CHECKSUM_ERRORS => "Peer fetches rejected for a checksum mismatch",
        PASSES_COMPLETED => "Aggregation passes run to completion",
        PASSES_ABORTED => "Aggregation passes torn down before completion",
        LOW_WATER_EPOCH => "Epoch through which the container is aggregated",
        _ => "EC aggregation metric",
    }
}

/// Every bucket [`size_bucket`] can return, plus the one whole passes use.
pub const SIZE_BUCKETS: &[&str] = &["4KiB", "64KiB", "1MiB", "large", "all"];

/// Size bucket a latency sample is filed under.
pub fn size_bucket(bytes: usize) -> &'static str {
    match bytes {
        0..=4096 => "4KiB",
        4097..=65_536 => "64KiB",
        65_537..=1_048_576 => "1MiB",
        _ => "large",
    }
}

/// Sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_latency(&self, _op: &'static str, _bucket: &'static str, _value: Duration) {}

    fn increment(&self, _counter: &'static str) {}

    fn set_gauge(&self, _gauge: &'static str, _value: f64) {}
}
