//! Metrics instrumentation via the `metrics` crate facade.
//!
//! The runtime only records; installing an exporter (Prometheus or
//! otherwise) is the host application's job. Without a recorder installed,
//! every call here is a no-op.
//!
//! Naming convention: `caravel_{component}_{name}_{unit}`.

use std::time::Duration;

/// Delivery-engine metrics.
pub struct ClientMetrics;

impl ClientMetrics {
    // ---- Producer ----

    pub fn increment_records_published(delivery: &'static str, count: u64) {
        metrics::counter!("caravel_producer_records_published_total", "delivery" => delivery)
            .increment(count);
    }

    pub fn increment_publish_errors() {
        metrics::counter!("caravel_producer_publish_errors_total").increment(1);
    }

    pub fn increment_dead_letters_published() {
        metrics::counter!("caravel_producer_dead_letters_total").increment(1);
    }

    pub fn record_publish_latency(elapsed: Duration) {
        metrics::histogram!("caravel_producer_publish_duration_seconds")
            .record(elapsed.as_secs_f64());
    }

    // ---- Consumer pipeline ----

    pub fn increment_records_received() {
        metrics::counter!("caravel_consumer_records_received_total").increment(1);
    }

    pub fn increment_records_processed() {
        metrics::counter!("caravel_consumer_records_processed_total").increment(1);
    }

    pub fn increment_handler_retries() {
        metrics::counter!("caravel_consumer_handler_retries_total").increment(1);
    }

    pub fn increment_permanent_failures() {
        metrics::counter!("caravel_consumer_permanent_failures_total").increment(1);
    }

    pub fn increment_offsets_committed() {
        metrics::counter!("caravel_consumer_offsets_committed_total").increment(1);
    }

    pub fn record_handler_latency(elapsed: Duration) {
        metrics::histogram!("caravel_consumer_handler_duration_seconds")
            .record(elapsed.as_secs_f64());
    }

    pub fn set_queue_depth(consumer: &str, depth: usize) {
        metrics::gauge!("caravel_consumer_queue_depth", "consumer" => consumer.to_string())
            .set(depth as f64);
    }

    // ---- Transactions ----

    pub fn increment_transactions_begun() {
        metrics::counter!("caravel_txn_begun_total").increment(1);
    }

    pub fn increment_transactions_committed() {
        metrics::counter!("caravel_txn_committed_total").increment(1);
    }

    pub fn increment_transactions_aborted() {
        metrics::counter!("caravel_txn_aborted_total").increment(1);
    }

    // ---- Pool ----

    pub fn increment_pool_hits() {
        metrics::counter!("caravel_pool_hits_total").increment(1);
    }

    pub fn increment_pool_misses() {
        metrics::counter!("caravel_pool_misses_total").increment(1);
    }

    pub fn increment_pool_evictions(count: u64) {
        metrics::counter!("caravel_pool_evictions_total").increment(count);
    }

    pub fn set_pool_size(size: usize) {
        metrics::gauge!("caravel_pool_size").set(size as f64);
    }
}
