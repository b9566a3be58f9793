//! Metrics module for metering-service.
//! Provides Prometheus metrics for ingestion, the billing ledger and
//! reconciliation.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Repository query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!(
            "metering_db_query_duration_seconds",
            "Repository query duration"
        ),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Events ingested (per-organization metering)
pub static EVENTS_INGESTED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Ledger entries accrued by kind
pub static ENTRIES_ACCRUED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Billing period state transitions
pub static PERIOD_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Pricing failures
pub static PRICING_FAILURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reconciliation mismatches by classification and severity
pub static MISMATCHES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Reconciliation runs by outcome
pub static RECONCILIATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Sweep runs by status
pub static SWEEP_RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    EVENTS_INGESTED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_events_ingested_total",
                "Total events ingested by organization and outcome"
            ),
            &["organization_id", "outcome"]
        )
        .expect("Failed to register EVENTS_INGESTED_TOTAL")
    });

    ENTRIES_ACCRUED_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_entries_accrued_total",
                "Total billing entries created by kind"
            ),
            &["kind"]
        )
        .expect("Failed to register ENTRIES_ACCRUED_TOTAL")
    });

    PERIOD_TRANSITIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_period_transitions_total",
                "Total billing period transitions by target state"
            ),
            &["state"]
        )
        .expect("Failed to register PERIOD_TRANSITIONS_TOTAL")
    });

    PRICING_FAILURES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_pricing_failures_total",
                "Total pricing failures by price kind"
            ),
            &["price_kind"]
        )
        .expect("Failed to register PRICING_FAILURES_TOTAL")
    });

    MISMATCHES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_reconciliation_mismatches_total",
                "Total reconciliation mismatches by classification and severity"
            ),
            &["classification", "severity"]
        )
        .expect("Failed to register MISMATCHES_TOTAL")
    });

    RECONCILIATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "metering_reconciliations_total",
                "Total reconciliations by outcome"
            ),
            &["outcome"]
        )
        .expect("Failed to register RECONCILIATIONS_TOTAL")
    });

    SWEEP_RUNS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_sweep_runs_total", "Total reconciliation sweeps by status"),
            &["status"]
        )
        .expect("Failed to register SWEEP_RUNS_TOTAL")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("metering_errors_total", "Total errors by type for alerting"),
            &["error_type", "operation"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Record an ingested event.
pub fn record_event_ingested(organization_id: &str, outcome: &str) {
    if let Some(counter) = EVENTS_INGESTED_TOTAL.get() {
        counter.with_label_values(&[organization_id, outcome]).inc();
    }
}

/// Record accrued ledger entries.
pub fn record_entries_accrued(kind: &str, count: u64) {
    if let Some(counter) = ENTRIES_ACCRUED_TOTAL.get() {
        counter.with_label_values(&[kind]).inc_by(count);
    }
}

/// Record a billing period transition.
pub fn record_period_transition(state: &str) {
    if let Some(counter) = PERIOD_TRANSITIONS_TOTAL.get() {
        counter.with_label_values(&[state]).inc();
    }
}

/// Record a pricing failure.
pub fn record_pricing_failure(price_kind: &str) {
    if let Some(counter) = PRICING_FAILURES_TOTAL.get() {
        counter.with_label_values(&[price_kind]).inc();
    }
}

/// Record a reconciliation mismatch.
pub fn record_mismatch(classification: &str, severity: &str) {
    if let Some(counter) = MISMATCHES_TOTAL.get() {
        counter.with_label_values(&[classification, severity]).inc();
    }
}

/// Record a reconciliation outcome.
pub fn record_reconciliation(outcome: &str) {
    if let Some(counter) = RECONCILIATIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Record a sweep run.
pub fn record_sweep_run(status: &str) {
    if let Some(counter) = SWEEP_RUNS_TOTAL.get() {
        counter.with_label_values(&[status]).inc();
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, operation: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, operation]).inc();
    }
}
