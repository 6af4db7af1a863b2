use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Fails if a recorder is already installed.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| anyhow::anyhow!("prometheus: install recorder: {e}"))?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("events_ingested_total", "Events stored by the ingest boundary.");
        describe_counter!("events_duplicate_total", "Re-ingested events ignored as duplicates.");
        describe_counter!("events_rejected_total", "Events rejected by ingest validation.");
        describe_counter!("correlation_groups_created_total", "New correlation groups.");
        describe_counter!(
            "correlation_groups_extended_total",
            "Events admitted into an existing group."
        );
        describe_counter!(
            "correlation_evictions_total",
            "Members evicted from full groups."
        );
        describe_counter!(
            "correlation_dead_letter_total",
            "Events dropped after exhausting correlation retries."
        );
        describe_counter!("actions_generated_total", "Persisted action recommendations.");
        describe_counter!(
            "actions_skipped_total",
            "Generation attempts that produced no action, by reason."
        );
        describe_histogram!("reasoning_call_ms", "Reasoning call latency in milliseconds.");
        describe_counter!(
            "retention_purged_events_total",
            "Events removed by the retention sweep."
        );
        describe_gauge!("queue_depth", "Work items queued or in flight, by queue.");
        describe_counter!(
            "notifications_dropped_total",
            "Notifications dropped because delivery was backed up or stopped."
        );
    });
}
