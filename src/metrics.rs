//! Prometheus metrics for graph store operations and pipeline events.
//!
//! Every collector is a lazily-initialised static registered in a single
//! process-wide registry; [`encode_metrics`] renders the text exposition
//! format for whichever HTTP surface serves it.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::future::Future;
use std::time::Instant;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<C: prometheus::core::Collector + Clone + 'static>(c: C) -> C {
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric registration should not fail");
    c
}

/// Graph store operations, by operation name and outcome (`ok` / `error`).
pub static STORE_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("kubegraph_store_operations_total", "Graph store operations"),
            &["operation", "outcome"],
        )
        .unwrap(),
    )
});

/// Graph store operation latency in seconds.
pub static STORE_OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let buckets = vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0];
    register(
        HistogramVec::new(
            HistogramOpts::new(
                "kubegraph_store_operation_duration_seconds",
                "Graph store operation time in seconds",
            )
            .buckets(buckets),
            &["operation"],
        )
        .unwrap(),
    )
});

/// Sessions currently held against the graph database.
pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register(
        IntGauge::new(
            "kubegraph_store_active_sessions",
            "Graph store sessions currently in flight",
        )
        .unwrap(),
    )
});

/// Watch notifications handled, by kind, notification and outcome.
pub static PIPELINE_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("kubegraph_pipeline_events_total", "Watch notifications handled"),
            &["kind", "event", "outcome"],
        )
        .unwrap(),
    )
});

/// Subscription state per kind (1 for the current state, 0 otherwise).
pub static SUBSCRIPTION_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register(
        IntGaugeVec::new(
            Opts::new("kubegraph_subscription_state", "Per-kind subscription state"),
            &["kind", "state"],
        )
        .unwrap(),
    )
});

/// Nodes removed by the retention sweeps, by sweep.
pub static NODES_SWEPT: Lazy<IntCounterVec> = Lazy::new(|| {
    register(
        IntCounterVec::new(
            Opts::new("kubegraph_nodes_swept_total", "Nodes deleted by retention sweeps"),
            &["sweep"],
        )
        .unwrap(),
    )
});

/// Holds the active-session gauge up for as long as it lives.
struct SessionGuard;

impl SessionGuard {
    fn acquire() -> Self {
        ACTIVE_SESSIONS.inc();
        SessionGuard
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        ACTIVE_SESSIONS.dec();
    }
}

/// Run one store operation, recording count, outcome, duration and the
/// in-flight gauge. The outcome is recorded before the result is returned.
pub async fn instrument<T, E, F>(operation: &'static str, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
{
    let _session = SessionGuard::acquire();
    let start = Instant::now();
    let result = fut.await;
    let outcome = if result.is_ok() { "ok" } else { "error" };
    STORE_OPERATIONS
        .with_label_values(&[operation, outcome])
        .inc();
    STORE_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(start.elapsed().as_secs_f64());
    result
}

/// Record one handled watch notification.
pub fn record_event(kind: &str, event: &str, ok: bool) {
    let outcome = if ok { "ok" } else { "error" };
    PIPELINE_EVENTS
        .with_label_values(&[kind, event, outcome])
        .inc();
}

/// Encode every registered metric in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_instrument_records_error_outcome() {
        let before = STORE_OPERATIONS
            .with_label_values(&["test_failing_op", "error"])
            .get();
        let res: Result<(), &str> = instrument("test_failing_op", async { Err("boom") }).await;
        assert!(res.is_err());
        let after = STORE_OPERATIONS
            .with_label_values(&["test_failing_op", "error"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[tokio::test]
    async fn test_instrument_releases_session() {
        let res: Result<u8, ()> = instrument("test_gauge_op", async {
            assert!(ACTIVE_SESSIONS.get() >= 1);
            Ok(7)
        })
        .await;
        assert_eq!(res, Ok(7));
    }

    #[test]
    fn test_encode_contains_families() {
        record_event("Pod", "add", true);
        let text = encode_metrics();
        assert!(text.contains("kubegraph_pipeline_events_total"));
    }
}
