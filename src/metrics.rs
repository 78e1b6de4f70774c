//! Prometheus metrics for the OPC UA / AAS bridge.
//!
//! Counters/histograms are registered against an explicit `Registry` owned
//! by `BridgeMetrics` rather than a process-global `lazy_static` table, so a
//! test can build its own `BridgeMetrics` without colliding with another
//! test's registrations in the same process.

use axum::{routing::get, Router};
use prometheus::{CounterVec, Encoder, GaugeVec, HistogramVec, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;

pub struct BridgeMetrics {
    registry: Registry,
    pub sync_events_total: CounterVec,
    pub active_subscriptions: GaugeVec,
    pub sync_latency_seconds: HistogramVec,
    pub write_requests_total: CounterVec,
    pub dedup_suppressed_total: CounterVec,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sync_events_total = CounterVec::new(
            prometheus::Opts::new("bridge_sync_events_total", "Total sync events by direction and outcome"),
            &["direction", "status"],
        )
        .expect("valid metric spec");

        let active_subscriptions = GaugeVec::new(
            prometheus::Opts::new("bridge_active_subscriptions", "Active OPC UA monitored items"),
            &["endpoint"],
        )
        .expect("valid metric spec");

        let sync_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "bridge_sync_latency_seconds",
                "Time from source read to target write",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["direction"],
        )
        .expect("valid metric spec");

        let write_requests_total = CounterVec::new(
            prometheus::Opts::new("bridge_write_requests_total", "Write requests accepted or rejected"),
            &["status"],
        )
        .expect("valid metric spec");

        let dedup_suppressed_total = CounterVec::new(
            prometheus::Opts::new("bridge_dedup_suppressed_total", "Echo writes suppressed by the dedup cache"),
            &["submodel_id"],
        )
        .expect("valid metric spec");

        registry.register(Box::new(sync_events_total.clone())).expect("register metric");
        registry.register(Box::new(active_subscriptions.clone())).expect("register metric");
        registry.register(Box::new(sync_latency_seconds.clone())).expect("register metric");
        registry.register(Box::new(write_requests_total.clone())).expect("register metric");
        registry.register(Box::new(dedup_suppressed_total.clone())).expect("register metric");

        Self {
            registry,
            sync_events_total,
            active_subscriptions,
            sync_latency_seconds,
            write_requests_total,
            dedup_suppressed_total,
        }
    }

    fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .expect("prometheus text encoding never fails for well-formed metrics");
        String::from_utf8(buffer).expect("prometheus text encoder emits valid UTF-8")
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MetricsServer {
    port: u16,
    metrics: Arc<BridgeMetrics>,
}

impl MetricsServer {
    pub fn new(port: u16, metrics: Arc<BridgeMetrics>) -> Self {
        Self { port, metrics }
    }

    pub async fn serve(self) -> anyhow::Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.metrics);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Arc<BridgeMetrics>>,
) -> String {
    metrics.gather()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_renders_registered_families() {
        let metrics = BridgeMetrics::new();
        metrics
            .sync_events_total
            .with_label_values(&["opcua_to_aas", "success"])
            .inc();
        let text = metrics.gather();
        assert!(text.contains("bridge_sync_events_total"));
    }
}
