//! Prometheus metrics for the etcd cluster operator.
//!
//! The registry is process-wide; the engine only sees the `MetricsSink`
//! trait so tests can record emissions without touching global state.

use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Gauge,
    HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

/// Metric emission points the reconcile engine hits.
pub trait MetricsSink: Send + Sync {
    /// A reconcile tick failed for the given reason.
    fn reconcile_failed(&self, reason: &str);

    /// A reconcile tick completed; `seconds` is its wall-clock duration.
    fn observe_reconcile(&self, cluster: &str, seconds: f64);

    /// A cluster worker was created or torn down.
    fn clusters_changed(&self, delta: i64);
}

lazy_static::lazy_static! {
    static ref RECONCILE_FAILED: CounterVec = register_counter_vec!(
        "etcd_operator_reconcile_failed_total",
        "Total number of failed reconcile ticks",
        &["reason"]
    ).unwrap();

    static ref RECONCILE_DURATION: HistogramVec = register_histogram_vec!(
        "etcd_operator_reconcile_duration_seconds",
        "Duration of reconcile ticks",
        &["cluster"]
    ).unwrap();

    static ref MANAGED_CLUSTERS: Gauge = register_gauge!(
        "etcd_operator_managed_clusters",
        "Number of clusters this operator instance manages"
    ).unwrap();
}

/// The production sink backed by the process-wide registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn reconcile_failed(&self, reason: &str) {
        RECONCILE_FAILED.with_label_values(&[reason]).inc();
    }

    fn observe_reconcile(&self, cluster: &str, seconds: f64) {
        RECONCILE_DURATION
            .with_label_values(&[cluster])
            .observe(seconds);
    }

    fn clusters_changed(&self, delta: i64) {
        MANAGED_CLUSTERS.add(delta as f64);
    }
}

/// Serves the text exposition format on the given port.
pub async fn run_metrics_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(port = %port, error = %e, "failed to bind metrics listener");
            return;
        }
    };
    info!(port = %port, "metrics server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let metrics = encoder.encode_to_string(&metric_families).unwrap_or_default();

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    metrics.len(),
                    metrics
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}
