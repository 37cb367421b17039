//! Prometheus text-exposition endpoint handler (spec §4.Q / §6's
//! `PROMETHEUS_EXPORTER` listener handler).

use crate::metrics::ProxyMetrics;

pub fn render_metrics(metrics: &ProxyMetrics) -> String {
    metrics.gather_text()
}
