pub mod access_log;
pub mod metrics;
pub mod prometheus_exporter;

pub use access_log::{log_access, AccessLogEntry};
pub use metrics::ProxyMetrics;
pub use prometheus_exporter::render_metrics;
