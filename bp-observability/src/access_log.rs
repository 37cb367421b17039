//! Structured access logging (spec §4.N): one `AccessLogEntry` per
//! completed request, keyed by "rule_id" (a translation-response match)
//! rather than a route ID, emitted as a `tracing` event instead of a
//! channel fed to an external log shipper, since that shipper is outside
//! this port's scope.

use serde::Serialize;

/// One completed request, logged as a single structured `tracing` event at
/// `info` level so it can be filtered or JSON-formatted independently of
/// the rest of the gateway's logs.
#[derive(Debug, Serialize)]
pub struct AccessLogEntry<'a> {
    pub rule_id: Option<&'a str>,
    pub client_ip: &'a str,
    pub method: &'a str,
    pub uri: &'a str,
    pub status: u16,
    pub latency_ms: f64,
    pub upstream_addr: Option<&'a str>,
}

#[allow(clippy::too_many_arguments)]
pub fn log_access(entry: &AccessLogEntry<'_>) {
    tracing::info!(
        target: "access",
        rule_id = entry.rule_id.unwrap_or("-"),
        client_ip = entry.client_ip,
        method = entry.method,
        uri = entry.uri,
        status = entry.status,
        latency_ms = entry.latency_ms,
        upstream_addr = entry.upstream_addr.unwrap_or("-"),
        "request"
    );
}
