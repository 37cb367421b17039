//! Active health checking: periodically probes each backend with a plain
//! HTTP GET over this crate's `monoio` runtime and flips `FailureManager`'s
//! `MonitorFailed` status after a run of consecutive failures, clearing it
//! after a run of successes.

use crate::failure::{FailureManager, FailureStatus};
use dashmap::DashMap;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub http_path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub healthy_successes: u32,
    pub unhealthy_failures: u32,
    pub healthy_statuses: Vec<u16>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            http_path: "/".to_string(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            healthy_successes: 2,
            unhealthy_failures: 3,
            healthy_statuses: vec![200, 204, 301, 302],
        }
    }
}

async fn probe_once(addr: SocketAddr, cfg: &HealthCheckConfig) -> bool {
    let fut = async {
        let mut stream = monoio::net::TcpStream::connect(addr).await.ok()?;
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            cfg.http_path, addr
        );
        let (res, _) = stream.write_all(request.into_bytes()).await;
        res.ok()?;
        let buf = vec![0u8; 512];
        let (res, buf) = stream.read(buf).await;
        let n = res.ok()?;
        let text = String::from_utf8_lossy(&buf[..n]);
        let status: u16 = text.split_whitespace().nth(1)?.parse().ok()?;
        Some(cfg.healthy_statuses.contains(&status))
    };
    match monoio::time::timeout(cfg.timeout, fut).await {
        Ok(Some(healthy)) => healthy,
        _ => false,
    }
}

/// Runs one upstream's active health check loop until cancelled. Intended
/// to be spawned with `monoio::spawn` per monitored backend.
pub async fn run_health_check_loop(
    addr: SocketAddr,
    cfg: HealthCheckConfig,
    failures: Arc<FailureManager>,
) {
    let mut successes = 0u32;
    let mut failures_count = 0u32;
    loop {
        monoio::time::sleep(cfg.interval).await;
        let healthy = probe_once(addr, &cfg).await;
        if healthy {
            successes += 1;
            failures_count = 0;
            if successes >= cfg.healthy_successes {
                failures.unset(addr, FailureStatus::MonitorFailed);
            }
        } else {
            failures_count += 1;
            successes = 0;
            if failures_count >= cfg.unhealthy_failures {
                tracing::warn!(%addr, "backend marked unhealthy by active health check");
                failures.set(addr, FailureStatus::MonitorFailed, cfg.interval * cfg.unhealthy_failures);
            }
        }
    }
}

/// Per-upstream health check configs, keyed by the same address-list
/// identity used elsewhere (spec §4.F).
#[derive(Default)]
pub struct HealthCheckRegistry {
    configs: DashMap<String, HealthCheckConfig>,
}

impl HealthCheckRegistry {
    pub fn new() -> Self {
        HealthCheckRegistry { configs: DashMap::new() }
    }

    pub fn register(&self, upstream_id: impl Into<String>, cfg: HealthCheckConfig) {
        self.configs.insert(upstream_id.into(), cfg);
    }

    pub fn get(&self, upstream_id: &str) -> Option<HealthCheckConfig> {
        self.configs.get(upstream_id).map(|c| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_sane_thresholds() {
        let cfg = HealthCheckConfig::default();
        assert!(cfg.healthy_successes > 0);
        assert!(cfg.unhealthy_failures > 0);
    }

    #[test]
    fn test_registry_round_trip() {
        let reg = HealthCheckRegistry::new();
        reg.register("up1", HealthCheckConfig::default());
        assert!(reg.get("up1").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[monoio::test]
    async fn test_probe_unreachable_address_is_unhealthy() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let cfg = HealthCheckConfig { timeout: Duration::from_millis(200), ..Default::default() };
        assert!(!probe_once(addr, &cfg).await);
    }
}
