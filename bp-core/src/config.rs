use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration, layered as defaults → YAML file → environment
/// (spec §4.L), mirroring the gateway's own config precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Node ID, used only in log lines and the `X-Gateway-Node` header.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Front-end listeners (plain HTTP, TLS-terminating, or both).
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Translation server this gateway consults per request (spec §6).
    #[serde(default)]
    pub translation: TranslationConfig,

    /// Worker/thread-pool sizing (spec §4.K).
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Response cache sizing (spec §4.H).
    #[serde(default)]
    pub cache: CacheConfig,

    /// Session store sizing (spec §4.I).
    #[serde(default)]
    pub session: SessionConfig,

    /// Peer selection / failure tracking (spec §4.F).
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Observability (logging + metrics) configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Control protocol listener (spec §6).
    #[serde(default)]
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub bind: SocketAddr,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_true")]
    pub reuse_port: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    #[serde(default = "default_translation_socket")]
    pub socket_path: String,
    #[serde(default = "default_translation_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_translation_cache_size")]
    pub cache_size: usize,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        TranslationConfig {
            socket_path: default_translation_socket(),
            timeout_ms: default_translation_timeout_ms(),
            cache_size: default_translation_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of per-core event loops (0 = one per available core).
    #[serde(default)]
    pub threads: usize,
    #[serde(default = "default_stopwatch_enabled")]
    pub stopwatch_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig { threads: 0, stopwatch_enabled: default_stopwatch_enabled() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_cache_max_entry_bytes")]
    pub max_entry_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_bytes: default_cache_max_bytes(),
            max_entry_bytes: default_cache_max_entry_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_shards")]
    pub shards: usize,
    #[serde(default = "default_session_idle_timeout_s")]
    pub idle_timeout_s: u64,
    #[serde(default = "default_session_cleanup_interval_s")]
    pub cleanup_interval_s: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            shards: default_session_shards(),
            idle_timeout_s: default_session_idle_timeout_s(),
            cleanup_interval_s: default_session_cleanup_interval_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default = "default_failure_cooldown_s")]
    pub failure_cooldown_s: u64,
    #[serde(default = "default_tarpit_threshold")]
    pub tarpit_threshold: u32,
    #[serde(default = "default_true")]
    pub active_health_checks: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        BalancerConfig {
            failure_cooldown_s: default_failure_cooldown_s(),
            tarpit_threshold: default_tarpit_threshold(),
            active_health_checks: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: SocketAddr,
    #[serde(default)]
    pub verbose_response: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        ObservabilityConfig {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_addr: default_metrics_addr(),
            verbose_response: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_control_addr")]
    pub bind: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig { bind: default_control_addr() }
    }
}

fn default_node_id() -> String {
    format!("gateway-{}", uuid::Uuid::new_v4())
}
fn default_true() -> bool {
    true
}
fn default_translation_socket() -> String {
    "/run/gateway/translate.socket".to_string()
}
fn default_translation_timeout_ms() -> u64 {
    10_000
}
fn default_translation_cache_size() -> usize {
    4096
}
fn default_stopwatch_enabled() -> bool {
    false
}
fn default_cache_max_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_cache_max_entry_bytes() -> u64 {
    256 * 1024
}
fn default_session_shards() -> usize {
    16
}
fn default_session_idle_timeout_s() -> u64 {
    1800
}
fn default_session_cleanup_interval_s() -> u64 {
    60
}
fn default_failure_cooldown_s() -> u64 {
    20
}
fn default_tarpit_threshold() -> u32 {
    16
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_addr() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}
fn default_control_addr() -> SocketAddr {
    "127.0.0.1:5413".parse().unwrap()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            node_id: default_node_id(),
            listeners: vec![ListenerConfig {
                bind: "0.0.0.0:8080".parse().unwrap(),
                tls: None,
                reuse_port: true,
            }],
            translation: TranslationConfig::default(),
            workers: WorkerConfig::default(),
            cache: CacheConfig::default(),
            session: SessionConfig::default(),
            balancer: BalancerConfig::default(),
            observability: ObservabilityConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Loads config from (in increasing precedence) built-in defaults, an
    /// optional YAML file, then `GATEWAY_`-prefixed environment variables.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, crate::error::GatewayError> {
        let mut figment = Figment::from(figment::providers::Serialized::defaults(GatewayConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("GATEWAY_").split("__"));
        figment
            .extract()
            .map_err(|e| crate::error::GatewayError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load_without_a_file() {
        let cfg = GatewayConfig::load(None).unwrap();
        assert_eq!(cfg.cache.max_bytes, default_cache_max_bytes());
        assert_eq!(cfg.session.shards, 16);
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let dir = tempdir();
        let path = dir.join("gateway.yaml");
        std::fs::write(&path, "cache:\n  max_bytes: 1024\n").unwrap();
        let cfg = GatewayConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.cache.max_bytes, 1024);
        std::fs::remove_file(&path).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("bp-core-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
