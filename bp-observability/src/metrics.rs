//! Prometheus metrics (spec §4.Q): a `prometheus::Registry` plus a
//! handful of named collectors, pull-only via `gather_text`. Covers
//! accepted/active connections per listener, backend request counts and
//! latencies per upstream, a failure-manager status gauge, cache hit/
//! miss/eviction counters, session occupancy, and worker-pool queue
//! depth.

use bp_cache::ResponseCache;
use bp_net::FailureManager;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::atomic::Ordering;

pub struct ProxyMetrics {
    registry: Registry,

    pub accepted_connections: IntCounterVec,
    pub active_connections: IntGaugeVec,

    pub backend_requests_total: IntCounterVec,
    pub backend_latency: HistogramVec,

    pub unusable_backends: IntGauge,

    pub cache_hits: IntGauge,
    pub cache_misses: IntGauge,
    pub cache_evictions: IntGauge,
    pub cache_bytes_used: IntGauge,

    pub session_occupancy: IntGauge,
    pub worker_queue_depth: IntGauge,
}

impl ProxyMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let accepted_connections = IntCounterVec::new(
            Opts::new("bp_accepted_connections_total", "Accepted connections per listener").namespace("bp"),
            &["listener"],
        )?;
        let active_connections = IntGaugeVec::new(
            Opts::new("bp_active_connections", "Currently open connections per listener").namespace("bp"),
            &["listener"],
        )?;
        let backend_requests_total = IntCounterVec::new(
            Opts::new("bp_backend_requests_total", "Requests dispatched per upstream").namespace("bp"),
            &["upstream"],
        )?;
        let backend_latency = HistogramVec::new(
            HistogramOpts::new("bp_backend_latency_seconds", "Backend response time")
                .namespace("bp")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["upstream"],
        )?;
        let unusable_backends = IntGauge::new("bp_unusable_backends", "Backends currently marked failed or monitor-failed")?;
        let cache_hits = IntGauge::new("bp_cache_hits", "Response cache hits")?;
        let cache_misses = IntGauge::new("bp_cache_misses", "Response cache misses")?;
        let cache_evictions = IntGauge::new("bp_cache_evictions", "Response cache evictions")?;
        let cache_bytes_used = IntGauge::new("bp_cache_bytes_used", "Response cache bytes currently held")?;
        let session_occupancy = IntGauge::new("bp_session_occupancy", "Live sessions in the session store")?;
        let worker_queue_depth = IntGauge::new("bp_worker_queue_depth", "Jobs queued on the CPU-bound worker pool")?;

        registry.register(Box::new(accepted_connections.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(backend_requests_total.clone()))?;
        registry.register(Box::new(backend_latency.clone()))?;
        registry.register(Box::new(unusable_backends.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(cache_evictions.clone()))?;
        registry.register(Box::new(cache_bytes_used.clone()))?;
        registry.register(Box::new(session_occupancy.clone()))?;
        registry.register(Box::new(worker_queue_depth.clone()))?;

        Ok(ProxyMetrics {
            registry,
            accepted_connections,
            active_connections,
            backend_requests_total,
            backend_latency,
            unusable_backends,
            cache_hits,
            cache_misses,
            cache_evictions,
            cache_bytes_used,
            session_occupancy,
            worker_queue_depth,
        })
    }

    pub fn record_accept(&self, listener: &str) {
        self.accepted_connections.with_label_values(&[listener]).inc();
        self.active_connections.with_label_values(&[listener]).inc();
    }

    pub fn record_close(&self, listener: &str) {
        self.active_connections.with_label_values(&[listener]).dec();
    }

    pub fn record_backend_request(&self, upstream: &str, duration_secs: f64) {
        self.backend_requests_total.with_label_values(&[upstream]).inc();
        self.backend_latency.with_label_values(&[upstream]).observe(duration_secs);
    }

    /// Refreshes the gauges backed by a live counter elsewhere (cache
    /// stats, failure manager, session occupancy, worker queue depth)
    /// right before a scrape, since those structures are the source of
    /// truth and this collector only mirrors them.
    pub fn refresh(&self, cache: &ResponseCache, failures: &FailureManager, session_occupancy: usize, worker_queue_depth: usize) {
        let stats = cache.stats();
        self.cache_hits.set(stats.hits.load(Ordering::Relaxed) as i64);
        self.cache_misses.set(stats.misses.load(Ordering::Relaxed) as i64);
        self.cache_evictions.set(stats.evictions.load(Ordering::Relaxed) as i64);
        self.cache_bytes_used.set(cache.bytes_used() as i64);
        self.unusable_backends.set(failures.unusable_count() as i64);
        self.session_occupancy.set(session_occupancy as i64);
        self.worker_queue_depth.set(worker_queue_depth as i64);
    }

    /// Prometheus text exposition, for the metrics listener (spec §6's
    /// `PROMETHEUS_EXPORTER` handler).
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics registry")
    }
}
