//! Thread-per-core worker loop (spec §5: "single-threaded cooperative
//! pipeline per core"): `SharedState` holds the one piece of cross-thread
//! mutable state (here,
//! the translator's route table, swapped behind an `ArcSwap` by a future
//! config-reload path), and each OS thread builds its own monoio runtime,
//! binds its own listener, and owns one `ProxyWorker` + one `ConnPool`
//! for every connection it accepts.

use crate::pool::ConnPool;
use crate::proxy::ProxyWorker;
use crate::translate::StaticTranslator;
use arc_swap::ArcSwap;
use bp_cache::ResponseCache;
use bp_core::GatewayConfig;
use bp_net::health::HealthCheckConfig;
use bp_net::FailureManager;
use bp_session::SessionStore;
use bp_worker::SharedWorkerPool;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Cross-thread state. `translator` is the only piece any worker mutates
/// indirectly (route updates go through its own interior `ArcSwap`); the
/// session store is the other cross-thread-shared structure (spec §5) —
/// every worker consults the same table so a client lands on the same
/// session regardless of which core accepted its connection.
pub struct SharedState {
    pub translator: Arc<StaticTranslator>,
    pub failures: Arc<FailureManager>,
    pub cache: Arc<ResponseCache>,
    pub sessions: Arc<SessionStore>,
    pub worker_pool: SharedWorkerPool,
    pub config: Arc<GatewayConfig>,
}

impl SharedState {
    pub fn new(translator: Arc<StaticTranslator>, config: GatewayConfig) -> Arc<Self> {
        let worker_pool = Arc::new(bp_worker::WorkerPool::new(bp_worker::default_worker_count()));
        let sessions = Arc::new(SessionStore::new(Duration::from_secs(config.session.idle_timeout_s), 0, 0));
        Arc::new(SharedState {
            translator,
            failures: Arc::new(FailureManager::new()),
            cache: Arc::new(ResponseCache::new(config.cache.max_bytes, config.cache.max_entry_bytes)),
            sessions,
            worker_pool,
            config: Arc::new(config),
        })
    }

    /// Spawns one active health-check loop per backend address (spec
    /// §4.F). Takes an explicit address list rather than asking the
    /// translator to enumerate its own backends, since `StaticTranslator`
    /// has no such API (see `DESIGN.md`); the caller that owns the
    /// upstream configuration supplies it. Must run inside a monoio
    /// runtime, since it uses `monoio::spawn`.
    pub fn spawn_health_checks(self: &Arc<Self>, addresses: &[SocketAddr], cfg: HealthCheckConfig) {
        for &addr in addresses {
            let failures = Arc::clone(&self.failures);
            let cfg = cfg.clone();
            monoio::spawn(bp_net::health::run_health_check_loop(addr, cfg, failures));
        }
    }

    /// Spawns the periodic session-expiry sweep (spec §4.I). Only one
    /// instance of this should run process-wide; callers pick a single
    /// dedicated thread rather than one per worker.
    pub fn spawn_session_cleanup(self: &Arc<Self>) {
        let sessions = Arc::clone(&self.sessions);
        let interval = Duration::from_secs(self.config.session.cleanup_interval_s);
        monoio::spawn(async move {
            loop {
                monoio::time::sleep(interval).await;
                let reaped = sessions.cleanup();
                if reaped > 0 {
                    tracing::debug!(reaped, "session cleanup sweep");
                }
            }
        });
    }
}

/// Spawns one OS thread per core, each running its own monoio runtime.
pub fn spawn_workers(shared: Arc<SharedState>, num_workers: usize) -> Vec<std::thread::JoinHandle<()>> {
    let listen_addr = shared
        .config
        .listeners
        .first()
        .map(|l| l.bind)
        .unwrap_or_else(|| "0.0.0.0:8080".parse().unwrap());
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);

        let handle = std::thread::Builder::new()
            .name(format!("bp-worker-{worker_id}"))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("failed to build monoio runtime");

                rt.block_on(worker_loop(worker_id, shared, listen_addr));
            })
            .expect("failed to spawn worker thread");

        handles.push(handle);
    }

    info!(workers = num_workers, addr = %listen_addr, "workers spawned");
    handles
}

/// Main loop for a single worker thread: one `ProxyWorker` and one
/// `ConnPool`, shared with every connection this thread accepts via
/// `Rc<RefCell<_>>`.
async fn worker_loop(worker_id: usize, shared: Arc<SharedState>, addr: std::net::SocketAddr) {
    use monoio::net::TcpListener;

    let listener = TcpListener::bind(addr).unwrap_or_else(|e| {
        panic!("worker {worker_id} failed to bind to {addr}: {e}");
    });

    info!(worker = worker_id, %addr, "worker listening");

    const MAX_IDLE_PER_UPSTREAM: usize = 16;

    let proxy = Rc::new(RefCell::new(ProxyWorker::new(Arc::clone(&shared.translator), Arc::clone(&shared.failures))));
    let conn_pool = Rc::new(ConnPool::new(MAX_IDLE_PER_UPSTREAM));

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);

                let proxy = Rc::clone(&proxy);
                let pool = Rc::clone(&conn_pool);
                let worker_pool = Arc::clone(&shared.worker_pool);
                let cache = Arc::clone(&shared.cache);
                let failures = Arc::clone(&shared.failures);
                let sessions = Arc::clone(&shared.sessions);

                monoio::spawn(async move {
                    if let Err(e) =
                        crate::connection::handle_connection(stream, peer_addr, proxy, pool, worker_pool, cache, failures, sessions).await
                    {
                        tracing::debug!(error = %e, "connection closed");
                    }
                });
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "accept error");
            }
        }
    }
}
