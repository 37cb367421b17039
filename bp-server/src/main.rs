// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  beng-proxy-rs — single-process HTTP reverse proxy / load balancer
//
//  Architecture: monoio thread-per-core data plane, a dedicated thread
//  for the control protocol (P), a dedicated thread for the Prometheus
//  metrics endpoint (Q).
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use bp_core::GatewayConfig;
use bp_observability::ProxyMetrics;
use bp_proxy::{spawn_workers, ControlServer, SharedState, StaticTranslator};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "beng-proxy", version, about = "beng-proxy-rs — HTTP reverse proxy / load balancer")]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level override (ignored if RUST_LOG is set).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Pre-shared token the control protocol (spec §4.P) authenticates
    /// packets against.
    #[arg(long, env = "GATEWAY_CONTROL_TOKEN", default_value = "")]
    control_token: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "beng-proxy-rs starting");

    let config = GatewayConfig::load(cli.config.as_deref())?;

    let num_workers = if config.workers.threads == 0 {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    } else {
        config.workers.threads
    };
    info!(workers = num_workers, "worker count resolved");

    // Translation-server wire protocol is out of scope (spec §1): the
    // default translator starts with no rules. A real deployment wires a
    // `Translator` impl that speaks that protocol in its place.
    let translator = Arc::new(StaticTranslator::new(vec![]));
    let shared = SharedState::new(translator, config.clone());

    let metrics = Arc::new(ProxyMetrics::new()?);
    spawn_metrics_server(config.observability.metrics_addr, Arc::clone(&metrics), Arc::clone(&shared));

    if !cli.control_token.is_empty() {
        spawn_control_server(config.control.clone(), cli.control_token.clone(), Arc::clone(&shared));
    } else {
        tracing::warn!("no control-token configured, control protocol disabled");
    }

    let worker_handles = spawn_workers(Arc::clone(&shared), num_workers);

    info!(
        workers = num_workers,
        listeners = config.listeners.len(),
        control_addr = %config.control.bind,
        metrics_addr = %config.observability.metrics_addr,
        "beng-proxy-rs is ready"
    );

    setup_signal_handler();
    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    info!("shutdown signal received, stopping");
    // Workers run an infinite accept loop on their own thread; on process
    // exit the OS reclaims them. Dropping the handles here just lets the
    // binary return instead of joining forever.
    drop(worker_handles);
    info!("beng-proxy-rs stopped");
    Ok(())
}

/// Runs the control protocol (spec §4.P) on its own thread and runtime, so
/// slow administrative commands never compete with the data-plane loops.
fn spawn_control_server(control_config: bp_core::config::ControlConfig, token: String, shared: Arc<SharedState>) {
    std::thread::Builder::new()
        .name("bp-control".to_string())
        .spawn(move || {
            let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                .enable_all()
                .build()
                .expect("failed to build monoio runtime for control protocol");
            rt.block_on(async move {
                match ControlServer::bind(&control_config, token, Arc::clone(&shared.cache), Arc::clone(&shared.failures)).await {
                    Ok(server) => server.run().await,
                    Err(e) => tracing::error!(error = %e, "control protocol failed to bind"),
                }
            });
        })
        .expect("failed to spawn control thread");
}

/// Runs the Prometheus text-exposition endpoint (spec §4.Q) on its own
/// thread: a minimal raw-HTTP responder, since this is process wiring
/// rather than a reusable module.
fn spawn_metrics_server(addr: std::net::SocketAddr, metrics: Arc<ProxyMetrics>, shared: Arc<SharedState>) {
    std::thread::Builder::new()
        .name("bp-metrics".to_string())
        .spawn(move || {
            let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                .enable_all()
                .build()
                .expect("failed to build monoio runtime for metrics");
            rt.block_on(metrics_loop(addr, metrics, shared));
        })
        .expect("failed to spawn metrics thread");
}

async fn metrics_loop(addr: std::net::SocketAddr, metrics: Arc<ProxyMetrics>, shared: Arc<SharedState>) {
    use monoio::io::{AsyncReadRent, AsyncWriteRentExt};

    shared.spawn_session_cleanup();

    let listener = match monoio::net::TcpListener::bind(addr) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, %addr, "metrics listener failed to bind");
            return;
        }
    };
    info!(%addr, "metrics endpoint listening");

    loop {
        let (mut stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(error = %e, "metrics accept error");
                continue;
            }
        };
        let metrics = Arc::clone(&metrics);
        let shared = Arc::clone(&shared);
        monoio::spawn(async move {
            let buf = vec![0u8; 1024];
            let (res, _buf) = stream.read(buf).await;
            if res.is_err() {
                return;
            }
            metrics.refresh(&shared.cache, &shared.failures, 0, shared.worker_pool.queue_depth());
            let body = metrics.gather_text();
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/plain; version=0.0.4\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.into_bytes()).await;
        });
    }
}

fn setup_signal_handler() {
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
