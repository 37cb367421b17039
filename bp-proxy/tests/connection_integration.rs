//! End-to-end tests for `handle_connection` using a real monoio runtime and
//! real TCP sockets — no network mocking needed.
//!
//! These tests exercise the I/O dispatch loop in connection.rs that cannot
//! be covered by unit tests alone (monoio async I/O is not compatible with
//! tokio's `#[tokio::test]`).

use bp_cache::ResponseCache;
use bp_core::{Address, AddressList};
use bp_net::FailureManager;
use bp_proxy::connection::handle_connection;
use bp_proxy::pool::ConnPool;
use bp_proxy::proxy::ProxyWorker;
use bp_proxy::translate::{RouteRule, StaticTranslator};
use bp_session::SessionStore;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

fn make_sessions() -> Arc<SessionStore> {
    Arc::new(SessionStore::new(Duration::from_secs(600), 0, 0))
}

fn make_rt() -> monoio::Runtime<monoio::LegacyDriver> {
    monoio::RuntimeBuilder::<monoio::LegacyDriver>::new()
        .build()
        .expect("monoio runtime build failed")
}

fn http_addr(port: u16) -> Address {
    Address::Http { addresses: AddressList::new(vec![format!("127.0.0.1:{port}").parse().unwrap()]), host: None }
}

fn rule(id: &str, pattern: &str, addr: Address) -> RouteRule {
    RouteRule { id: id.to_string(), pattern: pattern.to_string(), methods: vec![], address: addr, cacheable: false, session_realm: None }
}

fn make_worker(rules: Vec<RouteRule>, failures: Arc<FailureManager>) -> ProxyWorker {
    let translator = Arc::new(StaticTranslator::new(rules));
    ProxyWorker::new(translator, failures)
}

/// Extract the HTTP status line from the first line of a raw response.
fn status_line(buf: &[u8]) -> &str {
    let s = std::str::from_utf8(buf).unwrap_or("");
    s.lines().next().unwrap_or("")
}

#[allow(clippy::too_many_arguments)]
async fn run_one_shot(proxy: ProxyWorker, request: &'static [u8]) -> Vec<u8> {
    let listener = monoio::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let proxy = Rc::new(RefCell::new(proxy));
    let conn_pool = Rc::new(ConnPool::new(4));
    let worker_pool = Arc::new(bp_worker::WorkerPool::new(1));
    let cache = Arc::new(ResponseCache::new(1024 * 1024, 65536));
    let failures = Arc::new(FailureManager::new());
    let sessions = make_sessions();

    monoio::spawn(async move {
        if let Ok((stream, peer)) = listener.accept().await {
            let _ = handle_connection(stream, peer, proxy, conn_pool, worker_pool, cache, failures, sessions).await;
        }
    });

    let mut client = monoio::net::TcpStream::connect(proxy_addr.to_string().as_str()).await.unwrap();
    let (_, _) = client.write_all(request.to_vec()).await;

    let buf = vec![0u8; 1024];
    let (n, buf) = client.read(buf).await;
    let n = n.unwrap_or(0);
    buf[..n].to_vec()
}

// ── Test 1: no route → 404 ─────────────────────────────────────────────────

#[test]
fn handle_connection_404_no_matching_route() {
    make_rt().block_on(async {
        let proxy = make_worker(vec![], Arc::new(FailureManager::new()));
        let buf = run_one_shot(proxy, b"GET /missing HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
        let first = status_line(&buf);
        assert!(first.contains("404"), "Expected 404, got: {first:?}");
    });
}

// ── Test 2: invalid HTTP → 400 ────────────────────────────────────────────

#[test]
fn handle_connection_400_for_malformed_request() {
    make_rt().block_on(async {
        let proxy = make_worker(vec![], Arc::new(FailureManager::new()));
        let buf = run_one_shot(proxy, b"NOTHTTP GARBAGE\r\n\r\n").await;
        let first = status_line(&buf);
        assert!(first.contains("400"), "Expected 400, got: {first:?}");
    });
}

// ── Test 3: unreachable upstream → 502 ────────────────────────────────────

#[test]
fn handle_connection_502_upstream_unreachable() {
    // Grab a free port synchronously before entering the async runtime,
    // then drop it so nothing is actually listening there.
    let tmp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = tmp.local_addr().unwrap().port();
    drop(tmp);

    make_rt().block_on(async {
        let proxy = make_worker(vec![rule("r502", "/dead", http_addr(dead_port))], Arc::new(FailureManager::new()));
        let buf = run_one_shot(proxy, b"GET /dead HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
        let first = status_line(&buf);
        assert!(first.contains("502"), "Expected 502, got: {first:?}");
    });
}

// ── Test 4: all peers marked failed → 502 without attempting a connection ─

#[test]
fn handle_connection_502_when_all_peers_marked_failed() {
    make_rt().block_on(async {
        let failures = Arc::new(FailureManager::new());
        failures.add("127.0.0.1:9999".parse().unwrap());
        let proxy = make_worker(vec![rule("r-down", "/down", http_addr(9999))], failures);
        let buf = run_one_shot(proxy, b"GET /down HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
        let first = status_line(&buf);
        assert!(first.contains("502"), "Expected 502, got: {first:?}");
    });
}

// ── Test 5: full E2E smoke — proxy → echo upstream → client ───────────────

#[test]
fn e2e_smoke_proxy_echoes_through_real_upstream() {
    // Grab a free port for the echo upstream (std::net so it works before monoio)
    let echo_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    // Keep the listener alive so the port stays reserved; monoio will rebind it.
    drop(echo_listener);

    make_rt().block_on(async {
        let echo = monoio::net::TcpListener::bind(format!("127.0.0.1:{}", echo_addr.port()).as_str()).unwrap();
        monoio::spawn(async move {
            if let Ok((mut stream, _)) = echo.accept().await {
                let buf = vec![0u8; 4096];
                let (_n, _buf) = stream.read(buf).await;
                let resp = b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\nconnection: close\r\n\r\nhello-back";
                let (_, _) = stream.write_all(resp.to_vec()).await;
            }
        });

        let proxy = make_worker(
            vec![rule("r-e2e", "/echo", http_addr(echo_addr.port()))],
            Arc::new(FailureManager::new()),
        );
        let buf = run_one_shot(proxy, b"GET /echo HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
        let resp = std::str::from_utf8(&buf).unwrap_or("");
        assert!(resp.contains("200"), "Expected 200 OK, got: {resp:?}");
        assert!(resp.contains("hello-back"), "Expected echo body 'hello-back', got: {resp:?}");
    });
}

// ── Test 6: Connection: close terminates after one request ────────────────

#[test]
fn handle_connection_close_header_terminates_after_one_request() {
    make_rt().block_on(async {
        let listener = monoio::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let proxy = Rc::new(RefCell::new(make_worker(vec![], Arc::new(FailureManager::new()))));
        let conn_pool = Rc::new(ConnPool::new(0));
        let worker_pool = Arc::new(bp_worker::WorkerPool::new(1));
        let cache = Arc::new(ResponseCache::new(1024 * 1024, 65536));
        let failures = Arc::new(FailureManager::new());
        let sessions = make_sessions();

        monoio::spawn(async move {
            if let Ok((stream, peer)) = listener.accept().await {
                let _ = handle_connection(stream, peer, proxy, conn_pool, worker_pool, cache, failures, sessions).await;
            }
        });

        let mut client = monoio::net::TcpStream::connect(proxy_addr.to_string().as_str()).await.unwrap();
        let (_, _) = client
            .write_all(b"GET /missing HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n".to_vec())
            .await;

        let buf = vec![0u8; 512];
        let (n, _buf) = client.read(buf).await;
        let n = n.unwrap_or(0);
        assert!(n > 0, "Should have received a response");

        // Connection should be closed — next read returns 0
        let buf2 = vec![0u8; 512];
        let (n2, _buf2) = client.read(buf2).await;
        let n2 = n2.unwrap_or(0);
        assert_eq!(n2, 0, "Connection should be closed after connection: close");
    });
}

// ── Test 7: keepalive — two requests on the same connection ───────────────

#[test]
fn handle_connection_keepalive_two_requests_same_conn() {
    let echo_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    drop(echo_listener);

    make_rt().block_on(async {
        let echo = monoio::net::TcpListener::bind(format!("127.0.0.1:{}", echo_addr.port()).as_str()).unwrap();
        monoio::spawn(async move {
            for _ in 0..2 {
                if let Ok((mut stream, _)) = echo.accept().await {
                    let buf = vec![0u8; 4096];
                    let (_n, _buf) = stream.read(buf).await;
                    let resp = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok";
                    let (_, _) = stream.write_all(resp.to_vec()).await;
                }
            }
        });

        let listener = monoio::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let proxy = Rc::new(RefCell::new(make_worker(
            vec![rule("r-ka", "/ka", http_addr(echo_addr.port()))],
            Arc::new(FailureManager::new()),
        )));
        let conn_pool = Rc::new(ConnPool::new(4));
        let worker_pool = Arc::new(bp_worker::WorkerPool::new(1));
        let cache = Arc::new(ResponseCache::new(1024 * 1024, 65536));
        let failures = Arc::new(FailureManager::new());
        let sessions = make_sessions();

        monoio::spawn(async move {
            if let Ok((stream, peer)) = listener.accept().await {
                let _ = handle_connection(stream, peer, proxy, conn_pool, worker_pool, cache, failures, sessions).await;
            }
        });

        let mut client = monoio::net::TcpStream::connect(proxy_addr.to_string().as_str()).await.unwrap();

        // First request — keepalive (no "connection: close")
        let (_, _) = client.write_all(b"GET /ka HTTP/1.1\r\nhost: localhost\r\n\r\n".to_vec()).await;
        let buf = vec![0u8; 1024];
        let (n, buf) = client.read(buf).await;
        let n = n.unwrap_or(0);
        let first = std::str::from_utf8(&buf[..n]).unwrap_or("");
        assert!(first.contains("200"), "First req expected 200, got: {first:?}");

        // Second request on the same connection
        let (_, _) = client.write_all(b"GET /ka HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n".to_vec()).await;
        let buf2 = vec![0u8; 1024];
        let (n2, buf2) = client.read(buf2).await;
        let n2 = n2.unwrap_or(0);
        let second = std::str::from_utf8(&buf2[..n2]).unwrap_or("");
        assert!(second.contains("200"), "Second req expected 200, got: {second:?}");
    });
}

// ── Test 8: method-only route → 404 for a non-matching method ──────────────

#[test]
fn handle_connection_404_for_method_not_matched() {
    make_rt().block_on(async {
        let rule_get_only = RouteRule {
            id: "r-get".to_string(),
            pattern: "/get-only".to_string(),
            methods: vec!["GET".to_string()],
            address: http_addr(9999),
            cacheable: false,
            session_realm: None,
        };
        let proxy = make_worker(vec![rule_get_only], Arc::new(FailureManager::new()));
        let buf = run_one_shot(proxy, b"DELETE /get-only HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
        let first = status_line(&buf);
        assert!(first.contains("404"), "Expected 404, got: {first:?}");
    });
}

// ── Test 9: a session-binding route sets a cookie on the first response ───

#[test]
fn handle_connection_binds_session_and_sets_cookie() {
    let echo_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    drop(echo_listener);

    make_rt().block_on(async {
        let echo = monoio::net::TcpListener::bind(format!("127.0.0.1:{}", echo_addr.port()).as_str()).unwrap();
        monoio::spawn(async move {
            if let Ok((mut stream, _)) = echo.accept().await {
                let buf = vec![0u8; 4096];
                let (_n, _buf) = stream.read(buf).await;
                let resp = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok";
                let (_, _) = stream.write_all(resp.to_vec()).await;
            }
        });

        let rule_bound = RouteRule {
            id: "r-sess".to_string(),
            pattern: "/login".to_string(),
            methods: vec![],
            address: http_addr(echo_addr.port()),
            cacheable: false,
            session_realm: Some("app".to_string()),
        };
        let proxy = make_worker(vec![rule_bound], Arc::new(FailureManager::new()));
        let buf = run_one_shot(proxy, b"GET /login HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n").await;
        let resp = std::str::from_utf8(&buf).unwrap_or("");
        assert!(resp.to_ascii_lowercase().contains("set-cookie: session_id="), "Expected a session cookie, got: {resp:?}");
    });
}
