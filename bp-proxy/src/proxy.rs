//! Per-worker request orchestration (spec §4.A-§4.F): `ProxyWorker` is a
//! thread-local struct created once per core and reused across every
//! connection on that thread via `Rc<RefCell<_>>` — a brief, non-async
//! borrow picks the peer to dispatch to, then the caller releases the
//! borrow before doing any actual I/O.
//!
//! Generalized from "route -> plugin pipeline -> upstream string" to
//! "translation response -> peer selection", since this request model is
//! a translation-server lookup rather than an API gateway's route table.

use crate::translate::{StaticTranslator, TranslateRequest, TranslateResponse, Translator};
use bp_core::{Address, AddressList, GatewayError};
use bp_net::{Balancer, FailureManager};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

pub const RESP_404: &[u8] =
    b"HTTP/1.1 404 Not Found\r\ncontent-type: text/plain\r\ncontent-length: 14\r\nconnection: keep-alive\r\n\r\nno such route";

pub const RESP_502: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\ncontent-type: text/plain\r\ncontent-length: 19\r\nconnection: keep-alive\r\n\r\nupstream unavailable";

pub const RESP_400: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-type: text/plain\r\ncontent-length: 15\r\nconnection: close\r\n\r\nmalformed request";

/// What a worker decided to do with a request, handed back to the
/// connection-handling async code to actually execute.
#[derive(Debug, Clone)]
pub enum RequestResult {
    /// Dispatch to this backend. `addr` has already had any `Http`
    /// candidate list narrowed to the one chosen peer.
    Proxy { address: Address, cacheable: bool, session_realm: Option<String> },
    /// Send a pre-built static response (zero alloc).
    Static(&'static [u8]),
    /// Translation server explicitly refused the request.
    Deny,
}

/// Per-worker-thread proxy state: one translator handle (shared, its own
/// internal version counter), one round-robin cursor per distinct
/// upstream cluster, and a shared failure view.
pub struct ProxyWorker {
    translator: Arc<StaticTranslator>,
    failures: Arc<FailureManager>,
    balancers: HashMap<String, Balancer>,
}

impl ProxyWorker {
    pub fn new(translator: Arc<StaticTranslator>, failures: Arc<FailureManager>) -> Self {
        ProxyWorker { translator, failures, balancers: HashMap::new() }
    }

    /// Resolves a request end to end: translation lookup, then (for
    /// `Http` targets) peer selection against the shared failure view.
    /// `session_key` drives sticky dispatch when the resolved address
    /// list is marked sticky; 0 means "no session yet".
    pub async fn handle_request(
        &mut self,
        method: &str,
        uri: &str,
        host: Option<&str>,
        headers: &[(String, String)],
        client_ip: &str,
        session_key: u32,
    ) -> Result<RequestResult, GatewayError> {
        let resp = self
            .translator
            .translate(TranslateRequest { method, uri, host, headers, client_ip })
            .await?;
        Ok(self.resolve(resp, session_key))
    }

    /// The synchronous half: no awaits, so callers can do this while
    /// holding a brief `RefCell` borrow and release it before any I/O.
    fn resolve(&mut self, resp: TranslateResponse, session_key: u32) -> RequestResult {
        if resp.deny {
            return RequestResult::Deny;
        }
        let address = match resp.address {
            Address::None => return RequestResult::Static(RESP_404),
            Address::Http { addresses, host } => match self.pick_peer(&addresses, session_key) {
                Some(peer) => Address::Http { addresses: AddressList::new(vec![peer]), host },
                None => return RequestResult::Static(RESP_502),
            },
            other => other,
        };
        RequestResult::Proxy { address, cacheable: resp.cache.cacheable, session_realm: resp.session.realm }
    }

    fn pick_peer(&mut self, addresses: &AddressList, session_key: u32) -> Option<SocketAddr> {
        let key = addresses.addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(",");
        let balancer = self.balancers.entry(key).or_insert_with(Balancer::new);
        balancer.get(addresses, &self.failures, session_key)
    }
}

/// Builds an HTTP response into a reused buffer (no `format!` overhead).
pub fn build_response(buf: &mut Vec<u8>, status: u16, headers: &[(String, String)], body: &[u8]) {
    buf.clear();
    buf.extend_from_slice(b"HTTP/1.1 ");
    let mut itoa_buf = itoa::Buffer::new();
    buf.extend_from_slice(itoa_buf.format(status).as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(status_text(status).as_bytes());
    buf.extend_from_slice(b"\r\ncontent-length: ");
    buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
    buf.extend_from_slice(b"\r\nconnection: keep-alive\r\n");
    for (k, v) in headers {
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(v.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);
}

/// Builds an upstream HTTP request into a reused buffer, stripping
/// hop-by-hop headers (connection/keep-alive/transfer-encoding/upgrade).
pub fn build_upstream_request(buf: &mut Vec<u8>, method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) {
    buf.clear();
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("keep-alive")
            || name.eq_ignore_ascii_case("transfer-encoding")
            || name.eq_ignore_ascii_case("upgrade")
        {
            continue;
        }
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"connection: keep-alive\r\n");
    if !body.is_empty() {
        buf.extend_from_slice(b"content-length: ");
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
    buf.extend_from_slice(b"\r\n");
    if !body.is_empty() {
        buf.extend_from_slice(body);
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::RouteRule;

    fn http_addr(port: u16) -> Address {
        Address::Http { addresses: AddressList::new(vec![format!("127.0.0.1:{port}").parse().unwrap()]), host: None }
    }

    fn worker(rules: Vec<RouteRule>) -> ProxyWorker {
        ProxyWorker::new(Arc::new(StaticTranslator::new(rules)), Arc::new(FailureManager::new()))
    }

    fn rule(id: &str, pattern: &str, addr: Address) -> RouteRule {
        RouteRule { id: id.to_string(), pattern: pattern.to_string(), methods: vec![], address: addr, cacheable: false, session_realm: None }
    }

    #[monoio::test]
    async fn test_unmatched_route_returns_404() {
        let mut w = worker(vec![rule("r1", "/api", http_addr(8080))]);
        let result = w.handle_request("GET", "/missing", None, &[], "1.2.3.4", 0).await.unwrap();
        assert!(matches!(result, RequestResult::Static(RESP_404)));
    }

    #[monoio::test]
    async fn test_matched_route_resolves_single_peer() {
        let mut w = worker(vec![rule("r1", "/api", http_addr(8080))]);
        let result = w.handle_request("GET", "/api", None, &[], "1.2.3.4", 0).await.unwrap();
        match result {
            RequestResult::Proxy { address: Address::Http { addresses, .. }, .. } => {
                assert_eq!(addresses.len(), 1);
                assert_eq!(addresses.addresses[0].port(), 8080);
            }
            other => panic!("expected Proxy, got {other:?}"),
        }
    }

    #[monoio::test]
    async fn test_all_peers_failed_returns_502() {
        let mut w = worker(vec![rule("r1", "/api", http_addr(8080))]);
        w.failures.add("127.0.0.1:8080".parse().unwrap());
        let result = w.handle_request("GET", "/api", None, &[], "1.2.3.4", 0).await.unwrap();
        assert!(matches!(result, RequestResult::Static(RESP_502)));
    }

    #[test]
    fn test_status_text_known_and_unknown() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(999), "Unknown");
    }

    #[test]
    fn test_build_response_writes_status_line_and_body() {
        let mut buf = Vec::new();
        build_response(&mut buf, 200, &[], b"hello");
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello"));
    }

    #[test]
    fn test_build_upstream_request_strips_hop_by_hop_headers() {
        let mut buf = Vec::new();
        let headers = [("connection", "close"), ("x-forwarded-for", "1.2.3.4")];
        build_upstream_request(&mut buf, "GET", "/", &headers, b"");
        let text = String::from_utf8(buf).unwrap();
        assert!(!text.contains("connection: close"));
        assert!(text.contains("x-forwarded-for: 1.2.3.4"));
    }
}
