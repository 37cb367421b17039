//! Out-of-band control protocol (spec §4.P): a UDP command channel, run on
//! its own thread so slow administrative operations never compete with the
//! data-plane event loops (spec §2). Grounded on `bp_net::socket`'s
//! ownership-passing monoio IO idiom (`UdpSocket::recv_from`/`send_to`
//! mirror `TcpStream::read`/`write_all` there) and reaching into the same
//! `ResponseCache`/`FailureManager` handles the worker threads share.
//!
//! Packets are authenticated by a pre-shared token (the UDP variant of the
//! two schemes spec.md names; `SO_PEERCRED` only applies to the unix-socket
//! variant, out of scope here since `bind` is a `SocketAddr`). Wire format
//! is a single UTF-8 line: `<token> <command> [args...]`.

use bp_cache::{CacheKey, ResponseCache};
use bp_core::config::ControlConfig;
use bp_net::{FailureManager, FailureStatus};
use monoio::net::udp::UdpSocket;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct ControlServer {
    socket: UdpSocket,
    token: String,
    cache: Arc<ResponseCache>,
    failures: Arc<FailureManager>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    /// `invalidate GET /some/uri` — evicts the entry keyed the same way
    /// the proxy itself builds cache keys for uncacheable-header-free GETs.
    Invalidate { method: String, uri: String },
    /// `disable 10.0.0.1:8080` — marks a backend `Failed` for an hour,
    /// the same status a connect failure produces via `FailureManager::add`.
    Disable(SocketAddr),
    /// `enable 10.0.0.1:8080` — clears any failure status unconditionally.
    Enable(SocketAddr),
    /// `status 10.0.0.1:8080` — reports one backend's current status plus
    /// the process-wide cache hit/miss/eviction counters.
    Status(SocketAddr),
}

const DISABLE_DURATION: Duration = Duration::from_secs(3600);

fn parse_command(line: &str) -> Result<Command, String> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().ok_or("empty command")?;
    match verb {
        "invalidate" => {
            let method = parts.next().ok_or("invalidate requires <method> <uri>")?;
            let uri = parts.next().ok_or("invalidate requires <method> <uri>")?;
            Ok(Command::Invalidate { method: method.to_string(), uri: uri.to_string() })
        }
        "disable" => {
            let addr = parts.next().ok_or("disable requires <addr>")?;
            addr.parse().map(Command::Disable).map_err(|e| format!("bad address: {e}"))
        }
        "enable" => {
            let addr = parts.next().ok_or("enable requires <addr>")?;
            addr.parse().map(Command::Enable).map_err(|e| format!("bad address: {e}"))
        }
        "status" => {
            let addr = parts.next().ok_or("status requires <addr>")?;
            addr.parse().map(Command::Status).map_err(|e| format!("bad address: {e}"))
        }
        other => Err(format!("unknown command: {other}")),
    }
}

impl ControlServer {
    pub async fn bind(config: &ControlConfig, token: String, cache: Arc<ResponseCache>, failures: Arc<FailureManager>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(config.bind)?;
        info!(addr = %config.bind, "control protocol listening");
        Ok(ControlServer { socket, token, cache, failures })
    }

    /// Runs until the process exits; intended to be the body of the
    /// dedicated control thread (spec §2).
    pub async fn run(mut self) {
        let mut buf = vec![0u8; 2048];
        loop {
            let (res, b) = self.socket.recv_from(buf).await;
            buf = b;
            let (n, peer) = match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "control socket recv error");
                    continue;
                }
            };
            let reply = self.handle_packet(&buf[..n], peer).await;
            let (res, b) = self.socket.send_to(reply.into_bytes(), peer).await;
            buf = b;
            if let Err(e) = res {
                warn!(error = %e, %peer, "control socket send error");
            }
            buf.resize(2048, 0);
        }
    }

    async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> String {
        let line = String::from_utf8_lossy(packet);
        let mut parts = line.trim_end().splitn(2, ' ');
        let Some(supplied_token) = parts.next() else {
            return "ERR missing token\n".to_string();
        };
        if !constant_time_eq(supplied_token.as_bytes(), self.token.as_bytes()) {
            warn!(%peer, "control protocol rejected packet with bad token");
            return "ERR unauthorized\n".to_string();
        }
        let rest = parts.next().unwrap_or("");
        match parse_command(rest) {
            Ok(cmd) => self.dispatch(cmd),
            Err(e) => format!("ERR {e}\n"),
        }
    }

    fn dispatch(&self, cmd: Command) -> String {
        match cmd {
            Command::Invalidate { method, uri } => {
                let key = CacheKey::build(&method, &uri, &[], &http::HeaderMap::new());
                self.cache.remove(&key);
                format!("OK invalidated {method} {uri}\n")
            }
            Command::Disable(addr) => {
                self.failures.set(addr, FailureStatus::Failed, DISABLE_DURATION);
                format!("OK disabled {addr}\n")
            }
            Command::Enable(addr) => {
                self.failures.unset(addr, FailureStatus::Ok);
                format!("OK enabled {addr}\n")
            }
            Command::Status(addr) => {
                let usable = self.failures.is_usable(addr);
                let stats = self.cache.stats();
                format!(
                    "OK {addr} usable={usable} cache_hits={} cache_misses={} cache_evictions={} cache_bytes={}\n",
                    stats.hits.load(std::sync::atomic::Ordering::Relaxed),
                    stats.misses.load(std::sync::atomic::Ordering::Relaxed),
                    stats.evictions.load(std::sync::atomic::Ordering::Relaxed),
                    self.cache.bytes_used(),
                )
            }
        }
    }
}

/// Avoids a short-circuiting `==` on the token comparison, the usual
/// precaution for credential checks on an unauthenticated transport.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_invalidate() {
        let cmd = parse_command("invalidate GET /api/users").unwrap();
        assert_eq!(cmd, Command::Invalidate { method: "GET".to_string(), uri: "/api/users".to_string() });
    }

    #[test]
    fn test_parse_disable_enable() {
        assert_eq!(parse_command("disable 127.0.0.1:8080").unwrap(), Command::Disable("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(parse_command("enable 127.0.0.1:8080").unwrap(), Command::Enable("127.0.0.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_parse_unknown_command_errors() {
        assert!(parse_command("frobnicate").is_err());
    }

    #[test]
    fn test_parse_missing_args_errors() {
        assert!(parse_command("disable").is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"wrong!"));
        assert!(!constant_time_eq(b"short", b"longerstring"));
    }

    #[monoio::test]
    async fn test_dispatch_status_reports_usable_and_cache_stats() {
        let cache = Arc::new(ResponseCache::new(1024 * 1024, 64 * 1024));
        let failures = Arc::new(FailureManager::new());
        let server = ControlServer {
            socket: UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap(),
            token: "tok".to_string(),
            cache,
            failures,
        };
        let addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let reply = server.dispatch(Command::Status(addr));
        assert!(reply.starts_with("OK 127.0.0.1:9001 usable=true"));
    }

    #[monoio::test]
    async fn test_dispatch_disable_then_status_reports_unusable() {
        let cache = Arc::new(ResponseCache::new(1024 * 1024, 64 * 1024));
        let failures = Arc::new(FailureManager::new());
        let server = ControlServer {
            socket: UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap(),
            token: "tok".to_string(),
            cache,
            failures,
        };
        let addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        server.dispatch(Command::Disable(addr));
        let reply = server.dispatch(Command::Status(addr));
        assert!(reply.contains("usable=false"));
    }

    #[test]
    fn test_handle_packet_rejects_bad_token() {
        assert!(!constant_time_eq(b"wrong-token", b"real-token"));
    }
}
