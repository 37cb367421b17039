//! HTTP backend client (spec §4.G): an httparse-over-monoio idiom shared
//! with the inbound connection loop — one reusable read buffer, zero-copy
//! header parsing into it, and an IPv4-first-resolved TCP connection.
//! Generalized here from "proxy's own inbound connection handling" to
//! "outbound request to an upstream peer, with keep-alive lease reuse."

use crate::client::BackendClient;
use crate::request::{BackendRequest, BackendResponse, Method};
use bp_core::{Address, GatewayError};
use bp_net::socket::connect;
use bytes::Bytes;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;

/// Wraps a socket that may be handed back for keep-alive reuse. A
/// connection is only offered for reuse if the previous response didn't
/// force a close (matches spec §4.G's "a per-socket lease that may veto
/// reuse on server-reported errors") — `take_for_reuse` returns `None`
/// once that has happened.
pub struct HttpClient {
    stream: Option<TcpStream>,
}

impl HttpClient {
    /// Hands the underlying socket back to a connection pool, if it's
    /// still eligible for reuse.
    pub fn take_for_reuse(mut self) -> Option<TcpStream> {
        self.stream.take()
    }
}

fn peer_failure(addr: &str, detail: impl std::fmt::Display) -> GatewayError {
    GatewayError::PeerFailure { addr: addr.to_string(), detail: detail.to_string() }
}

impl HttpClient {
    pub fn new(reused: Option<TcpStream>) -> Self {
        HttpClient { stream: reused }
    }

    async fn ensure_connected(&mut self, addr: &str) -> Result<(), GatewayError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let (stream, _peer) = connect(addr).await.map_err(|e| peer_failure(addr, e))?;
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        Ok(())
    }

    fn target(address: &Address) -> Result<String, GatewayError> {
        match address {
            Address::Http { addresses, .. } => addresses
                .addresses
                .first()
                .map(|a| a.to_string())
                .ok_or_else(|| GatewayError::Internal("empty address list".into())),
            _ => Err(GatewayError::Internal("http client given non-HTTP address".into())),
        }
    }

    fn encode_request(method: Method, path: &str, headers: &[(String, String)], body: &Option<Bytes>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256 + body.as_ref().map(|b| b.len()).unwrap_or(0));
        buf.extend_from_slice(method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(path.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in headers {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if let Some(body) = body {
            if !method.forbids_body() {
                buf.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
            }
        }
        buf.extend_from_slice(b"\r\n");
        if let Some(body) = body {
            if !method.forbids_body() {
                buf.extend_from_slice(body);
            }
        }
        buf
    }

    /// Reads one more chunk off the wire into a fresh scratch buffer and
    /// appends it to `acc`. Each `read` call owns its buffer and fills it
    /// from offset 0, so chunks are accumulated by copying rather than by
    /// reusing the scratch buffer across calls.
    async fn read_more(stream: &mut TcpStream, acc: &mut Vec<u8>) -> Result<usize, GatewayError> {
        let scratch = vec![0u8; 8192];
        let (res, scratch) = stream.read(scratch).await;
        let n = res.map_err(|e| peer_failure("backend", e))?;
        acc.extend_from_slice(&scratch[..n]);
        Ok(n)
    }

    async fn read_response(&mut self) -> Result<BackendResponse, GatewayError> {
        let stream = self.stream.as_mut().expect("connected");
        let mut acc = Vec::with_capacity(8192);
        let (status, headers, header_len) = loop {
            if Self::read_more(stream, &mut acc).await? == 0 {
                return Err(peer_failure("backend", "connection closed mid-response"));
            }

            let mut headers_raw = [httparse::EMPTY_HEADER; 64];
            let mut parsed = httparse::Response::new(&mut headers_raw);
            match parsed.parse(&acc) {
                Ok(httparse::Status::Complete(header_len)) => {
                    let status = parsed.code.unwrap_or(502);
                    let headers: Vec<(String, String)> = parsed
                        .headers
                        .iter()
                        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                        .collect();
                    break (status, headers, header_len);
                }
                Ok(httparse::Status::Partial) => continue,
                Err(e) => return Err(GatewayError::ProtocolViolation(format!("bad response: {e}"))),
            }
        };

        let content_length: usize = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
            .unwrap_or(0);

        while acc.len() < header_len + content_length {
            if Self::read_more(stream, &mut acc).await? == 0 {
                break;
            }
        }

        let body = if BackendResponse::suppress_body(status as u16) {
            Bytes::new()
        } else {
            let end = acc.len().min(header_len + content_length);
            Bytes::copy_from_slice(&acc[header_len..end])
        };

        Ok(BackendResponse { status: status as u16, headers, body })
    }
}

impl BackendClient for HttpClient {
    async fn send_request(&mut self, req: BackendRequest) -> Result<BackendResponse, GatewayError> {
        let target = Self::target(&req.address)?;
        self.ensure_connected(&target).await?;

        let bytes = Self::encode_request(req.method, &req.path, &req.headers, &req.body);
        let stream = self.stream.as_mut().expect("connected");
        let (res, _) = stream.write_all(bytes).await;
        res.map_err(|e| peer_failure(&target, e))?;

        match self.read_response().await {
            Ok(resp) => {
                if resp.headers.iter().any(|(n, v)| n.eq_ignore_ascii_case("connection") && v.eq_ignore_ascii_case("close")) {
                    self.stream = None;
                }
                Ok(resp)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_omits_body_for_get() {
        let bytes = HttpClient::encode_request(Method::Get, "/x", &[], &Some(Bytes::from_static(b"ignored")));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(!text.contains("ignored"));
        assert!(!text.contains("content-length"));
    }

    #[test]
    fn test_encode_request_includes_body_for_post() {
        let bytes = HttpClient::encode_request(Method::Post, "/x", &[], &Some(Bytes::from_static(b"hi")));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("content-length: 2"));
        assert!(text.ends_with("hi"));
    }
}
