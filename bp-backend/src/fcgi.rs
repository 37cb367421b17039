//! FastCGI backend client (spec §4.G), grounded on
//! `fcgi/istream_fcgi.cxx`'s `FCGI_STDIN` record framing: data is split
//! into ≤ 0xffff-byte records each with an 8-byte header, terminated by a
//! zero-length record. Generalized from "one stream wraps one direction"
//! into a full client that also writes `FCGI_BEGIN_REQUEST`/`FCGI_PARAMS`
//! and demultiplexes `FCGI_STDOUT`/`FCGI_STDERR` on read, per the header's
//! "multiplexed on one connection" note.

use crate::client::BackendClient;
use crate::request::{BackendRequest, BackendResponse};
use bp_core::{Address, GatewayError};
use bp_net::socket::connect;
use bytes::{BufMut, Bytes, BytesMut};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;

const FCGI_VERSION_1: u8 = 1;
const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_RESPONDER: u16 = 1;
const FCGI_KEEP_CONN: u8 = 1;

fn peer_failure(addr: &str, detail: impl std::fmt::Display) -> GatewayError {
    GatewayError::PeerFailure { addr: addr.to_string(), detail: detail.to_string() }
}

fn record_header(record_type: u8, request_id: u16, content_length: u16) -> [u8; 8] {
    [
        FCGI_VERSION_1,
        record_type,
        (request_id >> 8) as u8,
        request_id as u8,
        (content_length >> 8) as u8,
        content_length as u8,
        0, // padding_length
        0, // reserved
    ]
}

fn put_nv_pair(buf: &mut BytesMut, name: &str, value: &str) {
    put_fcgi_len(buf, name.len());
    put_fcgi_len(buf, value.len());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn put_fcgi_len(buf: &mut BytesMut, len: usize) {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else {
        buf.put_u32((len as u32) | 0x8000_0000);
    }
}

/// Frames an arbitrary byte slice as one or more `record_type` records,
/// each capped at 0xffff content bytes, porting `fcgi_feed`'s splitting
/// loop without the istream pull-model plumbing.
fn frame_records(record_type: u8, request_id: u16, data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 8 * (data.len() / 0xffff + 2));
    let mut offset = 0;
    loop {
        let remaining = data.len() - offset;
        let chunk_len = remaining.min(0xffff);
        out.extend_from_slice(&record_header(record_type, request_id, chunk_len as u16));
        out.extend_from_slice(&data[offset..offset + chunk_len]);
        offset += chunk_len;
        if chunk_len == 0 {
            break;
        }
    }
    out.freeze()
}

pub struct FcgiClient {
    stream: TcpStream,
    request_id: u16,
}

impl FcgiClient {
    pub async fn connect(addr: &str) -> Result<Self, GatewayError> {
        let (stream, _) = connect(addr).await.map_err(|e| peer_failure(addr, e))?;
        Ok(FcgiClient { stream, request_id: 1 })
    }

    fn target(address: &Address) -> Result<String, GatewayError> {
        match address {
            Address::FastCgi { socket_path, .. } => Ok(socket_path.clone()),
            _ => Err(GatewayError::Internal("fcgi client given non-FastCGI address".into())),
        }
    }

    async fn read_record(&mut self) -> Result<(u8, Bytes), GatewayError> {
        let header = vec![0u8; 8];
        let (res, header) = self.stream.read(header).await;
        let n = res.map_err(|e| peer_failure("fcgi", e))?;
        if n < 8 {
            return Err(peer_failure("fcgi", "short record header"));
        }
        let record_type = header[1];
        let content_length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let padding_length = header[6] as usize;

        let mut acc = Vec::with_capacity(content_length);
        while acc.len() < content_length {
            let scratch = vec![0u8; content_length - acc.len()];
            let (res, scratch) = self.stream.read(scratch).await;
            let n = res.map_err(|e| peer_failure("fcgi", e))?;
            if n == 0 {
                return Err(peer_failure("fcgi", "connection closed mid-record"));
            }
            acc.extend_from_slice(&scratch[..n]);
        }
        if padding_length > 0 {
            let pad = vec![0u8; padding_length];
            let (res, _) = self.stream.read(pad).await;
            res.map_err(|e| peer_failure("fcgi", e))?;
        }
        Ok((record_type, Bytes::from(acc)))
    }
}

impl BackendClient for FcgiClient {
    async fn send_request(&mut self, req: BackendRequest) -> Result<BackendResponse, GatewayError> {
        let _ = Self::target(&req.address)?;
        let id = self.request_id;

        let mut begin_body = BytesMut::with_capacity(8);
        begin_body.put_u16(FCGI_RESPONDER);
        begin_body.put_u8(FCGI_KEEP_CONN);
        begin_body.extend_from_slice(&[0u8; 5]);
        let mut wire = BytesMut::new();
        wire.extend_from_slice(&record_header(FCGI_BEGIN_REQUEST, id, begin_body.len() as u16));
        wire.extend_from_slice(&begin_body);

        let mut params = BytesMut::new();
        put_nv_pair(&mut params, "REQUEST_METHOD", req.method.as_str());
        put_nv_pair(&mut params, "REQUEST_URI", &req.path);
        for (name, value) in &req.headers {
            put_nv_pair(&mut params, &format!("HTTP_{}", name.to_uppercase().replace('-', "_")), value);
        }
        wire.extend_from_slice(&frame_records(FCGI_PARAMS, id, &params));
        wire.extend_from_slice(&record_header(FCGI_PARAMS, id, 0)); // empty record closes params stream

        let empty_body = Bytes::new();
        let body_bytes = req.body.as_ref().filter(|_| !req.method.forbids_body()).unwrap_or(&empty_body);
        wire.extend_from_slice(&frame_records(FCGI_STDIN, id, body_bytes));

        let (res, _) = self.stream.write_all(wire.to_vec()).await;
        res.map_err(|e| peer_failure("fcgi", e))?;

        let mut stdout = BytesMut::new();
        loop {
            let (record_type, payload) = self.read_record().await?;
            match record_type {
                FCGI_STDOUT => {
                    if payload.is_empty() {
                        // empty STDOUT record signals end of stream, but END_REQUEST
                        // is the authoritative terminator; keep reading.
                    } else {
                        stdout.extend_from_slice(&payload);
                    }
                }
                FCGI_STDERR => {
                    if !payload.is_empty() {
                        tracing::warn!(target: "fcgi", bytes = payload.len(), "backend wrote to stderr");
                    }
                }
                FCGI_END_REQUEST => break,
                _ => return Err(GatewayError::ProtocolViolation("unknown FastCGI record type".into())),
            }
        }

        self.request_id = self.request_id.wrapping_add(1).max(1);
        parse_cgi_style_response(&stdout)
    }
}

/// FastCGI's STDOUT carries a CGI-style response: optional `Status:`
/// line, headers, blank line, body.
pub(crate) fn parse_cgi_style_response(stdout: &[u8]) -> Result<BackendResponse, GatewayError> {
    let text = String::from_utf8_lossy(stdout);
    let Some(split) = text.find("\r\n\r\n").or_else(|| text.find("\n\n")) else {
        return Ok(BackendResponse { status: 200, headers: Vec::new(), body: Bytes::copy_from_slice(stdout) });
    };
    let sep_len = if text[split..].starts_with("\r\n\r\n") { 4 } else { 2 };
    let header_block = &text[..split];
    let body_start = split + sep_len;

    let mut status = 200u16;
    let mut headers = Vec::new();
    for line in header_block.split(['\n']) {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            status = value.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(200);
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let body = if BackendResponse::suppress_body(status) {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&stdout[body_start.min(stdout.len())..])
    };
    Ok(BackendResponse { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_records_terminates_with_zero_length_record() {
        let framed = frame_records(FCGI_STDIN, 1, b"hello");
        // header(8) + "hello"(5) + terminating empty header(8)
        assert_eq!(framed.len(), 8 + 5 + 8);
        let last_header = &framed[framed.len() - 8..];
        assert_eq!(u16::from_be_bytes([last_header[4], last_header[5]]), 0);
    }

    #[test]
    fn test_frame_records_splits_oversized_payload() {
        let data = vec![0u8; 0xffff + 10];
        let framed = frame_records(FCGI_STDIN, 1, &data);
        // first record: header + 0xffff bytes; second: header + 10 bytes; terminator: header
        assert_eq!(framed.len(), 8 + 0xffff + 8 + 10 + 8);
    }

    #[test]
    fn test_parse_cgi_style_response_extracts_status_and_headers() {
        let raw = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nnope";
        let resp = parse_cgi_style_response(raw).unwrap();
        assert_eq!(resp.status, 404);
        assert_eq!(resp.headers, vec![("Content-Type".to_string(), "text/plain".to_string())]);
        assert_eq!(resp.body, Bytes::from_static(b"nope"));
    }

    #[test]
    fn test_parse_cgi_style_response_defaults_to_200_without_status() {
        let raw = b"Content-Type: text/html\r\n\r\n<html/>";
        let resp = parse_cgi_style_response(raw).unwrap();
        assert_eq!(resp.status, 200);
    }
}
