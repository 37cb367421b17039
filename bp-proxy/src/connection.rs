//! Per-connection request loop (spec §4.A-§4.H): buffers allocated once
//! and reused across keepalive requests, httparse-based zero-copy header
//! parsing, a
//! brief non-async `RefCell` borrow of `ProxyWorker` to pick where a
//! request goes, then async I/O to the chosen backend with a
//! stale-pooled-connection retry-once.
//!
//! Generalized from "always HTTP-over-TCP upstream" to dispatch across
//! every `bp_backend` client kind, and folds in cache lookup (spec
//! §4.H) and failure reporting (spec §4.F) around the original's byte
//! shuffling.

use crate::pool::ConnPool;
use crate::proxy::{ProxyWorker, RESP_400, RESP_502, RequestResult, build_response, build_upstream_request};
use bp_backend::{BackendClient, BackendRequest, BackendResponse, CgiClient, FcgiClient, LocalFileClient, Method, NfsClient, WasClient};
use bp_cache::{CacheKey, ResponseCache};
use bp_core::Address;
use bp_net::socket::connect as net_connect;
use bp_net::FailureManager;
use bp_session::{SessionId, SessionStore};
use bp_worker::SharedWorkerPool;
use bytes::Bytes;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

const SESSION_COOKIE_NAME: &str = "session_id";

/// Pulls the session id out of a `Cookie` header, if present and well-formed.
fn session_id_from_headers(headers: &[(String, String)]) -> Option<SessionId> {
    let cookie = headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("cookie"))?;
    cookie.1.split(';').find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        (name.trim() == SESSION_COOKIE_NAME).then(|| SessionId::from_hex(value.trim())).flatten()
    })
}

/// Binds this request to a session per the translation response's
/// directive: reuses the client's existing session if it names one and
/// the store still has it, otherwise mints a new one. Returns the bound
/// id and, when a fresh session was created, the `Set-Cookie` line to
/// hand back to the client.
fn bind_session(sessions: &SessionStore, headers: &[(String, String)], realm: &str) -> (SessionId, Option<String>) {
    if let Some(id) = session_id_from_headers(headers)
        && sessions.find(&id).is_some()
    {
        return (id, None);
    }
    let session = sessions.create(realm);
    let cookie = format!("{SESSION_COOKIE_NAME}={}; Path=/; HttpOnly", session.id);
    (session.id, Some(cookie))
}

/// Collapses a session id into the `u32` sticky-dispatch key `Balancer`
/// expects; 0 is reserved there to mean "no session", so a true zero hash
/// is nudged to 1.
fn sticky_key(id: SessionId) -> u32 {
    let b = id.as_bytes();
    let key = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
    if key == 0 { 1 } else { key }
}

fn result_session_realm(result: &RequestResult) -> Option<&str> {
    match result {
        RequestResult::Proxy { session_realm: Some(realm), .. } => Some(realm.as_str()),
        _ => None,
    }
}

fn parsed_method(m: &str) -> Method {
    match m {
        "GET" => Method::Get,
        "HEAD" => Method::Head,
        "POST" => Method::Post,
        "PUT" => Method::Put,
        "DELETE" => Method::Delete,
        "OPTIONS" => Method::Options,
        _ => Method::Other,
    }
}

/// Dispatches one already-parsed request to whatever backend the
/// resolved `Address` names. The HTTP case is handled separately in
/// `handle_connection` (it streams instead of buffering the whole
/// response), so this only covers the non-streaming backend kinds.
async fn dispatch_non_http(
    address: Address,
    method: &str,
    path: &str,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    worker_pool: &SharedWorkerPool,
) -> Result<BackendResponse, bp_core::GatewayError> {
    let req = BackendRequest { method: parsed_method(method), address: address.clone(), path: path.to_string(), headers, body };
    match &address {
        Address::Local { .. } => LocalFileClient::new().send_request(req).await,
        Address::Cgi(_) | Address::Pipe(_) => CgiClient::new(Arc::clone(worker_pool)).send_request(req).await,
        Address::FastCgi { socket_path, .. } => FcgiClient::connect(socket_path).await?.send_request(req).await,
        Address::Was { .. } => WasClient::new().send_request(req).await,
        Address::Nfs { .. } => NfsClient::new().send_request(req).await,
        // `bp_core::Address` carries no protocol discriminant to pick AJP
        // over plain HTTP, and no backend client here speaks HTTP over a
        // Unix socket (`LHttp`'s wire format) — both are left unserved
        // until a listener-scoped protocol selector exists (see DESIGN.md).
        Address::LHttp { .. } | Address::Http { .. } | Address::None => {
            Err(bp_core::GatewayError::Internal("unsupported address kind for non-streaming dispatch".into()))
        }
    }
}

/// Handles one client connection (HTTP/1.1 with keepalive), sharing
/// `ProxyWorker`/`ConnPool` with every other connection on this thread
/// via `Rc<RefCell<_>>` — single-core, zero-atomic-on-the-hot-path.
#[allow(clippy::too_many_arguments)]
pub async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    proxy: Rc<RefCell<ProxyWorker>>,
    conn_pool: Rc<ConnPool>,
    worker_pool: SharedWorkerPool,
    cache: Arc<ResponseCache>,
    failures: Arc<FailureManager>,
    sessions: Arc<SessionStore>,
) -> anyhow::Result<()> {
    let client_ip = peer_addr.ip().to_string();

    let mut read_buf = vec![0u8; 8192];
    let mut upstream_req_buf = Vec::with_capacity(2048);
    let mut resp_buf = Vec::with_capacity(4096);
    let mut upstream_buf = vec![0u8; 65536];

    loop {
        let (res, returned_buf) = client.read(read_buf).await;
        read_buf = returned_buf;
        let n = match res {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(e.into()),
        };

        let mut headers_raw = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers_raw);

        match req.parse(&read_buf[..n]) {
            Ok(httparse::Status::Complete(body_offset)) => {
                let method = req.method.unwrap_or("GET").to_string();
                let path = req.path.unwrap_or("/").to_string();

                let mut owned_headers: Vec<(String, String)> = Vec::with_capacity(16);
                let mut host: Option<String> = None;
                let mut keep_alive = true;

                for h in req.headers.iter() {
                    if h.name.is_empty() {
                        break;
                    }
                    let val = String::from_utf8_lossy(h.value).into_owned();
                    if h.name.eq_ignore_ascii_case("host") {
                        host = Some(val.clone());
                    } else if h.name.eq_ignore_ascii_case("connection") {
                        keep_alive = !val.eq_ignore_ascii_case("close");
                    }
                    owned_headers.push((h.name.to_string(), val));
                }

                let cache_key = CacheKey::build(&method, &path, &[], &http::HeaderMap::new());
                if method == "GET"
                    && let Some(entry) = cache.get(&cache_key)
                {
                    build_response(&mut resp_buf, entry.status, &[], &entry.body);
                    let data = resp_buf.clone();
                    let (res, _) = client.write_all(data).await;
                    res?;
                    if !keep_alive {
                        return Ok(());
                    }
                    continue;
                }

                // A session cookie, if any, doubles as the sticky-dispatch
                // key so a returning client keeps landing on the same peer
                // even before we know whether this route wants binding.
                let existing_session = session_id_from_headers(&owned_headers);
                let session_key = existing_session.map(sticky_key).unwrap_or(0);

                // ── Resolve target (translation lookup + peer pick) ──
                let result = {
                    let mut pw = proxy.borrow_mut();
                    pw.handle_request(&method, &path, host.as_deref(), &owned_headers, &client_ip, session_key).await
                };

                let result = match result {
                    Ok(r) => r,
                    Err(_) => {
                        let (res, _) = client.write_all(RESP_502.to_vec()).await;
                        res?;
                        if !keep_alive {
                            return Ok(());
                        }
                        continue;
                    }
                };

                let set_cookie = result_session_realm(&result)
                    .map(|realm| bind_session(&sessions, &owned_headers, realm))
                    .and_then(|(_, cookie)| cookie);

                match result {
                    RequestResult::Proxy { address: Address::Http { addresses, .. }, cacheable, .. } => {
                        let peer = addresses.addresses[0];
                        let key = peer.to_string();

                        let body_data = read_buf[body_offset..n].to_vec();
                        let header_pairs: Vec<(&str, &str)> =
                            owned_headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                        build_upstream_request(&mut upstream_req_buf, &method, &path, &header_pairs, &body_data);

                        let mut upstream = match conn_pool.take(&key) {
                            Some(s) => s,
                            None => match net_connect(&key).await {
                                Ok((s, _)) => s,
                                Err(_) => {
                                    failures.add(peer);
                                    let (res, _) = client.write_all(RESP_502.to_vec()).await;
                                    res?;
                                    if !keep_alive {
                                        return Ok(());
                                    }
                                    continue;
                                }
                            },
                        };

                        let req_data = upstream_req_buf.clone();
                        let (res, _) = upstream.write_all(req_data).await;
                        if res.is_err() {
                            match net_connect(&key).await {
                                Ok((mut new_upstream, _)) => {
                                    let req_data = upstream_req_buf.clone();
                                    let (res, _) = new_upstream.write_all(req_data).await;
                                    if res.is_err() {
                                        failures.add(peer);
                                        let (res, _) = client.write_all(RESP_502.to_vec()).await;
                                        res?;
                                        if !keep_alive {
                                            return Ok(());
                                        }
                                        continue;
                                    }
                                    upstream = new_upstream;
                                }
                                Err(_) => {
                                    failures.add(peer);
                                    let (res, _) = client.write_all(RESP_502.to_vec()).await;
                                    res?;
                                    if !keep_alive {
                                        return Ok(());
                                    }
                                    continue;
                                }
                            }
                        }

                        let (res, returned_ubuf) = upstream.read(upstream_buf).await;
                        upstream_buf = returned_ubuf;
                        let resp_n = match res {
                            Ok(0) | Err(_) => {
                                failures.add(peer);
                                let (res, _) = client.write_all(RESP_502.to_vec()).await;
                                res?;
                                if !keep_alive {
                                    return Ok(());
                                }
                                continue;
                            }
                            Ok(n) => n,
                        };

                        let mut resp_headers = [httparse::EMPTY_HEADER; 64];
                        let mut resp = httparse::Response::new(&mut resp_headers);
                        let mut content_length: Option<usize> = None;
                        let mut upstream_keepalive = true;
                        let mut resp_status: u16 = 502;

                        if let Ok(httparse::Status::Complete(hdr_len)) = resp.parse(&upstream_buf[..resp_n]) {
                            resp_status = resp.code.unwrap_or(502);
                            for h in resp.headers.iter() {
                                if h.name.is_empty() {
                                    break;
                                }
                                if h.name.eq_ignore_ascii_case("content-length") {
                                    content_length = std::str::from_utf8(h.value).ok().and_then(|s| s.parse().ok());
                                }
                                if h.name.eq_ignore_ascii_case("connection") {
                                    let v = std::str::from_utf8(h.value).unwrap_or("");
                                    upstream_keepalive = !v.eq_ignore_ascii_case("close");
                                }
                            }

                            let mut first_chunk = upstream_buf[..resp_n].to_vec();
                            let mut body_acc = if cacheable { Vec::with_capacity(content_length.unwrap_or(0)) } else { Vec::new() };
                            if cacheable {
                                body_acc.extend_from_slice(&first_chunk[hdr_len..]);
                            }
                            if let Some(cookie) = &set_cookie {
                                let insert_at = hdr_len.saturating_sub(2);
                                let line = format!("set-cookie: {cookie}\r\n");
                                first_chunk.splice(insert_at..insert_at, line.into_bytes());
                            }
                            let (res, _) = client.write_all(first_chunk).await;
                            res?;

                            if let Some(cl) = content_length {
                                let body_in_first = resp_n - hdr_len;
                                let mut remaining = cl.saturating_sub(body_in_first);

                                while remaining > 0 {
                                    let chunk_size = remaining.min(65536);
                                    let chunk_buf = vec![0u8; chunk_size];
                                    let (res, chunk_buf) = upstream.read(chunk_buf).await;
                                    let cn = match res {
                                        Ok(0) | Err(_) => break,
                                        Ok(n) => n,
                                    };
                                    remaining -= cn;
                                    if cacheable {
                                        body_acc.extend_from_slice(&chunk_buf[..cn]);
                                    }
                                    let data = chunk_buf[..cn].to_vec();
                                    let (res, _) = client.write_all(data).await;
                                    if res.is_err() {
                                        return Ok(());
                                    }
                                }
                            }

                            if cacheable && method == "GET" && (200..300).contains(&resp_status) {
                                cache.put(cache_key, resp_status, Vec::new(), Bytes::from(body_acc), Vec::new(), None);
                            }
                        } else {
                            let data = upstream_buf[..resp_n].to_vec();
                            let (res, _) = client.write_all(data).await;
                            res?;
                            upstream_keepalive = false;
                        }

                        if upstream_keepalive {
                            conn_pool.put(&key, upstream);
                        }
                    }

                    RequestResult::Proxy { address, .. } => {
                        let body_data = if body_offset < n { Some(Bytes::copy_from_slice(&read_buf[body_offset..n])) } else { None };
                        match dispatch_non_http(address, &method, &path, owned_headers, body_data, &worker_pool).await {
                            Ok(mut resp) => {
                                if let Some(cookie) = &set_cookie {
                                    resp.headers.push(("set-cookie".to_string(), cookie.clone()));
                                }
                                build_response(&mut resp_buf, resp.status, &resp.headers, &resp.body);
                                let data = resp_buf.clone();
                                let (res, _) = client.write_all(data).await;
                                res?;
                            }
                            Err(_) => {
                                let (res, _) = client.write_all(RESP_502.to_vec()).await;
                                res?;
                            }
                        }
                    }

                    RequestResult::Static(resp_bytes) => {
                        let (res, _) = client.write_all(resp_bytes.to_vec()).await;
                        res?;
                    }

                    RequestResult::Deny => {
                        let (res, _) = client.write_all(RESP_400.to_vec()).await;
                        res?;
                        return Ok(());
                    }
                }

                if !keep_alive {
                    return Ok(());
                }
            }
            Ok(httparse::Status::Partial) => {
                let (res, _) = client.write_all(RESP_400.to_vec()).await;
                res?;
                return Ok(());
            }
            Err(e) => {
                tracing::debug!(error = %e, "HTTP parse error");
                let (res, _) = client.write_all(RESP_400.to_vec()).await;
                res?;
                return Ok(());
            }
        }
    }
}
