//! Filtered socket abstraction (spec §4.C): wraps a raw `TcpStream` with an
//! optional `SocketFilter` that can transform bytes in transit (e.g. a TLS
//! terminator), so the rest of the proxy reads/writes plain bytes without
//! caring whether the wire has a filter attached. Observable state walks
//! `Connecting → Ready → {Readable, Writable, ReadableWritable} → Closed`;
//! the filter's own `is_empty()` is tracked independently, since a closed
//! fd doesn't mean the filter has finished handing back plaintext it
//! already decoded (a TLS session can still have a full record buffered).

use bp_core::GatewayError;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};

/// Outcome of handing buffered plaintext to the owner via
/// `SocketHandler::on_buffered_data`, mirroring the source's result enum
/// for that callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedDataResult {
    /// All available data was consumed; keep reading.
    Ok,
    /// Some data was consumed; more is buffered for the next call.
    Partial,
    /// The handler wants more data before it can make progress.
    More,
    /// The handler is blocked (e.g. downstream backpressure); stop
    /// delivering until explicitly unblocked.
    Blocking,
    /// The handler closed the socket from within the callback.
    Closed,
    /// The handler destroyed itself from within the callback; the socket
    /// must not be touched again.
    Destroyed,
}

/// Observable connection state (spec §4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Ready,
    Readable,
    Writable,
    ReadableWritable,
    Closed,
}

/// Events a `FilteredSocket` owner implements (spec §4.C: `OnBufferedData`,
/// `OnBufferedClosed`, `OnBufferedRemaining`, `OnBufferedEnd`,
/// `OnBufferedWrite`, `OnBufferedError`). Every method has a default so an
/// owner only needs to implement the events it cares about.
pub trait SocketHandler {
    /// New plaintext is buffered; return how much progress was made.
    fn on_buffered_data(&mut self, data: &[u8]) -> BufferedDataResult;

    /// The peer closed the fd. Returning `true` keeps the socket around so
    /// already-buffered plaintext (including whatever the filter is still
    /// holding) can still be drained; `false` tears it down immediately.
    fn on_buffered_closed(&mut self) -> bool {
        true
    }

    /// `n` raw bytes are still sitting in the fifo, unconsumed by the
    /// filter. Returning `false` abandons them.
    fn on_buffered_remaining(&mut self, _n: usize) -> bool {
        true
    }

    /// The fd is closed and every last byte (raw and filtered) has been
    /// delivered or discarded — the terminal event, fired exactly once.
    fn on_buffered_end(&mut self) {}

    /// A previously blocked write has drained enough to accept more.
    fn on_buffered_write(&mut self) {}

    fn on_buffered_error(&mut self, _err: &GatewayError) {}
}

/// A transform applied to bytes flowing over a `FilteredSocket`, covering
/// the source's filter capability set narrowed to what an async runtime
/// still needs explicitly — `ScheduleRead/Write` and `UnscheduleWrite` are
/// subsumed by simply awaiting `FilteredSocket::poll_read`/`write_all`, so
/// they have no counterpart here. The identity filter (no-op) is used for
/// plain HTTP; a TLS filter would decode ciphertext into plaintext and
/// encode the reverse.
pub trait SocketFilter: Send {
    /// `Init` — called once when the filter is attached to a socket.
    fn init(&mut self) {}

    /// `OnData` — raw bytes arrived on the wire; returns whatever
    /// plaintext can be decoded from them right now (may be less than
    /// `input`, e.g. a partial TLS record held back for the next call).
    fn on_data(&mut self, input: &[u8]) -> Vec<u8> {
        input.to_vec()
    }

    /// `Write` — encodes outgoing plaintext before it's written to the fd.
    fn write(&mut self, output: Vec<u8>) -> Vec<u8> {
        output
    }

    /// `OnClosed` — the raw fd was closed by the peer. Returning `true`
    /// keeps the filter attached so it can still be drained of whatever
    /// plaintext it already decoded.
    fn on_closed(&mut self) -> bool {
        true
    }

    /// `OnRemaining` — `n` more raw bytes are buffered ahead of the fd
    /// close. Returning `false` tells the socket to discard them.
    fn on_remaining(&mut self, _n: usize) -> bool {
        true
    }

    /// `OnEnd` — every raw byte has been consumed or discarded for good.
    fn on_end(&mut self) {}

    /// `IsEmpty()` — `false` means the filter still holds decoded
    /// plaintext the owner hasn't seen yet. A socket shutdown must not be
    /// finalized while this is `false`.
    fn is_empty(&self) -> bool {
        true
    }

    /// `Close` — releases filter-owned resources (e.g. a TLS session).
    fn close(&mut self) {}
}

pub struct IdentityFilter;
impl SocketFilter for IdentityFilter {}

pub struct FilteredSocket {
    stream: TcpStream,
    filter: Box<dyn SocketFilter>,
    peer_addr: SocketAddr,
    state: SocketState,
    /// Raw bytes read off the wire, not yet handed to the filter.
    raw_fifo: VecDeque<u8>,
    /// `true` once the underlying fd has reported EOF.
    fd_closed: bool,
}

impl FilteredSocket {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        FilteredSocket {
            stream,
            filter: Box::new(IdentityFilter),
            peer_addr,
            state: SocketState::Ready,
            raw_fifo: VecDeque::new(),
            fd_closed: false,
        }
    }

    pub fn with_filter(mut self, mut filter: Box<dyn SocketFilter>) -> Self {
        filter.init();
        self.filter = filter;
        self
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// `IsEmpty()` — true once neither the raw fifo nor the filter itself
    /// has anything left buffered. Shutdown logic must check this before
    /// declaring the socket fully drained.
    pub fn is_empty(&self) -> bool {
        self.raw_fifo.is_empty() && self.filter.is_empty()
    }

    pub fn set_nodelay(&self, value: bool) -> std::io::Result<()> {
        self.stream.set_nodelay(value)
    }

    /// `Read()` — pulls one chunk off the wire, runs it through the
    /// filter's `OnData`, and delivers whatever plaintext results to
    /// `handler.on_buffered_data`. On fd EOF, drives `OnBufferedClosed` /
    /// `OnBufferedRemaining` / `OnBufferedEnd` per spec §4.C, firing
    /// `OnBufferedEnd` exactly once (testable property #10).
    pub async fn read(&mut self, handler: &mut dyn SocketHandler) -> Result<BufferedDataResult, GatewayError> {
        if self.state == SocketState::Closed {
            return Ok(BufferedDataResult::Closed);
        }
        let buf = vec![0u8; 4096];
        let (res, buf) = self.stream.read(buf).await;
        match res {
            Ok(0) => self.handle_fd_eof(handler),
            Ok(n) => {
                self.state = SocketState::Readable;
                self.raw_fifo.extend(&buf[..n]);
                let raw: Vec<u8> = self.raw_fifo.drain(..).collect();
                let decoded = self.filter.on_data(&raw);
                if decoded.is_empty() {
                    return Ok(BufferedDataResult::More);
                }
                Ok(handler.on_buffered_data(&decoded))
            }
            Err(e) => {
                let err = GatewayError::from(e);
                handler.on_buffered_error(&err);
                Err(err)
            }
        }
    }

    fn handle_fd_eof(&mut self, handler: &mut dyn SocketHandler) -> Result<BufferedDataResult, GatewayError> {
        self.fd_closed = true;
        let keep = handler.on_buffered_closed();
        if !keep {
            self.filter.close();
            self.state = SocketState::Closed;
            handler.on_buffered_end();
            return Ok(BufferedDataResult::Closed);
        }
        if !self.raw_fifo.is_empty() {
            let n = self.raw_fifo.len();
            if !self.filter.on_remaining(n) {
                self.raw_fifo.clear();
            }
        }
        self.filter.on_end();
        self.state = SocketState::Closed;
        if self.is_empty() {
            handler.on_buffered_end();
        }
        Ok(BufferedDataResult::Closed)
    }

    /// `Write(span)` — encodes `data` through the filter and writes it to
    /// the fd, firing `OnBufferedWrite` once the write completes.
    pub async fn write(&mut self, data: Vec<u8>, handler: &mut dyn SocketHandler) -> Result<(), GatewayError> {
        let encoded = self.filter.write(data);
        let (res, _) = self.stream.write_all(encoded).await;
        match res {
            Ok(()) => {
                self.state = match self.state {
                    SocketState::Readable => SocketState::ReadableWritable,
                    SocketState::Closed => SocketState::Closed,
                    _ => SocketState::Writable,
                };
                handler.on_buffered_write();
                Ok(())
            }
            Err(e) => {
                let err = GatewayError::from(e);
                handler.on_buffered_error(&err);
                Err(err)
            }
        }
    }

    /// `Close()` — finalizes the socket immediately. Callers that need
    /// `IsEmpty()`-gated shutdown (draining a TLS filter's last record
    /// first) should check `is_empty()` before calling this.
    pub fn close(&mut self) {
        self.filter.close();
        self.state = SocketState::Closed;
    }

    /// `Abandon()` — drops the socket without running the filter's
    /// graceful close, for the "client already gone, don't bother" path.
    pub fn abandon(&mut self) {
        self.state = SocketState::Closed;
    }
}

/// Resolves a host:port string to candidate addresses, IPv4-first — a
/// macOS dual-stack workaround, harmless and still correct on Linux.
pub fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    let v6: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv6()).collect();
    v4.extend(v6);
    v4
}

/// Opens a new outbound TCP connection, trying every resolved candidate in
/// order and returning the first that succeeds.
pub async fn connect(addr: &str) -> anyhow::Result<(TcpStream, SocketAddr)> {
    let candidates = resolve_addrs(addr);
    if candidates.is_empty() {
        anyhow::bail!("address resolve failed for {addr}");
    }
    let mut last_err = None;
    for sa in candidates {
        match TcpStream::connect(sa).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok((stream, sa));
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(anyhow::anyhow!(
        "connect failed on all candidates for {addr}: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use monoio::io::{AsyncReadRent as _, AsyncWriteRentExt as _};

    #[test]
    fn test_resolve_literal_socket_addr() {
        let addrs = resolve_addrs("127.0.0.1:8080");
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn test_identity_filter_passes_through() {
        let mut f = IdentityFilter;
        assert_eq!(f.on_data(&[1, 2, 3]), vec![1, 2, 3]);
        assert_eq!(f.write(vec![4, 5]), vec![4, 5]);
        assert!(f.is_empty());
    }

    struct CollectingHandler {
        data: Vec<u8>,
        end_calls: u32,
    }
    impl SocketHandler for CollectingHandler {
        fn on_buffered_data(&mut self, data: &[u8]) -> BufferedDataResult {
            self.data.extend_from_slice(data);
            BufferedDataResult::Ok
        }
        fn on_buffered_end(&mut self) {
            self.end_calls += 1;
        }
    }

    /// Testable property #10: with a trivial pass-through filter, data
    /// written equals data read, and fd EOF is observed as
    /// `OnBufferedEnd()` exactly once.
    #[monoio::test]
    async fn test_identity_filter_round_trips_and_reports_end_once() {
        let listener = monoio::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let payload = b"hello through the filter".to_vec();
        let expected = payload.clone();

        monoio::spawn(async move {
            if let Ok((mut server, _)) = listener.accept().await {
                let buf = vec![0u8; expected.len()];
                let (res, buf) = server.read(buf).await;
                let n = res.unwrap_or(0);
                let (_, _) = server.write_all(buf[..n].to_vec()).await;
                // server drops here, closing its end of the connection.
            }
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut socket = FilteredSocket::new(stream, addr);
        let mut handler = CollectingHandler { data: Vec::new(), end_calls: 0 };

        socket.write(payload.clone(), &mut handler).await.unwrap();

        loop {
            let result = socket.read(&mut handler).await.unwrap();
            if result == BufferedDataResult::Closed || socket.state() == SocketState::Closed {
                break;
            }
        }

        assert_eq!(handler.data, payload);
        assert_eq!(handler.end_calls, 1);
        assert!(socket.is_empty());
    }
}
