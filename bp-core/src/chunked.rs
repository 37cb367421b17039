//! HTTP chunked transfer-coding stream filters (spec §4.B, §4.D).
//!
//! `Chunked` wraps an inner stream and frames its bytes as
//! `<hex-size>\r\n<data>\r\n...0\r\n\r\n`. `Dechunk` is the inverse state
//! machine (`HttpChunkParser`); its *verbatim* mode additionally forwards
//! the original encoded bytes unchanged, used when relaying to a peer that
//! will itself re-forward the chunked encoding (spec §4.D).

use crate::error::GatewayError;
use crate::stream::{Bucket, BucketList, Handler, Length, Stream};
use bytes::Bytes;

/// `Chunked` — write-side framing.
pub struct Chunked<S> {
    inner: S,
    eof_sent: bool,
}

impl<S: Stream> Chunked<S> {
    pub fn new(inner: S) -> Self {
        Chunked { inner, eof_sent: false }
    }
}

fn frame_chunk(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

const FINAL_CHUNK: &[u8] = b"0\r\n\r\n";

impl<S: Stream> Stream for Chunked<S> {
    fn length(&self) -> Length {
        Length::Unknown
    }

    fn read(&mut self, handler: &mut dyn Handler) {
        if self.eof_sent {
            handler.on_eof();
            return;
        }
        struct Framer<'a> {
            handler: &'a mut dyn Handler,
            eof_sent: &'a mut bool,
        }
        impl<'a> Handler for Framer<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                if span.is_empty() {
                    return 0;
                }
                let framed = frame_chunk(span);
                self.handler.on_data(&framed);
                span.len()
            }
            fn on_eof(&mut self) {
                *self.eof_sent = true;
                self.handler.on_data(FINAL_CHUNK);
                self.handler.on_eof();
            }
            fn on_error(&mut self, err: GatewayError) {
                self.handler.on_error(err);
            }
        }
        let mut framer = Framer { handler, eof_sent: &mut self.eof_sent };
        self.inner.read(&mut framer);
    }

    fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
        // Framing changes byte content; no zero-copy fast path.
        Ok(())
    }

    fn consume_bucket_list(&mut self, _n: usize) {}

    fn close(&mut self) {
        self.inner.close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Size,
    SizeCr,
    Data,
    DataCr,
    DataLf,
    TrailerCr,
    TrailerLf,
    Done,
}

/// Resumable chunked-encoding parser (`HttpChunkParser`).
pub struct ChunkParser {
    state: ParseState,
    chunk_remaining: u64,
    size_buf: Vec<u8>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    /// A span of decoded data bytes, plus the matching raw encoded bytes
    /// consumed to produce it (used by `Dechunk`'s verbatim mode).
    Data { decoded_len: usize },
    Done,
    NeedMore,
}

impl ChunkParser {
    pub fn new() -> Self {
        ChunkParser { state: ParseState::Size, chunk_remaining: 0, size_buf: Vec::new() }
    }

    /// Feeds `input`, writes decoded bytes to `decoded_out`, and returns how
    /// many input bytes were consumed along with the resulting event.
    pub fn feed(&mut self, input: &[u8], decoded_out: &mut Vec<u8>) -> Result<(usize, ChunkEvent), GatewayError> {
        let mut i = 0;
        while i < input.len() {
            match self.state {
                ParseState::Size => {
                    let b = input[i];
                    if b == b'\r' {
                        self.state = ParseState::SizeCr;
                        i += 1;
                    } else if b.is_ascii_hexdigit() {
                        self.size_buf.push(b);
                        i += 1;
                    } else if b == b';' {
                        // chunk extension: skip to CR
                        while i < input.len() && input[i] != b'\r' {
                            i += 1;
                        }
                    } else {
                        return Err(GatewayError::ProtocolViolation(format!(
                            "bad chunk size byte: {b:#x}"
                        )));
                    }
                }
                ParseState::SizeCr => {
                    if input[i] != b'\n' {
                        return Err(GatewayError::ProtocolViolation("expected LF after chunk size CR".into()));
                    }
                    i += 1;
                    let size_str = std::str::from_utf8(&self.size_buf)
                        .map_err(|_| GatewayError::ProtocolViolation("non-utf8 chunk size".into()))?;
                    let size = u64::from_str_radix(size_str, 16)
                        .map_err(|_| GatewayError::ProtocolViolation("malformed chunk size".into()))?;
                    self.size_buf.clear();
                    if size == 0 {
                        self.state = ParseState::TrailerCr;
                    } else {
                        self.chunk_remaining = size;
                        self.state = ParseState::Data;
                    }
                }
                ParseState::Data => {
                    let avail = (input.len() - i) as u64;
                    let take = avail.min(self.chunk_remaining) as usize;
                    decoded_out.extend_from_slice(&input[i..i + take]);
                    i += take;
                    self.chunk_remaining -= take as u64;
                    if self.chunk_remaining == 0 {
                        self.state = ParseState::DataCr;
                    } else {
                        return Ok((i, ChunkEvent::Data { decoded_len: decoded_out.len() }));
                    }
                }
                ParseState::DataCr => {
                    if input[i] != b'\r' {
                        return Err(GatewayError::ProtocolViolation("expected CR after chunk data".into()));
                    }
                    i += 1;
                    self.state = ParseState::DataLf;
                }
                ParseState::DataLf => {
                    if input[i] != b'\n' {
                        return Err(GatewayError::ProtocolViolation("expected LF after chunk data CR".into()));
                    }
                    i += 1;
                    self.state = ParseState::Size;
                }
                ParseState::TrailerCr => {
                    if input[i] == b'\r' {
                        i += 1;
                        self.state = ParseState::TrailerLf;
                    } else {
                        // trailer header byte; skip the whole line
                        while i < input.len() && input[i] != b'\n' {
                            i += 1;
                        }
                        if i < input.len() {
                            i += 1;
                        }
                    }
                }
                ParseState::TrailerLf => {
                    if input[i] != b'\n' {
                        return Err(GatewayError::ProtocolViolation("expected final LF".into()));
                    }
                    i += 1;
                    self.state = ParseState::Done;
                    return Ok((i, ChunkEvent::Done));
                }
                ParseState::Done => break,
            }
        }
        if self.state == ParseState::Done {
            Ok((i, ChunkEvent::Done))
        } else {
            Ok((i, ChunkEvent::NeedMore))
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

/// `Dechunk` — inverse of `Chunked`. In verbatim mode, the downstream
/// receives the original chunked bytes unchanged (for relaying), while this
/// struct still tracks decode progress internally to know when the stream
/// ends; in normal mode, the downstream receives decoded bytes only.
pub struct Dechunk<S> {
    inner: S,
    parser: ChunkParser,
    verbatim: bool,
    pending_raw: Vec<u8>,
}

impl<S: Stream> Dechunk<S> {
    pub fn new(inner: S, verbatim: bool) -> Self {
        Dechunk { inner, parser: ChunkParser::new(), verbatim, pending_raw: Vec::new() }
    }
}

impl<S: Stream> Stream for Dechunk<S> {
    fn length(&self) -> Length {
        Length::Unknown
    }

    fn read(&mut self, handler: &mut dyn Handler) {
        struct Decoder<'a> {
            handler: &'a mut dyn Handler,
            parser: &'a mut ChunkParser,
            verbatim: bool,
        }
        impl<'a> Handler for Decoder<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                let mut decoded = Vec::new();
                match self.parser.feed(span, &mut decoded) {
                    Ok((consumed, ChunkEvent::Done)) => {
                        let forward: &[u8] = if self.verbatim { &span[..consumed] } else { &decoded };
                        if !forward.is_empty() {
                            self.handler.on_data(forward);
                        }
                        consumed
                    }
                    Ok((consumed, _)) => {
                        let forward: &[u8] = if self.verbatim { &span[..consumed] } else { &decoded };
                        if !forward.is_empty() {
                            self.handler.on_data(forward);
                        }
                        consumed
                    }
                    Err(e) => {
                        self.handler.on_error(e);
                        0
                    }
                }
            }
            fn on_eof(&mut self) {
                if self.parser.is_done() {
                    self.handler.on_eof();
                } else {
                    self.handler.on_error(GatewayError::ProtocolViolation(
                        "chunked stream ended before final chunk".into(),
                    ));
                }
            }
            fn on_error(&mut self, err: GatewayError) {
                self.handler.on_error(err);
            }
        }
        if self.parser.is_done() {
            handler.on_eof();
            return;
        }
        let mut decoder = Decoder { handler, parser: &mut self.parser, verbatim: self.verbatim };
        self.inner.read(&mut decoder);
    }

    fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
        Ok(())
    }

    fn consume_bucket_list(&mut self, _n: usize) {}

    fn close(&mut self) {
        self.inner.close();
    }
}

/// Convenience: apply `Chunked` then `Dechunk` to a byte slice in-process,
/// for the round-trip test (testable property #2).
pub fn chunk_then_dechunk(data: &[u8], chunk_size: usize, verbatim: bool) -> Vec<u8> {
    struct FixedChunks {
        data: Vec<u8>,
        pos: usize,
        chunk_size: usize,
    }
    impl Stream for FixedChunks {
        fn length(&self) -> Length {
            Length::Exact((self.data.len() - self.pos) as u64)
        }
        fn read(&mut self, handler: &mut dyn Handler) {
            if self.pos >= self.data.len() {
                handler.on_eof();
                return;
            }
            let end = (self.pos + self.chunk_size).min(self.data.len());
            let consumed = handler.on_data(&self.data[self.pos..end]);
            self.pos += consumed;
            if self.pos >= self.data.len() {
                handler.on_eof();
            }
        }
        fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
            Ok(())
        }
        fn consume_bucket_list(&mut self, n: usize) {
            self.pos += n;
        }
        fn close(&mut self) {
            self.pos = self.data.len();
        }
    }

    let source = FixedChunks { data: data.to_vec(), pos: 0, chunk_size: chunk_size.max(1) };
    let mut chunked = Chunked::new(source);
    let encoded = crate::stream::drain_to_vec(&mut chunked);

    let encoded_source = FixedChunks { data: encoded, pos: 0, chunk_size: chunk_size.max(1) };
    let mut dechunk = Dechunk::new(encoded_source, verbatim);
    crate::stream::drain_to_vec(&mut dechunk)
}
