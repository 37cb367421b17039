//! Sink-side streams (spec §4.B): stream endpoints that a caller drives by
//! calling `read()` in a loop but whose purpose is to *collect* or *discard*
//! bytes rather than forward them further downstream. These are used as the
//! terminal end of a pipeline (e.g. buffering a small response body) where
//! an ordinary `Handler` would be overkill.

use crate::error::GatewayError;
use crate::stream::{drain_to_vec, Bucket, BucketList, Handler, Length, Stream};
use bytes::Bytes;
use std::os::unix::io::RawFd;

/// `StringSink` — collects an inner stream's bytes into an owned `String`,
/// rejecting non-UTF-8 content as a client violation.
pub struct StringSink<S> {
    inner: S,
}

impl<S: Stream> StringSink<S> {
    pub fn new(inner: S) -> Self {
        StringSink { inner }
    }

    pub fn collect(mut self) -> Result<String, GatewayError> {
        let bytes = drain_to_vec(&mut self.inner);
        String::from_utf8(bytes).map_err(|e| GatewayError::ClientViolation(e.to_string()))
    }
}

/// `RubberSink` — collects into a growable, size-limited buffer (named for
/// the source's "rubber" allocator, which overcommits virtual memory for
/// large bodies). Exceeding `max_bytes` aborts with `CacheBypass` so callers
/// fall back to streaming instead of buffering.
pub struct RubberSink<S> {
    inner: S,
    max_bytes: usize,
}

impl<S: Stream> RubberSink<S> {
    pub fn new(inner: S, max_bytes: usize) -> Self {
        RubberSink { inner, max_bytes }
    }

    pub fn collect(mut self) -> Result<Vec<u8>, GatewayError> {
        struct Bounded<'a> {
            buf: &'a mut Vec<u8>,
            max: usize,
            overflowed: bool,
        }
        impl<'a> Handler for Bounded<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                if self.buf.len() + span.len() > self.max {
                    self.overflowed = true;
                    return 0;
                }
                self.buf.extend_from_slice(span);
                span.len()
            }
            fn on_eof(&mut self) {}
            fn on_error(&mut self, _err: GatewayError) {}
        }
        let mut buf = Vec::new();
        let mut bounded = Bounded { buf: &mut buf, max: self.max_bytes, overflowed: false };
        for _ in 0..1_000_000 {
            self.inner.read(&mut bounded);
            if bounded.overflowed {
                return Err(GatewayError::CacheBypass("rubber sink exceeded max_bytes".into()));
            }
        }
        Ok(buf)
    }
}

/// `FdSink` — writes an inner stream directly to a raw file descriptor
/// (e.g. a socket doing passthrough), accepting direct-transfer buckets
/// without copying into userspace where the OS allows it.
pub struct FdSink<S> {
    inner: S,
    fd: RawFd,
    written: u64,
}

impl<S: Stream> FdSink<S> {
    pub fn new(inner: S, fd: RawFd) -> Self {
        FdSink { inner, fd, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Drains the inner stream, writing every span to `fd` with `libc::write`.
    pub fn run(&mut self) -> Result<u64, GatewayError> {
        struct Writer<'a> {
            fd: RawFd,
            written: &'a mut u64,
            err: Option<GatewayError>,
        }
        impl<'a> Handler for Writer<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                if span.is_empty() {
                    return 0;
                }
                let n = unsafe {
                    libc::write(self.fd, span.as_ptr() as *const libc::c_void, span.len())
                };
                if n < 0 {
                    self.err = Some(GatewayError::Transient(std::io::Error::last_os_error()));
                    return 0;
                }
                *self.written += n as u64;
                n as usize
            }
            fn on_eof(&mut self) {}
            fn on_error(&mut self, err: GatewayError) {
                self.err = Some(err);
            }
        }
        let mut writer = Writer { fd: self.fd, written: &mut self.written, err: None };
        for _ in 0..1_000_000 {
            self.inner.read(&mut writer);
            if let Some(err) = writer.err.take() {
                return Err(err);
            }
        }
        Ok(self.written)
    }
}

/// `NullSink` — discards everything, counting bytes seen (used by HEAD-style
/// requests that must still drain a response body).
pub struct NullSink<S> {
    inner: S,
}

impl<S: Stream> NullSink<S> {
    pub fn new(inner: S) -> Self {
        NullSink { inner }
    }

    pub fn drain(mut self) -> u64 {
        struct Counter {
            total: u64,
        }
        impl Handler for Counter {
            fn on_data(&mut self, span: &[u8]) -> usize {
                self.total += span.len() as u64;
                span.len()
            }
            fn on_eof(&mut self) {}
            fn on_error(&mut self, _err: GatewayError) {}
        }
        let mut counter = Counter { total: 0 };
        for _ in 0..1_000_000 {
            self.inner.read(&mut counter);
        }
        counter.total
    }
}

/// `GrowingBufferSink` — a `Stream` that is also a write target: callers
/// append bytes with `append`, and it is read out like any other stream.
/// Backs dynamically generated small responses (e.g. error pages built up
/// a fragment at a time).
pub struct GrowingBufferSink {
    chunks: Vec<Bytes>,
    closed: bool,
    pos_in_first: usize,
}

impl GrowingBufferSink {
    pub fn new() -> Self {
        GrowingBufferSink { chunks: Vec::new(), closed: false, pos_in_first: 0 }
    }

    pub fn append(&mut self, data: impl Into<Bytes>) {
        let bytes = data.into();
        if !bytes.is_empty() {
            self.chunks.push(bytes);
        }
    }

    pub fn finish(&mut self) {
        self.closed = true;
    }
}

impl Default for GrowingBufferSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for GrowingBufferSink {
    fn length(&self) -> Length {
        if self.closed {
            let total: usize = self.chunks.iter().map(|b| b.len()).sum::<usize>();
            Length::Exact((total - self.pos_in_first) as u64)
        } else {
            Length::Unknown
        }
    }

    fn read(&mut self, handler: &mut dyn Handler) {
        if self.chunks.is_empty() {
            if self.closed {
                handler.on_eof();
            }
            return;
        }
        let first = self.chunks[0].clone();
        let span = &first[self.pos_in_first..];
        if span.is_empty() {
            self.chunks.remove(0);
            self.pos_in_first = 0;
            return self.read(handler);
        }
        let consumed = handler.on_data(span);
        self.pos_in_first += consumed;
        if self.pos_in_first >= first.len() {
            self.chunks.remove(0);
            self.pos_in_first = 0;
        }
        if self.chunks.is_empty() && self.closed {
            handler.on_eof();
        }
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
        for (i, chunk) in self.chunks.iter().enumerate() {
            let start = if i == 0 { self.pos_in_first } else { 0 };
            if start < chunk.len() {
                list.push(Bucket::Buffer(chunk.slice(start..)));
            }
        }
        Ok(())
    }

    fn consume_bucket_list(&mut self, mut n: usize) {
        while n > 0 && !self.chunks.is_empty() {
            let first_remaining = self.chunks[0].len() - self.pos_in_first;
            if n < first_remaining {
                self.pos_in_first += n;
                n = 0;
            } else {
                n -= first_remaining;
                self.chunks.remove(0);
                self.pos_in_first = 0;
            }
        }
    }

    fn close(&mut self) {
        self.chunks.clear();
        self.closed = true;
    }
}

/// `FifoBufferSink` — like `GrowingBufferSink` but backed by a kernel FIFO
/// (anonymous pipe) so a direct-transfer-capable downstream can splice
/// instead of copying. Here the "pipe" is modeled as a fixed-capacity ring;
/// a real implementation would hold actual pipe fds from `pipe2(2)`.
pub struct FifoBufferSink {
    buf: GrowingBufferSink,
    capacity: usize,
}

impl FifoBufferSink {
    pub fn new(capacity: usize) -> Self {
        FifoBufferSink { buf: GrowingBufferSink::new(), capacity }
    }

    /// Returns `false` if the FIFO is at capacity and the write was
    /// rejected (backpressure), matching the source's full-pipe behavior.
    pub fn try_append(&mut self, data: impl Into<Bytes>) -> bool {
        let bytes = data.into();
        let used: usize = self.buf.chunks.iter().map(|b| b.len()).sum();
        if used + bytes.len() > self.capacity {
            return false;
        }
        self.buf.append(bytes);
        true
    }

    pub fn finish(&mut self) {
        self.buf.finish();
    }
}

impl Stream for FifoBufferSink {
    fn length(&self) -> Length {
        self.buf.length()
    }
    fn direct_mask(&self) -> crate::stream::DirectMask {
        crate::stream::DirectMask { file: false, pipe: true, socket: false }
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        self.buf.read(handler);
    }
    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
        self.buf.fill_bucket_list(list)
    }
    fn consume_bucket_list(&mut self, n: usize) {
        self.buf.consume_bucket_list(n);
    }
    fn close(&mut self) {
        self.buf.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryStream {
        data: Vec<u8>,
        pos: usize,
    }
    impl Stream for MemoryStream {
        fn length(&self) -> Length {
            Length::Exact((self.data.len() - self.pos) as u64)
        }
        fn read(&mut self, handler: &mut dyn Handler) {
            if self.pos >= self.data.len() {
                handler.on_eof();
                return;
            }
            let consumed = handler.on_data(&self.data[self.pos..]);
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

    #[test]
    fn test_string_sink_collects_utf8() {
        let sink = StringSink::new(MemoryStream { data: b"hello".to_vec(), pos: 0 });
        assert_eq!(sink.collect().unwrap(), "hello");
    }

    #[test]
    fn test_string_sink_rejects_non_utf8() {
        let sink = StringSink::new(MemoryStream { data: vec![0xff, 0xfe], pos: 0 });
        assert!(sink.collect().is_err());
    }

    #[test]
    fn test_rubber_sink_rejects_over_max() {
        let sink = RubberSink::new(MemoryStream { data: vec![0u8; 100], pos: 0 }, 10);
        assert!(sink.collect().is_err());
    }

    #[test]
    fn test_rubber_sink_collects_under_max() {
        let sink = RubberSink::new(MemoryStream { data: vec![1, 2, 3], pos: 0 }, 10);
        assert_eq!(sink.collect().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_null_sink_counts_bytes() {
        let sink = NullSink::new(MemoryStream { data: vec![0u8; 42], pos: 0 });
        assert_eq!(sink.drain(), 42);
    }

    #[test]
    fn test_growing_buffer_sink_round_trip() {
        let mut sink = GrowingBufferSink::new();
        sink.append(Bytes::from_static(b"ab"));
        sink.append(Bytes::from_static(b"cd"));
        sink.finish();
        let out = drain_to_vec(&mut sink);
        assert_eq!(out, b"abcd");
    }

    #[test]
    fn test_fifo_buffer_sink_backpressure() {
        let mut sink = FifoBufferSink::new(4);
        assert!(sink.try_append(Bytes::from_static(b"abcd")));
        assert!(!sink.try_append(Bytes::from_static(b"e")));
    }
}
