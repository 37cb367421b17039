//! Lazy typed byte stream pipeline (spec §3, §4.B).
//!
//! The source models streams as callback-driven pull producers: a handler
//! calls `Stream::read`, and the stream calls back into the handler's
//! `on_data`/`on_direct` zero or more times, then `on_eof`/`on_error`
//! exactly once, before returning. That shape is what lets `Tee`,
//! `Dechunk`, and `Subst` (see `filters.rs`) compose without each one
//! needing its own buffering thread — only streams that wrap other
//! streams need to implement `Handler` themselves.

use std::os::unix::io::RawFd;

/// Reported stream length; `Unknown` when the producer cannot tell ahead of
/// time (e.g. a dynamically generated body).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Length {
    Exact(u64),
    Approximate(u64),
    Unknown,
}

impl Length {
    pub fn value(&self) -> Option<u64> {
        match self {
            Length::Exact(n) | Length::Approximate(n) => Some(*n),
            Length::Unknown => None,
        }
    }
}

/// Capability mask: which kinds of descriptors a downstream handler accepts
/// for direct transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectMask {
    pub file: bool,
    pub pipe: bool,
    pub socket: bool,
}

impl DirectMask {
    pub const NONE: DirectMask = DirectMask { file: false, pipe: false, socket: false };
    pub const ANY: DirectMask = DirectMask { file: true, pipe: true, socket: true };

    pub fn accepts_any(&self) -> bool {
        self.file || self.pipe || self.socket
    }
}

/// Outcome of an `OnDirect` callback, matching the source's result enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectResult {
    Ok(usize),
    End,
    Errno(i32),
    Closed,
    Blocking,
}

/// A single bucket: currently only a borrowed/owned buffer span, per
/// spec §3 ("currently only BUFFER").
#[derive(Debug, Clone)]
pub enum Bucket {
    Buffer(bytes::Bytes),
}

impl Bucket {
    pub fn len(&self) -> usize {
        match self {
            Bucket::Buffer(b) => b.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Append-only bounded list of buckets with a `more` flag. Capacity is
/// bounded at 64 entries; once full, `more` is forced true and further
/// pushes are silently dropped (spec §3).
pub struct BucketList {
    buckets: Vec<Bucket>,
    more: bool,
}

pub const BUCKET_LIST_CAPACITY: usize = 64;

impl BucketList {
    pub fn new() -> Self {
        BucketList { buckets: Vec::new(), more: false }
    }

    pub fn push(&mut self, bucket: Bucket) {
        if self.buckets.len() >= BUCKET_LIST_CAPACITY {
            self.more = true;
            return;
        }
        self.buckets.push(bucket);
    }

    pub fn set_more(&mut self, more: bool) {
        self.more = more;
    }

    pub fn more(&self) -> bool {
        self.more
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn total_buffer_size(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// `IsDepleted(n)` ≡ `!more && n == total_buffer_size`.
    pub fn is_depleted(&self, consumed: usize) -> bool {
        !self.more && consumed == self.total_buffer_size()
    }

    /// `SpliceBuffersFrom` with an optional byte limit: move buckets from
    /// `src` into `self`, stopping once `limit` bytes have been moved.
    pub fn splice_buffers_from(&mut self, src: &mut BucketList, limit: Option<usize>) {
        let mut moved = 0usize;
        while !src.buckets.is_empty() {
            if let Some(limit) = limit {
                if moved >= limit {
                    break;
                }
            }
            let bucket = src.buckets.remove(0);
            moved += bucket.len();
            self.push(bucket);
        }
        if !src.buckets.is_empty() || src.more {
            self.more = true;
        }
    }

    /// `CopyBuffersFrom(skip, src)`: copy (not move) buckets from `src`
    /// after skipping `skip` bytes from the front.
    pub fn copy_buffers_from(&mut self, skip: usize, src: &BucketList) {
        let mut remaining_skip = skip;
        for bucket in &src.buckets {
            let Bucket::Buffer(b) = bucket;
            if remaining_skip >= b.len() {
                remaining_skip -= b.len();
                continue;
            }
            let slice = b.slice(remaining_skip..);
            remaining_skip = 0;
            self.push(Bucket::Buffer(slice));
        }
        if src.more {
            self.more = true;
        }
    }
}

impl Default for BucketList {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler invoked by a stream's producer.
pub trait Handler {
    /// Returns bytes consumed; 0 means blocked (the stream must not resume
    /// without an explicit subsequent `read`).
    fn on_data(&mut self, span: &[u8]) -> usize;

    fn on_direct(&mut self, _fd: RawFd, _offset: u64, _len: usize) -> DirectResult {
        DirectResult::End
    }

    fn on_eof(&mut self);

    fn on_error(&mut self, err: crate::error::GatewayError);
}

/// Lifecycle state, matching spec §3's stream state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unset,
    Attached,
    DataEmitting,
    Draining,
    Eof,
    Error,
    Destroyed,
}

/// A lazy, finite, non-restartable byte stream.
pub trait Stream {
    /// Total length, if known ahead of time.
    fn length(&self) -> Length;

    /// Capability mask this stream can forward via direct transfer (i.e.
    /// what kind of fd it wraps, if any).
    fn direct_mask(&self) -> DirectMask {
        DirectMask::NONE
    }

    fn as_fd(&self) -> Option<RawFd> {
        None
    }

    /// Drives data toward `handler`. May call `handler.on_data`/`on_direct`
    /// zero or more times, then `on_eof` or `on_error` at most once.
    fn read(&mut self, handler: &mut dyn Handler);

    /// Fast path: returns contiguous byte spans without copying.
    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), crate::error::GatewayError>;

    /// Acknowledges `n` bytes consumed from the last `fill_bucket_list`.
    fn consume_bucket_list(&mut self, n: usize);

    fn close(&mut self);

    fn state(&self) -> StreamState {
        StreamState::Attached
    }
}

/// Total bytes a deterministic in-memory producer will ever emit — used by
/// `Stream conservation` tests (testable property #1) as the oracle.
pub fn drain_to_vec<S: Stream + ?Sized>(stream: &mut S) -> Vec<u8> {
    struct Collector {
        buf: Vec<u8>,
        eof: bool,
    }
    impl Handler for Collector {
        fn on_data(&mut self, span: &[u8]) -> usize {
            self.buf.extend_from_slice(span);
            span.len()
        }
        fn on_eof(&mut self) {
            self.eof = true;
        }
        fn on_error(&mut self, _err: crate::error::GatewayError) {
            self.eof = true;
        }
    }
    let mut collector = Collector { buf: Vec::new(), eof: false };
    // Bound the number of read() calls defensively; well-behaved in-memory
    // streams in this crate always reach eof in at most a few iterations.
    for _ in 0..1_000_000 {
        if collector.eof {
            break;
        }
        stream.read(&mut collector);
    }
    collector.buf
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryStream {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
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
            let end = (self.pos + self.chunk).min(self.data.len());
            let consumed = handler.on_data(&self.data[self.pos..end]);
            self.pos += consumed;
            if self.pos >= self.data.len() {
                handler.on_eof();
            }
        }

        fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), crate::error::GatewayError> {
            if self.pos < self.data.len() {
                list.push(Bucket::Buffer(bytes::Bytes::copy_from_slice(&self.data[self.pos..])));
            }
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
    fn test_stream_conservation() {
        let original = b"hello, world! this is a deterministic payload.".to_vec();
        let mut stream = MemoryStream { data: original.clone(), pos: 0, chunk: 7 };
        let out = drain_to_vec(&mut stream);
        assert_eq!(out, original);
    }

    #[test]
    fn test_bucket_list_capacity_sets_more() {
        let mut list = BucketList::new();
        for _ in 0..BUCKET_LIST_CAPACITY + 5 {
            list.push(Bucket::Buffer(bytes::Bytes::from_static(b"x")));
        }
        assert!(list.more());
        assert_eq!(list.buckets().len(), BUCKET_LIST_CAPACITY);
    }

    #[test]
    fn test_is_depleted() {
        let mut list = BucketList::new();
        list.push(Bucket::Buffer(bytes::Bytes::from_static(b"abc")));
        assert!(!list.is_depleted(2));
        assert!(list.is_depleted(3));
        list.set_more(true);
        assert!(!list.is_depleted(3));
    }
}
