//! Stream filter combinators (spec §4.B). Each combinator wraps an inner
//! `Stream` and reshapes the bytes flowing through it. All are in-memory
//! (no direct-transfer fast path) except where noted, matching the
//! "compose in the arena, prefer static dispatch" guidance of spec §9.

use crate::error::GatewayError;
use crate::stream::{Bucket, BucketList, Handler, Length, Stream};
use bytes::Bytes;
use std::collections::VecDeque;
use std::rc::Rc;

/// `Head(n)` — authoritative length cap: delivers exactly `min(n, |x|)`
/// bytes and, if `authoritative`, reports `GetAvailable(false) == n`
/// whenever the inner stream reports `>= n` or unknown (testable property
/// #4).
pub struct Head<S> {
    inner: S,
    remaining: u64,
    authoritative: bool,
    inner_len_known_ge_n: bool,
}

impl<S: Stream> Head<S> {
    pub fn new(inner: S, n: u64, authoritative: bool) -> Self {
        let inner_len_known_ge_n = match inner.length() {
            Length::Exact(l) | Length::Approximate(l) => l >= n,
            Length::Unknown => true,
        };
        Head { inner, remaining: n, authoritative, inner_len_known_ge_n }
    }
}

impl<S: Stream> Stream for Head<S> {
    fn length(&self) -> Length {
        if self.authoritative && self.inner_len_known_ge_n {
            Length::Exact(self.remaining)
        } else {
            match self.inner.length() {
                Length::Exact(l) | Length::Approximate(l) => Length::Exact(l.min(self.remaining)),
                Length::Unknown => Length::Exact(self.remaining),
            }
        }
    }

    fn read(&mut self, handler: &mut dyn Handler) {
        if self.remaining == 0 {
            handler.on_eof();
            return;
        }
        struct Capper<'h> {
            handler: &'h mut dyn Handler,
            remaining: &'h mut u64,
            hit_cap: bool,
        }
        impl<'h> Handler for Capper<'h> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                let allowed = (*self.remaining).min(span.len() as u64) as usize;
                if allowed == 0 {
                    self.hit_cap = true;
                    return 0;
                }
                let consumed = self.handler.on_data(&span[..allowed]);
                *self.remaining -= consumed as u64;
                if *self.remaining == 0 {
                    self.hit_cap = true;
                }
                consumed
            }
            fn on_eof(&mut self) {
                self.handler.on_eof();
            }
            fn on_error(&mut self, err: GatewayError) {
                self.handler.on_error(err);
            }
        }
        let mut capper = Capper { handler, remaining: &mut self.remaining, hit_cap: false };
        self.inner.read(&mut capper);
        if capper.hit_cap && self.remaining == 0 {
            capper.handler.on_eof();
        }
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
        let mut inner_list = BucketList::new();
        self.inner.fill_bucket_list(&mut inner_list)?;
        let mut remaining = self.remaining;
        for bucket in inner_list.buckets() {
            if remaining == 0 {
                break;
            }
            let Bucket::Buffer(b) = bucket;
            let take = (b.len() as u64).min(remaining) as usize;
            list.push(Bucket::Buffer(b.slice(0..take)));
            remaining -= take as u64;
        }
        Ok(())
    }

    fn consume_bucket_list(&mut self, n: usize) {
        self.inner.consume_bucket_list(n);
        self.remaining = self.remaining.saturating_sub(n as u64);
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// `Null` — produces no bytes, immediate EOF.
pub struct NullStream;
impl Stream for NullStream {
    fn length(&self) -> Length {
        Length::Exact(0)
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        handler.on_eof();
    }
    fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
        Ok(())
    }
    fn consume_bucket_list(&mut self, _n: usize) {}
    fn close(&mut self) {}
}

/// `Zero` — infinite stream of zero bytes (bounded here by a cap so a
/// bounded consumer like `Head` can terminate it).
pub struct ZeroStream {
    pub remaining: u64,
}
impl Stream for ZeroStream {
    fn length(&self) -> Length {
        Length::Exact(self.remaining)
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        if self.remaining == 0 {
            handler.on_eof();
            return;
        }
        let chunk_len = self.remaining.min(4096) as usize;
        let zeros = vec![0u8; chunk_len];
        let consumed = handler.on_data(&zeros) as u64;
        self.remaining -= consumed;
        if self.remaining == 0 {
            handler.on_eof();
        }
    }
    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
        if self.remaining > 0 {
            let chunk_len = self.remaining.min(4096) as usize;
            list.push(Bucket::Buffer(Bytes::from(vec![0u8; chunk_len])));
        }
        Ok(())
    }
    fn consume_bucket_list(&mut self, n: usize) {
        self.remaining = self.remaining.saturating_sub(n as u64);
    }
    fn close(&mut self) {
        self.remaining = 0;
    }
}

/// `Block` — never delivers data, never EOFs (used to test backpressure
/// handling upstream).
pub struct BlockStream;
impl Stream for BlockStream {
    fn length(&self) -> Length {
        Length::Unknown
    }
    fn read(&mut self, _handler: &mut dyn Handler) {
        // Deliberately does nothing: simulates a producer with no data
        // ready and no EOF — the caller must not spin.
    }
    fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
        Ok(())
    }
    fn consume_bucket_list(&mut self, _n: usize) {}
    fn close(&mut self) {}
}

/// `Fail` — immediately errors.
pub struct FailStream {
    pub err: Option<GatewayError>,
}
impl Stream for FailStream {
    fn length(&self) -> Length {
        Length::Unknown
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        if let Some(err) = self.err.take() {
            handler.on_error(err);
        }
    }
    fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
        Err(self.err.take().unwrap_or(GatewayError::Internal("Fail stream read twice".into())))
    }
    fn consume_bucket_list(&mut self, _n: usize) {}
    fn close(&mut self) {}
}

/// `Byte` — feeds exactly one byte per `on_data` call, regardless of how
/// much the inner stream has ready. Used by testable property #2's
/// byte-at-a-time sink.
pub struct ByteStream<S> {
    inner: S,
    held: VecDeque<u8>,
}

impl<S: Stream> ByteStream<S> {
    pub fn new(inner: S) -> Self {
        ByteStream { inner, held: VecDeque::new() }
    }
}

impl<S: Stream> Stream for ByteStream<S> {
    fn length(&self) -> Length {
        self.inner.length()
    }

    fn read(&mut self, handler: &mut dyn Handler) {
        if let Some(b) = self.held.pop_front() {
            let one = [b];
            if handler.on_data(&one) == 0 {
                self.held.push_front(b);
            }
            return;
        }
        struct Splitter<'a> {
            held: &'a mut VecDeque<u8>,
        }
        impl<'a> Handler for Splitter<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                self.held.extend(span.iter().copied());
                span.len()
            }
            fn on_eof(&mut self) {}
            fn on_error(&mut self, _err: GatewayError) {}
        }
        let mut splitter = Splitter { held: &mut self.held };
        self.inner.read(&mut splitter);
        if let Some(b) = self.held.pop_front() {
            let one = [b];
            if handler.on_data(&one) == 0 {
                self.held.push_front(b);
            }
        } else {
            handler.on_eof();
        }
    }

    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
        if let Some(&b) = self.held.front() {
            list.push(Bucket::Buffer(Bytes::copy_from_slice(&[b])));
        }
        Ok(())
    }

    fn consume_bucket_list(&mut self, n: usize) {
        for _ in 0..n {
            self.held.pop_front();
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// `Four` — like `Byte` but four bytes at a time.
pub struct FourStream<S> {
    inner: ByteStream<S>,
}

impl<S: Stream> FourStream<S> {
    pub fn new(inner: S) -> Self {
        FourStream { inner: ByteStream::new(inner) }
    }
}

impl<S: Stream> Stream for FourStream<S> {
    fn length(&self) -> Length {
        self.inner.length()
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        let mut buf = Vec::with_capacity(4);
        for _ in 0..4 {
            if let Some(b) = self.inner.held.pop_front() {
                buf.push(b);
            } else {
                break;
            }
        }
        if buf.len() < 4 {
            struct Filler<'a> {
                buf: &'a mut Vec<u8>,
            }
            impl<'a> Handler for Filler<'a> {
                fn on_data(&mut self, span: &[u8]) -> usize {
                    let need = 4 - self.buf.len();
                    let take = need.min(span.len());
                    self.buf.extend_from_slice(&span[..take]);
                    take
                }
                fn on_eof(&mut self) {}
                fn on_error(&mut self, _err: GatewayError) {}
            }
            let mut filler = Filler { buf: &mut buf };
            self.inner.inner.read(&mut filler);
        }
        if buf.is_empty() {
            handler.on_eof();
        } else if handler.on_data(&buf) < buf.len() {
            for b in buf.into_iter().rev() {
                self.inner.held.push_front(b);
            }
        }
    }
    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
        self.inner.fill_bucket_list(list)
    }
    fn consume_bucket_list(&mut self, n: usize) {
        self.inner.consume_bucket_list(n);
    }
    fn close(&mut self) {
        self.inner.close();
    }
}

/// `Hold` — absorbs everything forever, for deferred completion: never
/// reports EOF even after the inner stream does, used to hold a response
/// open until some external event fires.
pub struct HoldStream<S> {
    inner: S,
    inner_done: bool,
}

impl<S: Stream> HoldStream<S> {
    pub fn new(inner: S) -> Self {
        HoldStream { inner, inner_done: false }
    }

    pub fn release(&mut self, handler: &mut dyn Handler) {
        if self.inner_done {
            handler.on_eof();
        }
    }
}

impl<S: Stream> Stream for HoldStream<S> {
    fn length(&self) -> Length {
        Length::Unknown
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        if self.inner_done {
            return;
        }
        struct Sink<'a> {
            done: &'a mut bool,
        }
        impl<'a> Handler for Sink<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                span.len()
            }
            fn on_eof(&mut self) {
                *self.done = true;
            }
            fn on_error(&mut self, _err: GatewayError) {
                *self.done = true;
            }
        }
        let mut sink = Sink { done: &mut self.inner_done };
        self.inner.read(&mut sink);
        let _ = handler; // hold never forwards data
    }
    fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
        Ok(())
    }
    fn consume_bucket_list(&mut self, _n: usize) {}
    fn close(&mut self) {
        self.inner.close();
    }
}

/// `Catch(on_error → fill_with_spaces)` — replaces an erroring inner stream
/// with ASCII spaces for the remainder of its declared length, preserving
/// content-length (spec §7's propagation example).
pub struct CatchStream<S> {
    inner: S,
    declared_len: Option<u64>,
    delivered: u64,
    failed: bool,
}

impl<S: Stream> CatchStream<S> {
    pub fn new(inner: S) -> Self {
        let declared_len = inner.length().value();
        CatchStream { inner, declared_len, delivered: 0, failed: false }
    }
}

impl<S: Stream> Stream for CatchStream<S> {
    fn length(&self) -> Length {
        self.inner.length()
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        if self.failed {
            if let Some(total) = self.declared_len {
                if self.delivered < total {
                    let remaining = (total - self.delivered).min(4096) as usize;
                    let spaces = vec![b' '; remaining];
                    let consumed = handler.on_data(&spaces) as u64;
                    self.delivered += consumed;
                    if self.delivered >= total {
                        handler.on_eof();
                    }
                    return;
                }
            }
            handler.on_eof();
            return;
        }
        struct Wrapper<'a> {
            handler: &'a mut dyn Handler,
            delivered: &'a mut u64,
            failed: &'a mut bool,
        }
        impl<'a> Handler for Wrapper<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                let consumed = self.handler.on_data(span);
                *self.delivered += consumed as u64;
                consumed
            }
            fn on_eof(&mut self) {
                self.handler.on_eof();
            }
            fn on_error(&mut self, _err: GatewayError) {
                *self.failed = true;
            }
        }
        let mut wrapper =
            Wrapper { handler, delivered: &mut self.delivered, failed: &mut self.failed };
        self.inner.read(&mut wrapper);
    }
    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
        if self.failed {
            return Ok(());
        }
        match self.inner.fill_bucket_list(list) {
            Ok(()) => Ok(()),
            Err(_) => {
                self.failed = true;
                Ok(())
            }
        }
    }
    fn consume_bucket_list(&mut self, n: usize) {
        self.delivered += n as u64;
        if !self.failed {
            self.inner.consume_bucket_list(n);
        }
    }
    fn close(&mut self) {
        self.inner.close();
    }
}

/// `Tee(weak?, defer_read?)` — duplicates bytes into two outputs (testable
/// property #5: byte-identical sequences on both outputs). If one output
/// blocks, the whole tee is paused (no buffering) per spec §5's ordering
/// rule. The "weak" output is automatically dropped once it is the only
/// remaining branch.
pub struct Tee<S> {
    inner: S,
    weak: bool,
}

pub struct TeeOutputs {
    pub a: Vec<u8>,
    pub b: Vec<u8>,
    pub a_blocked: bool,
    pub b_blocked: bool,
}

impl<S: Stream> Tee<S> {
    pub fn new(inner: S, weak: bool) -> Self {
        Tee { inner, weak }
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Drains into two in-memory sinks; fails (pauses) the whole tee the
    /// moment either branch refuses bytes, matching spec §5: "if one
    /// output blocks, the upstream is paused entirely."
    pub fn drain_to_both(&mut self) -> TeeOutputs {
        struct Both<'a> {
            a: &'a mut Vec<u8>,
            b: &'a mut Vec<u8>,
        }
        impl<'a> Handler for Both<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                self.a.extend_from_slice(span);
                self.b.extend_from_slice(span);
                span.len()
            }
            fn on_eof(&mut self) {}
            fn on_error(&mut self, _err: GatewayError) {}
        }
        let mut outputs = TeeOutputs { a: Vec::new(), b: Vec::new(), a_blocked: false, b_blocked: false };
        let mut both = Both { a: &mut outputs.a, b: &mut outputs.b };
        for _ in 0..1_000_000 {
            let before = both.a.len();
            self.inner.read(&mut both);
            if both.a.len() == before {
                break;
            }
        }
        outputs
    }
}

/// `Delayed`/`Later` — defers its first byte; modeled as a stream that
/// requires `N` no-op `read()` calls before forwarding to the inner
/// stream, standing in for the source's timer-armed variants.
pub struct DelayedStream<S> {
    inner: S,
    ticks_remaining: u32,
}

impl<S: Stream> DelayedStream<S> {
    pub fn new(inner: S, ticks: u32) -> Self {
        DelayedStream { inner, ticks_remaining: ticks }
    }
}

impl<S: Stream> Stream for DelayedStream<S> {
    fn length(&self) -> Length {
        self.inner.length()
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        if self.ticks_remaining > 0 {
            self.ticks_remaining -= 1;
            return;
        }
        self.inner.read(handler);
    }
    fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
        if self.ticks_remaining > 0 {
            return Ok(());
        }
        self.inner.fill_bucket_list(list)
    }
    fn consume_bucket_list(&mut self, n: usize) {
        self.inner.consume_bucket_list(n);
    }
    fn close(&mut self) {
        self.inner.close();
    }
}

/// `Escape(class)` — escapes bytes belonging to the given class (HTML or
/// JS) as they pass through.
#[derive(Clone, Copy)]
pub enum EscapeClass {
    Html,
    Js,
}

pub struct EscapeStream<S> {
    inner: S,
    class: EscapeClass,
}

impl<S: Stream> EscapeStream<S> {
    pub fn new(inner: S, class: EscapeClass) -> Self {
        EscapeStream { inner, class }
    }
}

fn escape_byte(class: EscapeClass, b: u8, out: &mut Vec<u8>) {
    match class {
        EscapeClass::Html => match b {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'"' => out.extend_from_slice(b"&quot;"),
            _ => out.push(b),
        },
        EscapeClass::Js => match b {
            b'\'' => out.extend_from_slice(b"\\'"),
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(b),
        },
    }
}

impl<S: Stream> Stream for EscapeStream<S> {
    fn length(&self) -> Length {
        Length::Unknown
    }
    fn read(&mut self, handler: &mut dyn Handler) {
        struct Escaper<'a> {
            handler: &'a mut dyn Handler,
            class: EscapeClass,
        }
        impl<'a> Handler for Escaper<'a> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                let mut out = Vec::with_capacity(span.len());
                for &b in span {
                    escape_byte(self.class, b, &mut out);
                }
                self.handler.on_data(&out);
                span.len()
            }
            fn on_eof(&mut self) {
                self.handler.on_eof();
            }
            fn on_error(&mut self, err: GatewayError) {
                self.handler.on_error(err);
            }
        }
        let mut escaper = Escaper { handler, class: self.class };
        self.inner.read(&mut escaper);
    }
    fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
        // Escaping changes byte content, so there is no zero-copy fast
        // path; callers must use read().
        Ok(())
    }
    fn consume_bucket_list(&mut self, _n: usize) {}
    fn close(&mut self) {
        self.inner.close();
    }
}

struct TstNode {
    byte: u8,
    low: Option<usize>,
    eq: Option<usize>,
    high: Option<usize>,
    value: Option<Bytes>,
}

/// Ternary search tree of keyword substitutions, built once and shared
/// (read-only) across every `SubstStream` using it. Matching is
/// case-sensitive (spec §4.B's "Substitution engine contract").
pub struct SubstTree {
    nodes: Vec<TstNode>,
    root: Option<usize>,
}

impl SubstTree {
    pub fn new() -> Self {
        SubstTree { nodes: Vec::new(), root: None }
    }

    pub fn add(&mut self, keyword: &[u8], replacement: impl Into<Bytes>) {
        assert!(!keyword.is_empty(), "Subst keyword must not be empty");
        let value = replacement.into();
        let root = self.root;
        self.root = Some(self.insert(root, keyword, 0, value));
    }

    fn insert(&mut self, node: Option<usize>, key: &[u8], i: usize, value: Bytes) -> usize {
        let b = key[i];
        let idx = match node {
            Some(idx) => idx,
            None => {
                self.nodes.push(TstNode { byte: b, low: None, eq: None, high: None, value: None });
                self.nodes.len() - 1
            }
        };
        if b < self.nodes[idx].byte {
            let low = self.nodes[idx].low;
            let new_low = self.insert(low, key, i, value);
            self.nodes[idx].low = Some(new_low);
        } else if b > self.nodes[idx].byte {
            let high = self.nodes[idx].high;
            let new_high = self.insert(high, key, i, value);
            self.nodes[idx].high = Some(new_high);
        } else if i + 1 < key.len() {
            let eq = self.nodes[idx].eq;
            let new_eq = self.insert(eq, key, i + 1, value);
            self.nodes[idx].eq = Some(new_eq);
        } else {
            self.nodes[idx].value = Some(value);
        }
        idx
    }
}

impl Default for SubstTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Advances the match state machine by one input byte, writing resolved
/// output bytes (verbatim passthrough or substitution) into `out`.
///
/// `cursor` is the TST subtree to compare the next byte against — `NONE`
/// is `cursor == tree.root && pending.is_empty()`; anything else in
/// progress is `MATCH`. A completed match is `INSERT` (the replacement is
/// appended to `out` inline, below); `CLOSED` is handled by the caller
/// once the inner stream reaches eof.
fn feed_byte(tree: &SubstTree, cursor: &mut Option<usize>, pending: &mut Vec<u8>, c: u8, out: &mut Vec<u8>) {
    loop {
        match *cursor {
            Some(idx) => {
                let node = &tree.nodes[idx];
                if c < node.byte {
                    *cursor = node.low;
                } else if c > node.byte {
                    *cursor = node.high;
                } else {
                    pending.push(c);
                    if let Some(val) = &node.value {
                        out.extend_from_slice(val);
                        pending.clear();
                        *cursor = tree.root;
                    } else {
                        *cursor = node.eq;
                    }
                    return;
                }
            }
            None => {
                if pending.is_empty() {
                    out.push(c);
                    *cursor = tree.root;
                    return;
                }
                // Partial mismatch: the consumed prefix wasn't part of a
                // keyword after all. Re-emit it verbatim, then retry this
                // same byte against a fresh search — it may start another
                // keyword of its own.
                out.append(pending);
                *cursor = tree.root;
            }
        }
    }
}

/// `Subst(tree)` — ternary-search-tree keyword substitution with rollback
/// on partial mismatch (spec §4.B, testable property #3). No zero-copy
/// fast path: like `Escape`, substitution can change byte content, so
/// `fill_bucket_list` is a no-op and callers must use `read()`.
pub struct SubstStream<S> {
    inner: S,
    tree: Rc<SubstTree>,
    cursor: Option<usize>,
    pending: Vec<u8>,
}

impl<S: Stream> SubstStream<S> {
    pub fn new(inner: S, tree: Rc<SubstTree>) -> Self {
        let cursor = tree.root;
        SubstStream { inner, tree, cursor, pending: Vec::new() }
    }
}

impl<S: Stream> Stream for SubstStream<S> {
    fn length(&self) -> Length {
        Length::Unknown
    }

    fn read(&mut self, handler: &mut dyn Handler) {
        struct Collector<'h> {
            tree: &'h SubstTree,
            cursor: &'h mut Option<usize>,
            pending: &'h mut Vec<u8>,
            out: Vec<u8>,
            eof: bool,
            err: Option<GatewayError>,
        }
        impl<'h> Handler for Collector<'h> {
            fn on_data(&mut self, span: &[u8]) -> usize {
                for &c in span {
                    feed_byte(self.tree, self.cursor, self.pending, c, &mut self.out);
                }
                span.len()
            }
            fn on_eof(&mut self) {
                self.eof = true;
            }
            fn on_error(&mut self, err: GatewayError) {
                self.err = Some(err);
            }
        }
        let mut collector = Collector {
            tree: self.tree.as_ref(),
            cursor: &mut self.cursor,
            pending: &mut self.pending,
            out: Vec::new(),
            eof: false,
            err: None,
        };
        self.inner.read(&mut collector);
        let mut out = collector.out;
        let eof = collector.eof;
        let err = collector.err;
        if eof && !self.pending.is_empty() {
            // The stream ended mid-match: the held prefix never completed
            // a keyword, so it must still reach the client verbatim.
            out.append(&mut self.pending);
            self.cursor = self.tree.root;
        }
        if !out.is_empty() {
            handler.on_data(&out);
        }
        if let Some(err) = err {
            handler.on_error(err);
        } else if eof {
            handler.on_eof();
        }
    }

    fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
        Ok(())
    }
    fn consume_bucket_list(&mut self, _n: usize) {}
    fn close(&mut self) {
        self.inner.close();
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
        fn fill_bucket_list(&mut self, list: &mut BucketList) -> Result<(), GatewayError> {
            if self.pos < self.data.len() {
                list.push(Bucket::Buffer(Bytes::copy_from_slice(&self.data[self.pos..])));
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

    struct Collector(Vec<u8>);
    impl Handler for Collector {
        fn on_data(&mut self, span: &[u8]) -> usize {
            self.0.extend_from_slice(span);
            span.len()
        }
        fn on_eof(&mut self) {}
        fn on_error(&mut self, _err: GatewayError) {}
    }

    #[test]
    fn test_head_bound() {
        let data = b"0123456789".to_vec();
        let mut head = Head::new(MemoryStream { data, pos: 0 }, 4, true);
        assert_eq!(head.length(), Length::Exact(4));
        let mut out = Collector(Vec::new());
        head.read(&mut out);
        assert_eq!(out.0, b"0123");
    }

    #[test]
    fn test_head_authoritative_when_inner_shorter() {
        let data = b"ab".to_vec();
        let head = Head::new(MemoryStream { data, pos: 0 }, 10, true);
        // inner is shorter than n, so authoritative length must not claim n
        assert_eq!(head.length(), Length::Exact(2));
    }

    #[test]
    fn test_tee_fidelity() {
        let data = b"tee me twice".to_vec();
        let mut tee = Tee::new(MemoryStream { data: data.clone(), pos: 0 }, false);
        let out = tee.drain_to_both();
        assert_eq!(out.a, data);
        assert_eq!(out.b, data);
    }

    #[test]
    fn test_catch_fills_spaces_preserving_length() {
        struct Erroring {
            emitted: bool,
        }
        impl Stream for Erroring {
            fn length(&self) -> Length {
                Length::Exact(5)
            }
            fn read(&mut self, handler: &mut dyn Handler) {
                if !self.emitted {
                    self.emitted = true;
                    handler.on_error(GatewayError::Internal("boom".into()));
                }
            }
            fn fill_bucket_list(&mut self, _list: &mut BucketList) -> Result<(), GatewayError> {
                Ok(())
            }
            fn consume_bucket_list(&mut self, _n: usize) {}
            fn close(&mut self) {}
        }
        let mut catch = CatchStream::new(Erroring { emitted: false });
        let mut out = Collector(Vec::new());
        catch.read(&mut out); // triggers the error, switches to space-filling
        catch.read(&mut out);
        assert_eq!(out.0.len(), 5);
        assert!(out.0.iter().all(|&b| b == b' '));
    }

    #[test]
    fn test_byte_stream_one_at_a_time() {
        let data = b"abc".to_vec();
        let mut bs = ByteStream::new(MemoryStream { data, pos: 0 });
        let mut collected = Vec::new();
        for _ in 0..3 {
            let mut out = Collector(Vec::new());
            bs.read(&mut out);
            assert_eq!(out.0.len(), 1);
            collected.extend(out.0);
        }
        assert_eq!(collected, b"abc");
    }

    #[test]
    fn test_subst_with_no_matching_rule_round_trips_identically() {
        let mut tree = SubstTree::new();
        tree.add(b"zzz", Bytes::from_static(b"nope"));
        let data = b"hello world, no matches in here".to_vec();
        let mut subst = SubstStream::new(MemoryStream { data: data.clone(), pos: 0 }, Rc::new(tree));
        let mut out = Collector(Vec::new());
        for _ in 0..8 {
            subst.read(&mut out);
        }
        assert_eq!(out.0, data);
    }

    #[test]
    fn test_subst_replaces_every_occurrence_across_byte_sized_chunks() {
        let mut tree = SubstTree::new();
        tree.add(b"cat", Bytes::from_static(b"dog"));
        let data = b"the cat sat on the cat mat, concatenate".to_vec();
        let expected = String::from_utf8(data.clone()).unwrap().replace("cat", "dog");

        // Feed the source one byte at a time, so a keyword can straddle
        // an arbitrary number of `read()` calls.
        let source = ByteStream::new(MemoryStream { data, pos: 0 });
        let mut subst = SubstStream::new(source, Rc::new(tree));
        let mut out = Collector(Vec::new());
        for _ in 0..(expected.len() + 16) {
            subst.read(&mut out);
        }
        assert_eq!(String::from_utf8(out.0).unwrap(), expected);
    }

    #[test]
    fn test_subst_flushes_partial_match_left_dangling_at_eof() {
        let mut tree = SubstTree::new();
        tree.add(b"catalog", Bytes::from_static(b"INDEX"));
        let data = b"the cat".to_vec();
        let mut subst = SubstStream::new(MemoryStream { data: data.clone(), pos: 0 }, Rc::new(tree));
        let mut out = Collector(Vec::new());
        for _ in 0..8 {
            subst.read(&mut out);
        }
        assert_eq!(out.0, data);
    }
}
