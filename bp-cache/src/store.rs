//! Response cache store (spec §4.H): caches complete response bodies
//! keyed by request URI plus a fingerprint of the varying request headers
//! named in the cached response's own `Vary` header, size-bounded by both
//! a total-bytes budget and a per-entry cap. Built on a `DashMap`-plus-
//! stats idiom, generalized from "one map per resource type" to "one map
//! of fingerprinted cache keys" and combined with this crate's `age`
//! module for expiry.

use crate::age::calc_expires;
use bytes::Bytes;
use dashmap::DashMap;
use http::HeaderMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct CacheKey {
    method: String,
    uri: String,
    /// Values of the headers named in `Vary`, in the order `Vary` named
    /// them, so two requests with the same varying headers collide and
    /// two with different values get distinct entries.
    fingerprint: Vec<(String, String)>,
}

impl CacheKey {
    /// Builds a key from the request method, URI, the response's `Vary`
    /// header names, and the request headers to fingerprint against them.
    pub fn build(method: &str, uri: &str, vary: &[String], request_headers: &HeaderMap) -> Self {
        let fingerprint = vary
            .iter()
            .map(|name| {
                let value = request_headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                (name.to_ascii_lowercase(), value)
            })
            .collect();
        CacheKey { method: method.to_ascii_uppercase(), uri: uri.to_string(), fingerprint }
    }
}

pub struct CacheEntry {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub vary: Vec<String>,
    expires: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }
}

#[derive(Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl std::fmt::Display for CacheStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hits={} misses={} evictions={}",
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed)
        )
    }
}

/// Tracks in-flight cache builds so concurrent requests for the same key
/// attach as listeners instead of each fetching from the origin. Listeners
/// that attach before the build finishes get the stored body on success, or
/// fall back to their own origin fetch on failure.
enum PendingBuild {
    InProgress,
    Done(Arc<CacheEntry>),
    Failed,
}

/// Fingerprinted, Vary-aware response cache with a total-bytes budget.
pub struct ResponseCache {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    pending: DashMap<CacheKey, PendingBuild>,
    bytes_used: AtomicU64,
    max_bytes: u64,
    max_entry_bytes: u64,
    stats: CacheStats,
}

impl ResponseCache {
    pub fn new(max_bytes: u64, max_entry_bytes: u64) -> Self {
        ResponseCache {
            entries: DashMap::new(),
            pending: DashMap::new(),
            bytes_used: AtomicU64::new(0),
            max_bytes,
            max_entry_bytes,
            stats: CacheStats::default(),
        }
    }

    /// Registers `key` as having an in-flight build, returning `true` if
    /// this caller is the one responsible for doing the fetch. A caller
    /// that gets `false` back should await `poll_pending` instead of
    /// hitting the origin itself.
    pub fn begin_build(&self, key: CacheKey) -> bool {
        match self.pending.entry(key) {
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(PendingBuild::InProgress);
                true
            }
            dashmap::mapref::entry::Entry::Occupied(_) => false,
        }
    }

    /// Returns the outcome of a build this caller attached to as a
    /// listener, or `None` if it's still in progress.
    pub fn poll_pending(&self, key: &CacheKey) -> Option<Result<Arc<CacheEntry>, ()>> {
        match self.pending.get(key)?.value() {
            PendingBuild::InProgress => None,
            PendingBuild::Done(entry) => Some(Ok(Arc::clone(entry))),
            PendingBuild::Failed => Some(Err(())),
        }
    }

    /// Marks the build for `key` as succeeded; every listener's next
    /// `poll_pending` sees the shared entry instead of re-fetching.
    pub fn complete_build(&self, key: &CacheKey, entry: Arc<CacheEntry>) {
        if let Some(mut slot) = self.pending.get_mut(key) {
            *slot.value_mut() = PendingBuild::Done(entry);
        }
    }

    /// Marks the build for `key` as failed; every listener's next
    /// `poll_pending` sees `Err(())` and must fall back to its own fetch.
    pub fn fail_build(&self, key: &CacheKey) {
        if let Some(mut slot) = self.pending.get_mut(key) {
            *slot.value_mut() = PendingBuild::Failed;
        }
    }

    /// Removes the resolved pending-build record once the owning builder is
    /// done signaling listeners. Must not be called while the build is
    /// still `InProgress`.
    pub fn clear_pending(&self, key: &CacheKey) {
        self.pending.remove(key);
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let now = Instant::now();
        // The `Ref` from `get` must be dropped before any call that might
        // touch the same shard (e.g. `remove`), or a single-threaded
        // deadlock results.
        let found = self.entries.get(key).map(|e| (e.is_expired(now), Arc::clone(e.value())));
        match found {
            Some((false, entry)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Some((true, _)) => {
                self.remove(key);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Returns `false` (cache bypass) if the entry is larger than
    /// `max_entry_bytes`, matching spec §4.H's per-entry cap.
    pub fn put(
        &self,
        key: CacheKey,
        status: u16,
        headers: Vec<(String, String)>,
        body: Bytes,
        vary: Vec<String>,
        expires_header: Option<SystemTime>,
    ) -> bool {
        let size = body.len() as u64;
        if size > self.max_entry_bytes {
            return false;
        }
        let Some(expires) = calc_expires(Instant::now(), SystemTime::now(), expires_header, &vary) else {
            return false;
        };
        self.reserve(size);
        let entry = Arc::new(CacheEntry { status, headers, body, vary, expires });
        self.complete_build(&key, Arc::clone(&entry));
        if let Some(old) = self.entries.insert(key, entry) {
            self.bytes_used.fetch_sub(old.body.len() as u64, Ordering::Relaxed);
        }
        true
    }

    pub fn remove(&self, key: &CacheKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            self.bytes_used.fetch_sub(entry.body.len() as u64, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }

    /// Evicts arbitrary entries (no LRU ordering tracked) until there is
    /// room for `incoming`, then accounts for it.
    fn reserve(&self, incoming: u64) {
        while self.bytes_used.load(Ordering::Relaxed) + incoming > self.max_bytes {
            let victim = self.entries.iter().next().map(|e| e.key().clone());
            match victim {
                Some(key) => {
                    self.remove(&key);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
        self.bytes_used.fetch_add(incoming, Ordering::Relaxed);
    }
}
