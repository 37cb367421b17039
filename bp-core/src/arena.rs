//! Hierarchical region allocator (spec §3, §4.A).
//!
//! A `Pool` owns a bump-allocated arena of byte storage. Pools form a tree:
//! each pool may have a parent, and releasing a pool (dropping its last
//! `PoolRef`) must not leave any child pool referencing freed storage — we
//! enforce that by keeping every child's backing `Rc<RefCell<Inner>>` alive
//! via a strong parent pointer, so a parent can only truly deallocate after
//! all of its children have already been dropped.
//!
//! Three variants, matching the source: `Linear` (bump allocation, freed as
//! a whole region), `Libc` (every allocation individually tracked, for
//! debugging use-after-free and leaks), and `Temp` (the single process-wide
//! scratch region, rewound by a scoped lease rather than freed as a unit).

use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Linear,
    Libc,
    Temp,
}

struct Inner {
    name: String,
    kind: PoolKind,
    /// Keeps the parent's storage alive as long as this pool exists.
    _parent: Option<Pool>,
    /// `major` pools are one-per-connection, used to make allocation
    /// contention statistics meaningful; purely informational here.
    major: bool,
    linear_buf: RefCell<Vec<u8>>,
    libc_allocs: RefCell<Vec<Box<[u8]>>>,
}

/// A reference-counted handle to a pool. Cloning a `Pool` does not create a
/// new pool; it shares the same underlying arena (this plays the role of
/// `Ref`/`Unref` in the source — the arena is freed when the last `Pool`
/// clone is dropped).
#[derive(Clone)]
pub struct Pool(Rc<Inner>);

impl Pool {
    pub fn new(parent: Option<&Pool>, name: impl Into<String>, initial_bytes: usize) -> Self {
        Self::new_kind(parent, name, initial_bytes, PoolKind::Linear)
    }

    pub fn new_kind(
        parent: Option<&Pool>,
        name: impl Into<String>,
        initial_bytes: usize,
        kind: PoolKind,
    ) -> Self {
        Pool(Rc::new(Inner {
            name: name.into(),
            kind,
            _parent: parent.cloned(),
            major: false,
            linear_buf: RefCell::new(Vec::with_capacity(initial_bytes)),
            libc_allocs: RefCell::new(Vec::new()),
        }))
    }

    /// `NewLinear(parent, name)` — a linear child pool with no preallocated
    /// capacity.
    pub fn new_linear(parent: &Pool, name: impl Into<String>) -> Self {
        Self::new_kind(Some(parent), name, 0, PoolKind::Linear)
    }

    pub fn with_major(mut self, major: bool) -> Self {
        Rc::get_mut(&mut self.0)
            .map(|inner| inner.major = major)
            .unwrap_or_else(|| {
                // Pool already shared; rebuild with the flag set.
                let inner = &self.0;
                self.0 = Rc::new(Inner {
                    name: inner.name.clone(),
                    kind: inner.kind,
                    _parent: inner._parent.clone(),
                    major,
                    linear_buf: RefCell::new(Vec::new()),
                    libc_allocs: RefCell::new(Vec::new()),
                });
            });
        self
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_major(&self) -> bool {
        self.0.major
    }

    pub fn kind(&self) -> PoolKind {
        self.0.kind
    }

    /// Number of live `Pool` handles sharing this arena (i.e. the refcount).
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// `Malloc(size)` — raw allocation. For `Linear`, bytes are appended to
    /// the bump buffer and a copy is handed out (the bump buffer itself is
    /// never resized out from under a caller because callers only ever see
    /// `Vec<u8>` copies, never borrows into the arena). For `Libc`, each
    /// allocation is separately tracked so a debug build could report leaks.
    pub fn malloc(&self, size: usize) -> Vec<u8> {
        match self.0.kind {
            PoolKind::Linear | PoolKind::Temp => {
                let mut buf = self.0.linear_buf.borrow_mut();
                let start = buf.len();
                buf.resize(start + size, 0);
                buf[start..start + size].to_vec()
            }
            PoolKind::Libc => {
                let block: Box<[u8]> = vec![0u8; size].into_boxed_slice();
                let out = block.to_vec();
                self.0.libc_allocs.borrow_mut().push(block);
                out
            }
        }
    }

    /// `Free(ptr, size)` — optional; linear/temp pools ignore it (storage
    /// is reclaimed only when the whole pool is dropped).
    pub fn free(&self, _size: usize) {
        // No-op for Linear/Temp. Libc pools in the source track and can
        // release individual blocks; we only ever hand out owned Vec<u8>
        // copies so there is nothing to release here beyond dropping the
        // caller's own copy.
    }

    /// `Dup(string)` — copy a string's bytes into this pool's lifetime.
    pub fn dup(&self, s: &str) -> String {
        let _ = self.malloc(s.len());
        s.to_string()
    }

    /// `DupZ(byte_span)` — zero-terminated copy.
    pub fn dup_z(&self, bytes: &[u8]) -> Vec<u8> {
        let mut v = self.malloc(bytes.len() + 1);
        v[..bytes.len()].copy_from_slice(bytes);
        v[bytes.len()] = 0;
        v
    }

    /// `Concat(...)` — variadic concatenation, duplicated into this pool.
    pub fn concat(&self, parts: &[&str]) -> String {
        let total: String = parts.concat();
        self.dup(&total)
    }

    /// Total bytes currently accounted to the linear bump buffer.
    pub fn bytes_used(&self) -> usize {
        match self.0.kind {
            PoolKind::Linear | PoolKind::Temp => self.0.linear_buf.borrow().len(),
            PoolKind::Libc => self.0.libc_allocs.borrow().iter().map(|b| b.len()).sum(),
        }
    }
}

/// Thin handle used by APIs that need to duplicate strings or construct
/// objects whose lifetime equals the pool's — mirrors `AllocatorPtr`.
#[derive(Clone)]
pub struct AllocatorPtr(Pool);

impl AllocatorPtr {
    pub fn new(pool: Pool) -> Self {
        AllocatorPtr(pool)
    }

    pub fn dup(&self, s: &str) -> String {
        self.0.dup(s)
    }

    pub fn check_dup(&self, s: Option<&str>) -> Option<String> {
        s.map(|s| self.0.dup(s))
    }

    pub fn dup_z(&self, bytes: &[u8]) -> Vec<u8> {
        self.0.dup_z(bytes)
    }

    pub fn concat(&self, parts: &[&str]) -> String {
        self.0.concat(parts)
    }

    pub fn pool(&self) -> &Pool {
        &self.0
    }
}

/// Scoped lease for the single process-wide temp region. Records the
/// allocation watermark on acquire and rewinds to it on drop, so temp-pool
/// data never silently outlives the lease. Per invariant (iii) in spec §3,
/// callers must `Pool::dup` anything they need to survive past the lease
/// into a longer-lived pool before it drops.
pub struct TempPoolLease<'a> {
    temp: &'a Pool,
    watermark: usize,
}

impl<'a> TempPoolLease<'a> {
    pub fn acquire(temp: &'a Pool) -> Self {
        debug_assert_eq!(temp.kind(), PoolKind::Temp, "TempPoolLease requires a Temp pool");
        let watermark = temp.bytes_used();
        TempPoolLease { temp, watermark }
    }

    pub fn pool(&self) -> &Pool {
        self.temp
    }
}

impl Drop for TempPoolLease<'_> {
    fn drop(&mut self) {
        if let PoolKind::Temp = self.temp.kind() {
            self.temp.0.linear_buf.borrow_mut().truncate(self.watermark);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_pool_bump_allocates() {
        let pool = Pool::new(None, "root", 64);
        let a = pool.malloc(10);
        let b = pool.malloc(20);
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 20);
        assert_eq!(pool.bytes_used(), 30);
    }

    #[test]
    fn test_child_keeps_parent_alive() {
        let parent = Pool::new(None, "parent", 0);
        let child = Pool::new_linear(&parent, "child");
        drop(parent);
        // Parent storage is kept alive transitively through the child's Rc.
        assert_eq!(child.name(), "child");
    }

    #[test]
    fn test_dup_z_is_nul_terminated() {
        let pool = Pool::new(None, "p", 0);
        let v = pool.dup_z(b"hello");
        assert_eq!(&v[..5], b"hello");
        assert_eq!(v[5], 0);
    }

    #[test]
    fn test_temp_pool_lease_rewinds() {
        let temp = Pool::new_kind(None, "temp", 0, PoolKind::Temp);
        temp.malloc(16);
        let watermark_before = temp.bytes_used();
        {
            let lease = TempPoolLease::acquire(&temp);
            lease.pool().malloc(100);
            assert_eq!(temp.bytes_used(), watermark_before + 100);
        }
        assert_eq!(temp.bytes_used(), watermark_before);
    }

    #[test]
    fn test_libc_pool_tracks_allocations() {
        let pool = Pool::new_kind(None, "libc", 0, PoolKind::Libc);
        pool.malloc(8);
        pool.malloc(8);
        assert_eq!(pool.bytes_used(), 16);
    }

    #[test]
    fn test_major_flag() {
        let pool = Pool::new(None, "conn", 0).with_major(true);
        assert!(pool.is_major());
    }
}
