//! Outbound keep-alive connection pool (spec §4.G: "a per-socket lease
//! that may veto reuse on server-reported errors"): a `HashMap<String,
//! VecDeque<TcpStream>>` keyed by upstream identity, bounded per key and
//! warmed at startup. Generalized from "the balancer's upstream string"
//! to `Address::get_id()`, and narrowed to the one backend kind that
//! actually offers a reusable socket (`bp_backend::HttpClient`) — AJP and
//! FastCGI connect fresh per request in this port (see `bp-backend`), CGI
//! and WAS are per-request subprocesses, and local/NFS have no persistent
//! peer connection to pool.

use monoio::net::TcpStream;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

/// Per-worker-thread pool of idle upstream sockets. Not `Send`: one
/// instance lives on each core's thread, shared within a single monoio
/// runtime via `Rc<RefCell<ConnPool>>`.
pub struct ConnPool {
    idle: RefCell<HashMap<String, VecDeque<TcpStream>>>,
    max_idle_per_key: usize,
}

impl ConnPool {
    pub fn new(max_idle_per_key: usize) -> Self {
        ConnPool { idle: RefCell::new(HashMap::new()), max_idle_per_key }
    }

    /// Takes one idle connection for `key`, if any is available.
    pub fn take(&self, key: &str) -> Option<TcpStream> {
        self.idle.borrow_mut().get_mut(key)?.pop_front()
    }

    /// Returns a connection to the pool for future reuse, dropping it
    /// instead if the per-key bound is already full.
    pub fn put(&self, key: &str, stream: TcpStream) {
        let mut idle = self.idle.borrow_mut();
        let queue = idle.entry(key.to_string()).or_default();
        if queue.len() < self.max_idle_per_key {
            queue.push_back(stream);
        }
    }

    pub fn idle_count(&self, key: &str) -> usize {
        self.idle.borrow().get(key).map(|q| q.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.idle.borrow().values().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
