//! Worker thread pool for blocking/CPU-bound jobs (spec §4.K), grounded on
//! `thread/Job.hxx` + `thread/Pool.cxx`: jobs are queued, run on a worker
//! thread, and their `Done()` callback fires back on the submitting side —
//! here, a `crossbeam_channel` receiver the caller drains instead of an
//! event-loop callback, which fits this crate's synchronous idiom.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initial,
    Waiting,
    Busy,
    Done,
}

impl JobState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => JobState::Initial,
            1 => JobState::Waiting,
            2 => JobState::Busy,
            _ => JobState::Done,
        }
    }
}

/// Handle to a submitted job: lets the caller poll `state()` without
/// blocking, or block on `recv()` for the output, mirroring `ThreadJob`'s
/// `IsIdle()`/state-machine contract from the source.
pub struct JobHandle<T> {
    rx: Receiver<T>,
    state: Arc<AtomicU8>,
}

impl<T> JobHandle<T> {
    pub fn state(&self) -> JobState {
        JobState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn recv(&self) -> Result<T, crossbeam_channel::RecvError> {
        self.rx.recv()
    }

    pub fn try_recv(&self) -> Result<T, crossbeam_channel::TryRecvError> {
        self.rx.try_recv()
    }
}

/// A unit of work handed to the pool. `run` executes on a worker thread and
/// returns the value later delivered to the caller via `WorkerPool::poll`.
pub trait ThreadJob: Send + 'static {
    type Output: Send + 'static;

    fn run(self: Box<Self>) -> Self::Output;
}

struct Envelope {
    run: Box<dyn FnOnce() + Send>,
}

/// Caps worker count at 16, mirroring `GetWorkerThreadCount()`'s
/// `MAX_WORKER_THREADS` ceiling; falls back to 1 if core count can't be
/// determined.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).min(16)
}

pub struct WorkerPool {
    sender: Sender<Envelope>,
    _handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(n_threads: usize) -> Self {
        let n_threads = n_threads.max(1);
        let (sender, receiver): (Sender<Envelope>, Receiver<Envelope>) = bounded(1024);
        let mut handles = Vec::with_capacity(n_threads);
        for i in 0..n_threads {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("bp-worker-{i}"))
                .spawn(move || {
                    while let Ok(envelope) = receiver.recv() {
                        (envelope.run)();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        WorkerPool { sender, _handles: handles }
    }

    /// Submits `job`, returning a handle that yields its output once a
    /// worker thread has run it. Mirrors the source's `State::WAITING` →
    /// `BUSY` → `DONE` progression, collapsed into channel send/recv plus
    /// an explicit `JobState` the caller can poll without blocking.
    pub fn submit<J: ThreadJob>(&self, job: J) -> JobHandle<J::Output> {
        let (tx, rx) = bounded(1);
        let job = Box::new(job);
        let state = Arc::new(AtomicU8::new(JobState::Waiting as u8));
        let state_for_worker = Arc::clone(&state);
        let envelope = Envelope {
            run: Box::new(move || {
                state_for_worker.store(JobState::Busy as u8, Ordering::Release);
                let output = job.run();
                state_for_worker.store(JobState::Done as u8, Ordering::Release);
                let _ = tx.send(output);
            }),
        };
        self.sender.send(envelope).expect("worker pool channel closed");
        JobHandle { rx, state }
    }

    /// Number of jobs submitted but not yet picked up by a worker thread,
    /// for the metrics gauge (spec §4.Q: "worker-pool queue depth").
    pub fn queue_depth(&self) -> usize {
        self.sender.len()
    }
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        WorkerPool { sender: self.sender.clone(), _handles: Vec::new() }
    }
}

/// Convenience wrapper sharing one pool across threads without re-spawning
/// workers; `bp-proxy` holds one `SharedWorkerPool` in its global state.
pub type SharedWorkerPool = Arc<WorkerPool>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Square(u64);
    impl ThreadJob for Square {
        type Output = u64;
        fn run(self: Box<Self>) -> u64 {
            self.0 * self.0
        }
    }

    #[test]
    fn test_submit_runs_job_on_worker_thread() {
        let pool = WorkerPool::new(2);
        let rx = pool.submit(Square(7));
        assert_eq!(rx.recv().unwrap(), 49);
    }

    #[test]
    fn test_multiple_jobs_all_complete() {
        let pool = WorkerPool::new(4);
        let receivers: Vec<_> = (0..20).map(|i| pool.submit(Square(i))).collect();
        for (i, rx) in receivers.into_iter().enumerate() {
            assert_eq!(rx.recv().unwrap(), (i as u64) * (i as u64));
        }
    }

    #[test]
    fn test_default_worker_count_is_capped_at_16() {
        assert!(default_worker_count() <= 16);
        assert!(default_worker_count() >= 1);
    }

    #[test]
    fn test_queue_depth_reflects_pending_jobs() {
        let pool = WorkerPool::new(1);
        let handles: Vec<_> = (0..5u64).map(Square).map(|j| pool.submit(j)).collect();
        for h in handles {
            h.recv().unwrap();
        }
        assert_eq!(pool.queue_depth(), 0);
    }
}
