pub mod pool;
pub mod stopwatch;

pub use pool::{default_worker_count, JobHandle, JobState, SharedWorkerPool, ThreadJob, WorkerPool};
pub use stopwatch::Stopwatch;
