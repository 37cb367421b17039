pub mod id;
pub mod store;

pub use id::SessionId;
pub use store::{Session, SessionStore, CLEANUP_INTERVAL, N_BUCKETS};
