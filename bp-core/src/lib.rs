pub mod address;
pub mod arena;
pub mod chunked;
pub mod config;
pub mod error;
pub mod filters;
pub mod sinks;
pub mod stream;

pub use address::{Address, AddressList, CgiAddress, StickyMode};
pub use arena::{AllocatorPtr, Pool, PoolKind, TempPoolLease};
pub use config::GatewayConfig;
pub use error::GatewayError;
pub use stream::{Bucket, BucketList, DirectMask, Handler, Length, Stream, StreamState};
