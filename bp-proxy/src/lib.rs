//! Proxy orchestration crate: translation lookup, peer selection, the
//! outbound connection pool, per-connection request handling, the
//! thread-per-core worker loop, and the out-of-band control protocol.

pub mod connection;
pub mod control;
pub mod pool;
pub mod proxy;
pub mod translate;
pub mod worker;

pub use control::ControlServer;
pub use pool::ConnPool;
pub use proxy::{ProxyWorker, RequestResult};
pub use translate::{RouteRule, StaticTranslator, TranslateRequest, TranslateResponse, Translator};
pub use worker::{spawn_workers, SharedState};
