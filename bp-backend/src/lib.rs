pub mod ajp;
pub mod cgi;
pub mod client;
pub mod fcgi;
pub mod http;
pub mod localfile;
pub mod nfs;
pub mod request;
pub mod was;

pub use ajp::AjpClient;
pub use cgi::CgiClient;
pub use client::BackendClient;
pub use fcgi::FcgiClient;
pub use http::HttpClient;
pub use localfile::LocalFileClient;
pub use nfs::NfsClient;
pub use request::{BackendRequest, BackendResponse, Method};
pub use was::WasClient;
