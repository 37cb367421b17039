//! Common request/response contract every backend client implements
//! (spec §4.G): `SendRequest(pool, stopwatch, params, method, address,
//! expected_status, headers, body, filter, handler, cancel)`. Completion
//! is asynchronous; this port expresses that as an `async fn` returning
//! `Result<BackendResponse, GatewayError>` rather than a callback, since
//! every client here already runs inside one cooperative task per
//! connection (no separate handler/cancel-token plumbing is needed to
//! get the same "synchronous cancel before dispatch" behavior: dropping
//! the future does it).

use bp_core::Address;
use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Other,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Other => "GET",
        }
    }

    /// HEAD/GET never carry a request body, per §4.D's response status map
    /// rule mirrored onto the request side.
    pub fn forbids_body(&self) -> bool {
        matches!(self, Method::Get | Method::Head)
    }
}

pub struct BackendRequest {
    pub method: Method,
    pub address: Address,
    /// Request-line path, distinct from `address.get_id()` (a cache-key
    /// style fingerprint, not necessarily a valid URI path).
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

pub struct BackendResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl BackendResponse {
    /// §4.D: 1xx/204/304 carry no body regardless of what the origin sent.
    pub fn suppress_body(status: u16) -> bool {
        (100..200).contains(&status) || status == 204 || status == 304
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_head_forbid_body() {
        assert!(Method::Get.forbids_body());
        assert!(Method::Head.forbids_body());
        assert!(!Method::Post.forbids_body());
    }

    #[test]
    fn test_suppress_body_status_classes() {
        assert!(BackendResponse::suppress_body(100));
        assert!(BackendResponse::suppress_body(204));
        assert!(BackendResponse::suppress_body(304));
        assert!(!BackendResponse::suppress_body(200));
        assert!(!BackendResponse::suppress_body(404));
    }
}
