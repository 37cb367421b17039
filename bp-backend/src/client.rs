use crate::request::{BackendRequest, BackendResponse};
use bp_core::GatewayError;

/// Common contract every backend kind implements, per spec §4.G.
/// Dropping the returned future before it resolves is this port's
/// analogue of "cancel before dispatch" / "cancel after dispatch closes
/// the transport" — whichever has already happened, the client's `Drop`
/// impl (where one is needed, e.g. to return a connection to its pool)
/// runs either way.
#[allow(async_fn_in_trait)]
pub trait BackendClient {
    async fn send_request(&mut self, req: BackendRequest) -> Result<BackendResponse, GatewayError>;
}
