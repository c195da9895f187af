use std::future::Future;
use std::pin::Pin;

use crate::error::Error;
use crate::types::HitlRequest;

/// Object-safe async interface to the chat transport's egress side.
///
/// Uses `Pin<Box<dyn Future>>` for dyn-compatibility. The transport never
/// mutates request state itself; ingress hands parsed replies to the
/// coordinator.
pub trait ChatTransport: Send + Sync {
    /// Deliver the prompt for a request to a human recipient. Returns the
    /// transport's message handle on success.
    fn send_prompt<'a>(
        &'a self,
        human_address: i64,
        request: &'a HitlRequest,
    ) -> Pin<Box<dyn Future<Output = Result<i32, Error>> + Send + 'a>>;

    /// Best-effort notification that a selection was recorded (or refused).
    /// Failures are logged by the implementation, never propagated.
    fn acknowledge<'a>(
        &'a self,
        human_address: i64,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}
