use crate::error::Error;
use crate::local::{CallFuture, CapabilityHandler};
use crate::message::Payload;

/// A handler that answers every call with the same error. Installed on a
/// promise export once it resolves to `.none`: every call already queued
/// against it must resolve to the same exception rather than panicking or
/// hanging.
pub struct BrokenHandler {
    error: Error,
}

impl BrokenHandler {
    pub fn new(error: Error) -> Self {
        Self { error }
    }
}

impl CapabilityHandler for BrokenHandler {
    fn call(&self, _interface_id: u64, _method_id: u16, _params: Payload) -> CallFuture {
        let error = self.error.clone();
        Box::pin(async move { Err(error) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn always_errors() {
        let h = BrokenHandler::new(Error::PromiseBroken);
        let err = h.call(0, 0, Payload::empty()).await.unwrap_err();
        assert_eq!(err.reason(), "promise broken");
    }
}
