// A locally hosted capability is an `Rc`-shared handler object that a call
// dispatches into, deliberately untyped rather than wrapping a
// code-generated server trait. This core has no suspension points (every
// handler's future must resolve on its first poll, see
// `crate::rpc::poll_once_ready`), so `dispatch_deferred` below exists only
// to give every call site one shared place to box the call, not to defer
// anything across a scheduler tick.

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use crate::error::Error;
use crate::message::Payload;

pub type CallFuture = Pin<Box<dyn Future<Output = Result<Payload, Error>>>>;

/// The capability hook every export holds: something that can be called by
/// interface/method id and asked to produce a result payload.
pub trait CapabilityHandler {
    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> CallFuture;
}

/// Wraps a plain async closure as a [`CapabilityHandler`].
pub struct FnHandler<F> {
    f: Rc<F>,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(u64, u16, Payload) -> Fut + 'static,
    Fut: Future<Output = Result<Payload, Error>> + 'static,
{
    pub fn new(f: F) -> Rc<Self> {
        Rc::new(Self { f: Rc::new(f) })
    }
}

impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(u64, u16, Payload) -> Fut + 'static,
    Fut: Future<Output = Result<Payload, Error>> + 'static,
{
    fn call(&self, interface_id: u64, method_id: u16, params: Payload) -> CallFuture {
        let f = self.f.clone();
        Box::pin(async move { (f)(interface_id, method_id, params).await })
    }
}

/// Boxes a call on a locally hosted handler, giving every call site one
/// shared place to do so even though nothing here actually defers past the
/// first poll.
pub fn dispatch_deferred(
    handler: Rc<dyn CapabilityHandler>,
    interface_id: u64,
    method_id: u16,
    params: Payload,
) -> CallFuture {
    Box::pin(async move { handler.call(interface_id, method_id, params).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CapDescriptor;

    #[tokio::test]
    async fn fn_handler_dispatches() {
        let h = FnHandler::new(|_iface, _method, _params| async {
            Ok(Payload::single_cap(CapDescriptor::SenderHosted(7)))
        });
        let result = dispatch_deferred(h, 0x99, 0, Payload::empty()).await.unwrap();
        assert_eq!(result.cap_table.len(), 1);
    }
}
