//! Application handler contract
//!
//! One handler instance serves one accepted call. Its methods run on the
//! worker thread that dispatched the triggering event, never two at once
//! for the same call, and must not block.

use cqrpc_core::Status;

use super::rpc::ServerCall;
use crate::kind::CallKind;

pub trait Handler<Req, Resp>: Send {
    /// Called once after the call is matched, before the first request.
    fn initialize(&mut self, _call: &ServerCall<Req, Resp>) {}

    /// Called per inbound request, in arrival order.
    fn on_request(&mut self, call: &ServerCall<Req, Resp>, request: Req);

    /// The client half-closed. Finishes with OK unless overridden.
    fn on_reads_done(&mut self, call: &ServerCall<Req, Resp>) {
        call.finish(Status::ok());
    }

    /// Called exactly once when the call is over. `ok` is false when it
    /// ended without a successful finish.
    fn on_finish(&mut self, _call: &ServerCall<Req, Resp>, _ok: bool) {}
}

/// Creates the handler for each accepted call.
pub trait HandlerFactory<Req, Resp>: Send + Sync {
    fn create(&self, method: &str, kind: CallKind) -> Box<dyn Handler<Req, Resp>>;
}

impl<Req, Resp, F> HandlerFactory<Req, Resp> for F
where
    F: Fn(&str, CallKind) -> Box<dyn Handler<Req, Resp>> + Send + Sync,
{
    fn create(&self, method: &str, kind: CallKind) -> Box<dyn Handler<Req, Resp>> {
        self(method, kind)
    }
}
