//! Client transport contract
//!
//! Mirrors the server side: the engine hands out [`PendingOp`]s and the
//! transport completes each one exactly once, or drops it.

use std::sync::Arc;

use cqrpc_core::{RpcResult, Status};
use cqrpc_runtime::PendingOp;

use crate::config::Credentials;
use crate::kind::CallKind;

/// One outbound call.
pub trait ClientStream<Req, Resp>: Send + Sync {
    /// Wait for the next response. `false` once the server has finished
    /// or the call is over.
    fn read(&self, op: PendingOp);

    fn take_message(&self) -> Option<Resp>;

    fn write(&self, message: Req, op: PendingOp);

    /// Half-close the request direction.
    fn writes_done(&self, op: PendingOp);

    /// Completes once the final status is known; fetch it with
    /// [`take_status`](Self::take_status).
    fn finish(&self, op: PendingOp);

    fn take_status(&self) -> Option<Status>;

    /// Abort the call. Every outstanding operation completes with `false`;
    /// a pending or later `finish` still completes, with `Cancelled`.
    fn cancel(&self);
}

/// Connecting side of a transport.
pub trait ClientTransport<Req, Resp>: Send + Sync {
    /// Open channel `channel` to `endpoint`.
    fn connect(&self, endpoint: &str, credentials: &Credentials, channel: usize) -> RpcResult<()>;

    /// Start a call. `op` completes `true` once the server has accepted
    /// it and `false` if it could not be started.
    fn start_call(
        &self,
        channel: usize,
        method: &str,
        kind: CallKind,
        op: PendingOp,
    ) -> Arc<dyn ClientStream<Req, Resp>>;

    /// Close every channel. Calls not yet accepted fail.
    fn shutdown(&self);
}
