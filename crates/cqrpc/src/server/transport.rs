//! Server transport contract
//!
//! The engine never encodes messages or touches sockets. A transport
//! performs the asynchronous operations and completes the [`PendingOp`]
//! it was handed: `ok = true` when the operation succeeded, `ok = false`
//! when it could not (the call is ending). Every op handed to a transport
//! must eventually be completed or dropped; dropping completes it with
//! `ok = false`.

use std::sync::{Arc, Mutex};

use cqrpc_core::{RpcResult, Status};
use cqrpc_runtime::PendingOp;

use crate::config::ChannelArgs;
use crate::kind::CallKind;

/// One accepted call as seen by the server.
pub trait ServerStream<Req, Resp>: Send + Sync {
    fn method(&self) -> &str;

    fn kind(&self) -> CallKind;

    /// Wait for the next request. Completes `true` when one is ready for
    /// [`take_message`](Self::take_message), `false` once the client has
    /// half-closed or the call is over.
    fn read(&self, op: PendingOp);

    /// The request delivered by the last successful read.
    fn take_message(&self) -> Option<Req>;

    fn write(&self, message: Resp, op: PendingOp);

    /// Send the final status. Later reads and writes fail.
    fn finish(&self, status: Status, op: PendingOp);

    /// Completes once the call is over: `true` after a normal finish,
    /// `false` when the call was cancelled.
    fn notify_when_done(&self, op: PendingOp);

    /// Abort the call. Every outstanding operation completes with `false`.
    fn cancel(&self);
}

/// Where a transport deposits the stream of a newly accepted call.
pub struct CallSlot<Req, Resp> {
    stream: Mutex<Option<Arc<dyn ServerStream<Req, Resp>>>>,
}

impl<Req, Resp> CallSlot<Req, Resp> {
    pub fn new() -> Self {
        Self {
            stream: Mutex::new(None),
        }
    }

    pub fn fill(&self, stream: Arc<dyn ServerStream<Req, Resp>>) {
        *self.stream.lock().unwrap() = Some(stream);
    }

    pub fn take(&self) -> Option<Arc<dyn ServerStream<Req, Resp>>> {
        self.stream.lock().unwrap().take()
    }
}

impl<Req, Resp> Default for CallSlot<Req, Resp> {
    fn default() -> Self {
        Self::new()
    }
}

/// Listening side of a transport.
pub trait ServerTransport<Req, Resp>: Send + Sync {
    fn bind(&self, address: &str, args: &ChannelArgs) -> RpcResult<()>;

    /// Arm a listener. When a call arrives the transport fills `slot` and
    /// completes `op` with `true`; on shutdown it completes with `false`.
    fn request_call(&self, slot: Arc<CallSlot<Req, Resp>>, op: PendingOp);

    /// Stop accepting. Armed listeners complete with `false`.
    fn shutdown(&self);
}
