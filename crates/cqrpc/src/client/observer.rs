//! Client call observers
//!
//! Two ways to consume a call sit on the same event core:
//!
//! - [`CallbackObserver`]: a closure invoked on the worker for each event.
//! - [`FutureObserver`]: collects responses and resolves a
//!   [`ResponseFuture`] when the call finishes; the awaiting task is
//!   woken from the worker, which never suspends.
//!
//! Observers see `Start`, `Read` (a response is ready), `Write` (one per
//! request sent; the half-close is not reported), `Timeout` and, exactly
//! once, `Finish` with `ok` equal to whether the final status is OK.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::channel::oneshot;

use cqrpc_core::{EventType, Status};

use super::call::ClientCall;

/// Receiver of client call events. Runs on a worker, must not block.
pub trait ClientObserver<Req, Resp>: Send + Sync {
    fn on_event(&self, call: &ClientCall<Req, Resp>, ok: bool, ty: EventType);
}

/// Observer backed by a closure.
pub struct CallbackObserver<F> {
    f: F,
}

impl<F> CallbackObserver<F> {
    pub fn new(f: F) -> Arc<Self> {
        Arc::new(Self { f })
    }
}

impl<Req, Resp, F> ClientObserver<Req, Resp> for CallbackObserver<F>
where
    F: Fn(&ClientCall<Req, Resp>, bool, EventType) + Send + Sync,
{
    fn on_event(&self, call: &ClientCall<Req, Resp>, ok: bool, ty: EventType) {
        (self.f)(call, ok, ty)
    }
}

type CallResult<Resp> = Result<Vec<Resp>, Status>;

/// Observer that resolves a [`ResponseFuture`].
pub struct FutureObserver<Resp> {
    responses: Mutex<Vec<Resp>>,
    sender: Mutex<Option<oneshot::Sender<CallResult<Resp>>>>,
}

impl<Resp> FutureObserver<Resp> {
    pub fn new() -> (Arc<Self>, ResponseFuture<Resp>) {
        let (tx, rx) = oneshot::channel();
        let observer = Arc::new(Self {
            responses: Mutex::new(Vec::new()),
            sender: Mutex::new(Some(tx)),
        });
        (observer, ResponseFuture { rx })
    }
}

impl<Req, Resp> ClientObserver<Req, Resp> for FutureObserver<Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn on_event(&self, call: &ClientCall<Req, Resp>, ok: bool, ty: EventType) {
        match ty {
            EventType::Read if ok => {
                let mut responses = self.responses.lock().unwrap();
                while let Some(msg) = call.next_response() {
                    responses.push(msg);
                }
            }
            EventType::Finish => {
                let mut responses = std::mem::take(&mut *self.responses.lock().unwrap());
                while let Some(msg) = call.next_response() {
                    responses.push(msg);
                }
                let result = match call.status() {
                    Some(status) if status.is_ok() => Ok(responses),
                    Some(status) => Err(status),
                    None => Err(Status::cancelled()),
                };
                if let Some(tx) = self.sender.lock().unwrap().take() {
                    // Receiver gone means nobody is waiting any more
                    let _ = tx.send(result);
                }
            }
            _ => {}
        }
    }
}

/// Resolves to every response of the call, or its failing status.
///
/// Resolves to `Cancelled` if the call is torn down without finishing.
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture<Resp> {
    rx: oneshot::Receiver<CallResult<Resp>>,
}

impl<Resp> Future for ResponseFuture<Resp> {
    type Output = CallResult<Resp>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Status::cancelled())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// [`ResponseFuture`] of a unary call: exactly one response.
#[must_use = "futures do nothing unless polled"]
pub struct UnaryFuture<Resp> {
    inner: ResponseFuture<Resp>,
}

impl<Resp> UnaryFuture<Resp> {
    pub(crate) fn new(inner: ResponseFuture<Resp>) -> Self {
        Self { inner }
    }
}

impl<Resp> Future for UnaryFuture<Resp> {
    type Output = Result<Resp, Status>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(responses)) => Poll::Ready(
                responses
                    .into_iter()
                    .next()
                    .ok_or_else(|| Status::internal("unary call finished without a response")),
            ),
            Poll::Ready(Err(status)) => Poll::Ready(Err(status)),
            Poll::Pending => Poll::Pending,
        }
    }
}
