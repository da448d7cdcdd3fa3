//! cqrpc echo demo
//!
//! Runs an echo server and a client over the in-process loopback
//! transport, issues a batch of unary calls and one bidi stream, then
//! prints the Prometheus statistics of both sides.
//!
//! # Environment Variables
//!
//! - `ECHO_CALLS=<n>` - Unary calls to issue (default 100)
//! - `ECHO_STREAM_MESSAGES=<n>` - Messages on the bidi stream (default 10)
//! - `CQRPC_LOG_LEVEL=debug` - Engine log level
//!
//! Server and client settings (`CQRPC_SERVER_*`, `CQRPC_CLIENT_*`) are
//! read by the builders.

use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use cqrpc::env::env_get;
use cqrpc::{
    kerror, kinfo, loopback, render_prometheus, ActiveObject, CallKind, CallOptions,
    CallbackObserver, ClientBuilder, ClientCall, EventType, Handler, RpcResult, ServerBuilder,
    ServerCall,
};

// CQRPC_LOG_LEVEL=debug ECHO_CALLS=1000 cargo run -p cqrpc-echo
struct Echo;

impl Handler<String, String> for Echo {
    fn on_request(&mut self, call: &ServerCall<String, String>, request: String) {
        call.write(request);
    }
}

fn run() -> RpcResult<()> {
    let calls: usize = env_get("ECHO_CALLS", 100);
    let messages: usize = env_get("ECHO_STREAM_MESSAGES", 10);

    let (server_transport, client_transport) = loopback::pair::<String, String>();

    let server = ServerBuilder::new()
        .transport(server_transport)
        .handler_fn(|_, _| Box::new(Echo) as Box<dyn Handler<String, String>>)
        .build()?;
    server.activate()?;

    let client = ClientBuilder::new()
        .endpoint(server.address())
        .transport(client_transport)
        .build()?;
    client.activate()?;

    println!("=== cqrpc echo: {} unary calls ===", calls);
    let start = Instant::now();
    let mut failed = 0usize;
    for i in 0..calls {
        let future = client.unary("/echo.Echo/Say", format!("ping {}", i))?;
        let reply = futures::executor::block_on(future);
        match reply {
            Ok(text) if text == format!("ping {}", i) => {}
            Ok(text) => {
                kerror!("call {}: unexpected reply {:?}", i, text);
                failed += 1;
            }
            Err(status) => {
                kerror!("call {}: {}", i, status);
                failed += 1;
            }
        }
    }
    let elapsed = start.elapsed();
    println!(
        "{} calls in {:?} ({} failed, {:.0} calls/s)",
        calls,
        elapsed,
        failed,
        calls as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    println!("\n=== cqrpc echo: bidi stream of {} ===", messages);
    let received = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&received);
    let observer = CallbackObserver::new(
        move |call: &ClientCall<String, String>, ok: bool, ty: EventType| match ty {
            EventType::Read if ok => {
                while let Some(text) = call.next_response() {
                    seen.fetch_add(1, Ordering::Relaxed);
                    kinfo!("{}: <- {}", call.id(), text);
                }
            }
            EventType::Finish => {
                let status = call.status().unwrap_or_default();
                kinfo!("{}: finished ({})", call.id(), status);
            }
            _ => {}
        },
    );
    let stream = client.call(
        "/echo.Echo/Chat",
        CallKind::BidiStreaming,
        observer,
        CallOptions::new(),
    )?;
    for i in 0..messages {
        if !stream.write(format!("message {}", i)) {
            kerror!("{}: write {} rejected", stream.id(), i);
        }
    }
    stream.writes_done();

    let deadline = Instant::now() + std::time::Duration::from_secs(5);
    while stream.status().is_none() && Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    println!(
        "stream received {}/{} echoes, status {}",
        received.load(Ordering::Relaxed),
        messages,
        stream
            .status()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "pending".to_string())
    );
    drop(stream);

    println!("\n=== server statistics ===");
    print!("{}", render_prometheus(&server));
    println!("\n=== client statistics ===");
    print!("{}", render_prometheus(&client));

    client.shutdown()?;
    server.shutdown()?;
    println!("\n=== Echo Complete ===");
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("cqrpc-echo: {}", e);
            ExitCode::FAILURE
        }
    }
}
