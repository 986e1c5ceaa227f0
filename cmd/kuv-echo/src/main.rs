//! kuv Echo Server
//!
//! Echoes every byte back to the peer, one handler thread per connection,
//! sockets spread round-robin over the transport threads.
//!
//! Usage:
//!     cargo build --release -p kuv-echo
//!     ./target/release/kuv-echo [port] [threads]
//!
//! Environment:
//!     KUV_LOG=debug                 log filter (falls back to RUST_LOG)
//!     KUV_MAX_READ_BUFFER_SIZE=...  input backpressure, 0 for unlimited
//!     KUV_SHUTDOWN_TIMEOUT_MS=...   per-phase stop timeout
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!     printf 'POST / HTTP/1.0\r\nContent-Length: 11\r\n\r\nHello World' | nc -q1 localhost 9999

use std::io;
use std::net::SocketAddr;

use kuv_transport::{ConnectionContext, ListenOptions, LoggingAdapter, Transport, TransportOptions};
use nix::sys::signal::{SigSet, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("KUV_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn echo(ctx: &mut ConnectionContext) -> io::Result<()> {
    let (input, output) = ctx.streams();
    io::copy(input, output)?;
    Ok(())
}

fn main() {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let mut options = TransportOptions::from_env();
    if let Some(threads) = args.get(2).and_then(|s| s.parse().ok()) {
        options = options.thread_count(threads);
    }

    // ── Block shutdown signals before any thread starts ──
    // every transport thread inherits the mask; only main waits for them
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    if let Err(err) = signals.thread_block() {
        error!(error = %err, "failed to block signals");
        std::process::exit(1);
    }

    let mut listen = ListenOptions::new(SocketAddr::from(([0, 0, 0, 0], port)));
    if std::env::var_os("KUV_ECHO_TRACE").is_some() {
        listen = listen.with_adapter(LoggingAdapter);
    }

    let threads = options.thread_count;
    let mut transport = match Transport::new(listen, options, echo) {
        Ok(transport) => transport,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(1);
        }
    };
    let addr = match transport.bind() {
        Ok(addr) => addr,
        Err(err) => {
            error!(error = %err, "bind failed");
            std::process::exit(1);
        }
    };
    info!(%addr, threads, "kuv-echo listening");

    // ── Wait for SIGINT/SIGTERM ──
    match signals.wait() {
        Ok(signal) => info!(?signal, "shutting down"),
        Err(err) => error!(error = %err, "signal wait failed; shutting down"),
    }

    let outcomes = transport.stop();
    info!(?outcomes, "kuv-echo stopped");
}
