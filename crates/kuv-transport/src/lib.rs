//! # kuv-transport
//!
//! Multi-threaded TCP transport on per-thread event loops.
//!
//! Every transport thread runs one [`kuv_loop::EventLoop`]. The first
//! thread owns the public endpoint and spreads accepted sockets round-robin
//! over itself and the other threads through an internal Unix-socket pipe.
//! Each connection exposes blocking, backpressured streams to an
//! application [`ConnectionHandler`] running on its own thread.
//!
//! ## Example
//!
//! ```rust,ignore
//! use kuv_transport::{ConnectionContext, ListenOptions, Transport, TransportOptions};
//!
//! let listen = ListenOptions::new("127.0.0.1:8080".parse()?);
//! let echo = |ctx: &mut ConnectionContext| -> std::io::Result<()> {
//!     let (input, output) = ctx.streams();
//!     std::io::copy(input, output)?;
//!     Ok(())
//! };
//! let mut transport = Transport::new(listen, TransportOptions::from_env(), echo)?;
//! transport.bind()?;
//! // ...
//! transport.stop();
//! ```
//!
//! ## Modules
//!
//! - `options` - Transport and endpoint configuration
//! - `handler` - Application contract: handler, adapters, connection context
//! - `thread` - Transport thread lifecycle and cross-thread posting
//! - `connection` - Socket <-> pipe pump with backpressure and half-close
//! - `listener` - Accept loop and single-thread listener
//! - `listener_primary` - Endpoint owner and round-robin dispatcher
//! - `listener_secondary` - Receives dispatched sockets from the primary
//! - `transport` - Bind/unbind/stop facade

mod connection;
pub mod handler;
pub mod listener;
pub mod listener_primary;
pub mod listener_secondary;
pub mod options;
pub mod thread;
mod trace;
pub mod transport;

pub use handler::{
    AbortHandle, ConnectionAdapter, ConnectionContext, ConnectionHandler, InputStream,
    LoggingAdapter, OutputStream,
};
pub use listener::Listener;
pub use listener_primary::{DispatchSnapshot, DispatchState, DispatchTarget, ListenerPrimary};
pub use listener_secondary::ListenerSecondary;
pub use options::{ListenOptions, TransportOptions};
pub use thread::{ThreadStop, TransportThread};
pub use transport::Transport;

pub use kuv_core::{Completion, ConnectionId, Result, UvError};
