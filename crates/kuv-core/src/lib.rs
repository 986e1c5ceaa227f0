//! # kuv-core
//!
//! Core types for the kuv transport.
//!
//! This crate contains no event-loop or socket code. Everything here is
//! usable (and tested) without a real socket.
//!
//! ## Modules
//!
//! - `error` - Error type shared by the loop binding and the transport
//! - `env` - Environment variable utilities
//! - `id` - Connection identifier
//! - `state` - Per-connection half-close state machine
//! - `pipe` - Backpressured byte pipe between loop and application
//! - `completion` - One-shot, multi-waiter completion handle

pub mod completion;
pub mod env;
pub mod error;
pub mod id;
pub mod pipe;
pub mod state;

// Re-exports for convenience
pub use completion::Completion;
pub use env::{env_get, env_get_bool, env_get_ms, env_get_opt, env_get_str};
pub use error::{is_connection_reset, Result, UvError};
pub use id::ConnectionId;
pub use pipe::{pipe, FlushResult, PipeCanceller, PipeOptions, PipeReader, PipeWriter, TryRead};
pub use state::{ConnectionEvent, ConnectionState};

/// Constants shared across the transport
pub mod constants {
    /// Backlog passed to `listen(2)` for the public endpoint and the pipe
    pub const LISTEN_BACKLOG: i32 = 128;

    /// Rounds of queued work a loop drains per wakeup before returning to I/O
    pub const MAX_POST_LOOPS: usize = 8;

    /// Size of the buffer handed to each native read
    pub const READ_CHUNK_SIZE: usize = 64 * 1024;

    /// Length of the handshake message exchanged over the internal pipe
    pub const HANDSHAKE_LEN: usize = 16;
}
