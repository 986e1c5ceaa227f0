//! # kuv-loop
//!
//! Native event-loop binding for the kuv transport.
//!
//! One [`EventLoop`] per OS thread. Everything that touches a handle runs
//! on that thread; other threads reach it through a [`LoopRemote`].
//!
//! ## Modules
//!
//! - `event_loop` - Poller, handle table, close queue, run/stop
//! - `post` - Cross-thread work queue and waker
//! - `stream` - Read/write helpers with libuv-style `read_start`/`read_stop`
//! - `listen` - Listener socket setup (TCP endpoint, internal pipe)
//! - `sys` - Socket handle passing over Unix sockets

pub mod event_loop;
pub mod listen;
pub mod post;
pub mod stream;
pub mod sys;

pub use event_loop::{EventLoop, Handle, HandleKind, LoopConfig, Ready, WAKE_TOKEN};
pub use post::{LoopRemote, Work};
pub use stream::{ReadStatus, StreamHandle, StreamIo, WriteStatus};

pub use mio::{Interest, Token};
