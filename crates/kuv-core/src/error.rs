//! Error types

use std::io;
use std::net::SocketAddr;

use nix::errno::Errno;
use thiserror::Error;

/// Errors raised by the loop binding, connections and listeners.
///
/// `Clone` so a single failure can complete a connection and be observed
/// by every waiter on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UvError {
    /// A native call failed
    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: Errno },

    /// Peer reset the connection, or the connection was torn down under a writer
    #[error("connection reset by peer")]
    ConnectionReset,

    /// Connection was aborted locally
    #[error("connection aborted: {0}")]
    ConnectionAborted(String),

    /// Public endpoint is already bound by someone else
    #[error("address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// Work was posted to a transport thread that is not running
    #[error("transport thread is not running")]
    ThreadStopped,

    /// Internal pipe handshake did not complete
    #[error("pipe handshake failed: {0}")]
    HandshakeFailed(String),

    /// A configuration value is out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Operation on a pipe side or handle that was already completed
    #[error("handle is closed")]
    Closed,
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, UvError>;

impl UvError {
    /// Build an `Os` error from an errno.
    #[inline]
    pub const fn os(op: &'static str, errno: Errno) -> Self {
        UvError::Os { op, errno }
    }

    /// Build an `Os` error from an `io::Error`.
    ///
    /// Errors with no OS code map to `EIO`.
    pub fn from_io(op: &'static str, err: &io::Error) -> Self {
        let errno = err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO);
        UvError::Os { op, errno }
    }

    /// The OS error code, if any.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            UvError::Os { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// True for errors that mean the peer is gone.
    pub fn is_connection_reset(&self) -> bool {
        match self {
            UvError::ConnectionReset => true,
            UvError::Os { errno, .. } => is_connection_reset(*errno),
            _ => false,
        }
    }
}

/// Errno values treated as a connection reset rather than a local failure.
#[inline]
pub fn is_connection_reset(errno: Errno) -> bool {
    matches!(
        errno,
        Errno::ECONNRESET | Errno::EPIPE | Errno::ENOTCONN | Errno::EINVAL
    )
}

impl From<UvError> for io::Error {
    fn from(err: UvError) -> io::Error {
        let kind = match &err {
            UvError::Os { errno, .. } => io::Error::from_raw_os_error(*errno as i32).kind(),
            UvError::ConnectionReset => io::ErrorKind::ConnectionReset,
            UvError::ConnectionAborted(_) => io::ErrorKind::ConnectionAborted,
            UvError::AddressInUse(_) => io::ErrorKind::AddrInUse,
            UvError::ThreadStopped | UvError::Closed => io::ErrorKind::NotConnected,
            UvError::HandshakeFailed(_) => io::ErrorKind::InvalidData,
            UvError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, err)
    }
}
