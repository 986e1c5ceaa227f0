//! Transport configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use kuv_transport::options::TransportOptions;
//!
//! // Defaults with env overrides
//! let options = TransportOptions::from_env();
//!
//! // Or customize programmatically
//! let options = TransportOptions::from_env()
//!     .thread_count(4)
//!     .max_read_buffer_size(Some(256 * 1024));
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kuv_core::env::{env_get, env_get_bool, env_get_ms};
use kuv_core::{PipeOptions, Result, UvError};

use crate::handler::ConnectionAdapter;

/// Library defaults
pub mod defaults {
    /// Disable Nagle on accepted sockets
    pub const NO_DELAY: bool = true;
    /// Input pipe pause threshold; resumes at half
    pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;
    /// Output pipe pause threshold; resumes at half
    pub const MAX_WRITE_BUFFER_SIZE: usize = 64 * 1024;
    /// Per-phase wait when stopping a transport thread
    pub const SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
    pub const LISTEN_BACKLOG: i32 = kuv_core::constants::LISTEN_BACKLOG;
    pub const READ_CHUNK_SIZE: usize = kuv_core::constants::READ_CHUNK_SIZE;
    /// Largest slice of output handed to one native write
    pub const WRITE_CHUNK_SIZE: usize = 64 * 1024;
    /// Upper bound on transport threads picked automatically
    pub const MAX_AUTO_THREADS: usize = 16;

    /// Half the available cores, between 1 and `MAX_AUTO_THREADS`
    pub fn thread_count() -> usize {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        (cores >> 1).clamp(1, MAX_AUTO_THREADS)
    }
}

/// Transport-wide settings, shared read-only by every thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Number of transport threads; one primary plus `thread_count - 1` secondaries
    pub thread_count: usize,
    /// Set `TCP_NODELAY` on accepted sockets
    pub no_delay: bool,
    /// Backpressure on data read from the network
    pub input: PipeOptions,
    /// Backpressure on data written by the application
    pub output: PipeOptions,
    /// `listen(2)` backlog for the public endpoint
    pub listen_backlog: i32,
    /// Buffer size for each native read
    pub read_chunk_size: usize,
    /// Largest slice handed to one native write
    pub write_chunk_size: usize,
    /// Wait per shutdown phase in `TransportThread::stop`
    pub shutdown_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from_env()
    }
}

/// `0` in the environment means unlimited
fn limit_from_env(key: &str, default: usize) -> Option<usize> {
    match env_get(key, default) {
        0 => None,
        n => Some(n),
    }
}

impl TransportOptions {
    /// Create options from library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `KUV_THREAD_COUNT` - Number of transport threads
    /// - `KUV_NO_DELAY` - Set TCP_NODELAY (0/1)
    /// - `KUV_MAX_READ_BUFFER_SIZE` - Input pause threshold, 0 for unlimited
    /// - `KUV_MAX_WRITE_BUFFER_SIZE` - Output pause threshold, 0 for unlimited
    /// - `KUV_LISTEN_BACKLOG` - listen(2) backlog
    /// - `KUV_READ_CHUNK_SIZE` - Bytes per native read
    /// - `KUV_SHUTDOWN_TIMEOUT_MS` - Per-phase thread stop timeout
    pub fn from_env() -> Self {
        Self {
            thread_count: env_get("KUV_THREAD_COUNT", defaults::thread_count()),
            no_delay: env_get_bool("KUV_NO_DELAY", defaults::NO_DELAY),
            input: PipeOptions::from_limit(limit_from_env(
                "KUV_MAX_READ_BUFFER_SIZE",
                defaults::MAX_READ_BUFFER_SIZE,
            )),
            output: PipeOptions::from_limit(limit_from_env(
                "KUV_MAX_WRITE_BUFFER_SIZE",
                defaults::MAX_WRITE_BUFFER_SIZE,
            )),
            listen_backlog: env_get("KUV_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            read_chunk_size: env_get("KUV_READ_CHUNK_SIZE", defaults::READ_CHUNK_SIZE),
            write_chunk_size: defaults::WRITE_CHUNK_SIZE,
            shutdown_timeout: env_get_ms("KUV_SHUTDOWN_TIMEOUT_MS", defaults::SHUTDOWN_TIMEOUT_MS),
        }
    }

    /// Create options with library defaults (no env override).
    pub fn new() -> Self {
        Self {
            thread_count: defaults::thread_count(),
            no_delay: defaults::NO_DELAY,
            input: PipeOptions::with_limit(defaults::MAX_READ_BUFFER_SIZE),
            output: PipeOptions::with_limit(defaults::MAX_WRITE_BUFFER_SIZE),
            listen_backlog: defaults::LISTEN_BACKLOG,
            read_chunk_size: defaults::READ_CHUNK_SIZE,
            write_chunk_size: defaults::WRITE_CHUNK_SIZE,
            shutdown_timeout: Duration::from_millis(defaults::SHUTDOWN_TIMEOUT_MS),
        }
    }

    // Builder methods

    pub fn thread_count(mut self, n: usize) -> Self {
        self.thread_count = n;
        self
    }

    pub fn no_delay(mut self, enable: bool) -> Self {
        self.no_delay = enable;
        self
    }

    /// Input pause threshold; resumes at half. `None` disables input backpressure.
    pub fn max_read_buffer_size(mut self, max: Option<usize>) -> Self {
        self.input = PipeOptions::from_limit(max);
        self
    }

    /// Output pause threshold; resumes at half. `None` disables output backpressure.
    pub fn max_write_buffer_size(mut self, max: Option<usize>) -> Self {
        self.output = PipeOptions::from_limit(max);
        self
    }

    /// Explicit input high/low water marks
    pub fn input_water_marks(mut self, high: usize, low: usize) -> Self {
        self.input = PipeOptions::new(high, low);
        self
    }

    /// Explicit output high/low water marks
    pub fn output_water_marks(mut self, high: usize, low: usize) -> Self {
        self.output = PipeOptions::new(high, low);
        self
    }

    pub fn listen_backlog(mut self, backlog: i32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size;
        self
    }

    pub fn write_chunk_size(mut self, size: usize) -> Self {
        self.write_chunk_size = size;
        self
    }

    pub fn shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(UvError::InvalidConfig("thread_count must be > 0"));
        }
        if self.listen_backlog <= 0 {
            return Err(UvError::InvalidConfig("listen_backlog must be > 0"));
        }
        if self.read_chunk_size == 0 {
            return Err(UvError::InvalidConfig("read_chunk_size must be > 0"));
        }
        if self.write_chunk_size == 0 {
            return Err(UvError::InvalidConfig("write_chunk_size must be > 0"));
        }
        self.input.validate()?;
        self.output.validate()?;
        Ok(())
    }
}

/// An endpoint plus the adapters applied to each of its connections.
///
/// Immutable once built; shared read-only by every listener thread.
#[derive(Clone)]
pub struct ListenOptions {
    endpoint: SocketAddr,
    adapters: Vec<Arc<dyn ConnectionAdapter>>,
}

impl ListenOptions {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            adapters: Vec::new(),
        }
    }

    /// Append an adapter; adapters run in the order added
    pub fn with_adapter<A: ConnectionAdapter + 'static>(mut self, adapter: A) -> Self {
        self.adapters.push(Arc::new(adapter));
        self
    }

    #[inline]
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    #[inline]
    pub fn adapters(&self) -> &[Arc<dyn ConnectionAdapter>] {
        &self.adapters
    }
}

impl fmt::Debug for ListenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.adapters.iter().map(|a| a.name()).collect();
        f.debug_struct("ListenOptions")
            .field("endpoint", &self.endpoint)
            .field("adapters", &names)
            .finish()
    }
}
