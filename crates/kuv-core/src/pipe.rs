//! Backpressured byte pipe
//!
//! A single-producer, single-consumer byte buffer with a pause threshold
//! (high-water mark) and a resume threshold (low-water mark). One side is
//! driven by an event loop that must never block, the other by an
//! application thread that may.
//!
//! # Loop side
//!
//! - `PipeWriter::write` never blocks; the returned [`FlushResult`] says
//!   whether the writer should stop producing (`is_paused`) or the reader
//!   is gone (`is_completed`).
//! - `PipeReader::try_read` never blocks; `TryRead::Pending` arms the
//!   reader's wake hook for the next write.
//! - Wake hooks registered with `on_wake` run on the thread that caused
//!   the wake, outside the pipe lock. They are expected to post a
//!   notification to the loop, not to touch loop state directly.
//!
//! # Application side
//!
//! - `PipeReader::read` blocks until data or completion.
//! - `PipeWriter::write_all` appends and then blocks while paused.
//!
//! Dropping either side completes it gracefully.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, UvError};

/// Called when the other side of the pipe needs attention
pub type WakeHook = Arc<dyn Fn() + Send + Sync>;

/// Thresholds for one pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// Writer is paused once this many bytes are buffered
    pub pause_threshold: Option<usize>,
    /// Paused writer resumes once buffered bytes drop to this many
    pub resume_threshold: Option<usize>,
}

impl PipeOptions {
    /// No backpressure
    pub const fn unlimited() -> Self {
        Self {
            pause_threshold: None,
            resume_threshold: None,
        }
    }

    /// Explicit high/low water marks
    pub const fn new(pause_threshold: usize, resume_threshold: usize) -> Self {
        Self {
            pause_threshold: Some(pause_threshold),
            resume_threshold: Some(resume_threshold),
        }
    }

    /// Pause at `max`, resume at half of it
    pub const fn with_limit(max: usize) -> Self {
        Self::new(max, max / 2)
    }

    /// `None` limit means unlimited
    pub const fn from_limit(max: Option<usize>) -> Self {
        match max {
            Some(max) => Self::with_limit(max),
            None => Self::unlimited(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match (self.pause_threshold, self.resume_threshold) {
            (None, None) => Ok(()),
            (Some(pause), Some(resume)) if pause > 0 && resume < pause => Ok(()),
            (Some(_), Some(_)) => Err(UvError::InvalidConfig(
                "pipe resume threshold must be below a non-zero pause threshold",
            )),
            _ => Err(UvError::InvalidConfig(
                "pipe pause and resume thresholds must be set together",
            )),
        }
    }
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Outcome of a non-blocking write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushResult {
    /// Buffered bytes reached the pause threshold
    pub is_paused: bool,
    /// Reader completed; the data was discarded
    pub is_completed: bool,
}

/// Outcome of a non-blocking read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryRead {
    /// Buffered bytes, in order
    Data(Bytes),
    /// Nothing buffered; the reader's wake hook is armed
    Pending,
    /// Writer completed and the buffer is drained
    Completed(Option<UvError>),
}

struct State {
    buf: BytesMut,
    paused: bool,
    writer_done: Option<Option<UvError>>,
    reader_done: Option<Option<UvError>>,
    reader_armed: bool,
    reader_wake: Option<WakeHook>,
    writer_wake: Option<WakeHook>,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    writable: Condvar,
    options: PipeOptions,
}

/// Producer side
pub struct PipeWriter {
    shared: Arc<Shared>,
}

/// Consumer side
pub struct PipeReader {
    shared: Arc<Shared>,
}

/// Cancels a pipe's writer from outside it. Unlike the writer, dropping
/// it does nothing.
#[derive(Clone)]
pub struct PipeCanceller {
    shared: Arc<Shared>,
}

/// Create a pipe
pub fn pipe(options: PipeOptions) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: BytesMut::new(),
            paused: false,
            writer_done: None,
            reader_done: None,
            reader_armed: false,
            reader_wake: None,
            writer_wake: None,
        }),
        readable: Condvar::new(),
        writable: Condvar::new(),
        options,
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

#[inline]
fn fire(hook: Option<WakeHook>) {
    if let Some(hook) = hook {
        hook();
    }
}

impl Shared {
    /// Mark the writer done. Returns false if it already was.
    fn complete_writer(&self, error: Option<UvError>, discard: bool) -> bool {
        let mut state = self.state.lock();
        if state.writer_done.is_some() {
            return false;
        }
        state.writer_done = Some(error);
        state.reader_armed = false;
        if discard {
            state.buf.clear();
            state.paused = false;
        }
        let wake = state.reader_wake.clone();
        drop(state);
        self.readable.notify_all();
        self.writable.notify_all();
        fire(wake);
        true
    }

    /// Called with the lock held after bytes were consumed. Returns the
    /// writer hook when a paused writer may resume.
    fn after_consume(&self, state: &mut State) -> Option<WakeHook> {
        if !state.paused {
            return None;
        }
        let resume = self.options.resume_threshold.unwrap_or(0);
        if state.buf.len() > resume {
            return None;
        }
        state.paused = false;
        self.writable.notify_all();
        state.writer_wake.clone()
    }
}

impl PipeWriter {
    /// Register the hook run when a paused writer may resume or the reader completes
    pub fn on_wake(&self, hook: WakeHook) {
        self.shared.state.lock().writer_wake = Some(hook);
    }

    /// Append without blocking
    pub fn write(&self, data: &[u8]) -> Result<FlushResult> {
        let mut state = self.shared.state.lock();
        if state.writer_done.is_some() {
            return Err(UvError::Closed);
        }
        if state.reader_done.is_some() {
            return Ok(FlushResult {
                is_paused: false,
                is_completed: true,
            });
        }

        let mut wake = None;
        if !data.is_empty() {
            state.buf.extend_from_slice(data);
            if let Some(pause) = self.shared.options.pause_threshold {
                if state.buf.len() >= pause {
                    state.paused = true;
                }
            }
            if state.reader_armed {
                state.reader_armed = false;
                wake = state.reader_wake.clone();
            }
            self.shared.readable.notify_all();
        }
        let result = FlushResult {
            is_paused: state.paused,
            is_completed: false,
        };
        drop(state);
        fire(wake);
        Ok(result)
    }

    /// Append, then block while the pipe is paused
    ///
    /// Fails once the reader has completed: with the reader's error if it
    /// gave one, `ConnectionReset` otherwise.
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        let flush = self.write(data)?;
        let mut state = self.shared.state.lock();
        if flush.is_completed {
            return Err(reader_gone(&state));
        }
        while state.paused && state.reader_done.is_none() && state.writer_done.is_none() {
            self.shared.writable.wait(&mut state);
        }
        if state.reader_done.is_some() {
            return Err(reader_gone(&state));
        }
        match &state.writer_done {
            // cancelled while blocked
            Some(Some(err)) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Signal end of data. The first call wins.
    pub fn complete(&self, error: Option<UvError>) {
        self.shared.complete_writer(error, false);
    }

    /// Handle that can cancel this writer from another owner
    pub fn canceller(&self) -> PipeCanceller {
        PipeCanceller {
            shared: self.shared.clone(),
        }
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    #[inline]
    pub fn is_reader_completed(&self) -> bool {
        self.shared.state.lock().reader_done.is_some()
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().writer_done.is_some()
    }
}

fn reader_gone(state: &State) -> UvError {
    match &state.reader_done {
        Some(Some(err)) => err.clone(),
        _ => UvError::ConnectionReset,
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.complete(None);
    }
}

impl PipeCanceller {
    /// Complete the writer with `error` and discard what is buffered.
    /// Returns false if the writer had already completed.
    pub fn cancel(&self, error: UvError) -> bool {
        self.shared.complete_writer(Some(error), true)
    }
}

impl PipeReader {
    /// Register the hook run when data arrives for an armed reader or the writer completes
    pub fn on_wake(&self, hook: WakeHook) {
        self.shared.state.lock().reader_wake = Some(hook);
    }

    /// Take up to `max` buffered bytes without blocking
    pub fn try_read(&self, max: usize) -> TryRead {
        let mut state = self.shared.state.lock();
        if state.reader_done.is_some() {
            return TryRead::Completed(Some(UvError::Closed));
        }
        if state.buf.is_empty() {
            return match &state.writer_done {
                Some(err) => TryRead::Completed(err.clone()),
                None => {
                    state.reader_armed = true;
                    TryRead::Pending
                }
            };
        }
        let n = state.buf.len().min(max.max(1));
        let chunk = state.buf.split_to(n).freeze();
        let wake = self.shared.after_consume(&mut state);
        drop(state);
        fire(wake);
        TryRead::Data(chunk)
    }

    /// Copy buffered bytes into `out`, blocking until some are available
    ///
    /// Returns `Ok(0)` once the writer completed gracefully and the buffer
    /// is drained, or the writer's error if it completed with one.
    pub fn read(&self, out: &mut [u8]) -> Result<usize> {
        let mut state = self.shared.state.lock();
        loop {
            if state.reader_done.is_some() {
                return Err(UvError::Closed);
            }
            if !state.buf.is_empty() {
                break;
            }
            match &state.writer_done {
                Some(None) => return Ok(0),
                Some(Some(err)) => return Err(err.clone()),
                None => self.shared.readable.wait(&mut state),
            }
        }
        if out.is_empty() {
            return Ok(0);
        }
        let n = state.buf.len().min(out.len());
        out[..n].copy_from_slice(&state.buf[..n]);
        let _ = state.buf.split_to(n);
        let wake = self.shared.after_consume(&mut state);
        drop(state);
        fire(wake);
        Ok(n)
    }

    /// Stop consuming. Buffered bytes are discarded and a blocked writer is released.
    pub fn complete(&self, error: Option<UvError>) {
        let mut state = self.shared.state.lock();
        if state.reader_done.is_some() {
            return;
        }
        state.reader_done = Some(error);
        state.buf.clear();
        state.paused = false;
        let wake = state.writer_wake.clone();
        drop(state);
        self.shared.writable.notify_all();
        fire(wake);
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buf.len()
    }

    #[inline]
    pub fn is_writer_completed(&self) -> bool {
        self.shared.state.lock().writer_done.is_some()
    }

    /// Error the writer completed with, if any
    pub fn writer_error(&self) -> Option<UvError> {
        match &self.shared.state.lock().writer_done {
            Some(Some(err)) => Some(err.clone()),
            _ => None,
        }
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.shared.state.lock().reader_done.is_some()
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.complete(None);
    }
}
