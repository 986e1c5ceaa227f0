//! Application-facing connection contract
//!
//! The transport hands each accepted connection to a [`ConnectionHandler`]
//! as a [`ConnectionContext`]: a blocking byte reader (data from the
//! peer), a blocking byte writer (data to the peer), addresses, and an
//! abort handle. Handlers run on their own thread, never on a loop thread.
//!
//! When the handler returns Ok, whatever is left of the input is
//! discarded and the output is flushed and followed by FIN. An error
//! aborts the connection instead. `finish_input`/`finish_output` end one
//! direction early; `cancel_output` drops queued output and closes the
//! connection without FIN.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use kuv_core::{Completion, ConnectionId, PipeCanceller, PipeReader, PipeWriter, Result, UvError};
use kuv_loop::{LoopRemote, Token};
use parking_lot::Mutex;
use tracing::debug;

/// Application callback invoked once per accepted connection.
///
/// Returning an error aborts the connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connection(&self, connection: &mut ConnectionContext) -> io::Result<()>;
}

impl<F> ConnectionHandler for F
where
    F: Fn(&mut ConnectionContext) -> io::Result<()> + Send + Sync + 'static,
{
    fn on_connection(&self, connection: &mut ConnectionContext) -> io::Result<()> {
        self(connection)
    }
}

/// Wraps a connection before the handler sees it (e.g. to inspect or
/// transform its streams). Adapters run in the order they were added.
pub trait ConnectionAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn on_connection(&self, connection: ConnectionContext) -> io::Result<ConnectionContext>;
}

/// Boxed application-side reader
pub type BoxRead = Box<dyn Read + Send>;
/// Boxed application-side writer
pub type BoxWrite = Box<dyn Write + Send>;

// ── Streams ─────────────────────────────────────────────────────────

/// Reads data received from the peer. `Ok(0)` is end-of-stream.
pub struct InputStream {
    reader: PipeReader,
}

impl InputStream {
    pub(crate) fn new(reader: PipeReader) -> Self {
        Self { reader }
    }

    /// Bytes buffered and not yet read
    pub fn buffered(&self) -> usize {
        self.reader.buffered()
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf).map_err(io::Error::from)
    }
}

/// Writes data to the peer. Blocks while the transport is behind.
pub struct OutputStream {
    writer: PipeWriter,
}

impl OutputStream {
    pub(crate) fn new(writer: PipeWriter) -> Self {
        Self { writer }
    }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write_all(buf).map_err(io::Error::from)?;
        Ok(buf.len())
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer.write_all(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Stands in for a stream the application has finished with
struct Finished;

impl Read for Finished {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for Finished {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "output already finished"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Stands in for an output the application cancelled
struct Cancelled;

impl Write for Cancelled {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(UvError::ConnectionReset.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Abort ───────────────────────────────────────────────────────────

/// Closes a connection from any thread
#[derive(Clone)]
pub struct AbortHandle {
    remote: LoopRemote,
    token: Token,
    reason: Arc<Mutex<Option<String>>>,
}

impl AbortHandle {
    pub(crate) fn new(remote: LoopRemote, token: Token, reason: Arc<Mutex<Option<String>>>) -> Self {
        Self {
            remote,
            token,
            reason,
        }
    }

    /// Close the connection without waiting for pending output.
    /// The first reason wins; later calls are no-ops.
    pub fn abort(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.into());
        }
        let token = self.token;
        // loop already stopped: the connection is gone with it
        let _ = self.remote.post(move |lp| lp.close(token));
    }
}

impl fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortHandle")
            .field("loop", &self.remote.name())
            .field("token", &self.token.0)
            .finish()
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// One accepted connection as seen by the application
pub struct ConnectionContext {
    input: BoxRead,
    output: BoxWrite,
    output_cancel: PipeCanceller,
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    thread_name: Arc<str>,
    abort: AbortHandle,
    closed: Completion<Result<()>>,
}

impl ConnectionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        input: BoxRead,
        output: BoxWrite,
        output_cancel: PipeCanceller,
        id: ConnectionId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        thread_name: Arc<str>,
        abort: AbortHandle,
        closed: Completion<Result<()>>,
    ) -> Self {
        Self {
            input,
            output,
            output_cancel,
            id,
            local_addr,
            remote_addr,
            thread_name,
            abort,
            closed,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Name of the transport thread that owns the socket
    #[inline]
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn input(&mut self) -> &mut (dyn Read + Send) {
        &mut *self.input
    }

    pub fn output(&mut self) -> &mut (dyn Write + Send) {
        &mut *self.output
    }

    /// Both streams at once, e.g. for `io::copy`
    pub fn streams(&mut self) -> (&mut (dyn Read + Send), &mut (dyn Write + Send)) {
        (&mut *self.input, &mut *self.output)
    }

    /// Stop reading; data still arriving from the peer is discarded
    pub fn finish_input(&mut self) {
        self.input = Box::new(Finished);
    }

    /// Flush what was written and send FIN; later writes fail
    pub fn finish_output(&mut self) {
        self.output = Box::new(Finished);
    }

    /// Give up on the output mid-write. Whatever the transport has not
    /// sent yet is discarded, the connection closes without FIN, and
    /// later writes fail with `ConnectionReset`.
    pub fn cancel_output(&mut self) {
        if self
            .output_cancel
            .cancel(UvError::ConnectionAborted("output cancelled".into()))
        {
            debug!(connection_id = %self.id, "output cancelled");
        }
        self.output = Box::new(Cancelled);
    }

    /// Close the connection immediately
    pub fn abort(&self, reason: impl Into<String>) {
        self.abort.abort(reason);
    }

    /// Abort handle that can be moved to another thread
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Resolves when the socket is closed: `Ok` after a graceful
    /// close of both directions, `Err` otherwise
    pub fn closed(&self) -> Completion<Result<()>> {
        self.closed.clone()
    }

    /// Replace the streams, keeping everything else
    pub fn map_streams<F>(self, f: F) -> Self
    where
        F: FnOnce(BoxRead, BoxWrite) -> (BoxRead, BoxWrite),
    {
        let (input, output) = f(self.input, self.output);
        Self {
            input,
            output,
            output_cancel: self.output_cancel,
            id: self.id,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            thread_name: self.thread_name,
            abort: self.abort,
            closed: self.closed,
        }
    }
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("thread", &self.thread_name)
            .finish()
    }
}

// ── Logging adapter ─────────────────────────────────────────────────

/// Logs every read and write on the connection at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingAdapter;

impl ConnectionAdapter for LoggingAdapter {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_connection(&self, connection: ConnectionContext) -> io::Result<ConnectionContext> {
        let id = connection.id();
        Ok(connection.map_streams(|input, output| {
            (
                Box::new(LoggingRead { inner: input, id }) as BoxRead,
                Box::new(LoggingWrite { inner: output, id }) as BoxWrite,
            )
        }))
    }
}

/// Bytes shown in one log line
const LOGGED_BYTES: usize = 32;

fn preview(data: &[u8]) -> String {
    let shown = &data[..data.len().min(LOGGED_BYTES)];
    let mut out = String::from_utf8_lossy(shown).escape_debug().to_string();
    if data.len() > LOGGED_BYTES {
        out.push_str("...");
    }
    out
}

struct LoggingRead {
    inner: BoxRead,
    id: ConnectionId,
}

impl Read for LoggingRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        debug!(connection_id = %self.id, count = n, data = %preview(&buf[..n]), "read");
        Ok(n)
    }
}

struct LoggingWrite {
    inner: BoxWrite,
    id: ConnectionId,
}

impl Write for LoggingWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        debug!(connection_id = %self.id, count = n, data = %preview(&buf[..n]), "write");
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kuv_core::{pipe, PipeOptions};
    use kuv_loop::{EventLoop, LoopConfig};

    fn context() -> (ConnectionContext, PipeWriter, PipeReader, EventLoop) {
        let lp = EventLoop::new(LoopConfig::default()).unwrap();
        let (in_tx, in_rx) = pipe(PipeOptions::unlimited());
        let (out_tx, out_rx) = pipe(PipeOptions::unlimited());
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let cancel = out_tx.canceller();
        let ctx = ConnectionContext::new(
            Box::new(InputStream::new(in_rx)),
            Box::new(OutputStream::new(out_tx)),
            cancel,
            ConnectionId::from_raw(7),
            addr,
            addr,
            Arc::from("kuv-thread-0"),
            AbortHandle::new(lp.remote(), Token(1), Arc::new(Mutex::new(None))),
            Completion::new(),
        );
        (ctx, in_tx, out_rx, lp)
    }

    #[test]
    fn test_streams_move_bytes() {
        let (mut ctx, in_tx, out_rx, _lp) = context();
        in_tx.write(b"ping").unwrap();
        in_tx.complete(None);

        let mut got = Vec::new();
        ctx.input().read_to_end(&mut got).unwrap();
        assert_eq!(got, b"ping");

        ctx.output().write_all(b"pong").unwrap();
        ctx.finish_output();
        assert!(ctx.output().write_all(b"late").is_err());
        let mut out = vec![0u8; 8];
        let n = out_rx.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"pong");
        assert_eq!(out_rx.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_write_after_transport_reset_fails() {
        let (mut ctx, _in_tx, out_rx, _lp) = context();
        out_rx.complete(Some(UvError::ConnectionReset));
        let err = ctx.output().write_all(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_cancel_output_discards_and_resets_later_writes() {
        let (ctx, _in_tx, out_rx, _lp) = context();
        // cancelling reaches the pipe even through an adapter's wrapper
        let mut ctx = LoggingAdapter.on_connection(ctx).unwrap();
        ctx.output().write_all(b"queued").unwrap();
        ctx.cancel_output();

        assert_eq!(out_rx.buffered(), 0);
        let mut buf = [0u8; 8];
        assert!(matches!(out_rx.read(&mut buf), Err(UvError::ConnectionAborted(_))));
        let err = ctx.output().write_all(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        // second cancel is a no-op
        ctx.cancel_output();
    }

    #[test]
    fn test_abort_first_reason_wins() {
        let (ctx, _in_tx, _out_rx, _lp) = context();
        let handle = ctx.abort_handle();
        ctx.abort("first");
        handle.abort("second");
        assert_eq!(handle.reason.lock().as_deref(), Some("first"));
    }

    #[test]
    fn test_closure_is_a_handler() {
        fn takes_handler<H: ConnectionHandler>(_h: H) {}
        takes_handler(|_ctx: &mut ConnectionContext| -> io::Result<()> { Ok(()) });
    }

    #[test]
    fn test_logging_adapter_passes_data_through() {
        let (ctx, in_tx, out_rx, _lp) = context();
        in_tx.write(b"hello").unwrap();
        in_tx.complete(None);

        let mut ctx = LoggingAdapter.on_connection(ctx).unwrap();
        let mut got = String::new();
        ctx.input().read_to_string(&mut got).unwrap();
        assert_eq!(got, "hello");

        ctx.output().write_all(b"world").unwrap();
        drop(ctx);
        let mut out = vec![0u8; 8];
        let n = out_rx.read(&mut out).unwrap();
        assert_eq!(&out[..n], b"world");
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview(b"ab\r\n"), "ab\\r\\n");
        let long = vec![b'x'; 40];
        assert!(preview(&long).ends_with("..."));
    }
}
