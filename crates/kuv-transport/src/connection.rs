//! Per-socket connection
//!
//! A `Connection` lives on its loop thread and pumps bytes between a TCP
//! socket and two pipes:
//!
//! ```text
//!   socket ──read──► input pipe ──► application (InputStream)
//!   socket ◄─write── output pipe ◄── application (OutputStream)
//! ```
//!
//! Backpressure: when the input pipe reaches its pause threshold the
//! socket stops reading; it restarts once the application has drained the
//! pipe to the resume threshold. Output works the same way in reverse: the
//! application's `write_all` blocks while the output pipe is full.
//!
//! Pipe wake hooks run on whatever thread touched the pipe; they only post
//! a notify to the loop. The loop drops notifies for closed handles.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kuv_core::{
    is_connection_reset, pipe, Completion, ConnectionEvent, ConnectionId, ConnectionState,
    PipeReader, PipeWriter, Result, TryRead, UvError,
};
use kuv_core::pipe::WakeHook;
use kuv_loop::{
    EventLoop, Handle, HandleKind, Interest, ReadStatus, Ready, StreamHandle, Token, WriteStatus,
};
use mio::event::Source;
use mio::net::TcpStream;
use nix::errno::Errno;
use parking_lot::Mutex;
use socket2::SockRef;
use tracing::warn;

use crate::handler::{AbortHandle, ConnectionContext, InputStream, OutputStream};
use crate::options::TransportOptions;
use crate::trace;

/// Application side of a connection that has not been started yet
pub(crate) struct ConnectionParts {
    pub id: ConnectionId,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    input: PipeReader,
    output: PipeWriter,
    reason: Arc<Mutex<Option<String>>>,
}

impl ConnectionParts {
    /// Build the application's view once the connection runs on `lp`
    pub(crate) fn into_context(
        self,
        lp: &EventLoop,
        token: Token,
        closed: Completion<Result<()>>,
    ) -> ConnectionContext {
        let output_cancel = self.output.canceller();
        ConnectionContext::new(
            Box::new(InputStream::new(self.input)),
            Box::new(OutputStream::new(self.output)),
            output_cancel,
            self.id,
            self.local_addr,
            self.remote_addr,
            Arc::from(lp.name()),
            AbortHandle::new(lp.remote(), token, self.reason),
            closed,
        )
    }
}

pub(crate) struct Connection {
    id: ConnectionId,
    stream: StreamHandle<TcpStream>,
    state: ConnectionState,
    /// Loop writes what it reads from the socket
    input: PipeWriter,
    /// Loop reads what the application wrote
    output: PipeReader,
    read_buf: Box<[u8]>,
    /// Part of an output chunk the socket has not accepted yet
    pending: Option<Bytes>,
    write_chunk: usize,
    input_paused: bool,
    error: Option<UvError>,
    abort_reason: Arc<Mutex<Option<String>>>,
    closed: Completion<Result<()>>,
}

impl Connection {
    /// Wrap an accepted socket. Nothing is read until `start`.
    pub(crate) fn new(stream: TcpStream, options: &TransportOptions) -> Result<(Self, ConnectionParts)> {
        let local_addr = stream
            .local_addr()
            .map_err(|e| UvError::from_io("getsockname", &e))?;
        let remote_addr = stream
            .peer_addr()
            .map_err(|e| UvError::from_io("getpeername", &e))?;
        let id = ConnectionId::next();
        if options.no_delay {
            if let Err(error) = stream.set_nodelay(true) {
                warn!(connection_id = %id, %error, "failed to set TCP_NODELAY");
            }
        }

        let (input_writer, input_reader) = pipe(options.input);
        let (output_writer, output_reader) = pipe(options.output);
        let reason = Arc::new(Mutex::new(None));

        let connection = Self {
            id,
            stream: StreamHandle::new(stream),
            state: ConnectionState::Open,
            input: input_writer,
            output: output_reader,
            read_buf: vec![0u8; options.read_chunk_size].into_boxed_slice(),
            pending: None,
            write_chunk: options.write_chunk_size,
            input_paused: false,
            error: None,
            abort_reason: reason.clone(),
            closed: Completion::new(),
        };
        let parts = ConnectionParts {
            id,
            local_addr,
            remote_addr,
            input: input_reader,
            output: output_writer,
            reason,
        };
        Ok((connection, parts))
    }

    /// Register on `lp` and start reading. The completion resolves once
    /// the socket is closed.
    pub(crate) fn start(self, lp: &mut EventLoop) -> Result<(Token, Completion<Result<()>>)> {
        let closed = self.closed.clone();
        let remote = lp.remote();
        let mut connection = self;
        let token = lp.insert_with(move |token| {
            let hook: WakeHook = Arc::new(move || {
                let _ = remote.post(move |lp| {
                    lp.notify(token);
                });
            });
            connection.input.on_wake(hook.clone());
            connection.output.on_wake(hook);
            connection.stream.read_start();
            connection
        })?;
        // arms the output pipe so the application's first write wakes us
        lp.notify(token);
        Ok((token, closed))
    }

    fn apply(&mut self, event: ConnectionEvent) {
        self.state = self.state.on(event);
    }

    // ── Read path ───────────────────────────────────────────────────

    fn do_read(&mut self) {
        while self.stream.is_reading() {
            let status = self.stream.read_into(&mut self.read_buf);
            if !self.on_read(status) {
                break;
            }
        }
    }

    /// Handle one native read. Returns true to keep reading.
    fn on_read(&mut self, status: ReadStatus) -> bool {
        match status {
            ReadStatus::Data(n) => {
                trace::connection_read(&self.id, n);
                match self.input.write(&self.read_buf[..n]) {
                    Ok(flush) if flush.is_completed => {
                        // application stopped reading; drop the rest
                        self.stream.read_stop();
                        self.apply(ConnectionEvent::InputCompleted);
                        false
                    }
                    Ok(flush) if flush.is_paused => {
                        trace::connection_pause(&self.id);
                        self.input_paused = true;
                        self.stream.read_stop();
                        false
                    }
                    Ok(_) => true,
                    Err(_) => {
                        self.stream.read_stop();
                        false
                    }
                }
            }
            // would-block: nothing arrived, the stream is still open
            ReadStatus::Empty => {
                self.apply(ConnectionEvent::ReadEmpty);
                false
            }
            ReadStatus::Eof => {
                trace::connection_read_fin(&self.id);
                self.stream.read_stop();
                self.input.complete(None);
                self.apply(ConnectionEvent::ReadEof);
                false
            }
            ReadStatus::Error(errno) => {
                let error = self.classify("read", errno);
                self.fail(error);
                false
            }
        }
    }

    /// Restart reading if the application drained the input far enough.
    /// Never restarts a read side that has already ended.
    fn try_resume(&mut self) -> bool {
        if !self.input_paused || !self.state.is_read_open() || self.input.is_paused() {
            return false;
        }
        self.input_paused = false;
        trace::connection_resume(&self.id);
        self.stream.read_start();
        true
    }

    /// The application dropped its reader
    fn check_input_completed(&mut self) {
        if self.state.is_read_open() && self.input.is_reader_completed() {
            self.stream.read_stop();
            self.input_paused = false;
            self.apply(ConnectionEvent::InputCompleted);
        }
    }

    // ── Write path ──────────────────────────────────────────────────

    fn do_write(&mut self) {
        while self.state.is_write_open() {
            let chunk = match self.pending.take() {
                Some(chunk) => chunk,
                None => match self.output.try_read(self.write_chunk) {
                    TryRead::Data(chunk) => chunk,
                    TryRead::Pending => {
                        self.stream.set_want_write(false);
                        return;
                    }
                    TryRead::Completed(None) => {
                        self.shutdown_write("application completed output");
                        return;
                    }
                    TryRead::Completed(Some(error)) => {
                        // output cancelled mid-write: no FIN, close the socket
                        self.fail(error);
                        return;
                    }
                },
            };

            match self.stream.try_write(&chunk) {
                WriteStatus::Written(n) if n > 0 => {
                    trace::connection_write(&self.id, n);
                    if n < chunk.len() {
                        self.pending = Some(chunk.slice(n..));
                    }
                }
                WriteStatus::Written(_) | WriteStatus::Blocked => {
                    self.pending = Some(chunk);
                    self.stream.set_want_write(true);
                    return;
                }
                WriteStatus::Error(errno) => {
                    let error = self.classify("write", errno);
                    self.fail(error);
                    return;
                }
            }
        }
    }

    /// The application cancelled its output. A write still waiting for
    /// the socket is dropped with it.
    fn check_output_cancelled(&mut self) {
        if !self.state.is_write_open() {
            return;
        }
        if let Some(error) = self.output.writer_error() {
            self.fail(error);
        }
    }

    fn shutdown_write(&mut self, reason: &str) {
        trace::connection_write_fin(&self.id, reason);
        if let Err(errno) = self.stream.shutdown_write() {
            if !is_connection_reset(errno) {
                trace::connection_error(&self.id, &UvError::os("shutdown", errno));
            }
        }
        self.apply(ConnectionEvent::WriteShutdown);
    }

    // ── Errors ──────────────────────────────────────────────────────

    fn classify(&self, op: &'static str, errno: Errno) -> UvError {
        if is_connection_reset(errno) {
            trace::connection_reset(&self.id);
            UvError::ConnectionReset
        } else {
            let error = UvError::os(op, errno);
            trace::connection_error(&self.id, &error);
            error
        }
    }

    /// Both directions are done: release the application and close
    fn fail(&mut self, error: UvError) {
        self.stream.read_stop();
        self.stream.set_want_write(false);
        self.pending = None;
        self.input.complete(Some(error.clone()));
        self.output.complete(Some(UvError::ConnectionReset));
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.apply(ConnectionEvent::Failed);
    }

    fn close_if_done(&self, lp: &mut EventLoop, token: Token) {
        if self.state.is_closed() {
            lp.close(token);
        }
    }
}

impl Handle for Connection {
    fn kind(&self) -> HandleKind {
        HandleKind::Tcp
    }

    fn source(&mut self) -> &mut dyn Source {
        self.stream.get_mut()
    }

    fn interest(&self) -> Option<Interest> {
        self.stream.interest()
    }

    fn on_ready(&mut self, lp: &mut EventLoop, token: Token, ready: Ready) {
        if ready.readable || ready.read_closed || ready.error {
            self.do_read();
        }
        if ready.writable || (ready.error && self.stream.wants_write()) {
            self.do_write();
        }
        self.close_if_done(lp, token);
    }

    fn on_notify(&mut self, lp: &mut EventLoop, token: Token) {
        self.check_input_completed();
        if self.try_resume() {
            self.do_read();
        }
        self.check_output_cancelled();
        if self.state.is_write_open() && !self.stream.wants_write() {
            self.do_write();
        }
        self.close_if_done(lp, token);
    }

    fn on_close(&mut self, _lp: &mut EventLoop, _token: Token) {
        let result = match self.abort_reason.lock().take() {
            Some(reason) => Err(UvError::ConnectionAborted(reason)),
            None if !self.state.is_closed() => Err(UvError::ConnectionAborted(
                "connection closed by the transport".into(),
            )),
            None => match self.error.take() {
                Some(error) => Err(error),
                None => Ok(()),
            },
        };

        // release an application still blocked on either pipe
        let input_error = match &result {
            Err(error) => error.clone(),
            Ok(()) => UvError::Closed,
        };
        self.input.complete(Some(input_error));
        self.output.complete(Some(UvError::ConnectionReset));
        self.pending = None;
        self.state = ConnectionState::Closed;
        if result.is_err() {
            // unsent output is dropped and the peer sees RST, not FIN
            if let Err(error) = SockRef::from(self.stream.get_ref()).set_linger(Some(Duration::ZERO)) {
                warn!(connection_id = %self.id, %error, "failed to set SO_LINGER");
            }
        }

        trace::connection_closed(&self.id, &result);
        self.closed.complete(result);
    }
}
