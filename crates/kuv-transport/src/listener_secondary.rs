//! Secondary listener
//!
//! Runs on every transport thread but the first. It never binds the
//! public endpoint: it connects to the primary's internal pipe, sends the
//! handshake, waits for the primary to echo it back, and from then on
//! receives accepted sockets over the pipe.
//!
//! Each received socket arrives as one marker byte plus one descriptor.
//! The acknowledgement and the first sockets can land in the same read, so
//! every read goes through `recv_fds`.

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kuv_core::{Completion, Result, UvError};
use kuv_loop::listen::connect_pipe;
use kuv_loop::sys::recv_fds;
use kuv_loop::{EventLoop, Handle, HandleKind, Interest, Ready, Token};
use mio::event::Source;
use mio::net::{TcpStream, UnixStream};
use nix::errno::Errno;
use tracing::{debug, error, warn};

use crate::handler::ConnectionHandler;
use crate::listener::ListenerContext;
use crate::listener_primary::DISPATCH_MARKER;
use crate::options::{ListenOptions, TransportOptions};
use crate::thread::TransportThread;

/// Longest wait for the primary's acknowledgement
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

enum Phase {
    /// Acknowledgement bytes received so far
    AwaitAck(Vec<u8>),
    Ready,
}

/// The secondary's end of the internal pipe
struct SecondaryPipe {
    stream: UnixStream,
    phase: Phase,
    handshake: Vec<u8>,
    context: ListenerContext,
    admitted: Completion<Result<()>>,
}

impl SecondaryPipe {
    /// Drain the pipe. `Err` means the pipe is unusable and must close.
    fn pump(&mut self, lp: &mut EventLoop) -> Result<()> {
        let mut buf = [0u8; 256];
        loop {
            let mut fds = Vec::new();
            let n = match recv_fds(self.stream.as_raw_fd(), &mut buf, &mut fds) {
                Ok(n) => n,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(errno) => return Err(UvError::os("pipe_read", errno)),
            };
            if n == 0 {
                return Err(UvError::HandshakeFailed(match self.phase {
                    Phase::AwaitAck(_) => "primary closed the pipe before acknowledging".into(),
                    Phase::Ready => "primary closed the pipe".into(),
                }));
            }

            let mut data = &buf[..n];
            if let Phase::AwaitAck(received) = &mut self.phase {
                let take = (self.handshake.len() - received.len()).min(data.len());
                received.extend_from_slice(&data[..take]);
                data = &data[take..];
                if !self.handshake.starts_with(received.as_slice()) {
                    return Err(UvError::HandshakeFailed("acknowledgement mismatch".into()));
                }
                if received.len() < self.handshake.len() {
                    if !fds.is_empty() {
                        return Err(UvError::HandshakeFailed(
                            "handles received before acknowledgement".into(),
                        ));
                    }
                    continue;
                }
                self.phase = Phase::Ready;
                self.admitted.complete(Ok(()));
                debug!(loop_name = lp.name(), "secondary listener admitted by primary");
            }

            self.accept_handles(lp, data, fds);
        }
    }

    fn accept_handles(&mut self, lp: &mut EventLoop, markers: &[u8], fds: Vec<OwnedFd>) {
        if markers.len() != fds.len() || markers.iter().any(|b| *b != DISPATCH_MARKER) {
            warn!(
                loop_name = lp.name(),
                markers = markers.len(),
                handles = fds.len(),
                "unexpected framing on internal pipe"
            );
        }
        for fd in fds {
            let stream = std::net::TcpStream::from(fd);
            if let Err(e) = stream.set_nonblocking(true) {
                warn!(error = %e, "dropping dispatched socket");
                continue;
            }
            self.context
                .handle_connection(lp, TcpStream::from_std(stream));
        }
    }
}

impl Handle for SecondaryPipe {
    fn kind(&self) -> HandleKind {
        HandleKind::Pipe
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn interest(&self) -> Option<Interest> {
        Some(Interest::READABLE)
    }

    fn on_ready(&mut self, lp: &mut EventLoop, token: Token, _ready: Ready) {
        if let Err(err) = self.pump(lp) {
            match self.phase {
                Phase::AwaitAck(_) => error!(loop_name = lp.name(), error = %err, "handshake with primary failed"),
                Phase::Ready => error!(loop_name = lp.name(), error = %err, "lost internal pipe to primary"),
            }
            self.admitted.complete(Err(err));
            lp.close(token);
        }
    }

    fn on_close(&mut self, _lp: &mut EventLoop, _token: Token) {
        self.admitted
            .complete(Err(UvError::HandshakeFailed("pipe closed".into())));
    }
}

/// Listener on every transport thread after the first
pub struct ListenerSecondary {
    options: Arc<TransportOptions>,
    handler: Arc<dyn ConnectionHandler>,
    bound: Option<(Arc<TransportThread>, Token)>,
}

impl ListenerSecondary {
    pub fn new(options: Arc<TransportOptions>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            options,
            handler,
            bound: None,
        }
    }

    /// Connect to the primary at `pipe_path` and wait until it is admitted
    pub fn start(
        &mut self,
        pipe_path: &Path,
        handshake: &[u8],
        listen: Arc<ListenOptions>,
        thread: Arc<TransportThread>,
    ) -> Result<()> {
        if handshake.is_empty() {
            return Err(UvError::InvalidConfig("handshake must not be empty"));
        }
        if self.bound.is_some() {
            return Err(UvError::InvalidConfig("secondary listener already started"));
        }

        let context = ListenerContext {
            options: self.options.clone(),
            listen,
            handler: self.handler.clone(),
        };
        let path = pipe_path.to_path_buf();
        let handshake = handshake.to_vec();
        let admitted: Completion<Result<()>> = Completion::new();
        let pending = admitted.clone();

        let token = thread.call(move |lp| {
            let stream = connect_pipe(&path, &handshake)?;
            lp.insert(SecondaryPipe {
                stream,
                phase: Phase::AwaitAck(Vec::with_capacity(handshake.len())),
                handshake,
                context,
                admitted: pending,
            })
        })?;

        match admitted.wait_timeout(HANDSHAKE_TIMEOUT) {
            Some(Ok(())) => {
                self.bound = Some((thread, token));
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => {
                let _ = thread.post(move |lp| lp.close(token));
                Err(UvError::HandshakeFailed(
                    "timed out waiting for acknowledgement".into(),
                ))
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.bound.is_some()
    }

    /// Close the pipe. Connections already received keep running.
    pub fn dispose(&mut self) -> Result<()> {
        match self.bound.take() {
            Some((thread, token)) => thread.call(move |lp| {
                lp.close(token);
                Ok(())
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener as StdUnixListener;

    use crate::handler::ConnectionContext;
    use kuv_loop::sys::send_fd;

    fn secondary() -> (ListenerSecondary, Arc<TransportThread>) {
        let thread = Arc::new(TransportThread::new(1));
        thread.start().unwrap();
        let handler: Arc<dyn ConnectionHandler> = Arc::new(|ctx: &mut ConnectionContext| {
            let name = ctx.thread_name().to_string();
            ctx.output().write_all(name.as_bytes())
        });
        (
            ListenerSecondary::new(Arc::new(TransportOptions::new()), handler),
            thread,
        )
    }

    fn pipe_path(tag: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("kuv_secondary_{tag}_{}", std::process::id()));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn listen() -> Arc<ListenOptions> {
        Arc::new(ListenOptions::new("127.0.0.1:0".parse().unwrap()))
    }

    #[test]
    fn test_ack_then_handles_in_one_read() {
        let path = pipe_path("merged");
        let fake_primary = StdUnixListener::bind(&path).unwrap();
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp.local_addr().unwrap();

        let primary = std::thread::spawn(move || {
            let (mut pipe, _) = fake_primary.accept().unwrap();
            let mut hello = [0u8; 4];
            pipe.read_exact(&mut hello).unwrap();
            assert_eq!(&hello, b"ping");

            let mut client = std::net::TcpStream::connect(addr).unwrap();
            let (server, _) = tcp.accept().unwrap();
            // ack and the first handle in a single message
            let mut payload = b"ping".to_vec();
            payload.push(DISPATCH_MARKER);
            send_fd(pipe.as_raw_fd(), &payload, server.as_raw_fd()).unwrap();
            drop(server);

            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut got = String::new();
            client.read_to_string(&mut got).unwrap();
            (got, pipe)
        });

        let (mut listener, thread) = secondary();
        listener.start(&path, b"ping", listen(), thread.clone()).unwrap();
        assert!(listener.is_started());

        let (got, _pipe) = primary.join().unwrap();
        assert_eq!(got, "kuv-thread-1");

        listener.dispose().unwrap();
        thread.stop(Duration::from_secs(5));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_bad_ack_fails_start() {
        let path = pipe_path("badack");
        let fake_primary = StdUnixListener::bind(&path).unwrap();
        let primary = std::thread::spawn(move || {
            let (mut pipe, _) = fake_primary.accept().unwrap();
            let mut hello = [0u8; 4];
            pipe.read_exact(&mut hello).unwrap();
            pipe.write_all(b"pong").unwrap();
            pipe
        });

        let (mut listener, thread) = secondary();
        let err = listener
            .start(&path, b"ping", listen(), thread.clone())
            .unwrap_err();
        assert!(matches!(err, UvError::HandshakeFailed(_)));
        assert!(!listener.is_started());

        drop(primary.join().unwrap());
        thread.stop(Duration::from_secs(5));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_primary_closing_fails_start() {
        let path = pipe_path("closed");
        let fake_primary = StdUnixListener::bind(&path).unwrap();
        let primary = std::thread::spawn(move || {
            let (mut pipe, _) = fake_primary.accept().unwrap();
            let mut hello = [0u8; 4];
            pipe.read_exact(&mut hello).unwrap();
        });

        let (mut listener, thread) = secondary();
        let err = listener
            .start(&path, b"ping", listen(), thread.clone())
            .unwrap_err();
        assert!(matches!(err, UvError::HandshakeFailed(_)));

        primary.join().unwrap();
        thread.stop(Duration::from_secs(5));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_losing_primary_after_admission_closes_pipe() {
        let path = pipe_path("lost");
        let fake_primary = StdUnixListener::bind(&path).unwrap();
        let primary = std::thread::spawn(move || {
            let (mut pipe, _) = fake_primary.accept().unwrap();
            let mut hello = [0u8; 4];
            pipe.read_exact(&mut hello).unwrap();
            pipe.write_all(b"ping").unwrap();
            pipe
        });

        let (mut listener, thread) = secondary();
        listener.start(&path, b"ping", listen(), thread.clone()).unwrap();
        let token = listener.bound.as_ref().unwrap().1;
        drop(primary.join().unwrap());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while thread.call(move |lp| Ok(lp.contains(token))).unwrap() {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        }
        listener.dispose().unwrap();
        thread.stop(Duration::from_secs(5));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_pipe_fails_start() {
        let path = pipe_path("missing");
        let (mut listener, thread) = secondary();
        assert!(listener.start(&path, b"ping", listen(), thread.clone()).is_err());
        thread.stop(Duration::from_secs(5));
    }
}
