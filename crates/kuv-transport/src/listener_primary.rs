//! Primary listener
//!
//! Owns the public endpoint and an internal Unix-socket pipe. Secondaries
//! connect to the pipe and send the handshake; the primary echoes it back
//! as an acknowledgement and adds the pipe to its dispatch list.
//!
//! Accepted sockets go round-robin over `[self, secondary 1, ...]`. A
//! socket sent to a secondary travels as `SCM_RIGHTS` next to one marker
//! byte; the primary closes its own copy right after.
//!
//! Pipe clients that send anything but the handshake are logged and
//! closed. They never enter the dispatch list.
//!
//! All dispatch state lives on the primary's loop thread. Readers on other
//! threads see a copy, republished after every change.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use kuv_core::{Result, UvError};
use kuv_loop::listen::bind_pipe;
use kuv_loop::sys::{recv_fds, send_fd};
use kuv_loop::{EventLoop, Handle, HandleKind, Interest, Ready, Token};
use mio::event::Source;
use mio::net::{TcpStream, UnixListener, UnixStream};
use nix::errno::Errno;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::handler::ConnectionHandler;
use crate::listener::{start_acceptor, Dispatch, ListenerContext};
use crate::options::{ListenOptions, TransportOptions};
use crate::thread::TransportThread;

/// Payload byte sent with every dispatched socket
pub(crate) const DISPATCH_MARKER: u8 = b'D';

// ── Dispatch list ───────────────────────────────────────────────────

/// Where the next accepted socket goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchTarget {
    /// Handled on the primary's own thread
    Local,
    /// Sent to the secondary behind this pipe
    Secondary(usize),
}

/// Read-only copy of the dispatch list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSnapshot {
    /// `Local` first, then admitted secondaries in admission order
    pub targets: Vec<DispatchTarget>,
    /// Index of the target the next socket goes to
    pub next: usize,
    /// Sockets dispatched so far
    pub dispatched: u64,
}

impl DispatchSnapshot {
    pub fn secondary_count(&self) -> usize {
        self.targets.len().saturating_sub(1)
    }
}

/// Round-robin over `[Local, secondaries...]`
#[derive(Debug, Clone)]
pub struct DispatchState {
    targets: Vec<DispatchTarget>,
    next: usize,
    dispatched: u64,
}

impl Default for DispatchState {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchState {
    pub fn new() -> Self {
        Self {
            targets: vec![DispatchTarget::Local],
            next: 0,
            dispatched: 0,
        }
    }

    /// Append a secondary; re-adding one is a no-op
    pub fn add_secondary(&mut self, id: usize) {
        let target = DispatchTarget::Secondary(id);
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
    }

    /// Remove a secondary, keeping the rotation order of the others
    pub fn remove_secondary(&mut self, id: usize) -> bool {
        let Some(pos) = self
            .targets
            .iter()
            .position(|t| *t == DispatchTarget::Secondary(id))
        else {
            return false;
        };
        self.targets.remove(pos);
        if pos < self.next {
            self.next -= 1;
        }
        if self.next >= self.targets.len() {
            self.next = 0;
        }
        true
    }

    /// Pick the target for the next socket and advance
    pub fn next_target(&mut self) -> DispatchTarget {
        // `Local` is never removed, so the list is never empty
        let target = self.targets[self.next];
        self.next = (self.next + 1) % self.targets.len();
        self.dispatched += 1;
        target
    }

    pub fn secondary_count(&self) -> usize {
        self.targets.len() - 1
    }

    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            targets: self.targets.clone(),
            next: self.next,
            dispatched: self.dispatched,
        }
    }
}

// ── Loop-thread state ───────────────────────────────────────────────

struct PrimaryState {
    dispatch: DispatchState,
    /// Admitted secondaries: dispatch id -> pipe descriptor
    pipes: HashMap<usize, RawFd>,
    /// Every open pipe connection, admitted or not
    connections: HashSet<Token>,
    published: Arc<Mutex<DispatchSnapshot>>,
}

type SharedState = Rc<RefCell<PrimaryState>>;

impl PrimaryState {
    fn new(published: Arc<Mutex<DispatchSnapshot>>) -> Self {
        let state = Self {
            dispatch: DispatchState::new(),
            pipes: HashMap::new(),
            connections: HashSet::new(),
            published,
        };
        state.publish();
        state
    }

    fn publish(&self) {
        *self.published.lock() = self.dispatch.snapshot();
    }

    fn admit(&mut self, token: Token, fd: RawFd) {
        self.dispatch.add_secondary(token.0);
        self.pipes.insert(token.0, fd);
        self.publish();
    }

    fn remove(&mut self, token: Token) {
        self.connections.remove(&token);
        if self.pipes.remove(&token.0).is_some() {
            self.dispatch.remove_secondary(token.0);
            self.publish();
        }
    }
}

struct PrimaryDispatch {
    context: ListenerContext,
    state: SharedState,
}

impl Dispatch for PrimaryDispatch {
    fn dispatch(&mut self, lp: &mut EventLoop, stream: TcpStream) {
        let (target, fd) = {
            let mut state = self.state.borrow_mut();
            let target = state.dispatch.next_target();
            state.publish();
            let fd = match target {
                DispatchTarget::Secondary(id) => state.pipes.get(&id).copied(),
                DispatchTarget::Local => None,
            };
            (target, fd)
        };

        let (DispatchTarget::Secondary(id), Some(fd)) = (target, fd) else {
            return self.context.handle_connection(lp, stream);
        };

        match send_fd(fd, &[DISPATCH_MARKER], stream.as_raw_fd()) {
            Ok(_) => {
                // our copy closes here; the secondary owns the socket now
                trace!(loop_name = lp.name(), secondary = id, "connection dispatched");
            }
            Err(Errno::EAGAIN) => {
                debug!(secondary = id, "secondary pipe full; handling connection locally");
                self.context.handle_connection(lp, stream);
            }
            Err(errno) => {
                error!(secondary = id, error = %errno, "failed to dispatch connection; dropping secondary");
                self.state.borrow_mut().remove(Token(id));
                lp.close(Token(id));
                self.context.handle_connection(lp, stream);
            }
        }
    }
}

// ── Pipe handles ────────────────────────────────────────────────────

/// Accepts secondaries on the internal pipe
struct PipeServer {
    listener: UnixListener,
    state: SharedState,
    handshake: Rc<[u8]>,
}

impl Handle for PipeServer {
    fn kind(&self) -> HandleKind {
        HandleKind::PipeListener
    }

    fn source(&mut self) -> &mut dyn Source {
        &mut self.listener
    }

    fn interest(&self) -> Option<Interest> {
        Some(Interest::READABLE)
    }

    fn on_ready(&mut self, lp: &mut EventLoop, _token: Token, _ready: Ready) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let pipe = PipeConnection {
                        stream,
                        phase: Phase::Handshake(Vec::new()),
                        state: self.state.clone(),
                        handshake: self.handshake.clone(),
                    };
                    match lp.insert(pipe) {
                        Ok(token) => {
                            self.state.borrow_mut().connections.insert(token);
                            debug!(token = token.0, "internal pipe connected, awaiting handshake");
                        }
                        Err(err) => error!(error = %err, "failed to register internal pipe"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "internal pipe accept failed");
                    return;
                }
            }
        }
    }

    fn on_close(&mut self, lp: &mut EventLoop, _token: Token) {
        let open: Vec<Token> = self.state.borrow().connections.iter().copied().collect();
        for token in open {
            lp.close(token);
        }
    }
}

enum Phase {
    /// Handshake bytes received so far
    Handshake(Vec<u8>),
    Admitted,
}

/// One client of the internal pipe
struct PipeConnection {
    stream: UnixStream,
    phase: Phase,
    state: SharedState,
    handshake: Rc<[u8]>,
}

impl PipeConnection {
    /// Drain the pipe. Returns false when it should be closed.
    fn pump(&mut self, token: Token) -> bool {
        let mut buf = [0u8; 64];
        loop {
            let mut fds = Vec::new();
            let n = match recv_fds(self.stream.as_raw_fd(), &mut buf, &mut fds) {
                Ok(n) => n,
                Err(Errno::EAGAIN) => return true,
                Err(errno) => {
                    error!(token = token.0, error = %errno, "internal pipe read failed");
                    return false;
                }
            };
            if n == 0 {
                match self.phase {
                    Phase::Handshake(_) => {
                        warn!(token = token.0, "internal pipe closed before completing the handshake")
                    }
                    Phase::Admitted => debug!(token = token.0, "secondary disconnected"),
                }
                return false;
            }
            if !fds.is_empty() {
                error!(token = token.0, "unexpected handles received on internal pipe");
                return false;
            }

            let complete = match &mut self.phase {
                Phase::Admitted => {
                    error!(token = token.0, "unexpected data from secondary on internal pipe");
                    return false;
                }
                Phase::Handshake(received) => {
                    received.extend_from_slice(&buf[..n]);
                    if !self.handshake.starts_with(received.as_slice()) {
                        error!(token = token.0, "internal pipe opened by an unknown client; ignoring it");
                        return false;
                    }
                    received.len() == self.handshake.len()
                }
            };
            if complete && !self.admit(token) {
                return false;
            }
        }
    }

    /// Join the dispatch list, then acknowledge the handshake. The
    /// secondary is eligible by the time it reads the acknowledgement.
    fn admit(&mut self, token: Token) -> bool {
        self.state.borrow_mut().admit(token, self.stream.as_raw_fd());
        let acked = match self.stream.write(&self.handshake) {
            Ok(n) if n == self.handshake.len() => true,
            Ok(n) => {
                error!(token = token.0, written = n, "short write acknowledging secondary");
                false
            }
            Err(e) => {
                error!(token = token.0, error = %e, "failed to acknowledge secondary");
                false
            }
        };
        if !acked {
            self.state.borrow_mut().remove(token);
            return false;
        }
        self.phase = Phase::Admitted;
        debug!(token = token.0, "secondary listener admitted");
        true
    }
}

impl Handle for PipeConnection {
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
        if !self.pump(token) {
            lp.close(token);
        }
    }

    fn on_close(&mut self, _lp: &mut EventLoop, token: Token) {
        self.state.borrow_mut().remove(token);
    }
}

// ── Public listener ─────────────────────────────────────────────────

struct Bound {
    thread: Arc<TransportThread>,
    acceptor: Token,
    pipe_server: Token,
    pipe_path: PathBuf,
    local_addr: SocketAddr,
}

/// Listener on the first transport thread
pub struct ListenerPrimary {
    options: Arc<TransportOptions>,
    handler: Arc<dyn ConnectionHandler>,
    published: Arc<Mutex<DispatchSnapshot>>,
    bound: Option<Bound>,
}

impl ListenerPrimary {
    pub fn new(options: Arc<TransportOptions>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            options,
            handler,
            published: Arc::new(Mutex::new(DispatchState::new().snapshot())),
            bound: None,
        }
    }

    /// Bind the public endpoint and the internal pipe on `thread`
    pub fn start(
        &mut self,
        pipe_path: &Path,
        handshake: &[u8],
        listen: Arc<ListenOptions>,
        thread: Arc<TransportThread>,
    ) -> Result<SocketAddr> {
        if handshake.is_empty() {
            return Err(UvError::InvalidConfig("handshake must not be empty"));
        }
        if self.bound.is_some() {
            return Err(UvError::InvalidConfig("primary listener already started"));
        }

        let endpoint = listen.endpoint();
        let backlog = self.options.listen_backlog;
        let context = ListenerContext {
            options: self.options.clone(),
            listen,
            handler: self.handler.clone(),
        };
        let path = pipe_path.to_path_buf();
        let handshake = handshake.to_vec();
        let published = self.published.clone();

        let (acceptor, pipe_server, local_addr) = thread.call(move |lp| {
            let state = Rc::new(RefCell::new(PrimaryState::new(published)));
            let dispatch = PrimaryDispatch {
                context,
                state: state.clone(),
            };
            let (acceptor, addr) = start_acceptor(lp, endpoint, backlog, dispatch)?;

            let server = bind_pipe(&path).and_then(|listener| {
                lp.insert(PipeServer {
                    listener,
                    state,
                    handshake: Rc::from(handshake),
                })
            });
            match server {
                Ok(server) => {
                    debug!(loop_name = lp.name(), path = %path.display(), "internal pipe listening");
                    Ok((acceptor, server, addr))
                }
                Err(err) => {
                    lp.close(acceptor);
                    let _ = std::fs::remove_file(&path);
                    Err(err)
                }
            }
        })?;

        self.bound = Some(Bound {
            thread,
            acceptor,
            pipe_server,
            pipe_path: pipe_path.to_path_buf(),
            local_addr,
        });
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound.as_ref().map(|b| b.local_addr)
    }

    pub fn pipe_path(&self) -> Option<&Path> {
        self.bound.as_ref().map(|b| b.pipe_path.as_path())
    }

    /// Copy of the dispatch list as of the last change
    pub fn dispatch_snapshot(&self) -> DispatchSnapshot {
        self.published.lock().clone()
    }

    pub fn secondary_count(&self) -> usize {
        self.published.lock().secondary_count()
    }

    /// Stop accepting and close every pipe; remove the pipe path
    pub fn dispose(&mut self) -> Result<()> {
        let Some(bound) = self.bound.take() else {
            return Ok(());
        };
        let (acceptor, pipe_server) = (bound.acceptor, bound.pipe_server);
        let result = bound.thread.call(move |lp| {
            lp.close(acceptor);
            lp.close(pipe_server);
            Ok(())
        });
        if let Err(e) = std::fs::remove_file(&bound.pipe_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %bound.pipe_path.display(), error = %e, "failed to remove internal pipe");
            }
        }
        *self.published.lock() = DispatchState::new().snapshot();
        result
    }
}

impl Drop for ListenerPrimary {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            debug!(error = %err, "primary listener disposed after its thread stopped");
        }
    }
}
