//! Listener plumbing shared by every listener kind
//!
//! An [`Acceptor`] owns the public TCP listener on one loop and hands each
//! accepted socket to a [`Dispatch`] policy: handle it on this loop, or
//! send it to another thread. [`ListenerContext`] turns a socket into a
//! running connection plus a handler thread.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use kuv_core::{Result, UvError};
use kuv_loop::listen::bind_tcp;
use kuv_loop::{EventLoop, Handle, HandleKind, Interest, Ready, Token};
use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, error, warn};

use crate::connection::Connection;
use crate::handler::{ConnectionAdapter, ConnectionContext, ConnectionHandler};
use crate::options::{ListenOptions, TransportOptions};
use crate::thread::TransportThread;

/// What every listener on a thread needs to run connections
#[derive(Clone)]
pub(crate) struct ListenerContext {
    pub options: Arc<TransportOptions>,
    pub listen: Arc<ListenOptions>,
    pub handler: Arc<dyn ConnectionHandler>,
}

impl ListenerContext {
    /// Start a connection for `stream` on this loop and run the handler
    pub(crate) fn handle_connection(&self, lp: &mut EventLoop, stream: TcpStream) {
        let (connection, parts) = match Connection::new(stream, &self.options) {
            Ok(pair) => pair,
            Err(err) => {
                // usually the peer reset before we got to it
                debug!(loop_name = lp.name(), error = %err, "dropping accepted socket");
                return;
            }
        };
        let id = parts.id;
        let (token, closed) = match connection.start(lp) {
            Ok(started) => started,
            Err(err) => {
                error!(connection_id = %id, error = %err, "failed to start connection");
                return;
            }
        };
        let ctx = parts.into_context(lp, token, closed);
        debug!(
            connection_id = %id,
            remote = %ctx.remote_addr(),
            loop_name = lp.name(),
            "connection accepted"
        );

        let abort = ctx.abort_handle();
        let handler = self.handler.clone();
        let adapters = self.listen.adapters().to_vec();
        let spawned = thread::Builder::new()
            .name(format!("kuv-conn-{id}"))
            .spawn(move || run_handler(handler, adapters, ctx));
        if let Err(err) = spawned {
            error!(connection_id = %id, error = %err, "failed to spawn connection handler");
            abort.abort("failed to start connection handler");
        }
    }
}

fn run_handler(
    handler: Arc<dyn ConnectionHandler>,
    adapters: Vec<Arc<dyn ConnectionAdapter>>,
    mut ctx: ConnectionContext,
) {
    let id = ctx.id();
    let abort = ctx.abort_handle();

    for adapter in &adapters {
        ctx = match adapter.on_connection(ctx) {
            Ok(ctx) => ctx,
            Err(err) => {
                error!(connection_id = %id, adapter = adapter.name(), error = %err, "connection adapter failed");
                abort.abort(format!("adapter {} failed", adapter.name()));
                return;
            }
        };
    }

    match handler.on_connection(&mut ctx) {
        Ok(()) => debug!(connection_id = %id, "handler finished"),
        Err(err) => {
            error!(connection_id = %id, error = %err, "unhandled error while processing connection");
            // abort before the streams drop so the peer never sees a clean FIN
            abort.abort(format!("handler failed: {err}"));
        }
    }
    drop(ctx);
}

/// Where an accepted socket goes
pub(crate) trait Dispatch {
    fn dispatch(&mut self, lp: &mut EventLoop, stream: TcpStream);
}

impl Dispatch for ListenerContext {
    fn dispatch(&mut self, lp: &mut EventLoop, stream: TcpStream) {
        self.handle_connection(lp, stream);
    }
}

/// The public TCP listener
pub(crate) struct Acceptor<D> {
    listener: TcpListener,
    dispatch: D,
}

impl<D: Dispatch> Acceptor<D> {
    pub(crate) fn new(listener: TcpListener, dispatch: D) -> Self {
        Self { listener, dispatch }
    }
}

impl<D: Dispatch> Handle for Acceptor<D> {
    fn kind(&self) -> HandleKind {
        HandleKind::TcpListener
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
                Ok((stream, _)) => self.dispatch.dispatch(lp, stream),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    // EMFILE and friends: try again on the next readiness
                    warn!(loop_name = lp.name(), error = %e, "accept failed");
                    return;
                }
            }
        }
    }
}

/// Bind `endpoint` and register an acceptor for it on the current loop
pub(crate) fn start_acceptor<D: Dispatch + 'static>(
    lp: &mut EventLoop,
    endpoint: SocketAddr,
    backlog: i32,
    dispatch: D,
) -> Result<(Token, SocketAddr)> {
    let listener = bind_tcp(endpoint, backlog)?;
    let addr = listener
        .local_addr()
        .map_err(|e| UvError::from_io("getsockname", &e))?;
    let token = lp.insert(Acceptor::new(listener, dispatch))?;
    debug!(loop_name = lp.name(), %addr, "listening");
    Ok((token, addr))
}

/// Listener used when the transport runs a single thread: accepts and
/// handles every connection on that thread.
pub struct Listener {
    options: Arc<TransportOptions>,
    handler: Arc<dyn ConnectionHandler>,
    bound: Option<(Arc<TransportThread>, Token)>,
    local_addr: Option<SocketAddr>,
}

impl Listener {
    pub fn new(options: Arc<TransportOptions>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            options,
            handler,
            bound: None,
            local_addr: None,
        }
    }

    /// Bind the endpoint on `thread` and start accepting
    pub fn start(&mut self, listen: Arc<ListenOptions>, thread: Arc<TransportThread>) -> Result<SocketAddr> {
        let endpoint = listen.endpoint();
        let backlog = self.options.listen_backlog;
        let context = ListenerContext {
            options: self.options.clone(),
            listen,
            handler: self.handler.clone(),
        };
        let (token, addr) =
            thread.call(move |lp| start_acceptor(lp, endpoint, backlog, context))?;
        self.bound = Some((thread, token));
        self.local_addr = Some(addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting. Connections already accepted keep running.
    pub fn dispose(&mut self) -> Result<()> {
        self.local_addr = None;
        match self.bound.take() {
            Some((thread, token)) => thread.call(move |lp| {
                lp.close(token);
                Ok(())
            }),
            None => Ok(()),
        }
    }
}
