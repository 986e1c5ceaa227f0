//! # Event loop
//!
//! Single-threaded readiness loop over `mio`.
//!
//! Handles are boxed [`Handle`] values keyed by [`Token`]. While a handle's
//! callback runs, its box is taken out of the table, so callbacks get full
//! `&mut EventLoop` access (insert, close, notify others) without aliasing.
//!
//! After every callback the loop compares the handle's desired
//! [`Handle::interest`] with what is registered and issues
//! register/reregister/deregister as needed. `read_start`/`read_stop`
//! therefore only flip flags on the handle and repeated calls are free.
//!
//! Closing is deferred: `close` deregisters the handle and queues its
//! `on_close`, which runs once at the end of the current iteration.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use kuv_core::constants::MAX_POST_LOOPS;
use kuv_core::{Result, UvError};
use mio::event::{Event, Source};
use mio::{Events, Interest, Poll, Registry, Token};
use tracing::{debug, trace, warn};

use crate::post::{LoopRemote, PostQueue};

/// Token reserved for the cross-thread waker
pub const WAKE_TOKEN: Token = Token(0);

/// What a handle wraps, for `walk` and logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Tcp,
    TcpListener,
    Pipe,
    PipeListener,
}

/// Readiness reported to a handle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl Ready {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// A value owned by the loop and driven by its callbacks
pub trait Handle {
    fn kind(&self) -> HandleKind;

    /// The I/O source registered with the poller
    fn source(&mut self) -> &mut dyn Source;

    /// Readiness this handle wants right now; `None` deregisters it
    fn interest(&self) -> Option<Interest>;

    /// The source became ready
    fn on_ready(&mut self, lp: &mut EventLoop, token: Token, ready: Ready);

    /// Someone called `EventLoop::notify` for this handle
    fn on_notify(&mut self, _lp: &mut EventLoop, _token: Token) {}

    /// The handle was closed; runs exactly once
    fn on_close(&mut self, _lp: &mut EventLoop, _token: Token) {}
}

/// Loop configuration
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Name used in logs
    pub name: String,
    /// Capacity of the readiness event buffer
    pub events_capacity: usize,
    /// Rounds of posted work drained per wakeup
    pub max_post_loops: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "kuv-loop".into(),
            events_capacity: 1024,
            max_post_loops: MAX_POST_LOOPS,
        }
    }
}

struct Slot {
    /// `None` while the handle's own callback runs
    handle: Option<Box<dyn Handle>>,
    kind: HandleKind,
    registered: Option<Interest>,
    /// Closed from inside its own callback
    closing: bool,
}

/// Per-thread event loop
pub struct EventLoop {
    name: String,
    poll: Poll,
    events: Events,
    slots: HashMap<Token, Slot>,
    next_token: usize,
    closing: VecDeque<(Token, Box<dyn Handle>)>,
    queue: Arc<PostQueue>,
    remote: LoopRemote,
    max_post_loops: usize,
    allow_stop: bool,
    stop_now: bool,
    ready_batch: Vec<(Token, Ready)>,
}

impl EventLoop {
    /// Create the poller and the waker
    pub fn new(config: LoopConfig) -> Result<Self> {
        let poll = Poll::new().map_err(|e| UvError::from_io("poll_create", &e))?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| UvError::from_io("waker_create", &e))?;
        let queue = Arc::new(PostQueue::new(waker));
        let remote = LoopRemote::new(queue.clone(), &config.name);

        Ok(Self {
            name: config.name,
            poll,
            events: Events::with_capacity(config.events_capacity.max(16)),
            slots: HashMap::new(),
            next_token: WAKE_TOKEN.0 + 1,
            closing: VecDeque::new(),
            queue,
            remote,
            max_post_loops: config.max_post_loops.max(1),
            allow_stop: false,
            stop_now: false,
            ready_batch: Vec::new(),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for posting work to this loop from other threads
    #[inline]
    pub fn remote(&self) -> LoopRemote {
        self.remote.clone()
    }

    /// Insert a handle built from its token and register its interest
    pub fn insert_with<H, F>(&mut self, build: F) -> Result<Token>
    where
        H: Handle + 'static,
        F: FnOnce(Token) -> H,
    {
        let token = Token(self.next_token);
        self.next_token += 1;

        let mut handle: Box<dyn Handle> = Box::new(build(token));
        let kind = handle.kind();
        let want = handle.interest();
        if let Some(interest) = want {
            self.poll
                .registry()
                .register(handle.source(), token, interest)
                .map_err(|e| UvError::from_io("register", &e))?;
        }
        self.slots.insert(
            token,
            Slot {
                handle: Some(handle),
                kind,
                registered: want,
                closing: false,
            },
        );
        trace!(loop_name = %self.name, token = token.0, ?kind, "handle inserted");
        Ok(token)
    }

    /// Insert a handle that does not need its own token
    pub fn insert<H: Handle + 'static>(&mut self, handle: H) -> Result<Token> {
        self.insert_with(|_| handle)
    }

    /// True while the handle is alive and not closing
    pub fn contains(&self, token: Token) -> bool {
        self.slots.get(&token).map_or(false, |slot| !slot.closing)
    }

    /// Close a handle. Idempotent; unknown tokens are ignored.
    pub fn close(&mut self, token: Token) {
        let Some(slot) = self.slots.get_mut(&token) else {
            return;
        };
        if slot.closing {
            return;
        }
        match slot.handle.take() {
            Some(mut handle) => {
                if slot.registered.take().is_some() {
                    let _ = self.poll.registry().deregister(handle.source());
                }
                self.slots.remove(&token);
                self.closing.push_back((token, handle));
            }
            // inside its own callback, finished when the callback returns
            None => slot.closing = true,
        }
    }

    /// Close every live handle
    pub fn close_all(&mut self) {
        let tokens: Vec<Token> = self.slots.keys().copied().collect();
        for token in tokens {
            self.close(token);
        }
    }

    /// Run the handle's `on_notify`. Returns false if it is gone or closing.
    pub fn notify(&mut self, token: Token) -> bool {
        self.dispatch(token, |handle, lp| handle.on_notify(lp, token))
    }

    /// Visit every live handle
    pub fn walk<F: FnMut(Token, HandleKind)>(&self, mut f: F) {
        for (token, slot) in &self.slots {
            if !slot.closing {
                f(*token, slot.kind);
            }
        }
    }

    /// Number of live handles
    pub fn handle_count(&self) -> usize {
        self.slots.values().filter(|slot| !slot.closing).count()
    }

    /// Let `run` return once no handles remain
    pub fn allow_stop(&mut self) {
        self.allow_stop = true;
    }

    /// Make `run` return after the current callback
    pub fn stop(&mut self) {
        self.stop_now = true;
    }

    fn should_exit(&self) -> bool {
        self.stop_now || (self.allow_stop && self.slots.is_empty() && self.closing.is_empty())
    }

    /// Run until `stop`, or until `allow_stop` and no handles remain
    pub fn run(&mut self) -> Result<()> {
        debug!(loop_name = %self.name, "event loop running");
        loop {
            self.run_closing();
            if self.should_exit() {
                break;
            }
            self.run_once(None)?;
        }
        debug!(
            loop_name = %self.name,
            handles = self.slots.len(),
            forced = self.stop_now,
            "event loop exited"
        );
        Ok(())
    }

    /// One poll, dispatch and close pass
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(UvError::from_io("poll", &err));
        }

        let mut batch = std::mem::take(&mut self.ready_batch);
        batch.clear();
        let mut woken = false;
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                woken = true;
            } else {
                batch.push((event.token(), Ready::from_event(event)));
            }
        }

        if woken {
            let queue = self.queue.clone();
            queue.drain(self, self.max_post_loops);
        }

        for (token, ready) in batch.drain(..) {
            if self.stop_now {
                break;
            }
            self.dispatch(token, |handle, lp| handle.on_ready(lp, token, ready));
        }
        self.ready_batch = batch;

        self.run_closing();
        Ok(())
    }

    /// Refuse new work, close every handle and run the close callbacks.
    ///
    /// Called when the thread is done with the loop; also run on drop.
    pub fn shutdown(&mut self) {
        self.queue.close();
        self.close_all();
        self.run_closing();
    }

    fn run_closing(&mut self) {
        while let Some((token, mut handle)) = self.closing.pop_front() {
            handle.on_close(self, token);
            trace!(loop_name = %self.name, token = token.0, "handle closed");
        }
    }

    fn dispatch<F>(&mut self, token: Token, f: F) -> bool
    where
        F: FnOnce(&mut dyn Handle, &mut EventLoop),
    {
        let mut handle = match self.slots.get_mut(&token) {
            Some(slot) if !slot.closing => match slot.handle.take() {
                Some(handle) => handle,
                None => return false,
            },
            _ => return false,
        };
        f(handle.as_mut(), self);
        self.restore(token, handle);
        true
    }

    fn restore(&mut self, token: Token, mut handle: Box<dyn Handle>) {
        let registry = self.poll.registry();
        let Some(slot) = self.slots.get_mut(&token) else {
            self.closing.push_back((token, handle));
            return;
        };

        if slot.closing {
            if slot.registered.take().is_some() {
                let _ = registry.deregister(handle.source());
            }
            self.slots.remove(&token);
            self.closing.push_back((token, handle));
            return;
        }

        let want = handle.interest();
        if let Err(err) = reconcile(registry, handle.as_mut(), token, &mut slot.registered, want) {
            warn!(loop_name = %self.name, token = token.0, error = %err, "interest update failed");
        }
        slot.handle = Some(handle);
    }
}

fn reconcile(
    registry: &Registry,
    handle: &mut dyn Handle,
    token: Token,
    registered: &mut Option<Interest>,
    want: Option<Interest>,
) -> io::Result<()> {
    match (*registered, want) {
        (None, Some(interest)) => registry.register(handle.source(), token, interest)?,
        (Some(_), None) => registry.deregister(handle.source())?,
        (Some(current), Some(interest)) if current != interest => {
            registry.reregister(handle.source(), token, interest)?
        }
        _ => return Ok(()),
    }
    *registered = want;
    Ok(())
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
