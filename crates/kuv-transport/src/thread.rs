//! Transport thread
//!
//! One OS thread running one [`EventLoop`]. Other threads hand it work
//! through `post`/`post_async`; everything that touches a socket runs on
//! the loop thread.
//!
//! Stopping escalates in three phases, each bounded by the same timeout:
//!
//! 1. Graceful - let the loop exit once its handles close on their own
//! 2. Rude - close every handle, then exit
//! 3. Immediate - stop the loop where it is
//!
//! A thread that survives all three is logged and detached.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kuv_core::{Completion, Result, UvError};
use kuv_loop::{EventLoop, LoopConfig, LoopRemote};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Wait used when a running thread is dropped without `stop`
const DROP_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// How `stop` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStop {
    /// Exited after its handles closed on their own
    Graceful,
    /// Exited after its handles were force-closed
    Rude,
    /// Exited after the loop was stopped in place
    Immediate,
    /// Still running after every phase; detached
    TimedOut,
    /// Was not running
    NotRunning,
}

struct Running {
    remote: LoopRemote,
    join: JoinHandle<()>,
    exited: Completion<()>,
}

/// Completes its signal when the thread body unwinds or returns
struct ExitSignal(Completion<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        self.0.complete(());
    }
}

/// Resolves a posted call with `ThreadStopped` if it never ran
struct PostGuard<T>(Completion<Result<T>>);

impl<T> Drop for PostGuard<T> {
    fn drop(&mut self) {
        self.0.complete(Err(UvError::ThreadStopped));
    }
}

pub struct TransportThread {
    index: usize,
    name: String,
    running: Mutex<Option<Running>>,
}

impl TransportThread {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: format!("kuv-thread-{index}"),
            running: Mutex::new(None),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the thread and wait until its loop is ready to accept work.
    /// Calling it on a running thread does nothing.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let ready: Completion<Result<LoopRemote>> = Completion::new();
        let exited = Completion::new();
        let config = LoopConfig {
            name: self.name.clone(),
            ..LoopConfig::default()
        };

        let join = {
            let ready = ready.clone();
            let exited = exited.clone();
            thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || thread_main(config, ready, exited))
                .map_err(|e| UvError::from_io("thread_spawn", &e))?
        };

        match ready.wait() {
            Ok(remote) => {
                *running = Some(Running {
                    remote,
                    join,
                    exited,
                });
                debug!(thread = %self.name, "transport thread started");
                Ok(())
            }
            Err(err) => {
                let _ = join.join();
                Err(err)
            }
        }
    }

    /// Remote for the running loop
    pub fn remote(&self) -> Result<LoopRemote> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.remote.clone())
            .ok_or(UvError::ThreadStopped)
    }

    /// Queue `f` to run on the loop thread. Fails once the thread stopped.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.remote()?.post(f)
    }

    /// Queue `f` and get its result through a completion.
    ///
    /// Resolves with `ThreadStopped` if the loop shuts down before `f` runs.
    pub fn post_async<T, F>(&self, f: F) -> Completion<Result<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut EventLoop) -> T + Send + 'static,
    {
        let completion = Completion::new();
        let guard = PostGuard(completion.clone());
        let posted = self.post(move |lp| {
            let value = f(lp);
            guard.0.complete(Ok(value));
        });
        if let Err(err) = posted {
            completion.complete(Err(err));
        }
        completion
    }

    /// Run a fallible `f` on the loop and wait for it.
    ///
    /// Must not be called from this thread's own loop.
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&mut EventLoop) -> Result<T> + Send + 'static,
    {
        self.post_async(f).wait().and_then(|r| r)
    }

    /// Stop the loop, escalating through the shutdown phases.
    pub fn stop(&self, timeout: Duration) -> ThreadStop {
        let Some(Running {
            remote,
            join,
            exited,
        }) = self.running.lock().take()
        else {
            return ThreadStop::NotRunning;
        };
        let started = Instant::now();

        let phases: [(ThreadStop, fn(&mut EventLoop)); 3] = [
            (ThreadStop::Graceful, |lp| lp.allow_stop()),
            (ThreadStop::Rude, |lp| {
                lp.allow_stop();
                lp.close_all();
            }),
            (ThreadStop::Immediate, |lp| lp.stop()),
        ];

        for (outcome, action) in phases {
            if outcome != ThreadStop::Graceful {
                warn!(thread = %self.name, phase = ?outcome, "transport thread still running, escalating stop");
            }
            // a closed queue means the loop is already on its way out
            let _ = remote.post(action);
            if exited.wait_timeout(timeout).is_some() {
                if join.join().is_err() {
                    error!(thread = %self.name, "transport thread panicked");
                }
                info!(thread = %self.name, ?outcome, elapsed = ?started.elapsed(), "transport thread stopped");
                return outcome;
            }
        }

        error!(thread = %self.name, ?timeout, "transport thread did not stop; detaching");
        drop(join);
        ThreadStop::TimedOut
    }
}

impl Drop for TransportThread {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop(DROP_STOP_TIMEOUT);
        }
    }
}

fn thread_main(config: LoopConfig, ready: Completion<Result<LoopRemote>>, exited: Completion<()>) {
    let _exit = ExitSignal(exited);

    let mut lp = match EventLoop::new(config) {
        Ok(lp) => lp,
        Err(err) => {
            error!(error = %err, "failed to initialize event loop");
            ready.complete(Err(err));
            return;
        }
    };
    ready.complete(Ok(lp.remote()));

    if let Err(err) = lp.run() {
        error!(loop_name = lp.name(), error = %err, "event loop failed");
    }
    // runs pending close callbacks and discards queued work
    lp.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream as StdUnixStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use kuv_loop::{Handle, HandleKind, Interest, Ready, Token};
    use mio::event::Source;
    use mio::net::UnixStream;

    /// A handle that never closes by itself
    struct Idle(UnixStream);

    impl Handle for Idle {
        fn kind(&self) -> HandleKind {
            HandleKind::Pipe
        }
        fn source(&mut self) -> &mut dyn Source {
            &mut self.0
        }
        fn interest(&self) -> Option<Interest> {
            Some(Interest::READABLE)
        }
        fn on_ready(&mut self, _lp: &mut EventLoop, _token: Token, _ready: Ready) {}
    }

    fn idle_handle() -> (Idle, StdUnixStream) {
        let (a, b) = StdUnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (Idle(UnixStream::from_std(a)), b)
    }

    #[test]
    fn test_post_runs_on_loop_thread() {
        let thread = TransportThread::new(3);
        thread.start().unwrap();
        assert_eq!(thread.name(), "kuv-thread-3");

        let name = thread
            .post_async(|lp| {
                (
                    std::thread::current().name().map(String::from),
                    lp.name().to_string(),
                )
            })
            .wait()
            .unwrap();
        assert_eq!(name.0.as_deref(), Some("kuv-thread-3"));
        assert_eq!(name.1, "kuv-thread-3");

        assert_eq!(thread.stop(Duration::from_secs(5)), ThreadStop::Graceful);
    }

    #[test]
    fn test_posted_work_runs_in_order() {
        let thread = TransportThread::new(0);
        thread.start().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..100 {
            let counter = counter.clone();
            let seen = seen.clone();
            thread
                .post(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    seen.lock().push(i);
                })
                .unwrap();
        }
        thread.post_async(|_| ()).wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
        thread.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_call_propagates_errors() {
        let thread = TransportThread::new(0);
        thread.start().unwrap();
        assert_eq!(thread.call(|_| Ok(7)).unwrap(), 7);
        assert_eq!(
            thread.call::<(), _>(|_| Err(UvError::Closed)),
            Err(UvError::Closed)
        );
        thread.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_post_after_stop_fails() {
        let thread = TransportThread::new(0);
        thread.start().unwrap();
        thread.stop(Duration::from_secs(5));

        assert_eq!(thread.post(|_| {}), Err(UvError::ThreadStopped));
        assert_eq!(
            thread.post_async(|_| 1).wait(),
            Err(UvError::ThreadStopped)
        );
        assert_eq!(thread.stop(Duration::from_secs(5)), ThreadStop::NotRunning);
    }

    #[test]
    fn test_stop_escalates_to_rude_with_open_handles() {
        let thread = TransportThread::new(0);
        thread.start().unwrap();
        let (handle, _peer) = idle_handle();
        thread.call(move |lp| lp.insert(handle)).unwrap();

        let started = Instant::now();
        assert_eq!(thread.stop(Duration::from_millis(50)), ThreadStop::Rude);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!thread.is_running());
    }

    #[test]
    fn test_restart_after_stop() {
        let thread = TransportThread::new(1);
        thread.start().unwrap();
        thread.stop(Duration::from_secs(5));
        thread.start().unwrap();
        assert!(thread.is_running());
        assert_eq!(thread.call(|_| Ok(())), Ok(()));
    }
}
