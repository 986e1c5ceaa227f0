//! Cross-thread work queue feeding one event loop
//!
//! Many producers push closures, the loop thread is the only consumer.
//! A push wakes the poller unless a wake is already pending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use kuv_core::{Result, UvError};

use crate::event_loop::EventLoop;

/// Work posted to a loop
pub type Work = Box<dyn FnOnce(&mut EventLoop) + Send>;

pub(crate) struct PostQueue {
    queue: SegQueue<Work>,
    waker: mio::Waker,
    /// A wake is in flight; the loop clears it before draining
    wake_pending: AtomicBool,
    /// Loop has exited; nothing posted from now on will run
    closed: AtomicBool,
}

impl PostQueue {
    pub(crate) fn new(waker: mio::Waker) -> Self {
        Self {
            queue: SegQueue::new(),
            waker,
            wake_pending: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Run queued work on the loop thread.
    ///
    /// Each round runs what was queued when the round started, so work
    /// posted by work runs in the next round. After `max_loops` rounds the
    /// rest waits for the next wakeup.
    pub(crate) fn drain(&self, lp: &mut EventLoop, max_loops: usize) -> usize {
        self.wake_pending.store(false, Ordering::Release);

        let mut ran = 0;
        for _ in 0..max_loops {
            let n = self.queue.len();
            if n == 0 {
                break;
            }
            for _ in 0..n {
                if let Some(work) = self.queue.pop() {
                    work(lp);
                    ran += 1;
                }
            }
        }

        if !self.queue.is_empty() && !self.wake_pending.swap(true, Ordering::AcqRel) {
            let _ = self.waker.wake();
        }
        ran
    }

    /// Refuse further work and drop what is queued
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.discard();
    }

    fn discard(&self) {
        while let Some(work) = self.queue.pop() {
            drop(work);
        }
    }
}

/// Handle for posting work to a loop from any thread
#[derive(Clone)]
pub struct LoopRemote {
    queue: Arc<PostQueue>,
    name: Arc<str>,
}

impl LoopRemote {
    pub(crate) fn new(queue: Arc<PostQueue>, name: &str) -> Self {
        Self {
            queue,
            name: Arc::from(name),
        }
    }

    /// Name of the loop this remote posts to
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` on the loop thread. FIFO with respect to other posts.
    ///
    /// Fails with `ThreadStopped` once the loop has exited; `f` is dropped
    /// without running.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut EventLoop) + Send + 'static,
    {
        self.post_boxed(Box::new(f))
    }

    pub fn post_boxed(&self, work: Work) -> Result<()> {
        if self.queue.closed.load(Ordering::Acquire) {
            return Err(UvError::ThreadStopped);
        }
        self.queue.queue.push(work);

        // lost the race with loop exit
        if self.queue.closed.load(Ordering::Acquire) {
            self.queue.discard();
            return Err(UvError::ThreadStopped);
        }

        if !self.queue.wake_pending.swap(true, Ordering::AcqRel) {
            self.queue
                .waker
                .wake()
                .map_err(|e| UvError::from_io("wake", &e))?;
        }
        Ok(())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.queue.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for LoopRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopRemote")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}
