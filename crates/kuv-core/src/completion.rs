//! One-shot completion handle
//!
//! Resolved once, observed by any number of waiters. The first `complete`
//! wins; later calls are ignored.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A value that becomes available once
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    value: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                value: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Resolve with `value`. Returns false if already resolved.
    pub fn complete(&self, value: T) -> bool {
        let mut slot = self.inner.value.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        drop(slot);
        self.inner.cond.notify_all();
        true
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.inner.value.lock().is_some()
    }
}

impl<T: Clone> Completion<T> {
    /// The value, if resolved
    pub fn try_get(&self) -> Option<T> {
        self.inner.value.lock().clone()
    }

    /// Block until resolved
    pub fn wait(&self) -> T {
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.inner.cond.wait(&mut slot);
        }
    }

    /// Block until resolved or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.value.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            if self.inner.cond.wait_until(&mut slot, deadline).timed_out() {
                return slot.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_complete_wins() {
        let c = Completion::new();
        assert!(!c.is_completed());
        assert!(c.complete(1));
        assert!(!c.complete(2));
        assert_eq!(c.try_get(), Some(1));
        assert_eq!(c.wait(), 1);
    }

    #[test]
    fn test_wait_across_threads() {
        let c: Completion<&'static str> = Completion::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || c.wait())
            })
            .collect();
        thread::sleep(Duration::from_millis(10));
        c.complete("done");
        for w in waiters {
            assert_eq!(w.join().unwrap(), "done");
        }
    }

    #[test]
    fn test_wait_timeout_expires() {
        let c: Completion<u32> = Completion::new();
        let start = Instant::now();
        assert_eq!(c.wait_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_wait_timeout_resolved() {
        let c = Completion::new();
        let c2 = c.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            c2.complete(7u32);
        });
        assert_eq!(c.wait_timeout(Duration::from_secs(5)), Some(7));
    }
}
