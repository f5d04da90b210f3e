//! Cooperative shutdown coordination.
//!
//! [`Shutdown`] is a monotonic, process-wide "the host is stopping" condition.
//! Long-running loops pace themselves with [`Shutdown::wait_timeout`] instead of
//! sleeping, so they both tick periodically and exit as soon as shutdown is
//! requested. No thread is ever killed; every loop is expected to notice the
//! condition within one polling interval.
//!
//! Each plugin receives a [`Shutdown::child`] token: tripping the host token
//! trips every child, while tripping a child (plugin teardown) leaves the host
//! running.
//!
//! [`WorkerSet`] tracks the threads a plugin spawns so teardown can grant them a
//! bounded grace period to finish.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::bus::panic_message;
use crate::error::Result;

#[derive(Default)]
struct State {
    requested: bool,
    children: Vec<Weak<Inner>>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// Cloneable shutdown token.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Shutdown {
    /// Create a token that has not been tripped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shutdown condition.
    ///
    /// Idempotent: returns true only for the call that actually tripped it.
    pub fn request(&self) -> bool {
        let children = {
            let mut state = self.inner.state.lock();
            if state.requested {
                return false;
            }
            state.requested = true;
            std::mem::take(&mut state.children)
        };
        self.inner.cond.notify_all();

        for child in children.iter().filter_map(Weak::upgrade) {
            Shutdown { inner: child }.request();
        }
        true
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.inner.state.lock().requested
    }

    /// Block for at most `timeout`.
    ///
    /// Returns true if shutdown was requested before the timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };

        let mut state = self.inner.state.lock();
        while !state.requested {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.requested;
            }
        }
        true
    }

    /// Block until shutdown is requested.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.requested {
            self.inner.cond.wait(&mut state);
        }
    }

    /// Create a token tripped together with this one.
    pub fn child(&self) -> Shutdown {
        let child = Shutdown::new();
        let mut state = self.inner.state.lock();
        if state.requested {
            child.inner.state.lock().requested = true;
        } else {
            state.children.retain(|w| w.strong_count() > 0);
            state.children.push(Arc::downgrade(&child.inner));
        }
        child
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("requested", &self.is_requested())
            .finish()
    }
}

struct WorkersInner {
    owner: String,
    active: Mutex<usize>,
    idle: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Threads spawned on behalf of one plugin.
#[derive(Clone)]
pub struct WorkerSet {
    inner: Arc<WorkersInner>,
}

struct ActiveGuard(Arc<WorkersInner>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.0.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl WorkerSet {
    /// Create an empty set owned by `owner` (used in thread names and logs).
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(WorkersInner {
                owner: owner.into(),
                active: Mutex::new(0),
                idle: Condvar::new(),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn a named worker thread.
    ///
    /// Panics inside the worker are caught and logged.
    pub fn spawn<F>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        *self.inner.active.lock() += 1;
        let guard = ActiveGuard(self.inner.clone());
        let owner = self.inner.owner.clone();
        let thread_name = format!("{}-{}", owner, name);

        let spawned = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _guard = guard;
                if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
                    tracing::error!(
                        plugin = %owner,
                        thread = %thread_name,
                        panic = %panic_message(panic.as_ref()),
                        "worker thread panicked"
                    );
                }
            })?;

        let mut handles = self.inner.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(spawned);
        Ok(())
    }

    /// Number of workers still running.
    pub fn active(&self) -> usize {
        *self.inner.active.lock()
    }

    /// Wait up to `timeout` for every worker to finish.
    ///
    /// Returns true if the set drained. Finished threads are joined; threads
    /// still running after the deadline are left detached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let drained = {
            let mut active = self.inner.active.lock();
            loop {
                if *active == 0 {
                    break true;
                }
                match deadline {
                    Some(deadline) => {
                        if self.inner.idle.wait_until(&mut active, deadline).timed_out() {
                            break *active == 0;
                        }
                    }
                    None => self.inner.idle.wait(&mut active),
                }
            }
        };

        let mut handles = self.inner.handles.lock();
        let (finished, running): (Vec<_>, Vec<_>) =
            handles.drain(..).partition(|h| h.is_finished());
        *handles = running;
        drop(handles);

        for handle in finished {
            let _ = handle.join();
        }

        if !drained {
            tracing::warn!(
                plugin = %self.inner.owner,
                remaining = self.active(),
                "workers still running after grace period"
            );
        }
        drained
    }
}

impl std::fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSet")
            .field("owner", &self.inner.owner)
            .field("active", &self.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_request_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_requested());

        assert!(shutdown.request());
        assert!(!shutdown.request());
        assert!(!shutdown.request());
        assert!(shutdown.is_requested());
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let shutdown = Shutdown::new();
        let started = Instant::now();
        assert!(!shutdown.wait_timeout(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_timeout_wakes_on_request() {
        let shutdown = Shutdown::new();
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let s = shutdown.clone();
                std::thread::spawn(move || s.wait_timeout(Duration::from_secs(10)))
            })
            .collect();

        std::thread::sleep(Duration::from_millis(20));
        let started = Instant::now();
        shutdown.request();
        shutdown.request();

        for w in waiters {
            assert!(w.join().unwrap());
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(shutdown.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_child_tokens() {
        let host = Shutdown::new();
        let plugin_a = host.child();
        let plugin_b = host.child();

        assert!(plugin_a.request());
        assert!(plugin_a.is_requested());
        assert!(!host.is_requested());
        assert!(!plugin_b.is_requested());

        host.request();
        assert!(plugin_b.is_requested());

        let late = host.child();
        assert!(late.is_requested());
    }

    #[test]
    fn test_worker_set_drains() {
        let shutdown = Shutdown::new();
        let workers = WorkerSet::new("test");

        for i in 0..3 {
            let s = shutdown.clone();
            workers
                .spawn(&format!("loop-{}", i), move || {
                    while !s.wait_timeout(Duration::from_millis(10)) {}
                })
                .unwrap();
        }
        assert_eq!(workers.active(), 3);
        assert!(!workers.wait_idle(Duration::from_millis(30)));

        shutdown.request();
        assert!(workers.wait_idle(Duration::from_secs(5)));
        assert_eq!(workers.active(), 0);
    }

    #[test]
    fn test_worker_panic_is_contained() {
        let workers = WorkerSet::new("test");
        let ran_after = Arc::new(AtomicBool::new(false));

        workers.spawn("boom", || panic!("worker failure")).unwrap();
        let flag = ran_after.clone();
        workers
            .spawn("fine", move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        assert!(workers.wait_idle(Duration::from_secs(5)));
        assert!(ran_after.load(Ordering::SeqCst));
    }
}
