//! Background event-loop thread and the monitor (lock + condition) that
//! callers share with it.
//!
//! The loop thread runs queued tasks one batch at a time with the loop lock
//! held. Foreground threads take the same lock through [`EventLoop::lock`] and
//! block on [`LoopGuard::wait`] until a task calls [`LoopGuard::signal`].

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::models::error::CaptureError;

/// Work item executed on the loop thread with the loop lock held.
pub type Task = Box<dyn FnOnce(&mut LoopGuard<'_>) + Send + 'static>;

/// State protected by the loop lock.
#[derive(Debug, Default)]
struct Monitor {
    waiting: usize,
    pending_accepts: usize,
}

struct TaskQueue {
    tasks: VecDeque<Task>,
    running: bool,
}

struct LoopShared {
    monitor: Mutex<Monitor>,
    cond: Condvar,
    accept_cond: Condvar,
    // Separate from the loop lock so tasks can be posted while holding it.
    queue: Mutex<TaskQueue>,
    wake: Condvar,
}

/// Proof that the loop lock is held.
///
/// Dropping the guard unlocks the loop.
pub struct LoopGuard<'a> {
    shared: &'a LoopShared,
    monitor: MutexGuard<'a, Monitor>,
}

impl<'a> LoopGuard<'a> {
    fn new(shared: &'a LoopShared) -> Self {
        Self {
            shared,
            monitor: shared.monitor.lock(),
        }
    }

    /// Release the lock until another thread calls [`signal`](Self::signal).
    ///
    /// Wakeups may be spurious; callers re-check their condition in a loop.
    pub fn wait(&mut self) {
        self.monitor.waiting += 1;
        self.shared.cond.wait(&mut self.monitor);
        self.monitor.waiting -= 1;
    }

    /// Wake every thread blocked in [`wait`](Self::wait).
    ///
    /// With `wait_for_accept`, keep blocking (lock released) until a woken
    /// thread calls [`accept`](Self::accept), so it can read state the
    /// signaller is about to invalidate.
    pub fn signal(&mut self, wait_for_accept: bool) {
        if self.monitor.waiting > 0 {
            self.shared.cond.notify_all();
        }
        if wait_for_accept {
            self.monitor.pending_accepts += 1;
            while self.monitor.pending_accepts > 0 {
                self.shared.accept_cond.wait(&mut self.monitor);
            }
        }
    }

    /// Let a thread blocked in `signal(true)` continue.
    pub fn accept(&mut self) {
        self.monitor.pending_accepts = self.monitor.pending_accepts.saturating_sub(1);
        self.shared.accept_cond.notify_all();
    }

    /// Number of threads currently blocked in [`wait`](Self::wait).
    pub fn waiters(&self) -> usize {
        self.monitor.waiting
    }

    pub fn unlock(self) {}
}

/// Cloneable handle for posting tasks to the loop thread.
///
/// Does not keep the loop alive.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Weak<LoopShared>,
}

impl Dispatcher {
    /// Queue `task` for the loop thread. Returns false if the loop has stopped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut LoopGuard<'_>) + Send + 'static,
    {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut queue = shared.queue.lock();
        if !queue.running {
            return false;
        }
        queue.tasks.push_back(Box::new(task));
        drop(queue);
        shared.wake.notify_one();
        true
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.queue.lock().running)
            .unwrap_or(false)
    }
}

/// A single background thread dispatching tasks under a shared monitor.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    name: String,
}

impl EventLoop {
    /// Spawn the loop thread.
    pub fn start(name: &str) -> Result<Self, CaptureError> {
        let shared = Arc::new(LoopShared {
            monitor: Mutex::new(Monitor::default()),
            cond: Condvar::new(),
            accept_cond: Condvar::new(),
            queue: Mutex::new(TaskQueue {
                tasks: VecDeque::new(),
                running: true,
            }),
            wake: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&thread_shared))
            .map_err(|e| {
                CaptureError::LoopUnavailable(format!("failed to spawn {name} thread: {e}"))
            })?;

        Ok(Self {
            shared,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the loop lock.
    ///
    /// Must not be called from the loop thread, which already holds it while
    /// running tasks.
    pub fn lock(&self) -> LoopGuard<'_> {
        debug_assert!(
            !self.in_loop_thread(),
            "event loop locked from its own thread"
        );
        LoopGuard::new(&self.shared)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_running(&self) -> bool {
        self.shared.queue.lock().running
    }

    /// Stop the loop and wait for its thread to exit.
    ///
    /// Tasks still queued are discarded. Called from the loop thread itself,
    /// the thread is detached instead of joined.
    pub fn stop(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.running = false;
        }
        self.shared.wake.notify_all();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if self.in_loop_thread() {
            log::warn!("{} stopped from its own thread; detaching", self.name);
            return;
        }
        if handle.join().is_err() {
            log::error!("{} thread panicked", self.name);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &LoopShared) {
    loop {
        let (batch, running) = {
            let mut queue = shared.queue.lock();
            while queue.tasks.is_empty() && queue.running {
                shared.wake.wait(&mut queue);
            }
            (std::mem::take(&mut queue.tasks), queue.running)
        };
        // Discarded tasks are dropped outside the queue lock.
        if !running {
            drop(batch);
            break;
        }

        let mut guard = LoopGuard::new(shared);
        for task in batch {
            task(&mut guard);
        }
    }
}
