use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::event_loop::{Dispatcher, EventLoop, LoopGuard};
use crate::models::error::CaptureError;

const LOOP_THREAD_NAME: &str = "pulse-loop";

/// Starts the loop thread for a registry, given the thread name.
pub type LoopStarter = fn(&str) -> Result<EventLoop, CaptureError>;

/// Snapshot of a registry's reference count and loop history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub refs: usize,
    pub loops_created: u64,
    pub loops_destroyed: u64,
}

impl RegistryStats {
    pub fn has_loop(&self) -> bool {
        self.refs > 0
    }
}

#[derive(Default)]
struct Slot {
    event_loop: Option<Arc<EventLoop>>,
    refs: usize,
    loops_created: u64,
    loops_destroyed: u64,
}

/// Reference-counted owner of the shared event loop.
///
/// The loop is created by the acquire that takes the count from 0 to 1 and
/// stopped by the release that brings it back to 0. The slot mutex is held
/// only while the count changes; never across a loop wait or thread join.
pub struct LoopRegistry {
    slot: Mutex<Slot>,
    start: LoopStarter,
}

impl LoopRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_starter(EventLoop::start)
    }

    /// Registry whose loops are started by `start` instead of [`EventLoop::start`].
    pub fn with_starter(start: LoopStarter) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot::default()),
            start,
        })
    }

    /// The process-wide registry.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<LoopRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(LoopRegistry::new))
    }

    /// Take a reference on the shared loop, starting it if needed.
    ///
    /// On failure the reference count is left unchanged.
    pub fn acquire(self: &Arc<Self>) -> Result<SharedLoop, CaptureError> {
        let mut slot = self.slot.lock();

        let event_loop = match &slot.event_loop {
            Some(event_loop) => {
                if slot.refs == usize::MAX {
                    return Err(CaptureError::LoopUnavailable(
                        "too many event loop references".into(),
                    ));
                }
                Arc::clone(event_loop)
            }
            None => {
                let event_loop = Arc::new((self.start)(LOOP_THREAD_NAME)?);
                slot.event_loop = Some(Arc::clone(&event_loop));
                slot.loops_created += 1;
                log::debug!("event loop started");
                event_loop
            }
        };

        slot.refs += 1;
        Ok(SharedLoop {
            registry: Arc::clone(self),
            event_loop,
        })
    }

    fn release(&self, event_loop: &Arc<EventLoop>) {
        let retired = {
            let mut slot = self.slot.lock();
            debug_assert!(slot.refs > 0, "event loop released too many times");
            debug_assert!(
                slot.event_loop
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, event_loop)),
                "released a loop this registry does not own"
            );

            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 {
                slot.loops_destroyed += 1;
                slot.event_loop.take()
            } else {
                None
            }
        };

        if let Some(event_loop) = retired {
            event_loop.stop();
            log::debug!("event loop stopped");
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let slot = self.slot.lock();
        RegistryStats {
            refs: slot.refs,
            loops_created: slot.loops_created,
            loops_destroyed: slot.loops_destroyed,
        }
    }
}

/// One counted reference on a registry's event loop.
///
/// Dropping it releases the reference; the last drop stops the loop thread
/// and returns only once that thread has exited.
pub struct SharedLoop {
    registry: Arc<LoopRegistry>,
    event_loop: Arc<EventLoop>,
}

impl SharedLoop {
    pub fn lock(&self) -> LoopGuard<'_> {
        self.event_loop.lock()
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.event_loop.dispatcher()
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }
}

impl Drop for SharedLoop {
    fn drop(&mut self) {
        self.registry.release(&self.event_loop);
    }
}
