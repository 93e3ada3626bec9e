use std::sync::Arc;

use uuid::Uuid;

use super::event_loop::{Dispatcher, EventLoop, LoopGuard};
use super::registry::{LoopRegistry, SharedLoop};
use crate::models::error::{CaptureError, ServerError};
use crate::models::state::ContextState;
use crate::traits::server::{AudioServer, ServerContext};

/// A ready connection to the audio server over the shared event loop.
///
/// Holds one reference on the loop. Dropping the connection releases the
/// server context under the loop lock, then the loop reference; if that was
/// the last reference the loop thread is stopped before `drop` returns.
/// Never drop a connection from an event-loop callback.
pub struct Connection {
    id: Uuid,
    identity: String,
    context: Option<Box<dyn ServerContext>>,
    // Declared last: released after the context.
    shared_loop: SharedLoop,
}

impl Connection {
    /// Connect to `server` on the process-wide loop.
    pub fn connect(server: &dyn AudioServer, identity: &str) -> Result<Self, CaptureError> {
        Self::connect_in(&LoopRegistry::global(), server, identity)
    }

    /// Connect to `server` on `registry`'s loop, blocking until the context
    /// is ready or has failed.
    pub fn connect_in(
        registry: &Arc<LoopRegistry>,
        server: &dyn AudioServer,
        identity: &str,
    ) -> Result<Self, CaptureError> {
        let shared_loop = registry.acquire()?;
        let id = Uuid::new_v4();

        let outcome = {
            let mut guard = shared_loop.lock();
            open_context(&mut guard, shared_loop.dispatcher(), server, identity)
        };

        match outcome {
            Ok(context) => {
                log::debug!("[{id}] connected to audio server as {identity:?}");
                Ok(Self {
                    id,
                    identity: identity.to_string(),
                    context: Some(context),
                    shared_loop,
                })
            }
            Err(source) => {
                log::error!("[{id}] audio server connection failure: {source}");
                // Releases the loop reference, tearing the loop down if unused.
                drop(shared_loop);
                Err(CaptureError::ConnectionFailed {
                    identity: identity.to_string(),
                    source,
                })
            }
        }
    }

    /// Explicit form of dropping the connection.
    pub fn disconnect(self) {}

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn lock(&self) -> LoopGuard<'_> {
        self.shared_loop.lock()
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        self.shared_loop.event_loop()
    }

    /// The server context. Call its methods with the loop lock held.
    pub fn context(&self) -> Result<&dyn ServerContext, CaptureError> {
        self.context
            .as_deref()
            .ok_or_else(|| CaptureError::ConfigurationFailed("connection closed".into()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            let _guard = self.shared_loop.lock();
            context.set_state_callback(None);
            context.disconnect();
            drop(context);
        }
        log::debug!("[{}] disconnected {:?}", self.id, self.identity);
    }
}

fn open_context(
    guard: &mut LoopGuard<'_>,
    dispatcher: Dispatcher,
    server: &dyn AudioServer,
    identity: &str,
) -> Result<Box<dyn ServerContext>, ServerError> {
    let context = server.new_context(dispatcher, identity)?;
    context.set_state_callback(Some(Arc::new(
        |guard: &mut LoopGuard<'_>, state: ContextState| {
            if state.wakes_waiters() {
                guard.signal(false);
            }
        },
    )));

    let connected = context
        .connect(None)
        .and_then(|()| wait_context_ready(guard, context.as_ref()));

    if let Err(err) = connected {
        context.set_state_callback(None);
        context.disconnect();
        return Err(err);
    }
    Ok(context)
}

fn wait_context_ready(
    guard: &mut LoopGuard<'_>,
    context: &dyn ServerContext,
) -> Result<(), ServerError> {
    loop {
        match context.state() {
            ContextState::Ready => return Ok(()),
            state if state.is_terminal() => return Err(context.last_error()),
            _ => guard.wait(),
        }
    }
}
