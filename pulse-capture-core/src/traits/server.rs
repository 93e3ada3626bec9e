use std::sync::Arc;
use std::time::Duration;

use crate::mainloop::event_loop::{Dispatcher, LoopGuard};
use crate::models::audio_models::{BufferAttr, ChannelMap, Latency, SampleSpec, StreamFlags};
use crate::models::error::ServerError;
use crate::models::state::{ContextState, StreamState};

/// Called on the loop thread after every context state transition.
pub type ContextStateCallback = Arc<dyn Fn(&mut LoopGuard<'_>, ContextState) + Send + Sync>;

/// Called on the loop thread for stream notifications without a payload.
pub type StreamNotifyCallback = Arc<dyn Fn(&mut LoopGuard<'_>, &dyn ServerStream) + Send + Sync>;

/// Called on the loop thread when `length` bytes can be read from the stream.
pub type StreamReadCallback =
    Arc<dyn Fn(&mut LoopGuard<'_>, &dyn ServerStream, usize) + Send + Sync>;

/// Result of peeking at a record stream's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Peek {
    /// Nothing buffered; there is nothing to drop.
    Empty,
    /// The server lost `n` bytes here. Must still be dropped.
    Hole(usize),
    /// The next fragment. Must be dropped once consumed.
    Data(Arc<[u8]>),
}

/// Entry point of the audio-server client library.
///
/// Implementations deliver every callback by posting to the given
/// dispatcher, so callbacks run on the shared loop thread with the loop
/// lock held.
pub trait AudioServer: Send + Sync {
    /// Create an unconnected context announcing itself as `identity`.
    fn new_context(
        &self,
        dispatcher: Dispatcher,
        identity: &str,
    ) -> Result<Box<dyn ServerContext>, ServerError>;
}

/// One client connection to the audio server.
///
/// All methods must be called with the loop lock held.
pub trait ServerContext: Send + Sync {
    fn set_state_callback(&self, callback: Option<ContextStateCallback>);

    /// Start connecting; progress is reported through the state callback.
    fn connect(&self, server: Option<&str>) -> Result<(), ServerError>;

    fn disconnect(&self);

    fn state(&self) -> ContextState;

    /// The error behind the most recent failure on this context.
    fn last_error(&self) -> ServerError;

    fn new_record_stream(
        &self,
        name: &str,
        spec: &SampleSpec,
        channel_map: &ChannelMap,
    ) -> Result<Box<dyn ServerStream>, ServerError>;
}

/// A stream object on a context.
///
/// All methods must be called with the loop lock held. Releasing the box
/// releases the stream; callbacks must be cleared first.
pub trait ServerStream: Send + Sync {
    fn set_state_callback(&self, callback: Option<StreamNotifyCallback>);
    fn set_read_callback(&self, callback: Option<StreamReadCallback>);
    fn set_moved_callback(&self, callback: Option<StreamNotifyCallback>);
    fn set_overflow_callback(&self, callback: Option<StreamNotifyCallback>);
    fn set_started_callback(&self, callback: Option<StreamNotifyCallback>);
    fn set_suspended_callback(&self, callback: Option<StreamNotifyCallback>);
    fn set_underflow_callback(&self, callback: Option<StreamNotifyCallback>);

    /// Start recording from `source` (None for the server default).
    fn connect_record(
        &self,
        source: Option<&str>,
        attr: &BufferAttr,
        flags: StreamFlags,
    ) -> Result<(), ServerError>;

    fn disconnect(&self) -> Result<(), ServerError>;

    fn state(&self) -> StreamState;

    /// Look at the next fragment without consuming it.
    fn peek(&self) -> Result<Peek, ServerError>;

    /// Consume the fragment returned by the last [`peek`](Self::peek).
    fn drop_fragment(&self) -> Result<(), ServerError>;

    fn latency(&self) -> Result<Latency, ServerError>;

    /// Stream clock position.
    fn time(&self) -> Result<Duration, ServerError>;

    /// Buffer metrics the server granted, once connected.
    fn buffer_attr(&self) -> Option<BufferAttr>;

    fn device_index(&self) -> Option<u32>;

    fn device_name(&self) -> Option<String>;
}
