//! # pulse-capture-core
//!
//! Live audio capture from a sound server over one shared event loop.
//!
//! Every connection in the process shares a single background event-loop
//! thread, reference counted by a [`LoopRegistry`]. A [`CaptureSession`] opens
//! a record stream on a [`Connection`] and forwards timestamped blocks to a
//! [`SampleSink`]. The server client library plugs in through the
//! [`AudioServer`] trait; [`SimulatedServer`] is an in-process stand-in.
//!
//! ## Architecture
//!
//! ```text
//! pulse-capture-core (this crate)
//! ├── mainloop/     ← EventLoop, LoopRegistry, SharedLoop, Connection
//! ├── session/      ← CaptureSession, LiveCapture, control queries
//! ├── traits/       ← AudioServer, ServerContext, ServerStream, SampleSink, Clock
//! ├── models/       ← CaptureError, states, sample spec, Block, CaptureConfiguration
//! └── server/       ← SimulatedServer
//! ```

pub mod mainloop;
pub mod models;
pub mod server;
pub mod session;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use mainloop::connection::Connection;
pub use mainloop::event_loop::{Dispatcher, EventLoop, LoopGuard};
pub use mainloop::registry::{LoopRegistry, LoopStarter, RegistryStats, SharedLoop};
pub use models::audio_models::{
    BufferAttr, CaptureDiagnostics, ChannelMap, Latency, SampleSpec, StreamFormat, StreamId,
};
pub use models::block::{Block, Timestamp};
pub use models::config::CaptureConfiguration;
pub use models::error::{CaptureError, ServerError, ServerErrorCode};
pub use models::state::{CaptureState, ContextState, StreamState};
pub use server::simulated::{ServerBehavior, SimStream, SimulatedServer};
pub use session::capture::{CaptureSession, ControlQuery, ControlReply, SessionRuntime};
pub use session::live::{open_capture, open_capture_in, LiveCapture};
pub use traits::allocator::{BlockAllocator, HeapAllocator};
pub use traits::clock::{Clock, MonotonicClock, CLOCK_ORIGIN_US};
pub use traits::server::{AudioServer, Peek, ServerContext, ServerStream};
pub use traits::sink::{ChannelSink, SampleSink, SinkEvent};
