//! In-process audio server.
//!
//! Behaves like the real client library from the caller's side: every state
//! change and notification is posted to the shared loop and delivered there
//! with the loop lock held. Tests drive streams through the hooks on
//! [`SimStream`]; the optional generator feeds a tone for demos.

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::mainloop::event_loop::{Dispatcher, LoopGuard};
use crate::models::audio_models::{BufferAttr, ChannelMap, Latency, SampleSpec, StreamFlags};
use crate::models::error::{ServerError, ServerErrorCode};
use crate::models::state::{ContextState, StreamState};
use crate::traits::server::{
    AudioServer, ContextStateCallback, Peek, ServerContext, ServerStream, StreamNotifyCallback,
    StreamReadCallback,
};

const DEFAULT_DEVICE_NAME: &str = "sim.monitor";

/// Server buffer limit granted when the client leaves it to the server (4 s).
const DEFAULT_MAX_LENGTH: u32 = 4 * 48000 * 4;

/// How the simulated server treats new clients.
#[derive(Debug, Clone)]
pub struct ServerBehavior {
    /// Fail every context connection with this error.
    pub refuse_connections: Option<ServerErrorCode>,
    /// Fail every record stream once connecting, with this error.
    pub fail_record_streams: Option<ServerErrorCode>,
    /// Latency reported by new streams.
    pub latency: Latency,
    pub device_index: u32,
    pub device_name: String,
    /// Feed a 440 Hz tone into ready streams at this interval.
    pub generator_interval: Option<Duration>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            refuse_connections: None,
            fail_record_streams: None,
            latency: Latency::behind(20_000),
            device_index: 0,
            device_name: DEFAULT_DEVICE_NAME.into(),
            generator_interval: None,
        }
    }
}

#[derive(Default)]
pub struct SimulatedServer {
    behavior: Mutex<ServerBehavior>,
    streams: Arc<Mutex<Vec<WeakStream>>>,
}

impl SimulatedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: ServerBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            streams: Arc::default(),
        }
    }

    /// Applies to contexts created afterwards.
    pub fn refuse_connections(&self, code: Option<ServerErrorCode>) {
        self.behavior.lock().refuse_connections = code;
    }

    /// Applies to contexts created afterwards.
    pub fn fail_record_streams(&self, code: Option<ServerErrorCode>) {
        self.behavior.lock().fail_record_streams = code;
    }

    /// Record streams still referenced by a client or a test, oldest first.
    pub fn streams(&self) -> Vec<SimStream> {
        self.streams
            .lock()
            .iter()
            .filter_map(WeakStream::upgrade)
            .collect()
    }

    pub fn last_stream(&self) -> Option<SimStream> {
        self.streams
            .lock()
            .iter()
            .rev()
            .find_map(WeakStream::upgrade)
    }
}

impl AudioServer for SimulatedServer {
    fn new_context(
        &self,
        dispatcher: Dispatcher,
        identity: &str,
    ) -> Result<Box<dyn ServerContext>, ServerError> {
        if identity.is_empty() {
            return Err(ServerErrorCode::InvalidArgument.into());
        }
        let inner = Arc::new(ContextInner {
            dispatcher,
            identity: identity.to_string(),
            behavior: self.behavior.lock().clone(),
            server_streams: Arc::clone(&self.streams),
            state: Mutex::new(ContextSlot {
                state: ContextState::Unconnected,
                last_error: ServerErrorCode::Unknown.into(),
                callback: None,
                streams: Vec::new(),
            }),
        });
        Ok(Box::new(SimContext { inner }))
    }
}

struct ContextSlot {
    state: ContextState,
    last_error: ServerError,
    callback: Option<ContextStateCallback>,
    streams: Vec<WeakStream>,
}

struct ContextInner {
    dispatcher: Dispatcher,
    identity: String,
    behavior: ServerBehavior,
    server_streams: Arc<Mutex<Vec<WeakStream>>>,
    state: Mutex<ContextSlot>,
}

impl ContextInner {
    fn transition(&self, guard: &mut LoopGuard<'_>, state: ContextState, error: Option<ServerError>) {
        let callback = {
            let mut slot = self.state.lock();
            // A disconnect overtakes anything still queued.
            if slot.state.is_terminal() {
                return;
            }
            slot.state = state;
            if let Some(error) = error {
                slot.last_error = error;
            }
            slot.callback.clone()
        };
        log::trace!("context {:?} -> {state:?}", self.identity);
        if let Some(callback) = callback {
            callback(guard, state);
        }
    }

    fn set_last_error(&self, error: ServerError) {
        self.state.lock().last_error = error;
    }
}

pub struct SimContext {
    inner: Arc<ContextInner>,
}

impl ServerContext for SimContext {
    fn set_state_callback(&self, callback: Option<ContextStateCallback>) {
        self.inner.state.lock().callback = callback;
    }

    fn connect(&self, _server: Option<&str>) -> Result<(), ServerError> {
        if self.inner.state.lock().state != ContextState::Unconnected {
            return Err(ServerErrorCode::BadState.into());
        }

        let outcome = match self.inner.behavior.refuse_connections {
            Some(code) => (ContextState::Failed, Some(ServerError::new(code))),
            None => (ContextState::Ready, None),
        };
        let steps = [
            (ContextState::Connecting, None),
            (ContextState::Authorizing, None),
            (ContextState::SettingName, None),
            outcome,
        ];
        for (state, error) in steps {
            let inner = Arc::clone(&self.inner);
            let posted = self
                .inner
                .dispatcher
                .post(move |guard| inner.transition(guard, state, error));
            if !posted {
                return Err(ServerErrorCode::ConnectionRefused.into());
            }
        }
        Ok(())
    }

    fn disconnect(&self) {
        let streams = {
            let mut slot = self.inner.state.lock();
            slot.state = ContextState::Terminated;
            std::mem::take(&mut slot.streams)
        };
        // Streams die with their context.
        for stream in streams.iter().filter_map(WeakStream::upgrade) {
            stream.terminate();
        }
    }

    fn state(&self) -> ContextState {
        self.inner.state.lock().state
    }

    fn last_error(&self) -> ServerError {
        self.inner.state.lock().last_error.clone()
    }

    fn new_record_stream(
        &self,
        name: &str,
        spec: &SampleSpec,
        channel_map: &ChannelMap,
    ) -> Result<Box<dyn ServerStream>, ServerError> {
        if self.state() != ContextState::Ready {
            return Err(ServerErrorCode::BadState.into());
        }
        if !spec.is_valid() || !channel_map.is_compatible(spec) {
            return Err(ServerErrorCode::InvalidArgument.into());
        }

        let behavior = &self.inner.behavior;
        let stream = SimStream {
            name: name.to_string(),
            dispatcher: self.inner.dispatcher.clone(),
            context: Arc::clone(&self.inner),
            inner: Arc::new(Mutex::new(StreamInner {
                state: StreamState::Unconnected,
                spec: *spec,
                callbacks: StreamCallbacks::default(),
                queue: VecDeque::new(),
                queued_bytes: 0,
                peeked: false,
                drop_calls: 0,
                bytes_read: 0,
                latency: Ok(behavior.latency),
                peek_error: None,
                device_index: behavior.device_index,
                device_name: behavior.device_name.clone(),
                granted: None,
                flags: StreamFlags::default(),
                ignored_notifications: 0,
                generator: None,
            })),
        };

        remember(&mut self.inner.state.lock().streams, &stream);
        remember(&mut self.inner.server_streams.lock(), &stream);
        log::trace!("context {:?} created stream {name:?}", self.inner.identity);
        Ok(Box::new(stream))
    }
}

#[derive(Default)]
struct StreamCallbacks {
    state: Option<StreamNotifyCallback>,
    read: Option<StreamReadCallback>,
    moved: Option<StreamNotifyCallback>,
    overflow: Option<StreamNotifyCallback>,
    started: Option<StreamNotifyCallback>,
    suspended: Option<StreamNotifyCallback>,
    underflow: Option<StreamNotifyCallback>,
}

impl StreamCallbacks {
    fn any(&self) -> bool {
        self.state.is_some()
            || self.read.is_some()
            || self.moved.is_some()
            || self.overflow.is_some()
            || self.started.is_some()
            || self.suspended.is_some()
            || self.underflow.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notification {
    State,
    Moved,
    Overflow,
    Started,
    Suspended,
    Underflow,
}

enum Fragment {
    Data(Arc<[u8]>),
    Hole(usize),
}

impl Fragment {
    fn len(&self) -> usize {
        match self {
            Self::Data(bytes) => bytes.len(),
            Self::Hole(len) => *len,
        }
    }
}

struct Generator {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct StreamInner {
    state: StreamState,
    spec: SampleSpec,
    callbacks: StreamCallbacks,
    queue: VecDeque<Fragment>,
    queued_bytes: usize,
    peeked: bool,
    drop_calls: usize,
    bytes_read: u64,
    latency: Result<Latency, ServerError>,
    peek_error: Option<ServerError>,
    device_index: u32,
    device_name: String,
    granted: Option<BufferAttr>,
    flags: StreamFlags,
    ignored_notifications: usize,
    generator: Option<Generator>,
}

/// Add `stream` to a list of weak handles, forgetting released streams.
fn remember(streams: &mut Vec<WeakStream>, stream: &SimStream) {
    streams.retain(WeakStream::is_alive);
    streams.push(stream.downgrade());
}

/// Non-owning handle to a [`SimStream`].
struct WeakStream {
    name: String,
    dispatcher: Dispatcher,
    context: Weak<ContextInner>,
    inner: Weak<Mutex<StreamInner>>,
}

impl WeakStream {
    fn upgrade(&self) -> Option<SimStream> {
        Some(SimStream {
            name: self.name.clone(),
            dispatcher: self.dispatcher.clone(),
            context: self.context.upgrade()?,
            inner: self.inner.upgrade()?,
        })
    }

    fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

/// A simulated record stream. Clones are handles to the same stream.
///
/// The stream is freed once the client releases it and no clone remains.
#[derive(Clone)]
pub struct SimStream {
    name: String,
    dispatcher: Dispatcher,
    context: Arc<ContextInner>,
    inner: Arc<Mutex<StreamInner>>,
}

impl SimStream {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn downgrade(&self) -> WeakStream {
        WeakStream {
            name: self.name.clone(),
            dispatcher: self.dispatcher.clone(),
            context: Arc::downgrade(&self.context),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Queue captured bytes and announce them to the read callback.
    ///
    /// Returns false when the stream is not recording. Bytes beyond the
    /// granted buffer limit are discarded with an overflow notification.
    pub fn push_fragment(&self, bytes: &[u8]) -> bool {
        let length = bytes.len();
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Ready {
                return false;
            }
            let limit = inner
                .granted
                .and_then(|attr| attr.max_length)
                .map_or(usize::MAX, |max| max as usize);
            if inner.queued_bytes + length > limit {
                drop(inner);
                self.post_notification(Notification::Overflow);
                return true;
            }
            inner.queued_bytes += length;
            inner.queue.push_back(Fragment::Data(Arc::from(bytes)));
        }
        self.post_read(length)
    }

    /// Queue a gap of `length` lost bytes.
    pub fn push_hole(&self, length: usize) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Ready {
                return false;
            }
            inner.queued_bytes += length;
            inner.queue.push_back(Fragment::Hole(length));
        }
        self.post_read(length)
    }

    pub fn set_latency(&self, latency: Latency) {
        self.inner.lock().latency = Ok(latency);
    }

    /// Make latency queries fail until the next [`set_latency`](Self::set_latency).
    pub fn fail_latency(&self, code: ServerErrorCode) {
        self.inner.lock().latency = Err(code.into());
    }

    pub fn fail_next_peek(&self, code: ServerErrorCode) {
        self.inner.lock().peek_error = Some(code.into());
    }

    pub fn notify_overflow(&self) -> bool {
        self.post_notification(Notification::Overflow)
    }

    pub fn notify_underflow(&self) -> bool {
        self.post_notification(Notification::Underflow)
    }

    pub fn notify_started(&self) -> bool {
        self.post_notification(Notification::Started)
    }

    pub fn notify_suspended(&self) -> bool {
        self.post_notification(Notification::Suspended)
    }

    /// Reattach the stream to another source device.
    pub fn move_to_source(&self, index: u32, name: &str) -> bool {
        {
            let mut inner = self.inner.lock();
            inner.device_index = index;
            inner.device_name = name.to_string();
        }
        self.post_notification(Notification::Moved)
    }

    /// Fail the stream from the server side.
    pub fn fail(&self, code: ServerErrorCode) -> bool {
        let stream = self.clone();
        self.dispatcher.post(move |guard| {
            stream.transition(guard, StreamState::Failed, Some(ServerError::new(code)))
        })
    }

    /// Calls to `drop_fragment` so far, including refused ones.
    pub fn drops(&self) -> usize {
        self.inner.lock().drop_calls
    }

    /// Notifications delivered while no callback was registered.
    pub fn ignored_notifications(&self) -> usize {
        self.inner.lock().ignored_notifications
    }

    pub fn has_callbacks(&self) -> bool {
        self.inner.lock().callbacks.any()
    }

    pub fn queued_bytes(&self) -> usize {
        self.inner.lock().queued_bytes
    }

    pub fn flags(&self) -> StreamFlags {
        self.inner.lock().flags
    }

    fn post_read(&self, length: usize) -> bool {
        let stream = self.clone();
        self.dispatcher.post(move |guard| {
            let callback = {
                let mut inner = stream.inner.lock();
                let callback = inner.callbacks.read.clone();
                if callback.is_none() {
                    inner.ignored_notifications += 1;
                }
                callback
            };
            if let Some(callback) = callback {
                callback(guard, &stream, length);
            }
        })
    }

    fn post_notification(&self, kind: Notification) -> bool {
        let stream = self.clone();
        self.dispatcher
            .post(move |guard| stream.deliver(guard, kind))
    }

    fn deliver(&self, guard: &mut LoopGuard<'_>, kind: Notification) {
        let callback = {
            let mut inner = self.inner.lock();
            let slots = &inner.callbacks;
            let callback = match kind {
                Notification::State => slots.state.clone(),
                Notification::Moved => slots.moved.clone(),
                Notification::Overflow => slots.overflow.clone(),
                Notification::Started => slots.started.clone(),
                Notification::Suspended => slots.suspended.clone(),
                Notification::Underflow => slots.underflow.clone(),
            };
            if callback.is_none() {
                inner.ignored_notifications += 1;
            }
            callback
        };
        if let Some(callback) = callback {
            callback(guard, self);
        }
    }

    fn transition(&self, guard: &mut LoopGuard<'_>, state: StreamState, error: Option<ServerError>) {
        let generator_interval = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() || inner.state == state {
                return;
            }
            inner.state = state;
            (state == StreamState::Ready)
                .then_some(self.context.behavior.generator_interval)
                .flatten()
        };
        if let Some(error) = error {
            self.context.set_last_error(error);
        }
        log::trace!("stream {:?} -> {state:?}", self.name);

        self.deliver(guard, Notification::State);

        if let Some(interval) = generator_interval {
            self.start_generator(interval);
        }
        if state.is_terminal() {
            self.stop_generator();
        }
    }

    /// Server-side termination without notifying the client.
    fn terminate(&self) {
        self.inner.lock().state = StreamState::Terminated;
        self.stop_generator();
    }

    fn start_generator(&self, interval: Duration) {
        let stop = Arc::new(AtomicBool::new(false));
        let stream = self.clone();
        let stop_flag = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name(format!("sim-gen-{}", self.name))
            .spawn(move || stream.generate(interval, &stop_flag));

        match spawned {
            Ok(handle) => self.inner.lock().generator = Some(Generator { stop, handle }),
            Err(err) => log::warn!("cannot start tone generator: {err}"),
        }
    }

    fn stop_generator(&self) {
        // Join outside the stream mutex; the generator takes it to push.
        let generator = self.inner.lock().generator.take();
        if let Some(generator) = generator {
            generator.stop.store(true, Ordering::Release);
            if generator.handle.thread().id() != thread::current().id()
                && generator.handle.join().is_err()
            {
                log::warn!("tone generator panicked");
            }
        }
    }

    fn generate(&self, interval: Duration, stop: &AtomicBool) {
        let spec = self.inner.lock().spec;
        let frames = spec.usec_to_bytes(interval.as_micros() as u64) / spec.frame_size();
        let step = TAU * 440.0 / spec.rate as f32;
        let mut phase = 0.0f32;

        while !stop.load(Ordering::Acquire) {
            thread::sleep(interval);
            let mut bytes = Vec::with_capacity(frames * spec.frame_size());
            for _ in 0..frames {
                let sample = (phase.sin() * f32::from(i16::MAX) * 0.25) as i16;
                for _ in 0..spec.channels {
                    bytes.extend_from_slice(&sample.to_ne_bytes());
                }
                phase = (phase + step) % TAU;
            }
            if !self.push_fragment(&bytes) {
                break;
            }
        }
    }
}

impl ServerStream for SimStream {
    fn set_state_callback(&self, callback: Option<StreamNotifyCallback>) {
        self.inner.lock().callbacks.state = callback;
    }

    fn set_read_callback(&self, callback: Option<StreamReadCallback>) {
        self.inner.lock().callbacks.read = callback;
    }

    fn set_moved_callback(&self, callback: Option<StreamNotifyCallback>) {
        self.inner.lock().callbacks.moved = callback;
    }

    fn set_overflow_callback(&self, callback: Option<StreamNotifyCallback>) {
        self.inner.lock().callbacks.overflow = callback;
    }

    fn set_started_callback(&self, callback: Option<StreamNotifyCallback>) {
        self.inner.lock().callbacks.started = callback;
    }

    fn set_suspended_callback(&self, callback: Option<StreamNotifyCallback>) {
        self.inner.lock().callbacks.suspended = callback;
    }

    fn set_underflow_callback(&self, callback: Option<StreamNotifyCallback>) {
        self.inner.lock().callbacks.underflow = callback;
    }

    fn connect_record(
        &self,
        source: Option<&str>,
        attr: &BufferAttr,
        flags: StreamFlags,
    ) -> Result<(), ServerError> {
        {
            let mut inner = self.inner.lock();
            if inner.state != StreamState::Unconnected {
                return Err(ServerErrorCode::BadState.into());
            }
            inner.state = StreamState::Creating;
            inner.flags = flags;
            if let Some(source) = source {
                inner.device_name = source.to_string();
            }
            inner.granted = Some(BufferAttr {
                max_length: Some(attr.max_length.unwrap_or(DEFAULT_MAX_LENGTH)),
                fragment_size: attr.fragment_size,
            });
        }

        let (state, error) = match self.context.behavior.fail_record_streams {
            Some(code) => (StreamState::Failed, Some(ServerError::new(code))),
            None => (StreamState::Ready, None),
        };
        let stream = self.clone();
        if self
            .dispatcher
            .post(move |guard| stream.transition(guard, state, error))
        {
            Ok(())
        } else {
            Err(ServerErrorCode::ConnectionTerminated.into())
        }
    }

    fn disconnect(&self) -> Result<(), ServerError> {
        {
            let mut inner = self.inner.lock();
            if inner.state == StreamState::Unconnected {
                return Err(ServerErrorCode::BadState.into());
            }
            inner.state = StreamState::Terminated;
        }
        self.stop_generator();
        Ok(())
    }

    fn state(&self) -> StreamState {
        self.inner.lock().state
    }

    fn peek(&self) -> Result<Peek, ServerError> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.peek_error.take() {
            // The client drops after a failed peek like after any other.
            inner.peeked = true;
            return Err(error);
        }
        inner.peeked = !inner.queue.is_empty();
        Ok(match inner.queue.front() {
            None => Peek::Empty,
            Some(Fragment::Hole(len)) => Peek::Hole(*len),
            Some(Fragment::Data(bytes)) => Peek::Data(Arc::clone(bytes)),
        })
    }

    fn drop_fragment(&self) -> Result<(), ServerError> {
        let mut inner = self.inner.lock();
        inner.drop_calls += 1;
        if !std::mem::take(&mut inner.peeked) {
            return Err(ServerErrorCode::BadState.into());
        }
        if let Some(fragment) = inner.queue.pop_front() {
            inner.queued_bytes -= fragment.len();
            inner.bytes_read += fragment.len() as u64;
        }
        Ok(())
    }

    fn latency(&self) -> Result<Latency, ServerError> {
        self.inner.lock().latency.clone()
    }

    fn time(&self) -> Result<Duration, ServerError> {
        let inner = self.inner.lock();
        if inner.state != StreamState::Ready {
            return Err(ServerErrorCode::NoData.into());
        }
        let bytes = usize::try_from(inner.bytes_read).unwrap_or(usize::MAX);
        Ok(inner.spec.bytes_to_duration(bytes))
    }

    fn buffer_attr(&self) -> Option<BufferAttr> {
        self.inner.lock().granted
    }

    fn device_index(&self) -> Option<u32> {
        let inner = self.inner.lock();
        (inner.state == StreamState::Ready).then_some(inner.device_index)
    }

    fn device_name(&self) -> Option<String> {
        let inner = self.inner.lock();
        (inner.state == StreamState::Ready).then(|| inner.device_name.clone())
    }
}
