use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::mainloop::connection::Connection;
use crate::mainloop::event_loop::{EventLoop, LoopGuard};
use crate::models::audio_models::{
    BufferAttr, CaptureDiagnostics, ChannelMap, Latency, SampleSpec, StreamFlags, StreamFormat,
    StreamId,
};
use crate::models::block::{Block, Timestamp};
use crate::models::config::CaptureConfiguration;
use crate::models::error::{CaptureError, ServerError};
use crate::models::state::{CaptureState, StreamState};
use crate::traits::allocator::{BlockAllocator, HeapAllocator};
use crate::traits::clock::{Clock, MonotonicClock};
use crate::traits::server::{Peek, ServerContext, ServerStream, StreamNotifyCallback};
use crate::traits::sink::SampleSink;

/// Host services a session uses from the event-loop thread.
#[derive(Clone)]
pub struct SessionRuntime {
    pub clock: Arc<dyn Clock>,
    pub allocator: Arc<dyn BlockAllocator>,
}

impl Default for SessionRuntime {
    fn default() -> Self {
        Self {
            clock: Arc::new(MonotonicClock),
            allocator: Arc::new(HeapAllocator),
        }
    }
}

/// Queries a host may issue against a running capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlQuery {
    CurrentTime,
    CachingDelay,
    CanSeek,
    CanPause,
    CanControlPace,
    CanControlRate,
    CanRecord,
    HasUnsupportedMeta,
    SetTime(Timestamp),
    SetNextDemuxTime(Timestamp),
    GetMeta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Time(Duration),
    Delay(Duration),
    Flag(bool),
}

/// Presentation time of a fragment read at `now`.
///
/// Latency reported as negative lies in the future and is added; otherwise
/// it is subtracted.
pub fn presentation_time(now: Timestamp, latency: Latency) -> Timestamp {
    if latency.negative {
        now.saturating_add_micros(latency.micros)
    } else {
        now.saturating_sub_micros(latency.micros)
    }
}

struct SessionState {
    state: CaptureState,
    stream_id: Option<StreamId>,
    discontinuity: bool,
    diagnostics: CaptureDiagnostics,
}

/// Session data reachable from stream callbacks.
struct SessionShared {
    id: Uuid,
    frame_size: usize,
    sink: Arc<dyn SampleSink>,
    runtime: SessionRuntime,
    state: Mutex<SessionState>,
}

impl SessionShared {
    fn new(id: Uuid, frame_size: usize, sink: Arc<dyn SampleSink>, runtime: SessionRuntime) -> Self {
        Self {
            id,
            frame_size,
            sink,
            runtime,
            state: Mutex::new(SessionState {
                state: CaptureState::Unconnected,
                stream_id: None,
                discontinuity: false,
                diagnostics: CaptureDiagnostics::default(),
            }),
        }
    }

    fn set_state(&self, state: CaptureState) {
        self.state.lock().state = state;
    }

    fn on_state_changed(&self, guard: &mut LoopGuard<'_>, stream: &dyn ServerStream) {
        let stream_state = stream.state();
        if stream_state.wakes_waiters() {
            guard.signal(false);
        }
        if !stream_state.is_terminal() {
            return;
        }

        let mut state = self.state.lock();
        if state.state.is_active() {
            state.state = if stream_state == StreamState::Failed {
                CaptureState::Failed
            } else {
                CaptureState::Terminated
            };
            log::warn!("[{}] record stream {:?}", self.id, stream_state);
        }
    }

    /// Consume one readable fragment. Every path that peeked drops exactly once.
    fn on_data_ready(&self, stream: &dyn ServerStream, length: usize) {
        log::trace!("[{}] {length} bytes readable", self.id);

        match stream.peek() {
            Ok(Peek::Empty) => return,
            Ok(Peek::Hole(size)) => self.mark_hole(size),
            Ok(Peek::Data(fragment)) => self.process_fragment(stream, &fragment),
            Err(err) => self.report_read_error("cannot peek stream", &err),
        }

        if let Err(err) = stream.drop_fragment() {
            log::error!("[{}] cannot drop fragment: {err}", self.id);
        }
    }

    fn process_fragment(&self, stream: &dyn ServerStream, fragment: &[u8]) {
        let latency = match stream.latency() {
            Ok(latency) => latency,
            Err(err) => return self.report_read_error("cannot determine latency", &err),
        };
        let pts = presentation_time(self.runtime.clock.now(), latency);

        // The clock reference goes out even when the fragment does not.
        self.sink.set_clock_reference(pts);

        let mut state = self.state.lock();
        state.diagnostics.fragments_received += 1;
        if state.state == CaptureState::Ready {
            state.state = CaptureState::Streaming;
        }

        let Some(stream_id) = state.stream_id else {
            // Fragment arrived before the output stream was registered.
            state.diagnostics.dropped_before_sink += 1;
            return;
        };

        let Some(mut data) = self.runtime.allocator.allocate(fragment.len()) else {
            state.discontinuity = true;
            state.diagnostics.allocation_failures += 1;
            return;
        };
        data.extend_from_slice(fragment);

        let block = Block {
            data,
            pts,
            dts: pts,
            sample_count: fragment.len() / self.frame_size,
            discontinuity: std::mem::take(&mut state.discontinuity),
        };
        state.diagnostics.blocks_sent += 1;
        state.diagnostics.bytes_sent += fragment.len() as u64;
        drop(state);

        self.sink.send(stream_id, block);
    }

    fn mark_hole(&self, size: usize) {
        log::debug!("[{}] server dropped {size} bytes", self.id);
        let mut state = self.state.lock();
        state.discontinuity = true;
        state.diagnostics.holes += 1;
    }

    fn report_read_error(&self, what: &str, err: &ServerError) {
        log::error!("[{}] {what}: {err}", self.id);
        self.state.lock().diagnostics.read_errors += 1;
    }

    fn on_moved(&self, stream: &dyn ServerStream) {
        log::debug!(
            "[{}] connected to source {}: {}",
            self.id,
            stream.device_index().map_or_else(|| "?".into(), |i| i.to_string()),
            stream.device_name().unwrap_or_default()
        );
    }

    fn on_overflow(&self, _stream: &dyn ServerStream) {
        log::error!("[{}] overflow", self.id);
        self.state.lock().diagnostics.overflows += 1;
    }

    fn on_started(&self, _stream: &dyn ServerStream) {
        log::debug!("[{}] started", self.id);
    }

    fn on_suspended(&self, _stream: &dyn ServerStream) {
        log::debug!("[{}] suspended", self.id);
    }

    fn on_underflow(&self, _stream: &dyn ServerStream) {
        log::debug!("[{}] underflow", self.id);
        self.state.lock().diagnostics.underflows += 1;
    }
}

/// A live record stream on a [`Connection`], feeding a [`SampleSink`].
///
/// Dropping the session closes the stream; the connection must outlive it
/// and is released separately.
pub struct CaptureSession {
    id: Uuid,
    shared: Arc<SessionShared>,
    stream: Option<Box<dyn ServerStream>>,
    event_loop: Arc<EventLoop>,
    caching_us: u64,
}

impl CaptureSession {
    pub fn open(
        connection: &Connection,
        sink: Arc<dyn SampleSink>,
        config: &CaptureConfiguration,
    ) -> Result<Self, CaptureError> {
        Self::open_with(connection, sink, config, SessionRuntime::default())
    }

    /// Create the record stream, wait until the server reports it ready and
    /// register the output stream with `sink`.
    ///
    /// Runs with the loop lock held throughout, except while waiting.
    pub fn open_with(
        connection: &Connection,
        sink: Arc<dyn SampleSink>,
        config: &CaptureConfiguration,
        runtime: SessionRuntime,
    ) -> Result<Self, CaptureError> {
        config.validate().map_err(CaptureError::ConfigurationFailed)?;
        let context = connection.context()?;

        let spec = SampleSpec::CAPTURE;
        let channel_map = ChannelMap::stereo();
        let attr = BufferAttr::for_caching(&spec, config.caching_us);

        let id = Uuid::new_v4();
        let shared = Arc::new(SessionShared::new(
            id,
            spec.frame_size(),
            Arc::clone(&sink),
            runtime,
        ));
        let event_loop = Arc::clone(connection.event_loop());

        let stream = {
            let mut guard = event_loop.lock();
            shared.set_state(CaptureState::Connecting);

            let stream = context
                .new_record_stream(&config.stream_name, &spec, &channel_map)
                .map_err(|err| {
                    log::error!("[{id}] cannot create record stream: {err}");
                    shared.set_state(CaptureState::Failed);
                    CaptureError::StreamConnectionFailed(err)
                })?;
            register_callbacks(stream.as_ref(), &shared);

            let connected = stream
                .connect_record(config.source.as_deref(), &attr, StreamFlags::capture())
                .and_then(|()| wait_stream_ready(&mut guard, stream.as_ref(), context));
            if let Err(err) = connected {
                log::error!("[{id}] cannot connect record stream: {err}");
                release_stream(stream);
                shared.set_state(CaptureState::Failed);
                return Err(CaptureError::StreamConnectionFailed(err));
            }

            let stream_id = sink.add_stream(&StreamFormat::from_spec(&spec, channel_map));
            {
                let mut state = shared.state.lock();
                state.stream_id = Some(stream_id);
                if state.state == CaptureState::Connecting {
                    state.state = CaptureState::Ready;
                }
            }

            if let Some(granted) = stream.buffer_attr() {
                log::debug!(
                    "[{id}] using buffer metrics: maxlength={:?}, fragsize={:?}",
                    granted.max_length,
                    granted.fragment_size
                );
            }
            stream
        };

        Ok(Self {
            id,
            shared,
            stream: Some(stream),
            event_loop,
            caching_us: config.caching_us,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> CaptureState {
        self.shared.state.lock().state
    }

    pub fn diagnostics(&self) -> CaptureDiagnostics {
        self.shared.state.lock().diagnostics.clone()
    }

    pub fn caching_delay_us(&self) -> u64 {
        self.caching_us
    }

    /// Stream clock position, or `Unsupported` while the server cannot tell.
    pub fn current_time(&self) -> Result<Duration, CaptureError> {
        let stream = self.stream.as_deref().ok_or(CaptureError::Unsupported)?;
        let _guard = self.event_loop.lock();
        stream.time().map_err(|err| {
            log::debug!("[{}] stream time unavailable: {err}", self.id);
            CaptureError::Unsupported
        })
    }

    pub fn control(&self, query: ControlQuery) -> Result<ControlReply, CaptureError> {
        match query {
            ControlQuery::CurrentTime => self.current_time().map(ControlReply::Time),
            ControlQuery::CachingDelay => Ok(ControlReply::Delay(Duration::from_micros(
                self.caching_us,
            ))),
            // Live source: no seeking, pausing, pacing or recording.
            ControlQuery::CanSeek
            | ControlQuery::CanPause
            | ControlQuery::CanControlPace
            | ControlQuery::CanControlRate
            | ControlQuery::CanRecord
            | ControlQuery::HasUnsupportedMeta => Ok(ControlReply::Flag(false)),
            ControlQuery::SetTime(_) | ControlQuery::SetNextDemuxTime(_) | ControlQuery::GetMeta => {
                Err(CaptureError::Unsupported)
            }
        }
    }

    /// Explicit form of dropping the session.
    pub fn close(self) {}

    /// Close the session when the caller already holds the loop lock.
    pub fn close_locked(mut self, _guard: &mut LoopGuard<'_>) {
        if let Some(stream) = self.stream.take() {
            release_stream(stream);
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _guard = self.event_loop.lock();
            release_stream(stream);
        }

        let mut state = self.shared.state.lock();
        if state.state != CaptureState::Failed {
            state.state = CaptureState::Terminated;
        }
        log::debug!("[{}] record stream closed", self.id);
    }
}

fn wait_stream_ready(
    guard: &mut LoopGuard<'_>,
    stream: &dyn ServerStream,
    context: &dyn ServerContext,
) -> Result<(), ServerError> {
    loop {
        match stream.state() {
            StreamState::Ready => return Ok(()),
            state if state.is_terminal() => return Err(context.last_error()),
            _ => guard.wait(),
        }
    }
}

fn notify(
    shared: &Arc<SessionShared>,
    handler: fn(&SessionShared, &dyn ServerStream),
) -> StreamNotifyCallback {
    let shared = Arc::clone(shared);
    Arc::new(move |_guard: &mut LoopGuard<'_>, stream: &dyn ServerStream| {
        handler(&shared, stream)
    })
}

fn register_callbacks(stream: &dyn ServerStream, shared: &Arc<SessionShared>) {
    let on_state = Arc::clone(shared);
    stream.set_state_callback(Some(Arc::new(
        move |guard: &mut LoopGuard<'_>, stream: &dyn ServerStream| {
            on_state.on_state_changed(guard, stream)
        },
    )));
    let on_read = Arc::clone(shared);
    stream.set_read_callback(Some(Arc::new(
        move |_guard: &mut LoopGuard<'_>, stream: &dyn ServerStream, length: usize| {
            on_read.on_data_ready(stream, length)
        },
    )));
    stream.set_moved_callback(Some(notify(shared, SessionShared::on_moved)));
    stream.set_overflow_callback(Some(notify(shared, SessionShared::on_overflow)));
    stream.set_started_callback(Some(notify(shared, SessionShared::on_started)));
    stream.set_suspended_callback(Some(notify(shared, SessionShared::on_suspended)));
    stream.set_underflow_callback(Some(notify(shared, SessionShared::on_underflow)));
}

fn clear_callbacks(stream: &dyn ServerStream) {
    stream.set_state_callback(None);
    stream.set_read_callback(None);
    stream.set_moved_callback(None);
    stream.set_overflow_callback(None);
    stream.set_started_callback(None);
    stream.set_suspended_callback(None);
    stream.set_underflow_callback(None);
}

/// Disconnect, deregister every callback, then release. Loop lock held.
fn release_stream(stream: Box<dyn ServerStream>) {
    if let Err(err) = stream.disconnect() {
        log::debug!("record stream disconnect: {err}");
    }
    clear_callbacks(stream.as_ref());
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::error::ServerErrorCode;
    use crate::traits::server::StreamReadCallback;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeInner {
        state: Option<StreamState>,
        peeks: VecDeque<Result<Peek, ServerError>>,
        latency: Option<Result<Latency, ServerError>>,
        time: Option<Result<Duration, ServerError>>,
        drops: usize,
        disconnected: bool,
        notify_slots: usize,
        read_slot: bool,
    }

    /// Clones share state, so a test can keep a handle on a released stream.
    #[derive(Default, Clone)]
    struct FakeStream {
        inner: Arc<Mutex<FakeInner>>,
    }

    impl FakeStream {
        fn with_latency(latency: Latency) -> Self {
            let stream = Self::default();
            stream.inner.lock().latency = Some(Ok(latency));
            stream
        }

        fn queue(&self, peek: Result<Peek, ServerError>) {
            self.inner.lock().peeks.push_back(peek);
        }

        fn queue_data(&self, bytes: &[u8]) {
            self.queue(Ok(Peek::Data(Arc::from(bytes))));
        }

        fn drops(&self) -> usize {
            self.inner.lock().drops
        }

        fn set_notify(&self, set: bool) {
            let mut inner = self.inner.lock();
            if set {
                inner.notify_slots += 1;
            } else {
                inner.notify_slots = inner.notify_slots.saturating_sub(1);
            }
        }
    }

    impl ServerStream for FakeStream {
        fn set_state_callback(&self, callback: Option<StreamNotifyCallback>) {
            self.set_notify(callback.is_some());
        }
        fn set_read_callback(&self, callback: Option<StreamReadCallback>) {
            self.inner.lock().read_slot = callback.is_some();
        }
        fn set_moved_callback(&self, callback: Option<StreamNotifyCallback>) {
            self.set_notify(callback.is_some());
        }
        fn set_overflow_callback(&self, callback: Option<StreamNotifyCallback>) {
            self.set_notify(callback.is_some());
        }
        fn set_started_callback(&self, callback: Option<StreamNotifyCallback>) {
            self.set_notify(callback.is_some());
        }
        fn set_suspended_callback(&self, callback: Option<StreamNotifyCallback>) {
            self.set_notify(callback.is_some());
        }
        fn set_underflow_callback(&self, callback: Option<StreamNotifyCallback>) {
            self.set_notify(callback.is_some());
        }
        fn connect_record(
            &self,
            _source: Option<&str>,
            _attr: &BufferAttr,
            _flags: StreamFlags,
        ) -> Result<(), ServerError> {
            Ok(())
        }
        fn disconnect(&self) -> Result<(), ServerError> {
            self.inner.lock().disconnected = true;
            Ok(())
        }
        fn state(&self) -> StreamState {
            self.inner.lock().state.unwrap_or(StreamState::Ready)
        }
        fn peek(&self) -> Result<Peek, ServerError> {
            self.inner.lock().peeks.pop_front().unwrap_or(Ok(Peek::Empty))
        }
        fn drop_fragment(&self) -> Result<(), ServerError> {
            self.inner.lock().drops += 1;
            Ok(())
        }
        fn latency(&self) -> Result<Latency, ServerError> {
            self.inner.lock().latency.clone().unwrap_or(Ok(Latency::default()))
        }
        fn time(&self) -> Result<Duration, ServerError> {
            self.inner
                .lock()
                .time
                .clone()
                .unwrap_or(Err(ServerErrorCode::NoData.into()))
        }
        fn buffer_attr(&self) -> Option<BufferAttr> {
            None
        }
        fn device_index(&self) -> Option<u32> {
            Some(3)
        }
        fn device_name(&self) -> Option<String> {
            Some("fake.monitor".into())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        clock_refs: Mutex<Vec<Timestamp>>,
        blocks: Mutex<Vec<Block>>,
    }

    impl SampleSink for RecordingSink {
        fn add_stream(&self, _format: &StreamFormat) -> StreamId {
            StreamId(7)
        }
        fn set_clock_reference(&self, pts: Timestamp) {
            self.clock_refs.lock().push(pts);
        }
        fn send(&self, stream: StreamId, block: Block) {
            assert_eq!(stream, StreamId(7));
            self.blocks.lock().push(block);
        }
    }

    struct FixedClock(i64);

    impl Clock for FixedClock {
        fn now(&self) -> Timestamp {
            Timestamp::from_micros(self.0)
        }
    }

    /// Fails the first allocation only.
    #[derive(Default)]
    struct FailOnce {
        failed: AtomicBool,
    }

    impl BlockAllocator for FailOnce {
        fn allocate(&self, len: usize) -> Option<Vec<u8>> {
            if self.failed.swap(true, Ordering::SeqCst) {
                HeapAllocator.allocate(len)
            } else {
                None
            }
        }
    }

    const NOW: i64 = 10_000_000;

    fn shared_with(
        sink: Arc<RecordingSink>,
        allocator: Arc<dyn BlockAllocator>,
        registered: bool,
    ) -> SessionShared {
        let shared = SessionShared::new(
            Uuid::new_v4(),
            SampleSpec::CAPTURE.frame_size(),
            sink,
            SessionRuntime {
                clock: Arc::new(FixedClock(NOW)),
                allocator,
            },
        );
        {
            let mut state = shared.state.lock();
            state.state = CaptureState::Ready;
            if registered {
                state.stream_id = Some(StreamId(7));
            }
        }
        shared
    }

    fn registered(sink: &Arc<RecordingSink>) -> SessionShared {
        shared_with(Arc::clone(sink), Arc::new(HeapAllocator), true)
    }

    #[test]
    fn latency_sign_convention() {
        let now = Timestamp::from_micros(NOW);
        assert_eq!(
            presentation_time(now, Latency::ahead(25_000)).as_micros(),
            NOW + 25_000
        );
        assert_eq!(
            presentation_time(now, Latency::behind(25_000)).as_micros(),
            NOW - 25_000
        );
        assert_eq!(presentation_time(now, Latency::behind(0)), now);
    }

    #[test]
    fn fragment_becomes_timestamped_block() {
        let sink = Arc::new(RecordingSink::default());
        let shared = registered(&sink);
        let stream = FakeStream::with_latency(Latency::behind(40_000));
        stream.queue_data(&[1u8; 64]);

        shared.on_data_ready(&stream, 64);

        let blocks = sink.blocks.lock();
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.data, vec![1u8; 64]);
        assert_eq!(block.pts.as_micros(), NOW - 40_000);
        assert_eq!(block.dts, block.pts);
        assert_eq!(block.sample_count, 16);
        assert!(!block.discontinuity);
        assert_eq!(*sink.clock_refs.lock(), vec![block.pts]);
        assert_eq!(stream.drops(), 1);
        assert_eq!(shared.state.lock().state, CaptureState::Streaming);
    }

    #[test]
    fn negative_latency_moves_timestamp_forward() {
        let sink = Arc::new(RecordingSink::default());
        let shared = registered(&sink);
        let stream = FakeStream::with_latency(Latency::ahead(5_000));
        stream.queue_data(&[0u8; 8]);

        shared.on_data_ready(&stream, 8);

        assert_eq!(sink.blocks.lock()[0].pts.as_micros(), NOW + 5_000);
    }

    #[test]
    fn fragment_before_sink_registration_is_dropped_silently() {
        let sink = Arc::new(RecordingSink::default());
        let shared = shared_with(Arc::clone(&sink), Arc::new(HeapAllocator), false);
        let stream = FakeStream::with_latency(Latency::behind(1_000));
        stream.queue_data(&[9u8; 16]);

        shared.on_data_ready(&stream, 16);

        assert!(sink.blocks.lock().is_empty());
        // Clock reference is still published.
        assert_eq!(sink.clock_refs.lock().len(), 1);
        assert_eq!(stream.drops(), 1);
        let state = shared.state.lock();
        assert_eq!(state.diagnostics.dropped_before_sink, 1);
        assert!(!state.discontinuity);
    }

    #[test]
    fn allocation_failure_flags_next_block() {
        let sink = Arc::new(RecordingSink::default());
        let shared = shared_with(Arc::clone(&sink), Arc::new(FailOnce::default()), true);
        let stream = FakeStream::with_latency(Latency::behind(0));
        for _ in 0..3 {
            stream.queue_data(&[2u8; 4]);
        }

        shared.on_data_ready(&stream, 4);
        assert!(sink.blocks.lock().is_empty());
        assert!(shared.state.lock().discontinuity);

        shared.on_data_ready(&stream, 4);
        shared.on_data_ready(&stream, 4);

        let blocks = sink.blocks.lock();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].discontinuity);
        assert!(!blocks[1].discontinuity);
        assert!(!shared.state.lock().discontinuity);
        assert_eq!(shared.state.lock().diagnostics.allocation_failures, 1);
        assert_eq!(stream.drops(), 3);
    }

    #[test]
    fn peek_failure_still_drops() {
        let sink = Arc::new(RecordingSink::default());
        let shared = registered(&sink);
        let stream = FakeStream::default();
        stream.queue(Err(ServerErrorCode::BadState.into()));

        shared.on_data_ready(&stream, 32);

        assert!(sink.clock_refs.lock().is_empty());
        assert!(sink.blocks.lock().is_empty());
        assert_eq!(stream.drops(), 1);
        assert_eq!(shared.state.lock().diagnostics.read_errors, 1);
    }

    #[test]
    fn latency_failure_still_drops() {
        let sink = Arc::new(RecordingSink::default());
        let shared = registered(&sink);
        let stream = FakeStream::default();
        stream.inner.lock().latency = Some(Err(ServerErrorCode::NoData.into()));
        stream.queue_data(&[0u8; 4]);

        shared.on_data_ready(&stream, 4);

        assert!(sink.clock_refs.lock().is_empty());
        assert!(sink.blocks.lock().is_empty());
        assert_eq!(stream.drops(), 1);
    }

    #[test]
    fn hole_marks_discontinuity() {
        let sink = Arc::new(RecordingSink::default());
        let shared = registered(&sink);
        let stream = FakeStream::with_latency(Latency::behind(0));
        stream.queue(Ok(Peek::Hole(128)));
        stream.queue_data(&[5u8; 4]);

        shared.on_data_ready(&stream, 128);
        shared.on_data_ready(&stream, 4);

        let blocks = sink.blocks.lock();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].discontinuity);
        assert_eq!(stream.drops(), 2);
    }

    #[test]
    fn empty_buffer_is_not_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let shared = registered(&sink);
        let stream = FakeStream::default();

        shared.on_data_ready(&stream, 0);

        assert_eq!(stream.drops(), 0);
        assert!(sink.clock_refs.lock().is_empty());
    }

    #[test]
    fn late_stream_failure_fails_the_session() {
        let event_loop = EventLoop::start("test-loop").unwrap();
        let sink = Arc::new(RecordingSink::default());
        let shared = registered(&sink);
        let stream = FakeStream::default();
        stream.inner.lock().state = Some(StreamState::Failed);

        let mut guard = event_loop.lock();
        shared.on_state_changed(&mut guard, &stream);

        assert_eq!(shared.state.lock().state, CaptureState::Failed);
    }

    #[test]
    fn release_clears_every_callback() {
        let sink = Arc::new(RecordingSink::default());
        let shared = Arc::new(registered(&sink));
        let stream = FakeStream::default();

        register_callbacks(&stream, &shared);
        assert_eq!(stream.inner.lock().notify_slots, 6);
        assert!(stream.inner.lock().read_slot);

        release_stream(Box::new(stream.clone()));

        let inner = stream.inner.lock();
        assert!(inner.disconnected);
        assert_eq!(inner.notify_slots, 0);
        assert!(!inner.read_slot);
    }

    #[test]
    fn control_queries() {
        let event_loop = Arc::new(EventLoop::start("test-loop").unwrap());
        let sink = Arc::new(RecordingSink::default());
        let shared = Arc::new(registered(&sink));
        let stream = FakeStream::default();
        stream.inner.lock().time = Some(Ok(Duration::from_millis(1500)));
        let session = CaptureSession {
            id: Uuid::new_v4(),
            shared,
            stream: Some(Box::new(stream)),
            event_loop,
            caching_us: 1_000_000,
        };

        assert_eq!(
            session.control(ControlQuery::CachingDelay),
            Ok(ControlReply::Delay(Duration::from_micros(1_000_000)))
        );
        assert_eq!(session.caching_delay_us(), 1_000_000);
        assert_eq!(
            session.control(ControlQuery::CurrentTime),
            Ok(ControlReply::Time(Duration::from_millis(1500)))
        );
        for query in [
            ControlQuery::CanSeek,
            ControlQuery::CanPause,
            ControlQuery::CanControlPace,
            ControlQuery::CanControlRate,
            ControlQuery::CanRecord,
            ControlQuery::HasUnsupportedMeta,
        ] {
            assert_eq!(session.control(query), Ok(ControlReply::Flag(false)), "{query:?}");
        }
        for query in [
            ControlQuery::GetMeta,
            ControlQuery::SetTime(Timestamp::from_micros(0)),
            ControlQuery::SetNextDemuxTime(Timestamp::from_micros(0)),
        ] {
            assert_eq!(session.control(query), Err(CaptureError::Unsupported));
        }

        session.close();
    }

    #[test]
    fn unknown_stream_time_is_unsupported() {
        let event_loop = Arc::new(EventLoop::start("test-loop").unwrap());
        let sink = Arc::new(RecordingSink::default());
        let session = CaptureSession {
            id: Uuid::new_v4(),
            shared: Arc::new(registered(&sink)),
            stream: Some(Box::new(FakeStream::default())),
            event_loop,
            caching_us: 300_000,
        };

        assert_eq!(session.current_time(), Err(CaptureError::Unsupported));
        drop(session);
    }
}
