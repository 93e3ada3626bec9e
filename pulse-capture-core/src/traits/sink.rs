use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::Sender;

use crate::models::audio_models::{StreamFormat, StreamId};
use crate::models::block::{Block, Timestamp};

/// Downstream consumer of captured audio.
///
/// All methods except `add_stream` are called from the event-loop thread
/// with the loop lock held. Implementations must not block.
pub trait SampleSink: Send + Sync {
    /// Register an elementary output stream.
    fn add_stream(&self, format: &StreamFormat) -> StreamId;

    /// Publish the clock reference for the input.
    fn set_clock_reference(&self, pts: Timestamp);

    fn send(&self, stream: StreamId, block: Block);
}

/// Everything a [`ChannelSink`] forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    StreamAdded(StreamId, StreamFormat),
    ClockReference(Timestamp),
    Block(StreamId, Block),
}

/// A sink forwarding every call over a std channel.
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
    next_id: AtomicU32,
}

impl ChannelSink {
    pub fn new(tx: Sender<SinkEvent>) -> Self {
        Self {
            tx,
            next_id: AtomicU32::new(1),
        }
    }
}

impl SampleSink for ChannelSink {
    fn add_stream(&self, format: &StreamFormat) -> StreamId {
        let id = StreamId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _ = self.tx.send(SinkEvent::StreamAdded(id, format.clone()));
        id
    }

    fn set_clock_reference(&self, pts: Timestamp) {
        let _ = self.tx.send(SinkEvent::ClockReference(pts));
    }

    fn send(&self, stream: StreamId, block: Block) {
        if self.tx.send(SinkEvent::Block(stream, block)).is_err() {
            log::trace!("sink receiver gone; block discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio_models::{ChannelMap, SampleSpec};
    use std::sync::mpsc;
    use std::sync::Arc;

    #[test]
    fn channel_sink_assigns_distinct_ids() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        let format = StreamFormat::from_spec(&SampleSpec::CAPTURE, ChannelMap::stereo());

        let a = sink.add_stream(&format);
        let b = sink.add_stream(&format);
        assert_ne!(a, b);
        assert_eq!(rx.recv().unwrap(), SinkEvent::StreamAdded(a, format.clone()));
    }

    #[test]
    fn test_sink_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Arc<dyn SampleSink>>();
    }
}
