use std::time::Duration;

/// PCM sample encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 16-bit, native endian.
    S16Ne,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16Ne => 2,
        }
    }

    pub fn bits_per_sample(self) -> u32 {
        self.bytes_per_sample() as u32 * 8
    }
}

/// Sample encoding, rate and channel count of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    /// The only format this crate records: stereo, s16 native-endian, 48 kHz.
    pub const CAPTURE: SampleSpec = SampleSpec {
        format: SampleFormat::S16Ne,
        rate: 48000,
        channels: 2,
    };

    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.channels > 0
    }

    /// Size of one frame (one sample per channel) in bytes.
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * usize::from(self.channels)
    }

    /// Bytes needed for `usec` microseconds of audio, rounded down to whole frames.
    pub fn usec_to_bytes(&self, usec: u64) -> usize {
        let frames = usec.saturating_mul(u64::from(self.rate)) / 1_000_000;
        frames as usize * self.frame_size()
    }

    /// Playback time represented by `bytes` of audio.
    pub fn bytes_to_duration(&self, bytes: usize) -> Duration {
        let frames = (bytes / self.frame_size()) as u64;
        Duration::from_micros(frames * 1_000_000 / u64::from(self.rate))
    }
}

/// Speaker position of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
}

/// Ordered channel layout of a stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelMap {
    pub positions: Vec<ChannelPosition>,
}

impl ChannelMap {
    pub fn stereo() -> Self {
        Self {
            positions: vec![ChannelPosition::FrontLeft, ChannelPosition::FrontRight],
        }
    }

    pub fn channels(&self) -> usize {
        self.positions.len()
    }

    pub fn is_compatible(&self, spec: &SampleSpec) -> bool {
        self.channels() == usize::from(spec.channels)
    }
}

/// Server-side buffering requested for (or granted to) a record stream.
///
/// `None` leaves the choice to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferAttr {
    pub max_length: Option<u32>,
    pub fragment_size: Option<u32>,
}

impl BufferAttr {
    /// Fragments of half the end-to-end caching budget, unconstrained maximum.
    pub fn for_caching(spec: &SampleSpec, caching_us: u64) -> Self {
        let fragment = spec.usec_to_bytes(caching_us) / 2;
        Self {
            max_length: None,
            fragment_size: Some(u32::try_from(fragment).unwrap_or(u32::MAX)),
        }
    }
}

/// Record stream connection flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags {
    pub interpolate_timing: bool,
    pub auto_timing_update: bool,
}

impl StreamFlags {
    pub fn capture() -> Self {
        Self {
            interpolate_timing: true,
            auto_timing_update: true,
        }
    }
}

/// Stream latency as reported by the server.
///
/// The sign is carried separately from the magnitude: `negative` means the
/// capture position lies ahead of the read position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Latency {
    pub micros: u64,
    pub negative: bool,
}

impl Latency {
    pub fn behind(micros: u64) -> Self {
        Self {
            micros,
            negative: false,
        }
    }

    pub fn ahead(micros: u64) -> Self {
        Self {
            micros,
            negative: true,
        }
    }
}

/// Codec of an elementary output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleCodec {
    /// Signed 16-bit PCM, native endian.
    S16N,
}

/// Descriptor registered with the downstream sink for the captured stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFormat {
    pub codec: SampleCodec,
    pub channel_map: ChannelMap,
    pub channels: u8,
    pub rate: u32,
    pub bits_per_sample: u32,
    pub block_align: u32,
    pub bitrate: u32,
}

impl StreamFormat {
    pub fn from_spec(spec: &SampleSpec, channel_map: ChannelMap) -> Self {
        let bits_per_sample = spec.format.bits_per_sample();
        Self {
            codec: SampleCodec::S16N,
            channel_map,
            channels: spec.channels,
            rate: spec.rate,
            bits_per_sample,
            block_align: spec.frame_size() as u32,
            bitrate: u32::from(spec.channels) * spec.rate * bits_per_sample,
        }
    }
}

/// Identifier of an elementary stream registered with a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u32);

/// Counters describing what a capture session has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureDiagnostics {
    pub fragments_received: u64,
    pub blocks_sent: u64,
    pub bytes_sent: u64,
    pub dropped_before_sink: u64,
    pub allocation_failures: u64,
    pub holes: u64,
    pub read_errors: u64,
    pub overflows: u64,
    pub underflows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_spec_frame_size() {
        assert_eq!(SampleSpec::CAPTURE.frame_size(), 4);
        assert!(SampleSpec::CAPTURE.is_valid());
    }

    #[test]
    fn one_second_of_caching_gives_half_second_fragments() {
        let attr = BufferAttr::for_caching(&SampleSpec::CAPTURE, 1_000_000);
        assert_eq!(attr.fragment_size, Some(96_000));
        assert_eq!(attr.max_length, None);
    }

    #[test]
    fn usec_to_bytes_rounds_down_to_frames() {
        // 1 µs at 48 kHz is less than a frame.
        assert_eq!(SampleSpec::CAPTURE.usec_to_bytes(1), 0);
        // 300 ms = 14400 frames.
        assert_eq!(SampleSpec::CAPTURE.usec_to_bytes(300_000), 57_600);
    }

    #[test]
    fn bytes_to_duration() {
        assert_eq!(
            SampleSpec::CAPTURE.bytes_to_duration(192_000),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn stereo_map_matches_capture_spec() {
        assert!(ChannelMap::stereo().is_compatible(&SampleSpec::CAPTURE));
    }

    #[test]
    fn capture_stream_format() {
        let fmt = StreamFormat::from_spec(&SampleSpec::CAPTURE, ChannelMap::stereo());
        assert_eq!(fmt.block_align, 4);
        assert_eq!(fmt.bits_per_sample, 16);
        assert_eq!(fmt.bitrate, 1_536_000);
    }
}
