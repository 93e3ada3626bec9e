use std::sync::OnceLock;
use std::time::Instant;

use crate::models::block::Timestamp;

/// First reading of [`MonotonicClock`], in microseconds (2^40, about 12.7 days).
///
/// Any latency a server reports can be subtracted from a reading without
/// reaching zero.
pub const CLOCK_ORIGIN_US: i64 = 1 << 40;

/// Source of "now" for presentation timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Monotonic microsecond clock starting at [`CLOCK_ORIGIN_US`] on the first
/// reading in the process.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        static EPOCH: OnceLock<Instant> = OnceLock::new();
        let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
        let micros = i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX);
        Timestamp::from_micros(CLOCK_ORIGIN_US.saturating_add(micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audio_models::Latency;
    use crate::session::capture::presentation_time;

    #[test]
    fn monotonic_clock_advances() {
        let clock = MonotonicClock;
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = clock.now();
        assert!(a.as_micros() >= CLOCK_ORIGIN_US);
        assert!(b > a);
    }

    #[test]
    fn early_readings_survive_large_latency() {
        let now = MonotonicClock.now();
        // Ten seconds behind is far beyond any capture buffer.
        let pts = presentation_time(now, Latency::behind(10_000_000));
        assert!(pts.as_micros() > 0);
    }
}
