//! Records from the simulated audio server for a few seconds and prints
//! what reached the sink.
//!
//! Usage: `pulse-capture-demo [seconds] [config.json]`

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use pulse_capture_core::{
    open_capture, Block, CaptureConfiguration, ControlQuery, ControlReply, LoopRegistry,
    SampleSink, ServerBehavior, SimulatedServer, StreamFormat, StreamId, Timestamp,
};

const DEFAULT_SECONDS: u64 = 3;

#[derive(Debug, Default)]
struct Meter {
    streams: u32,
    blocks: u64,
    bytes: u64,
    discontinuities: u64,
    peak: i16,
    first_pts: Option<Timestamp>,
    last_pts: Option<Timestamp>,
}

/// Sink that only measures what it receives.
#[derive(Default)]
struct MeterSink {
    meter: Mutex<Meter>,
}

impl SampleSink for MeterSink {
    fn add_stream(&self, format: &StreamFormat) -> StreamId {
        let mut meter = self.meter.lock();
        meter.streams += 1;
        log::info!(
            "output stream {}: {} Hz, {} channels, {} bit/s",
            meter.streams,
            format.rate,
            format.channels,
            format.bitrate
        );
        StreamId(meter.streams)
    }

    fn set_clock_reference(&self, _pts: Timestamp) {}

    fn send(&self, _stream: StreamId, block: Block) {
        let peak = block
            .data
            .chunks_exact(2)
            .map(|s| i16::from_ne_bytes([s[0], s[1]]).saturating_abs())
            .max()
            .unwrap_or(0);

        let mut meter = self.meter.lock();
        meter.blocks += 1;
        meter.bytes += block.len() as u64;
        meter.discontinuities += u64::from(block.discontinuity);
        meter.peak = meter.peak.max(peak);
        meter.first_pts.get_or_insert(block.pts);
        meter.last_pts = Some(block.pts);
    }
}

fn load_config(path: Option<String>) -> Result<CaptureConfiguration, String> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(&path).map_err(|e| format!("{path}: {e}"))?;
            CaptureConfiguration::from_json(&json)
        }
        None => Ok(CaptureConfiguration::default()),
    }
}

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let seconds = args
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_SECONDS);
    let config = match load_config(args.next()) {
        Ok(config) => config,
        Err(err) => {
            log::error!("invalid configuration: {err}");
            std::process::exit(2);
        }
    };

    let server = SimulatedServer::with_behavior(ServerBehavior {
        generator_interval: Some(Duration::from_millis(20)),
        ..ServerBehavior::default()
    });
    let sink = Arc::new(MeterSink::default());

    let capture = match open_capture(&server, sink.clone(), &config) {
        Ok(capture) => capture,
        Err(err) => {
            log::error!("{err}");
            std::process::exit(1);
        }
    };

    thread::sleep(Duration::from_secs(seconds));

    if let Ok(ControlReply::Time(position)) = capture.control(ControlQuery::CurrentTime) {
        log::info!("stream position {:.3}s", position.as_secs_f64());
    }
    let diagnostics = capture.session().diagnostics();
    capture.close();

    let meter = sink.meter.lock();
    let span = match (meter.first_pts, meter.last_pts) {
        (Some(first), Some(last)) => last.as_micros() - first.as_micros(),
        _ => 0,
    };
    println!(
        "{} blocks, {} bytes, {} discontinuities, peak {}, pts span {} us",
        meter.blocks, meter.bytes, meter.discontinuities, meter.peak, span
    );
    println!("{diagnostics:?}");
    println!("{:?}", LoopRegistry::global().stats());
}
