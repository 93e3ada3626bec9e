use serde::Deserialize;

/// Default end-to-end caching budget for live capture (300 ms).
pub const DEFAULT_CACHING_US: u64 = 300_000;

/// Configuration for a live capture.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CaptureConfiguration {
    /// End-to-end caching budget in microseconds (default: 300 000).
    pub caching_us: u64,

    /// Identity announced to the audio server; used for diagnostics only.
    pub user_agent: String,

    /// Name given to the record stream on the server.
    pub stream_name: String,

    /// Source device to record from, or None for the server default.
    pub source: Option<String>,
}

impl CaptureConfiguration {
    pub fn from_json(json: &str) -> Result<Self, String> {
        let config: Self = serde_json::from_str(json).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.caching_us == 0 {
            return Err("caching budget must be positive".into());
        }
        if i64::try_from(self.caching_us).is_err() {
            return Err(format!("caching budget too large: {}us", self.caching_us));
        }
        if self.user_agent.trim().is_empty() {
            return Err("user agent must not be empty".into());
        }
        if self.stream_name.is_empty() {
            return Err("stream name must not be empty".into());
        }
        Ok(())
    }
}

impl Default for CaptureConfiguration {
    fn default() -> Self {
        Self {
            caching_us: DEFAULT_CACHING_US,
            user_agent: concat!("pulse-capture/", env!("CARGO_PKG_VERSION")).into(),
            stream_name: "audio stream".into(),
            source: None,
        }
    }
}
