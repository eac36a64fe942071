//! Session configuration, PCM format and credentials.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CadenzaError, Result};

/// Bytes per sample; the stream is always signed 16-bit little endian.
pub const BYTES_PER_SAMPLE: u16 = 2;

/// Layout of the PCM bytes carried by the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes in one frame (one sample across all channels).
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE as usize
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate.saturating_mul(self.bytes_per_frame() as u32)
    }

    /// Reject layouts the ring and the WAV header cannot represent.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(CadenzaError::InvalidSessionConfig(
                "sample rate must be positive".into(),
            ));
        }
        if self.channels == 0 {
            return Err(CadenzaError::InvalidSessionConfig(
                "channel count must be positive".into(),
            ));
        }
        if self
            .sample_rate
            .checked_mul(u32::from(self.channels) * u32::from(BYTES_PER_SAMPLE))
            .is_none()
        {
            return Err(CadenzaError::InvalidSessionConfig(format!(
                "byte rate of {} Hz x {} channels overflows",
                self.sample_rate, self.channels
            )));
        }
        Ok(())
    }

    /// Playback duration of `bytes` of PCM in this format.
    pub fn duration_secs(&self, bytes: usize) -> f64 {
        let rate = self.byte_rate();
        if rate == 0 {
            return 0.0;
        }
        bytes as f64 / rate as f64
    }

    /// Byte count for `secs` of audio, rounded down to whole frames.
    pub fn bytes_for_secs(&self, secs: f32) -> usize {
        let frames = (secs.max(0.0) * self.sample_rate as f32) as usize;
        frames * self.bytes_per_frame()
    }
}

impl Default for PcmFormat {
    fn default() -> Self {
        Self::new(48_000, 2)
    }
}

/// Configuration for `SessionController`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct SessionConfig {
    /// Remote model identifier passed to the connector.
    pub model_id: String,
    /// PCM layout of inbound audio. Default: 48 kHz stereo.
    pub format: PcmFormat,
    /// Upper bound on stream establishment. Default: 10 s.
    pub connect_timeout_ms: u64,
    /// Upper bound on graceful remote teardown during `close()`. Default: 5 s.
    pub close_timeout_ms: u64,
    /// How long `close()` waits for the background thread to exit. Default: 2 s.
    pub worker_join_timeout_ms: u64,
    /// Delay between stream establishment and the first receive. Default: 500 ms.
    pub receive_warm_up_ms: u64,
    /// Pause after a remote context reset. Default: 100 ms.
    pub reset_settle_ms: u64,
    /// Pause between applying config and resetting in `reconfigure`. Default: 300 ms.
    pub reconfigure_settle_ms: u64,
    /// Seconds of audio the lock-free ring holds before spilling. Default: 10.
    pub ring_capacity_secs: f32,
    /// How often the receive loop moves spilled bytes into the ring. Default: 10 ms.
    pub spill_pump_interval_ms: u64,
    /// Output device to prefer; falls back to the default device.
    pub preferred_output_device: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_id: "models/lyria-realtime-exp".into(),
            format: PcmFormat::default(),
            connect_timeout_ms: 10_000,
            close_timeout_ms: 5_000,
            worker_join_timeout_ms: 2_000,
            receive_warm_up_ms: 500,
            reset_settle_ms: 100,
            reconfigure_settle_ms: 300,
            ring_capacity_secs: 10.0,
            spill_pump_interval_ms: 10,
            preferred_output_device: None,
        }
    }
}

impl SessionConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.format.validate()?;
        if !self.ring_capacity_secs.is_finite() {
            return Err(CadenzaError::InvalidSessionConfig(
                "ring capacity must be a finite number of seconds".into(),
            ));
        }
        Ok(())
    }

    /// Apply `CADENZA_*` environment overrides on top of the current values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(model) = std::env::var("CADENZA_MODEL") {
            if !model.trim().is_empty() {
                self.model_id = model.trim().to_string();
            }
        }
        if let Ok(device) = std::env::var("CADENZA_OUTPUT_DEVICE") {
            if !device.trim().is_empty() {
                self.preferred_output_device = Some(device.trim().to_string());
            }
        }
        override_ms("CADENZA_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms, 100, 120_000);
        override_ms("CADENZA_CLOSE_TIMEOUT_MS", &mut self.close_timeout_ms, 50, 60_000);
        override_ms("CADENZA_RECEIVE_WARM_UP_MS", &mut self.receive_warm_up_ms, 0, 5_000);
        override_ms("CADENZA_RESET_SETTLE_MS", &mut self.reset_settle_ms, 0, 5_000);
        override_ms(
            "CADENZA_RECONFIGURE_SETTLE_MS",
            &mut self.reconfigure_settle_ms,
            0,
            5_000,
        );
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    pub fn worker_join_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_join_timeout_ms)
    }

    pub fn receive_warm_up(&self) -> Duration {
        Duration::from_millis(self.receive_warm_up_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn reconfigure_settle(&self) -> Duration {
        Duration::from_millis(self.reconfigure_settle_ms)
    }

    pub fn spill_pump_interval(&self) -> Duration {
        Duration::from_millis(self.spill_pump_interval_ms.max(1))
    }

    /// Ring capacity in bytes, never below one second of audio.
    pub fn ring_capacity_bytes(&self) -> usize {
        let one_second = self.format.bytes_for_secs(1.0);
        self.format
            .bytes_for_secs(self.ring_capacity_secs)
            .max(one_second)
            .max(self.format.bytes_per_frame())
    }
}

fn override_ms(name: &str, slot: &mut u64, min: u64, max: u64) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.trim().parse::<u64>() {
        Ok(v) => {
            *slot = v.clamp(min, max);
            debug!(name, value = *slot, "config override from environment");
        }
        Err(_) => warn!(name, raw = raw.as_str(), "ignoring non-numeric override"),
    }
}

/// Credentials handed to the connector on `open`.
#[derive(Clone, Default)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    /// Read `GOOGLE_API_KEY`, then `GEMINI_API_KEY`.
    pub fn from_env() -> Option<Self> {
        ["GOOGLE_API_KEY", "GEMINI_API_KEY"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .map(Self::new)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &if self.is_empty() { "<empty>" } else { "<redacted>" })
            .finish()
    }
}
