//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::buffer::OverflowPolicy;
use crate::audio::host::{DeviceId, StreamSpec};
use crate::audio::level_meter::LevelMeterParams;
use crate::constants::*;
use crate::error::AudioError;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture configuration
    pub capture: CaptureConfig,

    /// Meter configuration
    pub meter: LevelMeterParams,
}

/// Capture configuration. Fixed for the lifetime of a running source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Number of input channels
    pub channels: u16,

    /// Frames per delivered block
    pub block_size: u32,

    /// Input device
    pub device: DeviceId,

    /// Initial input gain (linear, >= 0)
    pub gain: f32,

    /// Capture buffer capacity in blocks
    pub buffer_blocks: usize,

    /// What to do when the capture buffer is full
    pub overflow: OverflowPolicy,

    /// Longest a blocking producer waits for a free slot
    pub block_timeout_ms: u64,

    /// Longest `stop()` waits for the device to release
    pub teardown_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            block_size: DEFAULT_BLOCK_SIZE,
            device: DeviceId::Default,
            gain: DEFAULT_GAIN,
            buffer_blocks: DEFAULT_BUFFER_BLOCKS,
            overflow: OverflowPolicy::DropOldest,
            block_timeout_ms: DEFAULT_BLOCK_TIMEOUT_MS,
            teardown_timeout_ms: DEFAULT_TEARDOWN_TIMEOUT_MS,
        }
    }
}

impl CaptureConfig {
    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), AudioError> {
        let invalid = |msg: String| Err(AudioError::InvalidConfiguration(msg));

        if self.sample_rate == 0 {
            return invalid("sample_rate must be positive".into());
        }
        if self.channels == 0 {
            return invalid("channels must be positive".into());
        }
        if self.block_size == 0 {
            return invalid("block_size must be positive".into());
        }
        if self.buffer_blocks == 0 {
            return invalid("buffer_blocks must be positive".into());
        }
        if !self.gain.is_finite() || self.gain < 0.0 {
            return invalid(format!("gain must be a finite value >= 0, got {}", self.gain));
        }
        Ok(())
    }

    /// Samples in one interleaved block
    pub fn block_len(&self) -> usize {
        self.block_size as usize * self.channels as usize
    }

    /// Parameters handed to the audio host
    pub fn stream_spec(&self) -> StreamSpec {
        StreamSpec {
            sample_rate: self.sample_rate,
            channels: self.channels,
            block_size: self.block_size,
        }
    }

    /// Duration of one block
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate.max(1) as f64)
    }

    pub fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

/// Reject meter parameters that cannot describe a hold time
pub fn validate_meter(params: &LevelMeterParams) -> Result<(), AudioError> {
    if !params.peak_hold_secs.is_finite() || params.peak_hold_secs < 0.0 {
        return Err(AudioError::InvalidConfiguration(format!(
            "peak_hold_secs must be a finite value >= 0, got {}",
            params.peak_hold_secs
        )));
    }
    Ok(())
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        config.capture.validate()?;
        validate_meter(&config.meter)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "capture-meter", "capture-meter")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
