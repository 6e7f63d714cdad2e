//! Error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the audio pipeline in the caller context
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio source is already running")]
    DoubleStart,

    #[error("device did not release within {0:?}; capture resources leaked")]
    DeviceTeardownTimeout(Duration),

    #[error("audio stream error: {0}")]
    StreamError(String),
}

impl From<cpal::DevicesError> for AudioError {
    fn from(e: cpal::DevicesError) -> Self {
        AudioError::DeviceUnavailable(e.to_string())
    }
}

impl From<cpal::DeviceNameError> for AudioError {
    fn from(e: cpal::DeviceNameError) -> Self {
        AudioError::DeviceUnavailable(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::DeviceUnavailable(e.to_string())
    }
}

impl From<cpal::SupportedStreamConfigsError> for AudioError {
    fn from(e: cpal::SupportedStreamConfigsError) -> Self {
        AudioError::DeviceUnavailable(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        AudioError::DeviceUnavailable(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
