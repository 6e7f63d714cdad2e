//! Audio subsystem boundary
//!
//! [`AudioHost`] is the seam between the pipeline and whatever delivers raw
//! sample blocks. [`CpalHost`] is the production implementation.
//!
//! cpal streams are not `Send`, so each opened input lives on its own
//! stream-owner thread which builds the stream, reports readiness, parks until
//! asked to close, and then drops the stream. Sample callbacks arrive on the
//! driver's thread, not on the stream-owner thread.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::constants::DEVICE_OPEN_TIMEOUT_MS;
use crate::error::AudioError;

/// Which input device to open
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceId {
    /// The platform's default input
    #[default]
    Default,
    /// Position in the input device list
    Index(usize),
    /// Exact device name
    Name(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Default => write!(f, "default"),
            DeviceId::Index(i) => write!(f, "#{}", i),
            DeviceId::Name(name) => write!(f, "\"{}\"", name),
        }
    }
}

/// Input device description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioDevice {
    /// Position in the input device list
    pub index: usize,
    /// Human-readable name
    pub name: String,
    /// Whether this is the platform default input
    pub is_default: bool,
    /// Supported standard sample rates
    pub sample_rates: Vec<u32>,
    /// Supported channel counts
    pub channels: Vec<u16>,
}

impl AudioDevice {
    /// Description carrying only a name, for devices whose capabilities
    /// could not be queried
    pub fn named(index: usize, name: impl Into<String>, is_default: bool) -> Self {
        Self {
            index,
            name: name.into(),
            is_default,
            sample_rates: Vec::new(),
            channels: Vec::new(),
        }
    }
}

/// The default input is reported even when its capabilities cannot be read
fn describe_default(index: usize, name: String, described: Result<AudioDevice, AudioError>) -> AudioDevice {
    match described {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!("Default input device {} only partly described: {}", name, e);
            AudioDevice::named(index, name, true)
        }
    }
}

/// Stream parameters requested from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub sample_rate: u32,
    pub channels: u16,
    /// Preferred frames per driver callback
    pub block_size: u32,
}

/// Called by the driver with interleaved f32 samples. Runs in the capture
/// context; must not block.
pub type RawBlockHandler = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Called by the driver when the stream reports an error
pub type StreamErrorHandler = Box<dyn FnMut(AudioError) + Send + 'static>;

/// An open input stream
pub trait InputStream: Send {
    /// Stop delivery and release the device, waiting at most `timeout`.
    ///
    /// On timeout the stream's resources are leaked and
    /// [`AudioError::DeviceTeardownTimeout`] is returned.
    fn close(self: Box<Self>, timeout: Duration) -> Result<(), AudioError>;
}

/// Platform audio subsystem
pub trait AudioHost: Send + Sync {
    /// All input-capable devices, in index order
    fn input_devices(&self) -> Result<Vec<AudioDevice>, AudioError>;

    /// The platform default input, if any
    fn default_input_device(&self) -> Option<AudioDevice>;

    /// Open `device` and start delivering blocks to `on_block`
    fn open_input(
        &self,
        device: &DeviceId,
        spec: StreamSpec,
        on_block: RawBlockHandler,
        on_error: StreamErrorHandler,
    ) -> Result<Box<dyn InputStream>, AudioError>;
}

/// Sample rates checked when describing a device
const STANDARD_SAMPLE_RATES: [u32; 9] = [
    8_000, 16_000, 22_050, 32_000, 44_100, 48_000, 88_200, 96_000, 192_000,
];

static SHARED_HOST: Mutex<Weak<CpalHost>> = Mutex::new(Weak::new());

/// cpal-backed audio host
pub struct CpalHost {
    host: cpal::Host,
}

impl CpalHost {
    /// Acquire the process-wide host handle.
    ///
    /// The handle is reference counted: every `Arc` shares one cpal host,
    /// which is released when the last one is dropped.
    pub fn acquire() -> Arc<CpalHost> {
        let mut shared = SHARED_HOST.lock();
        if let Some(host) = shared.upgrade() {
            return host;
        }

        let host = cpal::default_host();
        tracing::debug!("Acquired audio host {:?}", host.id());
        let host = Arc::new(CpalHost { host });
        *shared = Arc::downgrade(&host);
        host
    }

    fn resolve(&self, device: &DeviceId) -> Result<cpal::Device, AudioError> {
        match device {
            DeviceId::Default => self
                .host
                .default_input_device()
                .ok_or_else(|| AudioError::DeviceUnavailable("no default input device".into())),
            DeviceId::Index(index) => self
                .host
                .input_devices()?
                .nth(*index)
                .ok_or_else(|| AudioError::DeviceUnavailable(format!("no input device #{}", index))),
            DeviceId::Name(name) => self
                .host
                .input_devices()?
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| AudioError::DeviceUnavailable(format!("input device not found: {}", name))),
        }
    }

    fn describe(index: usize, device: &cpal::Device, default_name: Option<&str>) -> Result<AudioDevice, AudioError> {
        let name = device.name()?;
        let mut sample_rates = Vec::new();
        let mut channels = Vec::new();

        for range in device.supported_input_configs()? {
            if !channels.contains(&range.channels()) {
                channels.push(range.channels());
            }
            for rate in STANDARD_SAMPLE_RATES {
                if (range.min_sample_rate().0..=range.max_sample_rate().0).contains(&rate)
                    && !sample_rates.contains(&rate)
                {
                    sample_rates.push(rate);
                }
            }
        }
        sample_rates.sort_unstable();
        channels.sort_unstable();

        Ok(AudioDevice {
            index,
            is_default: default_name == Some(name.as_str()),
            name,
            sample_rates,
            channels,
        })
    }
}

impl Drop for CpalHost {
    fn drop(&mut self) {
        tracing::debug!("Released audio host {:?}", self.host.id());
    }
}

impl AudioHost for CpalHost {
    fn input_devices(&self) -> Result<Vec<AudioDevice>, AudioError> {
        let default_name = self.host.default_input_device().and_then(|d| d.name().ok());

        let mut devices = Vec::new();
        for (index, device) in self.host.input_devices()?.enumerate() {
            match Self::describe(index, &device, default_name.as_deref()) {
                Ok(info) => devices.push(info),
                Err(e) => tracing::warn!("Skipping input device #{}: {}", index, e),
            }
        }
        Ok(devices)
    }

    fn default_input_device(&self) -> Option<AudioDevice> {
        let default_name = self.host.default_input_device()?.name().ok()?;
        let devices = match self.host.input_devices() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("Cannot enumerate input devices: {}", e);
                return None;
            }
        };

        for (index, device) in devices.enumerate() {
            if device.name().ok().as_deref() != Some(default_name.as_str()) {
                continue;
            }
            let described = Self::describe(index, &device, Some(default_name.as_str()));
            return Some(describe_default(index, default_name, described));
        }
        None
    }

    fn open_input(
        &self,
        device: &DeviceId,
        spec: StreamSpec,
        mut on_block: RawBlockHandler,
        on_error: StreamErrorHandler,
    ) -> Result<Box<dyn InputStream>, AudioError> {
        let cpal_device = self.resolve(device)?;
        let device_name = cpal_device.name().unwrap_or_else(|_| "unknown".into());
        tracing::info!(
            "Opening input {} ({}): {} Hz, {} ch, {} frames",
            device,
            device_name,
            spec.sample_rate,
            spec.channels,
            spec.block_size
        );

        // Not every backend honours a fixed buffer size
        let buffer_size = match cpal_device.default_input_config().map(|c| c.buffer_size().clone()) {
            Ok(cpal::SupportedBufferSize::Range { min, max })
                if (min..=max).contains(&spec.block_size) =>
            {
                cpal::BufferSize::Fixed(spec.block_size)
            }
            _ => {
                tracing::debug!("Fixed buffer of {} frames not supported, using device default", spec.block_size);
                cpal::BufferSize::Default
            }
        };
        let config = StreamConfig {
            channels: spec.channels,
            sample_rate: cpal::SampleRate(spec.sample_rate),
            buffer_size,
        };

        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let mut on_error = on_error;

        let thread = thread::Builder::new()
            .name(format!("capture-{}", device_name))
            .spawn(move || {
                let stream = cpal_device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| on_block(data),
                    move |err| on_error(AudioError::StreamError(err.to_string())),
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.into()));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until closed or the handle is dropped
                let _ = stop_rx.recv();

                let _ = stream.pause();
                drop(stream);
                let _ = done_tx.send(());
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_millis(DEVICE_OPEN_TIMEOUT_MS)) {
            Ok(Ok(())) => Ok(Box::new(CpalInputStream {
                stop_tx,
                done_rx,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                drop(stop_tx);
                Err(AudioError::DeviceUnavailable(format!(
                    "{} did not start within {} ms",
                    device, DEVICE_OPEN_TIMEOUT_MS
                )))
            }
        }
    }
}

/// Handle to a stream-owner thread
struct CpalInputStream {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl InputStream for CpalInputStream {
    fn close(mut self: Box<Self>, timeout: Duration) -> Result<(), AudioError> {
        let _ = self.stop_tx.try_send(());

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.thread.take() {
                    let _ = handle.join();
                }
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                // Detach: the thread and its stream are leaked
                self.thread.take();
                tracing::error!("Input stream did not release within {:?}; leaking it", timeout);
                Err(AudioError::DeviceTeardownTimeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_survives_failed_query() {
        let device = describe_default(
            3,
            "Built-in Microphone".to_string(),
            Err(AudioError::StreamError("configs unavailable".into())),
        );
        assert_eq!(device, AudioDevice::named(3, "Built-in Microphone", true));
        assert!(device.sample_rates.is_empty());

        let full = AudioDevice {
            sample_rates: vec![48_000],
            channels: vec![2],
            ..AudioDevice::named(1, "USB Mic", true)
        };
        assert_eq!(describe_default(1, "USB Mic".into(), Ok(full.clone())), full);
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::Default.to_string(), "default");
        assert_eq!(DeviceId::Index(2).to_string(), "#2");
        assert_eq!(DeviceId::Name("USB Mic".into()).to_string(), "\"USB Mic\"");
    }
}
