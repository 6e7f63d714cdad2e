//! Input device discovery

use std::sync::Arc;

use crate::audio::host::{AudioDevice, AudioHost, CpalHost, DeviceId};

/// Read-only queries against the audio subsystem's input devices.
///
/// Every call queries the host afresh; nothing is cached.
#[derive(Clone)]
pub struct DeviceDirectory {
    host: Arc<dyn AudioHost>,
}

impl DeviceDirectory {
    /// Directory backed by the shared cpal host
    pub fn new() -> Self {
        Self::with_host(CpalHost::acquire())
    }

    /// Directory backed by any audio host
    pub fn with_host(host: Arc<dyn AudioHost>) -> Self {
        Self { host }
    }

    /// All input devices. Enumeration failures are logged and yield an empty list.
    pub fn devices(&self) -> Vec<AudioDevice> {
        match self.host.input_devices() {
            Ok(devices) => {
                for device in &devices {
                    tracing::debug!("Found input device {}: {}", device.index, device.name);
                }
                devices
            }
            Err(e) => {
                tracing::error!("Error listing audio devices: {}", e);
                Vec::new()
            }
        }
    }

    /// `(index, name)` for every input device
    pub fn list_devices(&self) -> Vec<(usize, String)> {
        self.devices()
            .into_iter()
            .map(|device| (device.index, device.name))
            .collect()
    }

    /// The default input as an index, or `None` when there is no input device
    pub fn get_default_device(&self) -> Option<DeviceId> {
        let device = self.host.default_input_device()?;
        tracing::debug!("Using system default device: {}", device.index);
        Some(DeviceId::Index(device.index))
    }

    /// Details for the device at `index`
    pub fn get_device_info(&self, index: usize) -> Option<AudioDevice> {
        self.devices().into_iter().find(|device| device.index == index)
    }

    /// Resolve any device id to the device it currently refers to
    pub fn find(&self, id: &DeviceId) -> Option<AudioDevice> {
        match id {
            DeviceId::Default => self.host.default_input_device(),
            DeviceId::Index(index) => self.get_device_info(*index),
            DeviceId::Name(name) => self.devices().into_iter().find(|device| &device.name == name),
        }
    }
}

impl Default for DeviceDirectory {
    fn default() -> Self {
        Self::new()
    }
}
