//! Device enumeration under the active producer.

use tracing::{debug, warn};

use crate::error::{ConformanceError, Result};
use crate::traits::{AcquisitionSubsystem, DeviceInfo};

/// Maximum length of a spec file key.
const MAX_KEY_LEN: usize = 63;

/// One camera as seen through one producer.
///
/// `hardware_id` is only meaningful while the producer it was enumerated under
/// is active; use [`resolve`] after switching producers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Device name.
    pub device_name: String,
    /// Producer-assigned ID, starting at 1.
    pub hardware_id: u32,
    /// Supported pixel formats, in producer order, without duplicates.
    pub supported_formats: Vec<String>,
    /// Default pixel format; always a member of `supported_formats`.
    pub default_format: String,
    /// Camera-side persistent identity, if exposed.
    pub device_user_id: Option<String>,
    /// Key of the cached hardware spec for this device.
    pub spec_file_key: String,
}

impl DeviceDescriptor {
    /// Normalize a raw subsystem record.
    pub fn from_info(info: DeviceInfo) -> Result<Self> {
        if info.hardware_id == 0 {
            return Err(ConformanceError::SubsystemQuery(format!(
                "device {} reported hardware ID 0",
                info.name
            )));
        }

        let mut supported_formats: Vec<String> = Vec::with_capacity(info.formats.len());
        for format in info.formats {
            if !supported_formats.contains(&format) {
                supported_formats.push(format);
            }
        }

        let default_format = if supported_formats.contains(&info.default_format) {
            info.default_format
        } else {
            let fallback = supported_formats.first().cloned().ok_or_else(|| {
                ConformanceError::SubsystemQuery(format!(
                    "device {} reports no supported formats",
                    info.name
                ))
            })?;
            warn!(
                device = %info.name,
                reported = %info.default_format,
                fallback = %fallback,
                "default format not in supported list"
            );
            fallback
        };

        let spec_file_key = spec_file_key(&info.name, &default_format);
        Ok(Self {
            device_name: info.name,
            hardware_id: info.hardware_id,
            supported_formats,
            default_format,
            device_user_id: info.device_user_id,
            spec_file_key,
        })
    }

    /// Whether `format` is one of this device's supported formats.
    pub fn supports(&self, format: &str) -> bool {
        self.supported_formats.iter().any(|f| f == format)
    }

    /// Identity used to match this camera across producers.
    pub fn identity(&self) -> &str {
        self.device_user_id.as_deref().unwrap_or(&self.device_name)
    }

    fn same_device(&self, other: &Self) -> bool {
        self.device_name == other.device_name
            && (self.device_user_id.is_none()
                || other.device_user_id.is_none()
                || self.device_user_id == other.device_user_id)
    }
}

/// Enumerate all devices under the active producer.
pub fn enumerate(subsystem: &mut dyn AcquisitionSubsystem) -> Result<Vec<DeviceDescriptor>> {
    let producer = subsystem.active_producer().unwrap_or_default();
    let devices = subsystem
        .enumerate_devices()?
        .into_iter()
        .map(DeviceDescriptor::from_info)
        .collect::<Result<Vec<_>>>()?;

    if devices.is_empty() {
        return Err(ConformanceError::NoDevicesFound(format!(
            "under producer {}",
            producer.display()
        )));
    }
    debug!(producer = %producer.display(), count = devices.len(), "devices enumerated");
    Ok(devices)
}

/// Re-resolve a descriptor under the currently active producer by device name.
///
/// Returns `Ok(None)` when the device is not visible through this producer.
pub fn resolve(
    subsystem: &mut dyn AcquisitionSubsystem,
    descriptor: &DeviceDescriptor,
) -> Result<Option<DeviceDescriptor>> {
    let devices = match enumerate(subsystem) {
        Ok(devices) => devices,
        Err(ConformanceError::NoDevicesFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };
    Ok(devices
        .into_iter()
        .find(|candidate| candidate.same_device(descriptor)))
}

/// Sanitize a device name and default format into a file-safe key.
pub fn spec_file_key(device_name: &str, default_format: &str) -> String {
    let raw = format!("{device_name}_{default_format}");
    let mut key = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            key.push(ch);
        } else if !key.ends_with('_') {
            key.push('_');
        }
    }
    let mut key = key.trim_matches('_').to_owned();
    if key.is_empty() {
        key.push_str("device");
    }
    if key.starts_with(|c: char| c.is_ascii_digit()) {
        key.insert(0, 'x');
    }
    key.truncate(MAX_KEY_LEN);
    key
}
