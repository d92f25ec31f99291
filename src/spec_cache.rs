//! Persistent cache of per-device hardware specs.
//!
//! A hardware spec records every property of a device's capture session and
//! its selected source, plus the supported formats. Specs are golden files:
//! generated once per key from a live device and never refreshed
//! automatically, even if the hardware changes. Regenerating requires an
//! explicit [`HardwareSpecCache::invalidate`].
//!
//! Artifacts are JSON documents named `<key>.json`. Session-level records come
//! first; `source_offset` marks where source-level records begin.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::enumerator::DeviceDescriptor;
use crate::error::{ConformanceError, Result};
use crate::property::{ConstraintKind, PropertyInfo, PropertyType, PropertyValue};
use crate::traits::AcquisitionSubsystem;

/// Session-level properties whose values depend on live sensor state.
pub const RUNTIME_DEFINED_SESSION_PROPERTIES: [&str; 5] = [
    "ROIPosition",
    "VideoResolution",
    "NumberOfBands",
    "ReturnedColorSpace",
    "BayerSensorAlignment",
];

/// One property of a cached hardware spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    /// Property name.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    /// Constraint kind.
    pub constraint: ConstraintKind,
    /// Constraint payload.
    pub constraint_value: Option<PropertyValue>,
    /// Default value.
    pub default_value: PropertyValue,
    /// Whether the property is read-only.
    pub read_only: bool,
    /// Whether the property is device specific.
    pub device_specific: bool,
    /// Whether the value is only meaningful with a live session attached.
    pub runtime_defined: bool,
}

impl PropertyRecord {
    fn from_info(info: PropertyInfo, runtime_defined: bool) -> Self {
        Self {
            name: info.name,
            property_type: info.property_type,
            constraint: info.constraint,
            constraint_value: info.constraint_value.map(PropertyValue::classify),
            default_value: info.default_value.classify(),
            read_only: info.read_only,
            device_specific: info.device_specific,
            runtime_defined,
        }
    }
}

/// What a spec query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecMode {
    /// Ordered property records.
    Property,
    /// Supported format names.
    Formats,
}

impl FromStr for SpecMode {
    type Err = ConformanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "property" => Ok(Self::Property),
            "formats" => Ok(Self::Formats),
            other => Err(ConformanceError::ConfigMismatch(format!(
                "unknown spec mode `{other}`"
            ))),
        }
    }
}

/// Result of [`HardwareSpec::query`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpecView<'a> {
    /// Property records, session level first.
    Properties(&'a [PropertyRecord]),
    /// Supported formats.
    Formats(&'a [String]),
}

/// Cached description of one device's property surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSpec {
    /// Cache key.
    pub key: String,
    /// Device name at generation time.
    pub device_name: String,
    /// Default format at generation time.
    pub default_format: String,
    /// Supported formats.
    pub formats: Vec<String>,
    /// Index of the first source-level record.
    pub source_offset: usize,
    /// Session-level then source-level records.
    pub properties: Vec<PropertyRecord>,
}

impl HardwareSpec {
    /// Build a spec from live property lists.
    pub fn from_properties(
        device: &DeviceDescriptor,
        session: Vec<PropertyInfo>,
        source: Vec<PropertyInfo>,
    ) -> Self {
        let source_offset = session.len();
        let properties = session
            .into_iter()
            .map(|info| {
                let runtime = RUNTIME_DEFINED_SESSION_PROPERTIES.contains(&info.name.as_str());
                PropertyRecord::from_info(info, runtime)
            })
            .chain(
                source
                    .into_iter()
                    .map(|info| PropertyRecord::from_info(info, true)),
            )
            .collect();

        Self {
            key: device.spec_file_key.clone(),
            device_name: device.device_name.clone(),
            default_format: device.default_format.clone(),
            formats: device.supported_formats.clone(),
            source_offset,
            properties,
        }
    }

    /// Mode-selected view of the spec.
    pub fn query(&self, mode: SpecMode) -> SpecView<'_> {
        match mode {
            SpecMode::Property => SpecView::Properties(&self.properties),
            SpecMode::Formats => SpecView::Formats(&self.formats),
        }
    }

    /// Records belonging to the capture session.
    pub fn session_properties(&self) -> &[PropertyRecord] {
        self.properties
            .get(..self.source_offset)
            .unwrap_or(&self.properties)
    }

    /// Records belonging to the selected source.
    pub fn source_properties(&self) -> &[PropertyRecord] {
        self.properties.get(self.source_offset..).unwrap_or(&[])
    }

    /// Look up a record by name, session level first.
    pub fn property(&self, name: &str) -> Option<&PropertyRecord> {
        self.properties.iter().find(|record| record.name == name)
    }

    /// Whether the record at `index` is source level.
    pub const fn is_source_index(&self, index: usize) -> bool {
        index >= self.source_offset
    }
}

/// Directory-backed hardware spec cache.
#[derive(Debug, Clone)]
pub struct HardwareSpecCache {
    root: PathBuf,
}

impl HardwareSpecCache {
    /// Cache rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Artifact path for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// Read a cached spec without touching hardware.
    pub fn lookup(&self, key: &str) -> Result<Option<HardwareSpec>> {
        let path = self.path_for(key);
        if !path.is_file() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        let spec: HardwareSpec =
            serde_json::from_str(&text).map_err(|err| ConformanceError::SpecRead {
                path: path.clone(),
                reason: err.to_string(),
            })?;
        if spec.key != key {
            return Err(ConformanceError::SpecRead {
                path,
                reason: format!("artifact holds key `{}`", spec.key),
            });
        }
        Ok(Some(spec))
    }

    /// Return the cached spec for `device`, generating it from the live device on a miss.
    ///
    /// `subsystem` must have the device's producer active.
    pub fn get_or_create(
        &self,
        device: &DeviceDescriptor,
        subsystem: &mut dyn AcquisitionSubsystem,
    ) -> Result<HardwareSpec> {
        if let Some(spec) = self.lookup(&device.spec_file_key)? {
            if spec.device_name != device.device_name {
                return Err(ConformanceError::SpecRead {
                    path: self.path_for(&device.spec_file_key),
                    reason: format!(
                        "key `{}` already describes `{}`, not `{}`",
                        device.spec_file_key, spec.device_name, device.device_name
                    ),
                });
            }
            debug!(key = %device.spec_file_key, "hardware spec cache hit");
            return Ok(spec);
        }

        info!(
            key = %device.spec_file_key,
            device = %device.device_name,
            "generating hardware spec"
        );
        let spec = generate(device, subsystem)?;
        self.store(&spec)?;
        Ok(spec)
    }

    /// Delete the artifact for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist `spec`, replacing any previous artifact for its key.
    pub fn store(&self, spec: &HardwareSpec) -> Result<()> {
        let path = self.path_for(&spec.key);
        let write_err = |source| ConformanceError::SpecWrite {
            path: path.clone(),
            source,
        };

        let mut body = serde_json::to_vec_pretty(spec)?;
        body.push(b'\n');

        fs::create_dir_all(&self.root).map_err(write_err)?;
        self.invalidate(&spec.key).map_err(|err| match err {
            ConformanceError::Io(source) => write_err(source),
            other => other,
        })?;

        let mut file = NamedTempFile::new_in(&self.root).map_err(write_err)?;
        file.write_all(&body).map_err(write_err)?;
        file.as_file().sync_all().map_err(write_err)?;
        file.persist(&path).map_err(|err| write_err(err.error))?;
        debug!(path = %path.display(), "hardware spec written");
        Ok(())
    }
}

/// Open a session on `device`, read both property levels, and close it again.
fn generate(
    device: &DeviceDescriptor,
    subsystem: &mut dyn AcquisitionSubsystem,
) -> Result<HardwareSpec> {
    let handle = subsystem.open_session(device.hardware_id, None)?;
    let properties = subsystem.session_properties(handle).and_then(|session| {
        let source = subsystem.source_properties(handle)?;
        Ok((session, source))
    });
    let closed = subsystem.close_session(handle);
    let (session, source) = properties?;
    closed?;
    Ok(HardwareSpec::from_properties(device, session, source))
}
