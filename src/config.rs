//! Test parameter space: producers x devices (x formats).

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::discovery;
use crate::enumerator::{self, DeviceDescriptor};
use crate::error::{ConformanceError, Result};
use crate::session::SubsystemSession;
use crate::spec_cache::HardwareSpecCache;
use crate::traits::ProducerRef;

/// Whether and how configurations are expanded by pixel format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FormatTesting {
    /// One configuration per device, no format bound.
    #[default]
    Disabled,
    /// One configuration per supported format.
    All,
    /// One configuration per listed format the device supports.
    Only(Vec<String>),
}

/// Opaque identifier of one configuration within a set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey(String);

impl ConfigKey {
    /// Key for the `index`-th configuration (1-based).
    pub fn nth(index: usize) -> Self {
        Self(format!("cfg-{index}"))
    }

    /// Raw key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One producer/device (optionally format) pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfiguration {
    /// Opaque key.
    pub key: ConfigKey,
    /// Producer the device was enumerated under.
    pub producer: ProducerRef,
    /// Device as enumerated under `producer`.
    pub device: DeviceDescriptor,
    /// Bound pixel format; always supported by `device` when present.
    pub format: Option<String>,
}

impl TestConfiguration {
    /// Human-readable label: device ID, producer path and format.
    pub fn label(&self) -> String {
        let base = format!("device {} @ {}", self.device.hardware_id, self.producer);
        match &self.format {
            Some(format) => format!("{base} [{format}]"),
            None => base,
        }
    }
}

/// Ordered set of configurations with lookup by key.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationSet {
    configs: Vec<TestConfiguration>,
}

impl ConfigurationSet {
    /// Number of configurations.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Configurations in build order.
    pub fn iter(&self) -> std::slice::Iter<'_, TestConfiguration> {
        self.configs.iter()
    }

    /// Look up a configuration by key.
    pub fn get(&self, key: &ConfigKey) -> Option<&TestConfiguration> {
        self.configs.iter().find(|config| &config.key == key)
    }

    /// Distinct producers, in order of first appearance.
    pub fn producers(&self) -> Vec<ProducerRef> {
        let mut producers: Vec<ProducerRef> = Vec::new();
        for config in &self.configs {
            if !producers.contains(&config.producer) {
                producers.push(config.producer.clone());
            }
        }
        producers
    }

    /// Merge another set, re-keying its entries after the existing ones.
    ///
    /// Returns the new keys of the merged entries, in order.
    pub fn append(&mut self, other: Self) -> Vec<ConfigKey> {
        other
            .configs
            .into_iter()
            .map(|mut config| {
                config.key = ConfigKey::nth(self.configs.len() + 1);
                let key = config.key.clone();
                self.configs.push(config);
                key
            })
            .collect()
    }

    /// Keep only the first configuration of every producer, re-keyed.
    #[must_use]
    pub fn first_per_producer(self) -> Self {
        let mut collapsed = Self::default();
        for config in self.configs {
            if !collapsed.producers().contains(&config.producer) {
                collapsed.push(&config.producer, &config.device, None);
            }
        }
        collapsed
    }

    fn push(&mut self, producer: &ProducerRef, device: &DeviceDescriptor, format: Option<String>) {
        let key = ConfigKey::nth(self.configs.len() + 1);
        self.configs.push(TestConfiguration {
            key,
            producer: producer.clone(),
            device: device.clone(),
            format,
        });
    }
}

impl<'a> IntoIterator for &'a ConfigurationSet {
    type Item = &'a TestConfiguration;
    type IntoIter = std::slice::Iter<'a, TestConfiguration>;

    fn into_iter(self) -> Self::IntoIter {
        self.configs.iter()
    }
}

/// Builds the configuration space by probing every selected producer.
///
/// The builder switches the active producer while probing and restores the
/// previously active one before returning.
#[derive(Debug)]
pub struct ConfigurationBuilder<'a> {
    session: &'a SubsystemSession,
    search_path: Option<OsString>,
    producers: Option<Vec<PathBuf>>,
    device_ids: Option<Vec<u32>>,
    formats: FormatTesting,
    cache: Option<&'a HardwareSpecCache>,
}

impl<'a> ConfigurationBuilder<'a> {
    /// Builder over `session` with no overrides.
    pub const fn new(session: &'a SubsystemSession) -> Self {
        Self {
            session,
            search_path: None,
            producers: None,
            device_ids: None,
            formats: FormatTesting::Disabled,
            cache: None,
        }
    }

    /// Search path used when no producer override is given. Defaults to the environment.
    #[must_use]
    pub fn search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    /// Explicit producer directories instead of discovery.
    #[must_use]
    pub fn producers(mut self, producers: Option<Vec<PathBuf>>) -> Self {
        self.producers = producers;
        self
    }

    /// Restrict devices to these hardware IDs.
    #[must_use]
    pub fn device_ids(mut self, device_ids: Option<Vec<u32>>) -> Self {
        self.device_ids = device_ids;
        self
    }

    /// Format expansion mode.
    #[must_use]
    pub fn formats(mut self, formats: FormatTesting) -> Self {
        self.formats = formats;
        self
    }

    /// Populate this cache for every retained device.
    #[must_use]
    pub fn spec_cache(mut self, cache: &'a HardwareSpecCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Resolve the producer set: override list if given, discovery otherwise.
    pub fn resolve_producers(&self) -> Result<Vec<ProducerRef>> {
        if let Some(dirs) = &self.producers {
            return discovery::from_dirs(dirs);
        }
        let search_path = self
            .search_path
            .clone()
            .or_else(discovery::search_path_from_env)
            .ok_or_else(|| {
                ConformanceError::NoProducersFound(format!(
                    "{} is not set",
                    discovery::GENTL_PATH_VAR_64
                ))
            })?;
        discovery::discover(&search_path)
    }

    /// Build the configuration set.
    ///
    /// Fails only if no producer can be discovered, no producer yields any
    /// device, or a hardware spec cannot be written. Requested device IDs or
    /// formats that do not exist are logged and skipped.
    pub fn build(&self) -> Result<ConfigurationSet> {
        let producers = self.resolve_producers()?;
        let mut set = ConfigurationSet::default();
        let mut devices_seen = 0usize;

        for producer in &producers {
            let devices = match self.probe(producer) {
                Ok(devices) => devices,
                Err(ConformanceError::NoDevicesFound(reason)) => {
                    warn!(producer = %producer, "no devices found {reason}");
                    continue;
                }
                Err(err @ ConformanceError::SubsystemQuery(_)) => {
                    error!(producer = %producer, error = %err, "skipping producer");
                    continue;
                }
                Err(err) => return Err(err),
            };
            devices_seen += devices.len();

            for device in self.select_devices(producer, devices) {
                self.expand(&mut set, producer, &device);
            }
        }

        if devices_seen == 0 {
            return Err(ConformanceError::NoDevicesFound(format!(
                "under any of {} producer(s)",
                producers.len()
            )));
        }
        info!(
            producers = producers.len(),
            configurations = set.len(),
            "configuration space built"
        );
        Ok(set)
    }

    /// Activate `producer`, enumerate it, and fill the spec cache.
    fn probe(&self, producer: &ProducerRef) -> Result<Vec<DeviceDescriptor>> {
        let mut guard = self.session.acquire(producer)?;
        let devices = enumerator::enumerate(&mut *guard)?;

        if let Some(cache) = self.cache {
            for device in self.retained(&devices) {
                cache.get_or_create(device, &mut *guard)?;
            }
        }

        let leaked = guard.release()?;
        if leaked > 0 {
            warn!(producer = %producer, leaked, "sessions left open while probing");
        }
        Ok(devices)
    }

    fn retained<'d>(&self, devices: &'d [DeviceDescriptor]) -> Vec<&'d DeviceDescriptor> {
        devices
            .iter()
            .filter(|device| {
                self.device_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&device.hardware_id))
            })
            .collect()
    }

    fn select_devices(
        &self,
        producer: &ProducerRef,
        devices: Vec<DeviceDescriptor>,
    ) -> Vec<DeviceDescriptor> {
        let Some(ids) = &self.device_ids else {
            return devices;
        };

        for id in ids {
            if !devices.iter().any(|device| device.hardware_id == *id) {
                let mismatch =
                    ConformanceError::ConfigMismatch(format!("device ID {id} not found"));
                info!(producer = %producer, "{mismatch}, skipping");
            }
        }

        let mut selected = Vec::new();
        for id in ids {
            if let Some(device) = devices.iter().find(|device| device.hardware_id == *id) {
                if !selected.contains(device) {
                    selected.push(device.clone());
                }
            }
        }
        selected
    }

    fn expand(&self, set: &mut ConfigurationSet, producer: &ProducerRef, device: &DeviceDescriptor) {
        match &self.formats {
            FormatTesting::Disabled => set.push(producer, device, None),
            FormatTesting::All => {
                for format in &device.supported_formats {
                    set.push(producer, device, Some(format.clone()));
                }
            }
            FormatTesting::Only(formats) => {
                for format in formats {
                    if device.supports(format) {
                        set.push(producer, device, Some(format.clone()));
                    } else {
                        debug!(
                            device = %device.device_name,
                            format = %format,
                            "format not supported, skipping"
                        );
                    }
                }
            }
        }
    }
}
