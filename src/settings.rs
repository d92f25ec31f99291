//! Run settings layered from defaults, an optional TOML file, and the environment.
//!
//! Precedence, lowest first:
//! 1. [`RunSettings::default`]
//! 2. The TOML file passed to [`RunSettings::load`], if it exists
//! 3. `GENTL_CONFORMANCE_*` environment variables
//!
//! CLI flags are applied on top by the binary.
//!
//! ```toml
//! selection = ["tAcquisition", "tDevices/verifyAllDevices"]
//! producer_dirs = ["/opt/vendor/gentl"]
//! device_ids = [1, 2]
//! formats = ["Mono8"]
//! cache_dir = "hwspecs"
//! stream_timeout_ms = 20000
//! backend = "simulated"
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::orchestrator::RunParameters;
use crate::points::StreamTiming;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "GENTL_CONFORMANCE_";

/// Which acquisition subsystem backs the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Host V4L2 capture devices.
    #[default]
    V4l2,
    /// In-memory producers and cameras.
    Simulated,
}

/// Every knob of a conformance run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// `file` or `file/point` tokens; empty runs everything.
    pub selection: Vec<String>,
    /// Producer directories instead of discovery.
    pub producer_dirs: Option<Vec<PathBuf>>,
    /// Hardware IDs to test.
    pub device_ids: Option<Vec<u32>>,
    /// Pixel formats for format-expanded files.
    pub formats: Option<Vec<String>>,
    /// Producer search path; the GenTL environment variable when unset.
    pub search_path: Option<String>,
    /// Hardware spec cache directory.
    pub cache_dir: PathBuf,
    /// Log file and scratch directory.
    pub results_dir: PathBuf,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Streaming wait timeout.
    pub stream_timeout_ms: u64,
    /// Streaming poll interval.
    pub poll_interval_ms: u64,
    /// Acquisition backend.
    pub backend: Backend,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            selection: Vec::new(),
            producer_dirs: None,
            device_ids: None,
            formats: None,
            search_path: None,
            cache_dir: PathBuf::from("hwspecs"),
            results_dir: PathBuf::from("results"),
            log_level: "info".to_owned(),
            stream_timeout_ms: 30_000,
            poll_interval_ms: 50,
            backend: Backend::V4l2,
        }
    }
}

impl RunSettings {
    /// Load settings, reading `config_file` only if it exists.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = config_file {
            if path.exists() {
                figment = figment.merge(Toml::file(path));
            } else {
                debug!(path = %path.display(), "settings file not found, using defaults");
            }
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        Ok(figment.extract()?)
    }

    /// Streaming wait bounds.
    pub const fn timing(&self) -> StreamTiming {
        StreamTiming {
            timeout: Duration::from_millis(self.stream_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Parameter overrides for the orchestrator.
    pub fn parameters(&self) -> RunParameters {
        RunParameters {
            producers: self.producer_dirs.clone(),
            device_ids: self.device_ids.clone(),
            formats: self.formats.clone(),
        }
    }

    /// Search path override, if configured.
    pub fn search_path(&self) -> Option<OsString> {
        self.search_path.as_ref().map(OsString::from)
    }

    /// Scratch directory for temporary artifacts.
    pub fn scratch_dir(&self) -> PathBuf {
        self.results_dir.join("scratch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConformanceError;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("conformance.toml");
        fs::write(&path, body).expect("write failed");
        path
    }

    #[test]
    fn test_defaults() {
        let settings = RunSettings::default();
        assert_eq!(settings.timing(), StreamTiming::default());
        assert_eq!(settings.backend, Backend::V4l2);
        assert!(settings.parameters().supplied().is_empty());
    }

    #[test]
    #[serial]
    fn test_file_layer() {
        let dir = TempDir::new().expect("tempdir failed");
        let path = write_config(
            &dir,
            r#"
                selection = ["tDevices"]
                device_ids = [1, 3]
                backend = "simulated"
                stream_timeout_ms = 1000
            "#,
        );

        let settings = RunSettings::load(Some(path.as_path())).expect("load failed");
        assert_eq!(settings.selection, vec!["tDevices"]);
        assert_eq!(settings.device_ids, Some(vec![1, 3]));
        assert_eq!(settings.backend, Backend::Simulated);
        assert_eq!(settings.timing().timeout, Duration::from_secs(1));
        assert_eq!(settings.poll_interval_ms, 50);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let dir = TempDir::new().expect("tempdir failed");
        let path = write_config(&dir, "poll_interval_ms = 10\n");

        std::env::set_var("GENTL_CONFORMANCE_POLL_INTERVAL_MS", "25");
        let settings = RunSettings::load(Some(path.as_path()));
        std::env::remove_var("GENTL_CONFORMANCE_POLL_INTERVAL_MS");

        assert_eq!(settings.expect("load failed").poll_interval_ms, 25);
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().expect("tempdir failed");
        let settings =
            RunSettings::load(Some(dir.path().join("absent.toml").as_path())).expect("load failed");
        assert_eq!(settings, RunSettings::default());
    }

    #[test]
    #[serial]
    fn test_bad_value_is_settings_error() {
        let dir = TempDir::new().expect("tempdir failed");
        let path = write_config(&dir, "stream_timeout_ms = \"soon\"\n");
        let result = RunSettings::load(Some(path.as_path()));
        assert!(matches!(result, Err(ConformanceError::Settings(_))));
    }
}
