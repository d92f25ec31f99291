//! Tracing setup: human-readable events on stderr, plain text in the run log.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{ConformanceError, Result};

/// Path of the run log inside `results_dir`.
pub fn log_path(results_dir: &Path) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    results_dir.join(format!("conformance-{stamp}.log"))
}

/// Install the global subscriber and return the run log path.
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this again after
/// a subscriber is installed keeps the existing one.
pub fn init(results_dir: &Path, default_level: &str) -> Result<PathBuf> {
    fs::create_dir_all(results_dir)?;
    let path = log_path(results_dir);
    let file = File::create(&path)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|err| ConformanceError::Logging(format!("invalid log level: {err}")))?;

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let file_layer = fmt::layer().with_writer(Mutex::new(file)).with_ansi(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .or_else(|err| {
            if err
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(ConformanceError::Logging(err.to_string()))
            }
        })?;

    Ok(path)
}
