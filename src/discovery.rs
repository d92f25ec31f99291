//! Producer discovery over a GenTL search path.

use std::collections::HashSet;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ConformanceError, Result};
use crate::traits::ProducerRef;

/// Environment variable holding the producer search path on 64-bit hosts.
pub const GENTL_PATH_VAR_64: &str = "GENICAM_GENTL64_PATH";
/// Environment variable holding the producer search path on 32-bit hosts.
pub const GENTL_PATH_VAR_32: &str = "GENICAM_GENTL32_PATH";
/// Extension of GenTL producer descriptor files.
pub const DESCRIPTOR_EXTENSION: &str = "cti";

/// Search path from the environment for the host's pointer width.
pub fn search_path_from_env() -> Option<OsString> {
    let var = if cfg!(target_pointer_width = "64") {
        GENTL_PATH_VAR_64
    } else {
        GENTL_PATH_VAR_32
    };
    env::var_os(var)
}

/// Canonical, order-stable list of producer directories on `search_path`.
///
/// Segments are split on the platform separator. Empty segments and segments
/// without a descriptor file are skipped. The first occurrence of a directory
/// wins; comparison is on the normalized path string, without resolving links.
pub fn discover(search_path: &OsStr) -> Result<Vec<ProducerRef>> {
    if search_path.is_empty() {
        return Err(ConformanceError::NoProducersFound(
            "producer search path is empty".to_owned(),
        ));
    }

    let mut seen = HashSet::new();
    let mut producers = Vec::new();

    for segment in env::split_paths(search_path) {
        if segment.as_os_str().is_empty() {
            continue;
        }
        let dir = normalize(&segment);
        if !seen.insert(dir.clone()) {
            debug!(dir = %dir.display(), "duplicate search path segment");
            continue;
        }
        if has_descriptor(&dir) {
            debug!(dir = %dir.display(), "producer found");
            producers.push(ProducerRef::new(dir));
        } else {
            warn!(dir = %dir.display(), "no producer descriptor, skipping");
        }
    }

    if producers.is_empty() {
        return Err(ConformanceError::NoProducersFound(format!(
            "no directory on {} holds a .{DESCRIPTOR_EXTENSION} file",
            search_path.to_string_lossy()
        )));
    }
    Ok(producers)
}

/// Validate an explicit list of producer directories with the same rules as [`discover`].
pub fn from_dirs(dirs: &[PathBuf]) -> Result<Vec<ProducerRef>> {
    let joined = env::join_paths(dirs).map_err(|err| {
        ConformanceError::NoProducersFound(format!("invalid producer directory list: {err}"))
    })?;
    discover(&joined)
}

/// Strip trailing separators, leaving a bare root untouched.
fn normalize(dir: &Path) -> PathBuf {
    let raw = dir.to_string_lossy();
    let trimmed = raw.trim_end_matches(std::path::is_separator);
    if trimmed.is_empty() {
        dir.to_path_buf()
    } else {
        PathBuf::from(trimmed)
    }
}

fn has_descriptor(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries.filter_map(std::result::Result::ok).any(|entry| {
        let path = entry.path();
        path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(DESCRIPTOR_EXTENSION))
    })
}
