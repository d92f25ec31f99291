//! Error types for discovery, configuration building, spec caching and test points.
//!
//! `ConformanceError` covers everything that can go wrong while preparing a run.
//! Discovery and spec-write failures are fatal; subsystem query failures only
//! remove the affected producer's configurations. `PointError` is the narrower
//! vocabulary a single test point reports with; the orchestrator maps it onto
//! passed/failed/incomplete outcomes.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error type for everything outside a single test point.
#[derive(Debug, Error)]
pub enum ConformanceError {
    /// The producer search path was empty or no segment held a descriptor file.
    #[error("No GenTL producers found: {0}")]
    NoProducersFound(String),

    /// Enumeration succeeded but reported no devices.
    #[error("No devices found {0}")]
    NoDevicesFound(String),

    /// A requested device ID or format does not exist under the active producer.
    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// The acquisition subsystem could not be queried.
    #[error("Subsystem query failed: {0}")]
    SubsystemQuery(String),

    /// A hardware spec artifact could not be persisted.
    #[error("Failed to write hardware spec {}: {source}", .path.display())]
    SpecWrite {
        /// Artifact path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A persisted hardware spec artifact could not be parsed.
    #[error("Failed to read hardware spec {}: {reason}", .path.display())]
    SpecRead {
        /// Artifact path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// The backend does not implement the requested verb.
    #[error("Operation not supported by this backend: {0}")]
    Unsupported(String),

    /// A blocking wait did not complete in time.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Settings could not be loaded.
    #[error("Settings error: {0}")]
    Settings(#[from] Box<figment::Error>),

    /// Log destination could not be prepared.
    #[error("Logging setup failed: {0}")]
    Logging(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConformanceError {
    /// Whether the error must abort the run before (or instead of) executing tests.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoProducersFound(_)
                | Self::NoDevicesFound(_)
                | Self::SpecWrite { .. }
                | Self::SpecRead { .. }
                | Self::Settings(_)
                | Self::Logging(_)
        )
    }
}

impl From<figment::Error> for ConformanceError {
    fn from(err: figment::Error) -> Self {
        Self::Settings(Box::new(err))
    }
}

/// Result type for crate operations.
pub type Result<T> = std::result::Result<T, ConformanceError>;

/// Outcome-bearing error raised by a single test point.
#[derive(Debug, Error)]
pub enum PointError {
    /// Preconditions are not met by this configuration; reported as incomplete.
    #[error("Assumption not met: {0}")]
    AssumptionNotMet(String),

    /// Expected and actual values differ; reported as failed.
    #[error("Assertion failed: {0}")]
    AssertionFailure(String),

    /// A streaming wait expired; reported as failed.
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout {
        /// Condition that was being waited on.
        what: String,
        /// Elapsed budget.
        after: Duration,
    },

    /// Any other subsystem or cache error; reported as failed.
    #[error(transparent)]
    Subsystem(ConformanceError),
}

impl From<ConformanceError> for PointError {
    fn from(err: ConformanceError) -> Self {
        match err {
            ConformanceError::Unsupported(what) => Self::AssumptionNotMet(what),
            ConformanceError::Timeout(after) => Self::Timeout {
                what: "subsystem operation".to_owned(),
                after,
            },
            other => Self::Subsystem(other),
        }
    }
}

/// Result type for test points.
pub type PointResult = std::result::Result<(), PointError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_errors_are_fatal() {
        assert!(ConformanceError::NoProducersFound("empty".to_owned()).is_fatal());
        assert!(ConformanceError::NoDevicesFound("under /opt/producer".to_owned()).is_fatal());
        assert!(!ConformanceError::ConfigMismatch("device 9".to_owned()).is_fatal());
        assert!(!ConformanceError::SubsystemQuery("bad cti".to_owned()).is_fatal());
    }

    #[test]
    fn test_unsupported_becomes_assumption() {
        let err = PointError::from(ConformanceError::Unsupported("roi".to_owned()));
        assert!(matches!(err, PointError::AssumptionNotMet(_)));

        let err = PointError::from(ConformanceError::Timeout(Duration::from_secs(1)));
        assert!(matches!(err, PointError::Timeout { .. }));
    }
}
