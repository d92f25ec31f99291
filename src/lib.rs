//! GenTL conformance suite.
//!
//! Discovers producers, enumerates the cameras each one exposes, builds a set
//! of test configurations (producer, device, pixel format), and runs a fixed
//! registry of test points against them. The acquisition subsystem sits
//! behind the [`AcquisitionSubsystem`] trait so the suite runs unchanged
//! against V4L2 hardware or the in-memory [`mock`] backend.

pub mod config;
pub mod device;
pub mod discovery;
pub mod enumerator;
pub mod error;
pub mod logging;
pub mod mock;
pub mod orchestrator;
pub mod points;
pub mod property;
pub mod report;
pub mod session;
pub mod settings;
pub mod spec_cache;
pub mod traits;
pub mod validation;

pub use config::{
    ConfigKey, ConfigurationBuilder, ConfigurationSet, FormatTesting, TestConfiguration,
};
pub use device::V4l2Subsystem;
pub use enumerator::DeviceDescriptor;
pub use error::{ConformanceError, PointError, PointResult, Result};
pub use orchestrator::{
    resolve, Outcome, RunParameters, RunReport, Selection, TestOrchestrator, TestResult, REGISTRY,
};
pub use report::Summary;
pub use session::SubsystemSession;
pub use settings::{Backend, RunSettings};
pub use spec_cache::{HardwareSpec, HardwareSpecCache};
pub use traits::{AcquisitionSubsystem, DeviceInfo, Frame, ProducerRef, Roi, SessionHandle};
