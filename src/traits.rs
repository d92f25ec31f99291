//! Core traits and types for the acquisition subsystem seam.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::property::PropertyInfo;

/// One producer installation: a directory holding at least one descriptor file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerRef {
    path: PathBuf,
}

impl ProducerRef {
    /// Wrap an already validated producer directory.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Producer directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last path component, for compact reports.
    pub fn display_name(&self) -> String {
        self.path.file_name().map_or_else(
            || self.path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }
}

impl fmt::Display for ProducerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Raw device record as reported by the subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device name (model plus serial, as the producer reports it).
    pub name: String,
    /// Producer-assigned ID, valid only while this producer is active.
    pub hardware_id: u32,
    /// Supported pixel formats.
    pub formats: Vec<String>,
    /// Default pixel format.
    pub default_format: String,
    /// Camera-side persistent identity, if the device exposes one.
    pub device_user_id: Option<String>,
}

/// Handle to an open capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(pub u64);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Region of interest in sensor pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    /// Horizontal offset.
    pub x: u32,
    /// Vertical offset.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Roi {
    /// Full-frame ROI of the given size.
    #[must_use]
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Centered ROI with half the size of `self`, keeping even dimensions.
    #[must_use]
    pub const fn centered_half(&self) -> Self {
        let width = (self.width / 2) & !1;
        let height = (self.height / 2) & !1;
        Self {
            x: self.x + (self.width - width) / 2,
            y: self.y + (self.height - height) / 2,
            width,
            height,
        }
    }
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Capture timestamp.
    pub timestamp: Duration,
    /// Actual bytes used in the frame buffer.
    pub bytes_used: u32,
}

/// A captured video frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Raw frame data.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format name.
    pub format: String,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

/// Abstraction over the external acquisition subsystem.
///
/// The subsystem holds process-wide "active producer" state. Callers never use
/// it directly; they go through [`crate::session::SubsystemSession`], which
/// serializes access and resets the subsystem around every producer switch.
pub trait AcquisitionSubsystem: Send {
    /// Load the producer at `path` as the active one. `None` unloads the current one.
    fn set_active_producer(&mut self, path: Option<&Path>) -> Result<()>;

    /// Currently active producer, if any.
    fn active_producer(&self) -> Option<PathBuf>;

    /// Clear all state left by the previous producer. Open sessions are invalidated.
    fn reset(&mut self) -> Result<()>;

    /// List devices visible through the active producer.
    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>>;

    /// Open a capture session on a device, optionally forcing a pixel format.
    fn open_session(&mut self, hardware_id: u32, format: Option<&str>) -> Result<SessionHandle>;

    /// Properties of the capture session object.
    fn session_properties(&mut self, handle: SessionHandle) -> Result<Vec<PropertyInfo>>;

    /// Properties of the session's selected source.
    fn source_properties(&mut self, handle: SessionHandle) -> Result<Vec<PropertyInfo>>;

    /// Name of the session's selected source.
    fn selected_source(&self, handle: SessionHandle) -> Result<String>;

    /// Close a session.
    fn close_session(&mut self, handle: SessionHandle) -> Result<()>;

    /// Number of sessions currently open.
    fn open_session_count(&self) -> usize;

    /// Start acquiring `frames` frames.
    fn start_capture(&mut self, handle: SessionHandle, frames: u32) -> Result<()>;

    /// Stop acquisition.
    fn stop_capture(&mut self, handle: SessionHandle) -> Result<()>;

    /// Whether acquisition is still running.
    fn is_running(&self, handle: SessionHandle) -> Result<bool>;

    /// Frames acquired since the last start.
    fn frames_acquired(&self, handle: SessionHandle) -> Result<u32>;

    /// Frames retained from the last acquisition, oldest first.
    fn acquired_frames(&mut self, handle: SessionHandle) -> Result<Vec<Frame>>;

    /// Grab a single frame immediately.
    fn read_snapshot(&mut self, handle: SessionHandle) -> Result<Frame>;

    /// Current region of interest.
    fn region_of_interest(&self, handle: SessionHandle) -> Result<Roi>;

    /// Set the region of interest. Returns the ROI actually applied.
    fn set_region_of_interest(&mut self, handle: SessionHandle, roi: Roi) -> Result<Roi>;

    /// Log acquired frames to `path` during the next acquisition.
    fn attach_disk_logger(&mut self, handle: SessionHandle, path: &Path) -> Result<()>;
}
