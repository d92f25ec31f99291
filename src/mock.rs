//! In-memory acquisition subsystem for testing without hardware.
//!
//! Also backs the `--simulate` mode of the binary.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ConformanceError, Result};
use crate::property::{ConstraintKind, PropertyInfo, PropertyType, PropertyValue};
use crate::traits::{
    AcquisitionSubsystem, DeviceInfo, Frame, FrameMetadata, ProducerRef, Roi, SessionHandle,
};

/// Mock camera as seen by every producer it is registered with.
#[derive(Debug, Clone)]
pub struct MockDevice {
    name: String,
    device_user_id: Option<String>,
    formats: Vec<String>,
    default_format: String,
    width: u32,
    height: u32,
    session_properties: Vec<PropertyInfo>,
    source_properties: Vec<PropertyInfo>,
}

impl MockDevice {
    /// Create a 640x480 Mono8/Mono16/RGB8 camera with the standard property set.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let width = 640;
        let height = 480;
        Self {
            name: name.to_owned(),
            device_user_id: None,
            formats: vec!["Mono8".to_owned(), "Mono16".to_owned(), "RGB8".to_owned()],
            default_format: "Mono8".to_owned(),
            width,
            height,
            session_properties: standard_session_properties(width, height),
            source_properties: standard_source_properties(None),
        }
    }

    /// Set the camera-side persistent identity.
    #[must_use]
    pub fn with_user_id(mut self, user_id: &str) -> Self {
        self.device_user_id = Some(user_id.to_owned());
        self.source_properties = standard_source_properties(Some(user_id));
        self
    }

    /// Replace the supported formats and default format.
    #[must_use]
    pub fn with_formats(mut self, formats: &[&str], default_format: &str) -> Self {
        self.formats = formats.iter().map(|f| (*f).to_owned()).collect();
        self.default_format = default_format.to_owned();
        self
    }

    /// Set the sensor resolution.
    #[must_use]
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self.session_properties = standard_session_properties(width, height);
        self
    }

    /// Add or replace a source-level property.
    #[must_use]
    pub fn with_source_property(mut self, property: PropertyInfo) -> Self {
        upsert(&mut self.source_properties, property);
        self
    }

    /// Add or replace a session-level property.
    #[must_use]
    pub fn with_session_property(mut self, property: PropertyInfo) -> Self {
        upsert(&mut self.session_properties, property);
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn upsert(list: &mut Vec<PropertyInfo>, property: PropertyInfo) {
    match list.iter_mut().find(|existing| existing.name == property.name) {
        Some(existing) => *existing = property,
        None => list.push(property),
    }
}

/// Shared call counters, readable after the subsystem has been boxed away.
#[derive(Debug, Clone, Default)]
pub struct MockCounters {
    opens: Arc<AtomicUsize>,
    resets: Arc<AtomicUsize>,
    enumerations: Arc<AtomicUsize>,
}

impl MockCounters {
    /// Number of `open_session` calls.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of `reset` calls.
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    /// Number of `enumerate_devices` calls.
    pub fn enumerations(&self) -> usize {
        self.enumerations.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
struct MockProducer {
    devices: Vec<MockDevice>,
    broken: bool,
}

#[derive(Debug)]
struct MockSession {
    device: MockDevice,
    format: String,
    roi: Roi,
    sequence: u32,
    target: u32,
    polls_remaining: Cell<u32>,
    frames: Vec<Frame>,
    logger: Option<PathBuf>,
}

/// Mock subsystem holding any number of producers.
#[derive(Debug)]
pub struct MockSubsystem {
    producers: BTreeMap<PathBuf, MockProducer>,
    active: Option<PathBuf>,
    sessions: BTreeMap<SessionHandle, MockSession>,
    next_handle: u64,
    counters: MockCounters,
    capture_polls: u32,
    failing_reset: Option<PathBuf>,
}

impl Default for MockSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSubsystem {
    /// Create a subsystem with no producers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            producers: BTreeMap::new(),
            active: None,
            sessions: BTreeMap::new(),
            next_handle: 1,
            counters: MockCounters::default(),
            capture_polls: 2,
            failing_reset: None,
        }
    }

    /// Simulated installation: every producer sees the same three cameras.
    #[must_use]
    pub fn simulated(producers: &[ProducerRef]) -> Self {
        let devices = vec![
            MockDevice::new("SimCam A (SN1001)").with_user_id("cam-a"),
            MockDevice::new("SimCam B (SN1002)").with_user_id("cam-b"),
            MockDevice::new("SimCam C (SN1003)")
                .with_user_id("cam-c")
                .with_formats(&["Mono8", "BayerRG8"], "BayerRG8"),
        ];
        producers.iter().fold(Self::new(), |subsystem, producer| {
            subsystem.with_producer(producer.path(), devices.clone())
        })
    }

    /// Register a producer and the devices it enumerates, in ID order.
    #[must_use]
    pub fn with_producer(mut self, path: impl Into<PathBuf>, devices: Vec<MockDevice>) -> Self {
        self.producers.insert(
            path.into(),
            MockProducer {
                devices,
                broken: false,
            },
        );
        self
    }

    /// Register a producer whose device query always fails.
    #[must_use]
    pub fn with_broken_producer(mut self, path: impl Into<PathBuf>) -> Self {
        self.producers.insert(
            path.into(),
            MockProducer {
                devices: Vec::new(),
                broken: true,
            },
        );
        self
    }

    /// Number of `is_running` polls before an acquisition completes.
    /// `u32::MAX` never completes.
    #[must_use]
    pub fn with_capture_polls(mut self, polls: u32) -> Self {
        self.capture_polls = polls;
        self
    }

    /// Make `reset` fail whenever `path` is the active producer.
    #[must_use]
    pub fn with_failing_reset(mut self, path: impl Into<PathBuf>) -> Self {
        self.failing_reset = Some(path.into());
        self
    }

    /// Shared call counters.
    pub fn counters(&self) -> MockCounters {
        self.counters.clone()
    }

    fn active_devices(&self) -> Result<&[MockDevice]> {
        let path = self
            .active
            .as_ref()
            .ok_or_else(|| ConformanceError::SubsystemQuery("no active producer".to_owned()))?;
        let producer = self.producers.get(path).ok_or_else(|| {
            ConformanceError::SubsystemQuery(format!("producer {} not loaded", path.display()))
        })?;
        if producer.broken {
            return Err(ConformanceError::SubsystemQuery(format!(
                "producer descriptor in {} is malformed",
                path.display()
            )));
        }
        Ok(&producer.devices)
    }

    fn session(&self, handle: SessionHandle) -> Result<&MockSession> {
        self.sessions
            .get(&handle)
            .ok_or_else(|| ConformanceError::SubsystemQuery(format!("{handle} is not open")))
    }

    fn session_mut(&mut self, handle: SessionHandle) -> Result<&mut MockSession> {
        self.sessions
            .get_mut(&handle)
            .ok_or_else(|| ConformanceError::SubsystemQuery(format!("{handle} is not open")))
    }
}

impl AcquisitionSubsystem for MockSubsystem {
    fn set_active_producer(&mut self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) if !self.producers.contains_key(path) => {
                Err(ConformanceError::SubsystemQuery(format!(
                    "cannot load producer {}",
                    path.display()
                )))
            }
            Some(path) => {
                self.active = Some(path.to_path_buf());
                Ok(())
            }
            None => {
                self.active = None;
                Ok(())
            }
        }
    }

    fn active_producer(&self) -> Option<PathBuf> {
        self.active.clone()
    }

    fn reset(&mut self) -> Result<()> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        self.sessions.clear();
        if self.active.is_some() && self.active == self.failing_reset {
            return Err(ConformanceError::SubsystemQuery(
                "subsystem reset failed".to_owned(),
            ));
        }
        Ok(())
    }

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        self.counters.enumerations.fetch_add(1, Ordering::SeqCst);
        let devices = self.active_devices()?;
        Ok(devices
            .iter()
            .zip(1u32..)
            .map(|(device, hardware_id)| DeviceInfo {
                name: device.name.clone(),
                hardware_id,
                formats: device.formats.clone(),
                default_format: device.default_format.clone(),
                device_user_id: device.device_user_id.clone(),
            })
            .collect())
    }

    fn open_session(&mut self, hardware_id: u32, format: Option<&str>) -> Result<SessionHandle> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let device = hardware_id
            .checked_sub(1)
            .and_then(|index| self.active_devices().ok()?.get(index as usize))
            .cloned()
            .ok_or_else(|| {
                ConformanceError::ConfigMismatch(format!("device {hardware_id} not found"))
            })?;

        let format = match format {
            Some(requested) if !device.formats.iter().any(|f| f == requested) => {
                return Err(ConformanceError::ConfigMismatch(format!(
                    "format {requested} not supported by {}",
                    device.name
                )));
            }
            Some(requested) => requested.to_owned(),
            None => device.default_format.clone(),
        };

        let handle = SessionHandle(self.next_handle);
        self.next_handle += 1;
        let roi = Roi::full(device.width, device.height);
        self.sessions.insert(
            handle,
            MockSession {
                device,
                format,
                roi,
                sequence: 0,
                target: 0,
                polls_remaining: Cell::new(0),
                frames: Vec::new(),
                logger: None,
            },
        );
        Ok(handle)
    }

    fn session_properties(&mut self, handle: SessionHandle) -> Result<Vec<PropertyInfo>> {
        Ok(self.session(handle)?.device.session_properties.clone())
    }

    fn source_properties(&mut self, handle: SessionHandle) -> Result<Vec<PropertyInfo>> {
        Ok(self.session(handle)?.device.source_properties.clone())
    }

    fn selected_source(&self, handle: SessionHandle) -> Result<String> {
        self.session(handle).map(|_| "input1".to_owned())
    }

    fn close_session(&mut self, handle: SessionHandle) -> Result<()> {
        self.sessions
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| ConformanceError::SubsystemQuery(format!("{handle} is not open")))
    }

    fn open_session_count(&self) -> usize {
        self.sessions.len()
    }

    fn start_capture(&mut self, handle: SessionHandle, frames: u32) -> Result<()> {
        let polls = self.capture_polls;
        let session = self.session_mut(handle)?;
        session.target = frames;
        session.polls_remaining.set(polls);
        session.frames = (0..frames).map(|_| next_frame(session)).collect();

        if let Some(path) = &session.logger {
            let payload: Vec<u8> = session
                .frames
                .iter()
                .flat_map(|frame| frame.data.iter().copied())
                .collect();
            fs::write(path, payload)?;
        }
        Ok(())
    }

    fn stop_capture(&mut self, handle: SessionHandle) -> Result<()> {
        let session = self.session_mut(handle)?;
        session.polls_remaining.set(0);
        Ok(())
    }

    fn is_running(&self, handle: SessionHandle) -> Result<bool> {
        let session = self.session(handle)?;
        let remaining = session.polls_remaining.get();
        if remaining == u32::MAX {
            return Ok(true);
        }
        session.polls_remaining.set(remaining.saturating_sub(1));
        Ok(remaining > 0)
    }

    fn frames_acquired(&self, handle: SessionHandle) -> Result<u32> {
        let session = self.session(handle)?;
        Ok(if session.polls_remaining.get() == 0 {
            session.target
        } else {
            0
        })
    }

    fn acquired_frames(&mut self, handle: SessionHandle) -> Result<Vec<Frame>> {
        Ok(self.session(handle)?.frames.clone())
    }

    fn read_snapshot(&mut self, handle: SessionHandle) -> Result<Frame> {
        let session = self.session_mut(handle)?;
        Ok(next_frame(session))
    }

    fn region_of_interest(&self, handle: SessionHandle) -> Result<Roi> {
        Ok(self.session(handle)?.roi)
    }

    fn set_region_of_interest(&mut self, handle: SessionHandle, roi: Roi) -> Result<Roi> {
        let session = self.session_mut(handle)?;
        let fits = roi.width > 0
            && roi.height > 0
            && roi.x.saturating_add(roi.width) <= session.device.width
            && roi.y.saturating_add(roi.height) <= session.device.height;
        if !fits {
            return Err(ConformanceError::ConfigMismatch(format!(
                "ROI {roi:?} exceeds {}x{} sensor",
                session.device.width, session.device.height
            )));
        }
        session.roi = roi;
        Ok(roi)
    }

    fn attach_disk_logger(&mut self, handle: SessionHandle, path: &Path) -> Result<()> {
        self.session_mut(handle)?.logger = Some(path.to_path_buf());
        Ok(())
    }
}

/// Produce the next frame of a session using a horizontal gradient pattern.
fn next_frame(session: &mut MockSession) -> Frame {
    let roi = session.roi;
    let data = generate_gradient(roi.width, roi.height, bytes_per_pixel(&session.format));
    let sequence = session.sequence;
    session.sequence += 1;
    #[allow(clippy::cast_possible_truncation)]
    let bytes_used = data.len() as u32;

    Frame {
        metadata: FrameMetadata {
            sequence,
            timestamp: Duration::from_millis(u64::from(sequence) * 33), // ~30fps
            bytes_used,
        },
        data,
        width: roi.width,
        height: roi.height,
        format: session.format.clone(),
    }
}

/// Bytes per pixel for the formats the mock knows about.
pub fn bytes_per_pixel(format: &str) -> usize {
    match format {
        "Mono16" | "YUV422_8" | "YUYV" => 2,
        "RGB8" | "BGR8" => 3,
        _ => 1,
    }
}

/// Generate a horizontal gradient, dark on the left, bright on the right.
fn generate_gradient(width: u32, height: u32, bytes_per_pixel: usize) -> Vec<u8> {
    let row: Vec<u8> = (0..width)
        .flat_map(|x| {
            #[allow(clippy::cast_possible_truncation)]
            let level = ((x * 255) / width.max(1)) as u8;
            std::iter::repeat(level).take(bytes_per_pixel)
        })
        .collect();
    (0..height).flat_map(|_| row.iter().copied()).collect()
}

fn standard_session_properties(width: u32, height: u32) -> Vec<PropertyInfo> {
    vec![
        PropertyInfo {
            name: "FramesPerTrigger".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::Positive,
            constraint_value: None,
            default_value: PropertyValue::NumericScalar(10.0),
            read_only: false,
            device_specific: false,
        },
        PropertyInfo {
            name: "ROIPosition".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::Bounded,
            constraint_value: Some(PropertyValue::NumericArray(vec![
                0.0,
                0.0,
                f64::from(width),
                f64::from(height),
            ])),
            default_value: PropertyValue::NumericArray(vec![
                0.0,
                0.0,
                f64::from(width),
                f64::from(height),
            ]),
            read_only: false,
            device_specific: false,
        },
        PropertyInfo {
            name: "VideoResolution".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::None,
            constraint_value: None,
            default_value: PropertyValue::NumericArray(vec![f64::from(width), f64::from(height)]),
            read_only: true,
            device_specific: false,
        },
        PropertyInfo {
            name: "ReturnedColorSpace".to_owned(),
            property_type: PropertyType::String,
            constraint: ConstraintKind::Enum,
            constraint_value: Some(PropertyValue::EnumList(vec![
                "grayscale".to_owned(),
                "rgb".to_owned(),
            ])),
            default_value: PropertyValue::Text("grayscale".to_owned()),
            read_only: false,
            device_specific: false,
        },
        PropertyInfo {
            name: "FramesAcquiredFcn".to_owned(),
            property_type: PropertyType::Callback,
            constraint: ConstraintKind::Callback,
            constraint_value: None,
            default_value: PropertyValue::CallbackRef(String::new()),
            read_only: false,
            device_specific: false,
        },
        PropertyInfo {
            name: "Timeout".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::Positive,
            constraint_value: None,
            default_value: PropertyValue::NumericScalar(10.0),
            read_only: false,
            device_specific: false,
        },
    ]
}

fn standard_source_properties(user_id: Option<&str>) -> Vec<PropertyInfo> {
    vec![
        PropertyInfo {
            name: "ExposureTime".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::Bounded,
            constraint_value: Some(PropertyValue::NumericArray(vec![10.0, 1_000_000.0])),
            default_value: PropertyValue::NumericScalar(10_000.0),
            read_only: false,
            device_specific: true,
        },
        PropertyInfo {
            name: "Gain".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::Bounded,
            constraint_value: Some(PropertyValue::NumericArray(vec![0.0, 24.0])),
            default_value: PropertyValue::NumericScalar(1.000_000_000_000_000_2),
            read_only: false,
            device_specific: true,
        },
        PropertyInfo {
            name: "ReverseX".to_owned(),
            property_type: PropertyType::Boolean,
            constraint: ConstraintKind::None,
            constraint_value: None,
            default_value: PropertyValue::Boolean(false),
            read_only: false,
            device_specific: true,
        },
        PropertyInfo {
            name: "TriggerSelector".to_owned(),
            property_type: PropertyType::String,
            constraint: ConstraintKind::Enum,
            constraint_value: Some(PropertyValue::EnumList(vec![
                "FrameStart".to_owned(),
                "AcquisitionStart".to_owned(),
            ])),
            default_value: PropertyValue::Text("FrameStart".to_owned()),
            read_only: false,
            device_specific: true,
        },
        PropertyInfo {
            name: "DeviceUserID".to_owned(),
            property_type: PropertyType::String,
            constraint: ConstraintKind::None,
            constraint_value: None,
            default_value: PropertyValue::Text(user_id.unwrap_or_default().to_owned()),
            read_only: false,
            device_specific: true,
        },
        PropertyInfo {
            name: "SensorTemperature".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::None,
            constraint_value: None,
            default_value: PropertyValue::NumericScalar(41.5),
            read_only: true,
            device_specific: true,
        },
    ]
}
