//! V4L2 acquisition subsystem using the v4l crate.
//!
//! V4L2 has a single implicit transport layer, so the active producer is
//! recorded and validated but enumeration always lists the host's capture
//! nodes. Controls become source-level properties; the negotiated format
//! provides the session-level ones. Acquisition is synchronous: a capture has
//! finished by the time `start_capture` returns.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};
use v4l::buffer::Type;
use v4l::control::{self, MenuItem};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::error::{ConformanceError, Result};
use crate::property::{ConstraintKind, PropertyInfo, PropertyType, PropertyValue};
use crate::traits::{
    AcquisitionSubsystem, DeviceInfo, Frame, FrameMetadata, Roi, SessionHandle,
};

/// mmap buffers per stream.
const BUFFER_COUNT: u32 = 4;

fn query_err(context: &'static str) -> impl Fn(io::Error) -> ConformanceError {
    move |err| ConformanceError::SubsystemQuery(format!("{context}: {err}"))
}

/// A capture node found during enumeration.
#[derive(Debug, Clone)]
struct Node {
    index: usize,
    path: PathBuf,
}

struct V4l2Session {
    device: Device,
    node: Node,
    /// Format in effect before this session negotiated its own.
    original: Option<Format>,
    format: String,
    width: u32,
    height: u32,
    frames: Vec<Frame>,
    acquired: u32,
    logger: Option<PathBuf>,
}

/// Acquisition subsystem over `/dev/video*` capture nodes.
pub struct V4l2Subsystem {
    active: Option<PathBuf>,
    nodes: Vec<Node>,
    sessions: BTreeMap<SessionHandle, V4l2Session>,
    next_handle: u64,
}

impl Default for V4l2Subsystem {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Session {
    /// Put back the node's format if this session changed it.
    fn restore_format(&self) -> Result<()> {
        if let Some(original) = &self.original {
            self.device
                .set_format(original)
                .map_err(query_err("format restore failed"))?;
            debug!(path = %self.node.path.display(), "device format restored");
        }
        Ok(())
    }
}

impl V4l2Subsystem {
    /// Subsystem with no producer active.
    pub const fn new() -> Self {
        Self {
            active: None,
            nodes: Vec::new(),
            sessions: BTreeMap::new(),
            next_handle: 1,
        }
    }

    fn require_producer(&self) -> Result<&Path> {
        self.active
            .as_deref()
            .ok_or_else(|| ConformanceError::SubsystemQuery("no active producer".to_owned()))
    }

    /// Capture-capable nodes in index order, with their device info.
    fn scan() -> Vec<(Node, DeviceInfo)> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);

        let mut found = Vec::new();
        for node in nodes {
            match describe(node.index()) {
                Ok(Some((name, formats, default_format))) => {
                    let id = u32::try_from(found.len() + 1).unwrap_or(u32::MAX);
                    found.push((
                        Node {
                            index: node.index(),
                            path: node.path().to_path_buf(),
                        },
                        DeviceInfo {
                            name,
                            hardware_id: id,
                            formats,
                            default_format,
                            device_user_id: None,
                        },
                    ));
                }
                Ok(None) => debug!(path = %node.path().display(), "not a capture node"),
                Err(err) => warn!(path = %node.path().display(), error = %err, "skipping node"),
            }
        }
        found
    }

    fn session(&self, handle: SessionHandle) -> Result<&V4l2Session> {
        self.sessions
            .get(&handle)
            .ok_or_else(|| ConformanceError::SubsystemQuery(format!("{handle} is not open")))
    }

    fn session_mut(&mut self, handle: SessionHandle) -> Result<&mut V4l2Session> {
        self.sessions
            .get_mut(&handle)
            .ok_or_else(|| ConformanceError::SubsystemQuery(format!("{handle} is not open")))
    }

    fn next_handle(&mut self) -> SessionHandle {
        let handle = SessionHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

/// Name, formats and current format of a capture node; `None` if it cannot capture.
fn describe(index: usize) -> io::Result<Option<(String, Vec<String>, String)>> {
    let device = Device::new(index)?;
    let caps = device.query_caps()?;
    if !caps
        .capabilities
        .contains(v4l::capability::Flags::VIDEO_CAPTURE)
    {
        return Ok(None);
    }
    let formats = device
        .enum_formats()?
        .into_iter()
        .map(|desc| desc.fourcc.to_string())
        .collect();
    let current = device.format()?.fourcc.to_string();
    Ok(Some((format!("{} ({})", caps.card, caps.bus), formats, current)))
}

fn fourcc_from_name(name: &str) -> Result<FourCC> {
    let bytes: [u8; 4] = name.as_bytes().try_into().map_err(|_| {
        ConformanceError::ConfigMismatch(format!("{name} is not a V4L2 fourcc"))
    })?;
    Ok(FourCC::new(&bytes))
}

/// Grab `count` frames from a fresh mmap stream.
fn grab(device: &Device, count: u32, format: &str) -> Result<Vec<Frame>> {
    let mut stream = Stream::with_buffers(device, Type::VideoCapture, BUFFER_COUNT)
        .map_err(query_err("stream setup failed"))?;
    let current = device.format().map_err(query_err("format query failed"))?;

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (buf, meta) = stream.next().map_err(query_err("capture failed"))?;

        // V4L2 timestamps are non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let used = (meta.bytesused as usize).min(buf.len());
        frames.push(Frame {
            data: buf.get(..used).unwrap_or(buf).to_vec(),
            width: current.width,
            height: current.height,
            format: format.to_owned(),
            metadata: FrameMetadata {
                sequence: meta.sequence,
                timestamp: Duration::new(secs, nanos),
                bytes_used: meta.bytesused,
            },
        });
    }
    Ok(frames)
}

/// Control categories the conformance suite distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlKind {
    Numeric,
    Boolean,
    Menu,
    Button,
    Text,
    Class,
    Other,
}

impl From<control::Type> for ControlKind {
    fn from(typ: control::Type) -> Self {
        match typ {
            control::Type::Integer | control::Type::Integer64 | control::Type::Bitmask => {
                Self::Numeric
            }
            control::Type::Boolean => Self::Boolean,
            control::Type::Menu | control::Type::IntegerMenu => Self::Menu,
            control::Type::Button => Self::Button,
            control::Type::String => Self::Text,
            control::Type::CtrlClass => Self::Class,
            #[allow(unreachable_patterns)]
            _ => Self::Other,
        }
    }
}

/// Raw control fields, detached from the v4l types.
#[derive(Debug, Clone)]
struct ControlFields {
    name: String,
    kind: ControlKind,
    minimum: i64,
    maximum: i64,
    default: i64,
    read_only: bool,
    /// (index, label) pairs of menu entries.
    items: Vec<(u32, String)>,
}

impl From<control::Description> for ControlFields {
    fn from(desc: control::Description) -> Self {
        let items = desc
            .items
            .unwrap_or_default()
            .into_iter()
            .map(|(index, item)| {
                let label = match item {
                    MenuItem::Name(name) => name,
                    MenuItem::Value(value) => value.to_string(),
                };
                (index, label)
            })
            .collect();
        Self {
            name: desc.name,
            kind: ControlKind::from(desc.typ),
            minimum: desc.minimum,
            maximum: desc.maximum,
            default: desc.default,
            read_only: desc.flags.contains(control::Flags::READ_ONLY),
            items,
        }
    }
}

/// Map a control onto a property record. Control classes have no value and map to `None`.
#[allow(clippy::cast_precision_loss)]
fn property_from_control(control: ControlFields) -> Option<PropertyInfo> {
    let (property_type, constraint, constraint_value, default_value) = match control.kind {
        ControlKind::Class => return None,
        ControlKind::Numeric => (
            PropertyType::Integer,
            ConstraintKind::Bounded,
            Some(PropertyValue::NumericArray(vec![
                control.minimum as f64,
                control.maximum as f64,
            ])),
            PropertyValue::NumericScalar(control.default as f64),
        ),
        ControlKind::Boolean => (
            PropertyType::Boolean,
            ConstraintKind::None,
            None,
            PropertyValue::Boolean(control.default != 0),
        ),
        ControlKind::Menu => {
            let default = control
                .items
                .iter()
                .find(|(index, _)| i64::from(*index) == control.default)
                .or_else(|| control.items.first())
                .map(|(_, label)| label.clone())
                .unwrap_or_default();
            let labels = control.items.into_iter().map(|(_, label)| label).collect();
            (
                PropertyType::String,
                ConstraintKind::Enum,
                Some(PropertyValue::EnumList(labels)),
                PropertyValue::Text(default),
            )
        }
        ControlKind::Button => (
            PropertyType::Callback,
            ConstraintKind::Callback,
            None,
            PropertyValue::CallbackRef(control.name.clone()),
        ),
        ControlKind::Text => (
            PropertyType::String,
            ConstraintKind::None,
            None,
            PropertyValue::Text(String::new()),
        ),
        ControlKind::Other => (
            PropertyType::Any,
            ConstraintKind::None,
            None,
            PropertyValue::OpaqueRef(control.name.clone()),
        ),
    };

    Some(PropertyInfo {
        name: control.name,
        property_type,
        constraint,
        constraint_value,
        default_value,
        read_only: control.read_only,
        device_specific: true,
    })
}

/// Session-level properties derived from the negotiated format.
fn format_properties(format: &str, width: u32, height: u32) -> Vec<PropertyInfo> {
    let color_space = match format {
        "GREY" | "Y10 " | "Y12 " | "Y16 " => "grayscale",
        "BA81" | "GBRG" | "GRBG" | "RGGB" | "BGGR" => "bayer",
        "YUYV" | "UYVY" | "NV12" | "YU12" => "YCbCr",
        _ => "rgb",
    };
    let size = vec![f64::from(width), f64::from(height)];
    vec![
        PropertyInfo {
            name: "FramesPerTrigger".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::Positive,
            constraint_value: None,
            default_value: PropertyValue::NumericScalar(1.0),
            read_only: false,
            device_specific: false,
        },
        PropertyInfo {
            name: "ROIPosition".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::Bounded,
            constraint_value: Some(PropertyValue::NumericArray(
                [vec![0.0, 0.0], size.clone()].concat(),
            )),
            default_value: PropertyValue::NumericArray([vec![0.0, 0.0], size.clone()].concat()),
            read_only: false,
            device_specific: false,
        },
        PropertyInfo {
            name: "VideoResolution".to_owned(),
            property_type: PropertyType::Double,
            constraint: ConstraintKind::None,
            constraint_value: None,
            default_value: PropertyValue::NumericArray(size),
            read_only: true,
            device_specific: false,
        },
        PropertyInfo {
            name: "ReturnedColorSpace".to_owned(),
            property_type: PropertyType::String,
            constraint: ConstraintKind::None,
            constraint_value: None,
            default_value: PropertyValue::Text(color_space.to_owned()),
            read_only: false,
            device_specific: false,
        },
    ]
}

impl AcquisitionSubsystem for V4l2Subsystem {
    fn set_active_producer(&mut self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) if !path.is_dir() => Err(ConformanceError::SubsystemQuery(format!(
                "producer directory {} does not exist",
                path.display()
            ))),
            path => {
                self.active = path.map(Path::to_path_buf);
                self.nodes.clear();
                Ok(())
            }
        }
    }

    fn active_producer(&self) -> Option<PathBuf> {
        self.active.clone()
    }

    fn reset(&mut self) -> Result<()> {
        let sessions = std::mem::take(&mut self.sessions);
        let mut first_err = None;
        for session in sessions.values() {
            if let Err(err) = session.restore_format() {
                warn!(error = %err, "format not restored on reset");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn enumerate_devices(&mut self) -> Result<Vec<DeviceInfo>> {
        let producer = self.require_producer()?.to_path_buf();
        let (nodes, devices): (Vec<Node>, Vec<DeviceInfo>) = Self::scan().into_iter().unzip();
        debug!(producer = %producer.display(), count = devices.len(), "V4L2 nodes enumerated");
        self.nodes = nodes;
        Ok(devices)
    }

    fn open_session(&mut self, hardware_id: u32, format: Option<&str>) -> Result<SessionHandle> {
        self.require_producer()?;
        if self.nodes.is_empty() {
            self.enumerate_devices()?;
        }
        let node = hardware_id
            .checked_sub(1)
            .and_then(|index| self.nodes.get(index as usize))
            .cloned()
            .ok_or_else(|| {
                ConformanceError::ConfigMismatch(format!("device {hardware_id} not found"))
            })?;

        let device = Device::new(node.index).map_err(query_err("device open failed"))?;
        let mut current = device.format().map_err(query_err("format query failed"))?;
        let mut original = None;
        if let Some(requested) = format {
            let supported = device
                .enum_formats()
                .map_err(query_err("format enumeration failed"))?
                .iter()
                .any(|desc| desc.fourcc.to_string() == requested);
            if !supported {
                return Err(ConformanceError::ConfigMismatch(format!(
                    "format {requested} not supported by {}",
                    node.path.display()
                )));
            }
            original = Some(current);
            current.fourcc = fourcc_from_name(requested)?;
            current = device
                .set_format(&current)
                .map_err(query_err("format negotiation failed"))?;
        }

        let handle = self.next_handle();
        self.sessions.insert(
            handle,
            V4l2Session {
                device,
                node,
                original,
                format: current.fourcc.to_string(),
                width: current.width,
                height: current.height,
                frames: Vec::new(),
                acquired: 0,
                logger: None,
            },
        );
        Ok(handle)
    }

    fn session_properties(&mut self, handle: SessionHandle) -> Result<Vec<PropertyInfo>> {
        let session = self.session(handle)?;
        Ok(format_properties(&session.format, session.width, session.height))
    }

    fn source_properties(&mut self, handle: SessionHandle) -> Result<Vec<PropertyInfo>> {
        let controls = self
            .session(handle)?
            .device
            .query_controls()
            .map_err(query_err("control query failed"))?;
        Ok(controls
            .into_iter()
            .map(ControlFields::from)
            .filter_map(property_from_control)
            .collect())
    }

    fn selected_source(&self, handle: SessionHandle) -> Result<String> {
        Ok(self.session(handle)?.node.path.display().to_string())
    }

    fn close_session(&mut self, handle: SessionHandle) -> Result<()> {
        self.sessions
            .remove(&handle)
            .ok_or_else(|| ConformanceError::SubsystemQuery(format!("{handle} is not open")))?
            .restore_format()
    }

    fn open_session_count(&self) -> usize {
        self.sessions.len()
    }

    fn start_capture(&mut self, handle: SessionHandle, frames: u32) -> Result<()> {
        let session = self.session_mut(handle)?;
        let captured = grab(&session.device, frames, &session.format)?;

        if let Some(path) = &session.logger {
            let payload: Vec<u8> = captured
                .iter()
                .flat_map(|frame| frame.data.iter().copied())
                .collect();
            fs::write(path, payload)?;
        }
        session.acquired = u32::try_from(captured.len()).unwrap_or(u32::MAX);
        session.frames = captured;
        Ok(())
    }

    fn stop_capture(&mut self, handle: SessionHandle) -> Result<()> {
        self.session(handle).map(|_| ())
    }

    fn is_running(&self, handle: SessionHandle) -> Result<bool> {
        self.session(handle).map(|_| false)
    }

    fn frames_acquired(&self, handle: SessionHandle) -> Result<u32> {
        Ok(self.session(handle)?.acquired)
    }

    fn acquired_frames(&mut self, handle: SessionHandle) -> Result<Vec<Frame>> {
        Ok(self.session(handle)?.frames.clone())
    }

    fn read_snapshot(&mut self, handle: SessionHandle) -> Result<Frame> {
        let session = self.session(handle)?;
        grab(&session.device, 1, &session.format)?
            .pop()
            .ok_or_else(|| ConformanceError::SubsystemQuery("snapshot returned no frame".to_owned()))
    }

    fn region_of_interest(&self, handle: SessionHandle) -> Result<Roi> {
        let session = self.session(handle)?;
        Ok(Roi::full(session.width, session.height))
    }

    fn set_region_of_interest(&mut self, handle: SessionHandle, roi: Roi) -> Result<Roi> {
        let full = self.region_of_interest(handle)?;
        if roi == full {
            Ok(full)
        } else {
            Err(ConformanceError::Unsupported(
                "V4L2 capture nodes do not support sub-frame ROI".to_owned(),
            ))
        }
    }

    fn attach_disk_logger(&mut self, handle: SessionHandle, path: &Path) -> Result<()> {
        self.session_mut(handle)?.logger = Some(path.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn control(kind: ControlKind) -> ControlFields {
        ControlFields {
            name: "Power Line Frequency".to_owned(),
            kind,
            minimum: 0,
            maximum: 2,
            default: 1,
            read_only: false,
            items: vec![
                (0, "Disabled".to_owned()),
                (1, "50 Hz".to_owned()),
                (2, "60 Hz".to_owned()),
            ],
        }
    }

    #[test]
    fn test_menu_control_becomes_enum() {
        let info = property_from_control(control(ControlKind::Menu)).expect("menu dropped");
        assert_eq!(info.constraint, ConstraintKind::Enum);
        assert_eq!(info.default_value, PropertyValue::Text("50 Hz".to_owned()));
        assert_eq!(
            info.constraint_value,
            Some(PropertyValue::EnumList(vec![
                "Disabled".to_owned(),
                "50 Hz".to_owned(),
                "60 Hz".to_owned()
            ]))
        );
    }

    #[test]
    fn test_numeric_and_boolean_controls() {
        let info = property_from_control(control(ControlKind::Numeric)).expect("numeric dropped");
        assert_eq!(info.constraint, ConstraintKind::Bounded);
        assert_eq!(info.default_value, PropertyValue::NumericScalar(1.0));

        let info = property_from_control(control(ControlKind::Boolean)).expect("boolean dropped");
        assert_eq!(info.default_value, PropertyValue::Boolean(true));
    }

    #[test]
    fn test_control_class_is_skipped() {
        assert!(property_from_control(control(ControlKind::Class)).is_none());
        let info = property_from_control(control(ControlKind::Button)).expect("button dropped");
        assert_eq!(
            info.default_value,
            PropertyValue::CallbackRef("Power Line Frequency".to_owned())
        );
    }

    #[test]
    fn test_format_properties() {
        let props = format_properties("GREY", 640, 480);
        let resolution = props
            .iter()
            .find(|p| p.name == "VideoResolution")
            .expect("VideoResolution missing");
        assert!(resolution.read_only);
        assert_eq!(
            resolution.default_value,
            PropertyValue::NumericArray(vec![640.0, 480.0])
        );
        let color = props
            .iter()
            .find(|p| p.name == "ReturnedColorSpace")
            .expect("ReturnedColorSpace missing");
        assert_eq!(color.default_value, PropertyValue::Text("grayscale".to_owned()));
    }

    #[test]
    fn test_fourcc_from_name() {
        assert!(fourcc_from_name("YUYV").is_ok());
        assert!(matches!(
            fourcc_from_name("Mono8"),
            Err(ConformanceError::ConfigMismatch(_))
        ));
    }

    #[test]
    fn test_producer_must_exist() {
        let mut subsystem = V4l2Subsystem::new();
        assert!(subsystem
            .set_active_producer(Some(Path::new("/nonexistent/producer")))
            .is_err());
        assert!(subsystem.enumerate_devices().is_err());

        let dir = TempDir::new().expect("tempdir failed");
        subsystem
            .set_active_producer(Some(dir.path()))
            .expect("set_active_producer failed");
        assert_eq!(subsystem.active_producer().as_deref(), Some(dir.path()));
        assert!(subsystem.open_session(0, None).is_err());
    }
}
