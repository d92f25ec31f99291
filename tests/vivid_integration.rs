//! Integration tests against the vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded: `sudo modprobe vivid n_devs=2`
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! Tests fail rather than skip when vivid is missing, so CI catches a broken
//! setup.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;

use gentl_conformance::enumerator::{self, DeviceDescriptor};
use gentl_conformance::orchestrator::Outcome;
use gentl_conformance::validation::{validate_frame_dimensions, validate_frame_sequence};
use gentl_conformance::{
    resolve, AcquisitionSubsystem, HardwareSpecCache, ProducerRef, RunParameters,
    SubsystemSession, Summary, TestOrchestrator, V4l2Subsystem,
};
use serial_test::serial;
use tempfile::TempDir;

/// A producer directory the V4L2 backend accepts.
fn producer_dir() -> TempDir {
    let dir = TempDir::new().expect("tempdir failed");
    fs::write(dir.path().join("v4l2.cti"), b"v4l2").expect("write failed");
    dir
}

/// Vivid capture nodes as enumerated under `producer`.
fn vivid_devices(subsystem: &mut V4l2Subsystem, producer: &Path) -> Vec<DeviceDescriptor> {
    subsystem
        .set_active_producer(Some(producer))
        .expect("set_active_producer failed");
    enumerator::enumerate(subsystem)
        .expect("enumeration failed")
        .into_iter()
        .filter(|device| device.device_name.to_lowercase().contains("vivid"))
        .collect()
}

macro_rules! require_vivid {
    ($subsystem:expr, $producer:expr) => {{
        let devices = vivid_devices($subsystem, $producer);
        match devices.first().cloned() {
            Some(device) => device,
            None => panic!(
                "vivid virtual camera not available.\n\
                 Load vivid with: sudo modprobe vivid n_devs=2\n\
                 Or run unit tests only: cargo test --lib"
            ),
        }
    }};
}

#[test]
#[serial]
fn test_vivid_enumeration() {
    let producer = producer_dir();
    let mut subsystem = V4l2Subsystem::new();
    let device = require_vivid!(&mut subsystem, producer.path());

    assert!(device.hardware_id >= 1);
    assert!(!device.supported_formats.is_empty());
    assert!(device.supports(&device.default_format));
    println!("{} -> {}", device.device_name, device.spec_file_key);
}

#[test]
#[serial]
fn test_vivid_spec_generation() {
    let producer = producer_dir();
    let cache_dir = TempDir::new().expect("tempdir failed");
    let cache = HardwareSpecCache::new(cache_dir.path());
    let mut subsystem = V4l2Subsystem::new();
    let device = require_vivid!(&mut subsystem, producer.path());

    let spec = cache
        .get_or_create(&device, &mut subsystem)
        .expect("spec generation failed");
    assert!(spec.property("VideoResolution").is_some());
    assert!(
        spec.source_properties()
            .iter()
            .any(|record| record.name == "Brightness"),
        "vivid exposes a Brightness control"
    );
    assert_eq!(subsystem.open_session_count(), 0);

    let reloaded = cache
        .lookup(&device.spec_file_key)
        .expect("lookup failed")
        .expect("cache miss");
    assert_eq!(reloaded, spec);
}

#[test]
#[serial]
fn test_vivid_snapshot_and_stream() {
    let producer = producer_dir();
    let mut subsystem = V4l2Subsystem::new();
    let device = require_vivid!(&mut subsystem, producer.path());

    let handle = subsystem
        .open_session(device.hardware_id, Some("YUYV"))
        .expect("open failed");
    let roi = subsystem.region_of_interest(handle).expect("roi failed");

    let frame = subsystem.read_snapshot(handle).expect("snapshot failed");
    validate_frame_dimensions(&frame, &roi).expect("snapshot dimensions");

    subsystem.start_capture(handle, 10).expect("capture failed");
    assert!(!subsystem.is_running(handle).expect("is_running failed"));
    assert_eq!(subsystem.frames_acquired(handle).expect("count failed"), 10);
    let frames = subsystem.acquired_frames(handle).expect("frames failed");
    validate_frame_sequence(&frames).expect("sequence gap");

    assert!(subsystem
        .set_region_of_interest(handle, roi.centered_half())
        .is_err());
    subsystem.close_session(handle).expect("close failed");
}

#[test]
#[serial]
fn test_vivid_conformance_run() {
    let producer = producer_dir();
    let results = TempDir::new().expect("tempdir failed");
    let cache = HardwareSpecCache::new(results.path().join("hwspecs"));
    let mut subsystem = V4l2Subsystem::new();
    let device = require_vivid!(&mut subsystem, producer.path());
    let session = SubsystemSession::new(subsystem);

    let params = RunParameters {
        producers: Some(vec![producer.path().to_path_buf()]),
        device_ids: Some(vec![device.hardware_id]),
        formats: None,
    };
    let report = TestOrchestrator::new(&session, &cache, results.path().join("scratch"))
        .run(
            &resolve(&["tVideoinput", "tAcquisition", "tProperties"]),
            &params,
        )
        .expect("run failed");

    let summary = Summary::summarize(&report.results, &report.configurations);
    println!("{}", summary.render());
    assert_eq!(summary.failed, 0);

    let roi = report
        .results
        .iter()
        .find(|r| r.test_name == "tAcquisition/verifyRegionOfInterest")
        .expect("ROI point missing");
    assert!(matches!(roi.outcome, Outcome::Incomplete { .. }));
    assert_eq!(
        session.active_producer().expect("lock failed"),
        None,
        "{} left active",
        ProducerRef::new(producer.path())
    );
}

#[test]
#[serial]
fn test_vivid_format_restored_after_close() {
    let producer = producer_dir();
    let mut subsystem = V4l2Subsystem::new();
    let device = require_vivid!(&mut subsystem, producer.path());
    let other = device
        .supported_formats
        .iter()
        .find(|format| **format != device.default_format)
        .expect("vivid offers more than one format")
        .clone();

    let handle = subsystem
        .open_session(device.hardware_id, Some(&other))
        .expect("open failed");
    let frame = subsystem.read_snapshot(handle).expect("snapshot failed");
    assert_eq!(frame.format, other);
    subsystem.close_session(handle).expect("close failed");

    let handle = subsystem
        .open_session(device.hardware_id, Some(&other))
        .expect("open failed");
    subsystem.reset().expect("reset failed");

    let again = vivid_devices(&mut subsystem, producer.path())
        .into_iter()
        .find(|d| d.device_name == device.device_name)
        .expect("device vanished");
    assert_eq!(again.default_format, device.default_format);
    assert_eq!(again.spec_file_key, device.spec_file_key);
    assert_eq!(subsystem.open_session_count(), 0, "{handle} survived reset");
}
