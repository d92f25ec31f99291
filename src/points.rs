//! Conformance test points.
//!
//! Each point runs against exactly one [`TestConfiguration`] and reports
//! through [`PointResult`]: `AssumptionNotMet` when the configuration cannot
//! exercise the point, `AssertionFailure` or `Timeout` when the producer/device
//! pair misbehaves. Points take their own [`SessionGuard`]s and must close every
//! session they open; leaks are recorded on the [`PointContext`] and checked by
//! the orchestrator afterwards.

use std::cell::Cell;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{debug, trace};

use crate::config::TestConfiguration;
use crate::enumerator::{self, DeviceDescriptor};
use crate::error::{ConformanceError, PointError, PointResult};
use crate::property::{PropertyInfo, PropertyValue};
use crate::session::{SessionGuard, SubsystemSession};
use crate::spec_cache::{HardwareSpec, HardwareSpecCache, PropertyRecord};
use crate::traits::{AcquisitionSubsystem, ProducerRef, SessionHandle};
use crate::validation;

/// Frames requested by the streaming and disk-logging points.
const STREAM_FRAMES: u32 = 10;

/// Frames requested by the disk-logging point.
const LOGGED_FRAMES: u32 = 5;

/// Bounds on waits for streaming acquisitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    /// Give up waiting after this long.
    pub timeout: Duration,
    /// Delay between `is_running` polls.
    pub poll_interval: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Everything a test point may touch.
#[derive(Debug)]
pub struct PointContext<'a> {
    /// Shared subsystem.
    pub session: &'a SubsystemSession,
    /// Bound configuration.
    pub config: &'a TestConfiguration,
    /// Hardware spec cache.
    pub spec_cache: &'a HardwareSpecCache,
    /// Every producer taking part in the run.
    pub producers: &'a [ProducerRef],
    /// Streaming wait bounds.
    pub timing: StreamTiming,
    /// Directory for temporary artifacts; must be empty again afterwards.
    pub scratch_dir: &'a Path,
    leaked_sessions: Cell<usize>,
}

impl<'a> PointContext<'a> {
    /// Context for one point execution.
    pub const fn new(
        session: &'a SubsystemSession,
        config: &'a TestConfiguration,
        spec_cache: &'a HardwareSpecCache,
        producers: &'a [ProducerRef],
        timing: StreamTiming,
        scratch_dir: &'a Path,
    ) -> Self {
        Self {
            session,
            config,
            spec_cache,
            producers,
            timing,
            scratch_dir,
            leaked_sessions: Cell::new(0),
        }
    }

    /// Sessions the point left open when releasing its guards.
    pub fn leaked_sessions(&self) -> usize {
        self.leaked_sessions.get()
    }

    /// Activate the configuration's producer.
    fn acquire(&self) -> Result<SessionGuard<'a>, PointError> {
        Ok(self.session.acquire(&self.config.producer)?)
    }

    /// Release a guard, recording leaked sessions.
    fn release(&self, guard: SessionGuard<'_>) -> PointResult {
        let leaked = guard.release()?;
        self.leaked_sessions.set(self.leaked_sessions.get() + leaked);
        Ok(())
    }

    /// Run `check` against a freshly opened session on the bound device.
    ///
    /// The session is closed and the guard released whatever `check` returns.
    fn with_device<T, F>(&self, check: F) -> Result<T, PointError>
    where
        F: FnOnce(&mut dyn AcquisitionSubsystem, SessionHandle, &DeviceDescriptor) -> Result<T, PointError>,
    {
        let mut guard = self.acquire()?;
        let device = current_device(&mut *guard, &self.config.device)?;
        let handle = guard.open_session(device.hardware_id, self.config.format.as_deref())?;
        trace!(%handle, device = %device.device_name, "session opened");

        let outcome = check(&mut *guard, handle, &device);
        let closed = guard.close_session(handle);
        self.release(guard)?;
        let value = outcome?;
        closed?;
        Ok(value)
    }
}

/// Re-resolve `device` under the producer that is active now.
fn current_device(
    subsystem: &mut dyn AcquisitionSubsystem,
    device: &DeviceDescriptor,
) -> Result<DeviceDescriptor, PointError> {
    enumerator::resolve(subsystem, device)?.ok_or_else(|| {
        PointError::AssumptionNotMet(format!(
            "device {} is no longer visible through this producer",
            device.device_name
        ))
    })
}

/// Poll until acquisition stops or `timing.timeout` expires.
fn wait_for_acquisition(
    subsystem: &dyn AcquisitionSubsystem,
    handle: SessionHandle,
    timing: StreamTiming,
) -> PointResult {
    let deadline = Instant::now() + timing.timeout;
    while subsystem.is_running(handle)? {
        if Instant::now() >= deadline {
            return Err(PointError::Timeout {
                what: format!("acquisition on {handle} to complete"),
                after: timing.timeout,
            });
        }
        thread::sleep(timing.poll_interval);
    }
    Ok(())
}

fn ensure<F: FnOnce() -> String>(condition: bool, message: F) -> PointResult {
    if condition {
        Ok(())
    } else {
        Err(PointError::AssertionFailure(message()))
    }
}

// tVideoinput

/// A capture session can be created on the device and is gone after closing.
pub fn verify_videoinput_obj(ctx: &PointContext<'_>) -> PointResult {
    let mut guard = ctx.acquire()?;
    let result = current_device(&mut *guard, &ctx.config.device)
        .and_then(|device| open_and_close(&mut *guard, &device, ctx.config.format.as_deref()));
    ctx.release(guard)?;
    result
}

fn open_and_close(
    subsystem: &mut dyn AcquisitionSubsystem,
    device: &DeviceDescriptor,
    format: Option<&str>,
) -> PointResult {
    let before = subsystem.open_session_count();
    let handle = subsystem.open_session(device.hardware_id, format)?;
    let opened = subsystem.open_session_count();
    subsystem.close_session(handle)?;
    ensure(opened == before + 1, || {
        format!("expected {} open sessions after open, found {opened}", before + 1)
    })?;
    let closed = subsystem.open_session_count();
    ensure(closed == before, || {
        format!("expected {before} open sessions after close, found {closed}")
    })
}

/// The selected source exists and exposes uniquely named properties.
pub fn verify_selected_source(ctx: &PointContext<'_>) -> PointResult {
    ctx.with_device(|subsystem, handle, device| {
        let source = subsystem.selected_source(handle)?;
        ensure(!source.trim().is_empty(), || "selected source has no name".to_owned())?;

        let properties = subsystem.source_properties(handle)?;
        ensure(!properties.is_empty(), || {
            format!("source {source} exposes no properties")
        })?;

        let mut seen = HashSet::new();
        for property in &properties {
            if !seen.insert(property.name.as_str()) {
                return Err(PointError::AssertionFailure(format!(
                    "source {source} lists property {} twice",
                    property.name
                )));
            }
        }

        if let Some(expected) = &device.device_user_id {
            let reported = properties
                .iter()
                .find(|property| property.name == "DeviceUserID")
                .map(|property| property.default_value.clone());
            if let Some(PropertyValue::Text(reported)) = reported {
                ensure(&reported == expected, || {
                    format!("DeviceUserID reads {reported:?}, enumeration reported {expected:?}")
                })?;
            }
        }
        Ok(())
    })
}

// tAcquisition

/// A single snapshot matches the current ROI.
pub fn verify_snapshot(ctx: &PointContext<'_>) -> PointResult {
    ctx.with_device(|subsystem, handle, _| {
        let roi = subsystem.region_of_interest(handle)?;
        let frame = subsystem.read_snapshot(handle)?;
        validation::validate_frame_dimensions(&frame, &roi)
    })
}

/// Streaming delivers exactly the requested number of frames, in sequence.
pub fn verify_streaming(ctx: &PointContext<'_>) -> PointResult {
    ctx.with_device(|subsystem, handle, _| {
        subsystem.start_capture(handle, STREAM_FRAMES)?;
        let waited = wait_for_acquisition(subsystem, handle, ctx.timing);
        subsystem.stop_capture(handle)?;
        waited?;

        let acquired = subsystem.frames_acquired(handle)?;
        ensure(acquired == STREAM_FRAMES, || {
            format!("acquired {acquired} frames, requested {STREAM_FRAMES}")
        })?;

        let frames = subsystem.acquired_frames(handle)?;
        ensure(frames.len() == STREAM_FRAMES as usize, || {
            format!("retained {} frames, requested {STREAM_FRAMES}", frames.len())
        })?;
        validation::validate_frame_sequence(&frames)
    })
}

/// Frames logged to disk during an acquisition produce a non-empty file.
pub fn verify_disk_logging(ctx: &PointContext<'_>) -> PointResult {
    let scratch = TempDir::new_in(ctx.scratch_dir).map_err(ConformanceError::from)?;
    let log_path = scratch.path().join("acquisition.bin");

    ctx.with_device(|subsystem, handle, _| {
        subsystem.attach_disk_logger(handle, &log_path)?;
        subsystem.start_capture(handle, LOGGED_FRAMES)?;
        let waited = wait_for_acquisition(subsystem, handle, ctx.timing);
        subsystem.stop_capture(handle)?;
        waited?;

        let size = fs::metadata(&log_path).map(|meta| meta.len()).map_err(|err| {
            PointError::AssertionFailure(format!(
                "disk log {} was not written: {err}",
                log_path.display()
            ))
        })?;
        ensure(size > 0, || format!("disk log {} is empty", log_path.display()))
    })
}

/// A centered half-size ROI can be applied, read back, and is honoured by snapshots.
pub fn verify_region_of_interest(ctx: &PointContext<'_>) -> PointResult {
    ctx.with_device(|subsystem, handle, _| {
        let full = subsystem.region_of_interest(handle)?;
        let target = full.centered_half();
        if target.width == 0 || target.height == 0 {
            return Err(PointError::AssumptionNotMet(format!(
                "sensor {}x{} is too small for an ROI check",
                full.width, full.height
            )));
        }

        let applied = subsystem.set_region_of_interest(handle, target)?;
        let readback = subsystem.region_of_interest(handle)?;
        ensure(readback == applied, || {
            format!("ROI reads back as {readback:?}, applied {applied:?}")
        })?;

        let frame = subsystem.read_snapshot(handle)?;
        validation::validate_frame_dimensions(&frame, &applied)?;
        subsystem.set_region_of_interest(handle, full)?;
        Ok(())
    })
}

// tProperties

struct LiveProperties {
    spec: HardwareSpec,
    session: Vec<PropertyInfo>,
    source: Vec<PropertyInfo>,
}

fn live_properties(ctx: &PointContext<'_>) -> Result<LiveProperties, PointError> {
    let mut guard = ctx.acquire()?;
    let spec = current_device(&mut *guard, &ctx.config.device).and_then(|device| {
        ctx.spec_cache
            .get_or_create(&device, &mut *guard)
            .map_err(PointError::from)
    });
    ctx.release(guard)?;
    let spec = spec?;

    ctx.with_device(|subsystem, handle, _| {
        Ok(LiveProperties {
            spec,
            session: subsystem.session_properties(handle)?,
            source: subsystem.source_properties(handle)?,
        })
    })
}

fn compare_names(level: &str, cached: &[PropertyRecord], live: &[PropertyInfo]) -> PointResult {
    let missing: Vec<&str> = cached
        .iter()
        .filter(|record| !live.iter().any(|info| info.name == record.name))
        .map(|record| record.name.as_str())
        .collect();
    let extra: Vec<&str> = live
        .iter()
        .filter(|info| !cached.iter().any(|record| record.name == info.name))
        .map(|info| info.name.as_str())
        .collect();
    ensure(missing.is_empty() && extra.is_empty(), || {
        format!(
            "{level} properties differ from hardware spec: missing [{}], unexpected [{}]",
            missing.join(", "),
            extra.join(", ")
        )
    })
}

/// Live property names match the cached hardware spec on both levels.
pub fn verify_property_names(ctx: &PointContext<'_>) -> PointResult {
    let live = live_properties(ctx)?;
    compare_names("session", live.spec.session_properties(), &live.session)?;
    compare_names("source", live.spec.source_properties(), &live.source)
}

/// Defaults of properties that do not depend on live sensor state match the spec.
pub fn verify_property_defaults(ctx: &PointContext<'_>) -> PointResult {
    let live = live_properties(ctx)?;
    let comparable: Vec<&PropertyRecord> = live
        .spec
        .properties
        .iter()
        .filter(|record| !record.runtime_defined)
        .collect();
    if comparable.is_empty() {
        return Err(PointError::AssumptionNotMet(
            "every property of this device is runtime defined".to_owned(),
        ));
    }

    for record in comparable {
        let Some(info) = live.session.iter().find(|info| info.name == record.name) else {
            continue;
        };
        let actual = info.default_value.clone().classify();
        ensure(actual.same_as(&record.default_value), || {
            format!(
                "{} defaults to {actual}, hardware spec records {}",
                record.name, record.default_value
            )
        })?;
    }
    Ok(())
}

/// Read-only flags match the cached hardware spec.
pub fn verify_read_only_properties(ctx: &PointContext<'_>) -> PointResult {
    let live = live_properties(ctx)?;
    let levels = [
        (live.spec.session_properties(), &live.session),
        (live.spec.source_properties(), &live.source),
    ];
    for (cached, actual) in levels {
        for record in cached {
            let Some(info) = actual.iter().find(|info| info.name == record.name) else {
                continue;
            };
            ensure(info.read_only == record.read_only, || {
                format!(
                    "{} is {}read-only, hardware spec says {}read-only",
                    record.name,
                    if info.read_only { "" } else { "not " },
                    if record.read_only { "" } else { "not " },
                )
            })?;
        }
    }
    Ok(())
}

// tFormats

fn bound_format(ctx: &PointContext<'_>) -> Result<String, PointError> {
    ctx.config
        .format
        .clone()
        .ok_or_else(|| PointError::AssumptionNotMet("no pixel format bound".to_owned()))
}

/// A snapshot taken with the bound format reports that format and the ROI size.
pub fn verify_format_snapshot(ctx: &PointContext<'_>) -> PointResult {
    let format = bound_format(ctx)?;
    ctx.with_device(|subsystem, handle, _| {
        let roi = subsystem.region_of_interest(handle)?;
        let frame = subsystem.read_snapshot(handle)?;
        ensure(frame.format == format, || {
            format!("snapshot delivered {}, requested {format}", frame.format)
        })?;
        validation::validate_frame_dimensions(&frame, &roi)
    })
}

/// The resolution reported for the bound format matches delivered frames.
pub fn verify_format_resolution(ctx: &PointContext<'_>) -> PointResult {
    let format = bound_format(ctx)?;
    ctx.with_device(|subsystem, handle, _| {
        let roi = subsystem.region_of_interest(handle)?;
        let reported = subsystem
            .session_properties(handle)?
            .into_iter()
            .find(|info| info.name == "VideoResolution")
            .map(|info| info.default_value.classify());

        if let Some(PropertyValue::NumericArray(values)) = &reported {
            let expected = [f64::from(roi.width), f64::from(roi.height)];
            ensure(values.as_slice() == expected, || {
                format!(
                    "{format}: VideoResolution is {values:?}, ROI is {}x{}",
                    roi.width, roi.height
                )
            })?;
        } else {
            debug!(%format, "VideoResolution not exposed, checking frames only");
        }

        let frame = subsystem.read_snapshot(handle)?;
        validation::validate_frame_dimensions(&frame, &roi)
    })
}

// tDevices

fn enumerate_under(
    ctx: &PointContext<'_>,
    producer: &ProducerRef,
) -> Result<Vec<DeviceDescriptor>, PointError> {
    let mut guard = ctx.session.acquire(producer)?;
    let devices = enumerator::enumerate(&mut *guard);
    ctx.release(guard)?;
    match devices {
        Err(ConformanceError::NoDevicesFound(_)) => Ok(Vec::new()),
        devices => Ok(devices?),
    }
}

/// Hardware IDs under the bound producer are 1, 2, 3, ...
pub fn verify_device_id_sequence(ctx: &PointContext<'_>) -> PointResult {
    let devices = enumerate_under(ctx, &ctx.config.producer)?;
    validation::validate_id_sequence(&devices)
}

/// Every device seen under the bound producer is seen under every other producer and vice versa.
pub fn verify_all_devices(ctx: &PointContext<'_>) -> PointResult {
    let reference = enumerate_under(ctx, &ctx.config.producer)?;
    let expected: Vec<&str> = reference.iter().map(DeviceDescriptor::identity).collect();

    let others: Vec<&ProducerRef> = ctx
        .producers
        .iter()
        .filter(|producer| **producer != ctx.config.producer)
        .collect();
    if others.is_empty() {
        return Err(PointError::AssumptionNotMet(
            "only one producer available".to_owned(),
        ));
    }

    for producer in others {
        let devices = enumerate_under(ctx, producer)?;
        let actual: Vec<&str> = devices.iter().map(DeviceDescriptor::identity).collect();
        validation::validate_identities_present(
            &expected,
            &actual,
            &format!("under {producer}"),
        )?;
        validation::validate_identities_present(
            &actual,
            &expected,
            &format!("under {}", ctx.config.producer),
        )?;
    }
    Ok(())
}
