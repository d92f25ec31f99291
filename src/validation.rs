//! Verification helpers shared by the conformance test points.
//!
//! Every helper returns `PointError::AssertionFailure` describing the first
//! mismatch found.

use crate::enumerator::DeviceDescriptor;
use crate::error::{PointError, PointResult};
use crate::traits::{Frame, Roi};

/// Validates that a frame has the ROI's dimensions and a plausible payload size.
///
/// # Errors
///
/// Returns `AssertionFailure` if:
/// - The frame width or height differs from the ROI
/// - The payload is empty
/// - The payload is not a whole multiple of the pixel count
pub fn validate_frame_dimensions(frame: &Frame, roi: &Roi) -> PointResult {
    if frame.width != roi.width || frame.height != roi.height {
        return Err(PointError::AssertionFailure(format!(
            "frame is {}x{}, expected {}x{}",
            frame.width, frame.height, roi.width, roi.height
        )));
    }

    let pixels = u64::from(frame.width) * u64::from(frame.height);
    let bytes = frame.data.len() as u64;
    if bytes == 0 || pixels == 0 {
        return Err(PointError::AssertionFailure(
            "frame payload is empty".to_owned(),
        ));
    }
    if bytes % pixels != 0 {
        return Err(PointError::AssertionFailure(format!(
            "payload of {bytes} bytes is not a whole number of {pixels} pixels"
        )));
    }
    Ok(())
}

/// Validates that a sequence of frames has incrementing sequence numbers.
///
/// # Errors
///
/// Returns `AssertionFailure` if:
/// - The frames slice is empty
/// - Any sequence number doesn't increment by exactly 1 from the previous
pub fn validate_frame_sequence(frames: &[Frame]) -> PointResult {
    if frames.is_empty() {
        return Err(PointError::AssertionFailure(
            "cannot validate empty frame sequence".to_owned(),
        ));
    }

    for (idx, pair) in frames.windows(2).enumerate() {
        let [prev, curr] = pair else { continue };
        let expected = prev.metadata.sequence.wrapping_add(1);
        if curr.metadata.sequence != expected {
            return Err(PointError::AssertionFailure(format!(
                "frame sequence gap at index {}: expected {expected}, got {}",
                idx + 1,
                curr.metadata.sequence
            )));
        }
    }
    Ok(())
}

/// Validates that hardware IDs form a contiguous ascending run starting at 1.
///
/// # Errors
///
/// Returns `AssertionFailure` naming the first out-of-place ID.
pub fn validate_id_sequence(devices: &[DeviceDescriptor]) -> PointResult {
    for (device, expected) in devices.iter().zip(1u32..) {
        if device.hardware_id != expected {
            return Err(PointError::AssertionFailure(format!(
                "device {} has hardware ID {}, expected {expected}",
                device.device_name, device.hardware_id
            )));
        }
    }
    Ok(())
}

/// Validates that every identity in `expected` appears in `actual`.
///
/// # Errors
///
/// Returns `AssertionFailure` listing the missing identities.
pub fn validate_identities_present(expected: &[&str], actual: &[&str], context: &str) -> PointResult {
    let missing: Vec<&str> = expected
        .iter()
        .copied()
        .filter(|identity| !actual.contains(identity))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PointError::AssertionFailure(format!(
            "{context}: missing {}",
            missing.join(", ")
        )))
    }
}
