//! Checks that captured frames carry a known test pattern.
//!
//! Used by tests against the emulated camera and the vivid virtual camera to
//! tell a working acquisition path from one that returns garbage.

use crate::traits::{CameraError, Frame, Result};

/// Minimum brightness change across a gradient frame.
const MIN_GRADIENT_SPAN: u8 = 50;

/// Check for a left-to-right brightening ramp.
///
/// Samples the middle row every 10 pixels and checks that brightness never
/// drops (small rounding dips are allowed) and that it spans a meaningful
/// range overall.
///
/// # Errors
///
/// Returns `Device` if:
/// - The frame is smaller than its declared dimensions
/// - Brightness decreases along the row
/// - The total brightness change is too small (solid color)
pub fn validate_gradient(frame: &Frame) -> Result<()> {
    let center_y = frame.height / 2;
    let mut first: Option<u8> = None;
    let mut prev: Option<u8> = None;

    for x in (0..frame.width).step_by(10) {
        let value = frame.pixel(x, center_y).ok_or_else(|| {
            CameraError::Device(format!("Failed to get pixel at ({x}, {center_y})"))
        })?;

        if let Some(prev) = prev {
            if value.saturating_add(1) < prev {
                return Err(CameraError::Device(format!(
                    "Gradient not monotonically increasing at x={x}: {value} < previous {prev}"
                )));
            }
        }
        first.get_or_insert(value);
        prev = Some(value);
    }

    if let (Some(first), Some(last)) = (first, prev) {
        let span = last.saturating_sub(first);
        if span < MIN_GRADIENT_SPAN {
            return Err(CameraError::Device(format!(
                "Insufficient brightness change for gradient: {span} \
                 (expected at least {MIN_GRADIENT_SPAN})"
            )));
        }
    }

    Ok(())
}

/// Validates that every pixel equals `expected`.
///
/// # Errors
///
/// Returns `Device` on the first pixel that differs or if the buffer length
/// does not match the frame dimensions.
pub fn validate_uniform(frame: &Frame, expected: u8) -> Result<()> {
    let len = frame.width as usize * frame.height as usize;
    if frame.data.len() != len {
        return Err(CameraError::Device(format!(
            "Frame buffer has {} bytes, expected {len}",
            frame.data.len()
        )));
    }
    if let Some(index) = frame.data.iter().position(|&v| v != expected) {
        return Err(CameraError::Device(format!(
            "Pixel {index} differs from expected value {expected}"
        )));
    }
    Ok(())
}

/// Check that consecutive frames have consecutive sequence numbers.
///
/// # Errors
///
/// Returns `Device` for an empty slice or at the first gap.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    let Some(first) = frames.first() else {
        return Err(CameraError::Device("no frames to check".to_owned()));
    };

    let start = first.metadata.sequence;
    for (offset, frame) in (0u64..).zip(frames) {
        let expected = start + offset;
        if frame.metadata.sequence != expected {
            return Err(CameraError::Device(format!(
                "frame {offset} has sequence {}, expected {expected}",
                frame.metadata.sequence
            )));
        }
    }

    Ok(())
}
