//! Applying capture parameters to an open camera.
//!
//! Valid ranges always come from the device. Region-of-interest fields are
//! written in an order that keeps `offset + size` inside the sensor at every
//! step, and a failed apply restores whatever had already been written.

use tracing::{debug, warn};

use crate::traits::{CameraDevice, CameraError, Parameter, Result};

/// Acquisition settings for one capture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureParameters {
    /// Gain in dB (emulated camera: 0.0 - 18.0).
    pub gain: f64,
    /// Exposure time in microseconds (emulated camera: 20.0 - 999000.0).
    pub exposure_us: f64,
    /// ROI width (emulated camera: 1 - 1282).
    pub width: u32,
    /// ROI height (emulated camera: 1 - 1026).
    pub height: u32,
    /// ROI horizontal offset.
    pub offset_x: u32,
    /// ROI vertical offset.
    pub offset_y: u32,
}

impl CaptureParameters {
    /// Value of `parameter` in device units.
    #[must_use]
    pub fn get(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::Gain => self.gain,
            Parameter::ExposureTime => self.exposure_us,
            Parameter::Width => f64::from(self.width),
            Parameter::Height => f64::from(self.height),
            Parameter::OffsetX => f64::from(self.offset_x),
            Parameter::OffsetY => f64::from(self.offset_y),
        }
    }

    fn offsets(&self) -> (f64, f64) {
        (f64::from(self.offset_x), f64::from(self.offset_y))
    }

    /// Read the current settings back from an open camera.
    pub fn read_back<C: CameraDevice>(camera: &C) -> Result<Self> {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = |value: f64| value as u32;
        Ok(Self {
            gain: camera.parameter(Parameter::Gain)?,
            exposure_us: camera.parameter(Parameter::ExposureTime)?,
            width: whole(camera.parameter(Parameter::Width)?),
            height: whole(camera.parameter(Parameter::Height)?),
            offset_x: whole(camera.parameter(Parameter::OffsetX)?),
            offset_y: whole(camera.parameter(Parameter::OffsetY)?),
        })
    }
}

/// Write `parameters` to an open camera.
///
/// Fails with `ParameterOutOfRange` when a value is outside the range the
/// device reports at the moment it is written. On failure, parameters written
/// by this call are restored so the device is left as it was. Parameters the
/// camera has no control for are skipped with a warning.
pub fn apply<C: CameraDevice>(camera: &mut C, parameters: &CaptureParameters) -> Result<()> {
    let previous = Snapshot::take(camera)?;
    let mut written = Vec::with_capacity(Parameter::ALL.len());

    for parameter in write_order(previous.offsets(), parameters.offsets()) {
        let value = parameters.get(parameter);
        let Some(current) = previous.get(parameter) else {
            warn!(%parameter, value, "not supported by this camera, ignored");
            continue;
        };
        if (current - value).abs() < f64::EPSILON {
            continue;
        }

        if let Err(err) = camera.set_parameter(parameter, value) {
            warn!(%parameter, value, %err, "parameter rejected, restoring previous values");
            restore(camera, &previous, &written);
            return Err(err);
        }
        debug!(%parameter, value, "parameter set");
        written.push(parameter);
    }

    Ok(())
}

/// Values of every parameter the camera supports.
struct Snapshot(Vec<(Parameter, f64)>);

impl Snapshot {
    fn take<C: CameraDevice>(camera: &C) -> Result<Self> {
        let mut values = Vec::with_capacity(Parameter::ALL.len());
        for parameter in Parameter::ALL {
            match camera.parameter(parameter) {
                Ok(value) => values.push((parameter, value)),
                Err(CameraError::Unsupported(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(Self(values))
    }

    fn get(&self, parameter: Parameter) -> Option<f64> {
        self.0
            .iter()
            .find(|(candidate, _)| *candidate == parameter)
            .map(|&(_, value)| value)
    }

    fn offsets(&self) -> (f64, f64) {
        (
            self.get(Parameter::OffsetX).unwrap_or_default(),
            self.get(Parameter::OffsetY).unwrap_or_default(),
        )
    }
}

/// Order in which parameters can be written to move the ROI offsets from
/// `current` to `target` (both `(x, y)`).
fn write_order(current: (f64, f64), target: (f64, f64)) -> Vec<Parameter> {
    let mut order = vec![Parameter::Gain, Parameter::ExposureTime];
    order.extend(axis_order(
        current.0,
        target.0,
        Parameter::OffsetX,
        Parameter::Width,
    ));
    order.extend(axis_order(
        current.1,
        target.1,
        Parameter::OffsetY,
        Parameter::Height,
    ));
    order
}

/// Moving the offset towards the origin first never pushes the old size past
/// the sensor edge; moving it away is safe only after the size has shrunk.
fn axis_order(
    current_offset: f64,
    target_offset: f64,
    offset: Parameter,
    size: Parameter,
) -> [Parameter; 2] {
    if target_offset <= current_offset {
        [offset, size]
    } else {
        [size, offset]
    }
}

fn restore<C: CameraDevice>(camera: &mut C, previous: &Snapshot, written: &[Parameter]) {
    let Ok(current) = Snapshot::take(camera) else {
        warn!("could not read parameters back for restore");
        return;
    };

    for parameter in write_order(current.offsets(), previous.offsets()) {
        if !written.contains(&parameter) {
            continue;
        }
        let Some(value) = previous.get(parameter) else {
            continue;
        };
        if let Err(err) = camera.set_parameter(parameter, value) {
            warn!(%parameter, %err, "failed to restore parameter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::EmulatedCamera;

    fn opened() -> EmulatedCamera {
        let mut camera = EmulatedCamera::new();
        camera.open().expect("open should succeed");
        camera
    }

    fn params(width: u32, height: u32, offset_x: u32, offset_y: u32) -> CaptureParameters {
        CaptureParameters {
            gain: 5.0,
            exposure_us: 10_000.0,
            width,
            height,
            offset_x,
            offset_y,
        }
    }

    #[test]
    fn test_apply_round_trip() {
        let mut camera = opened();
        let wanted = params(200, 50, 30, 30);
        apply(&mut camera, &wanted).expect("apply should succeed");
        let actual = CaptureParameters::read_back(&camera).expect("read back");
        assert_eq!(actual, wanted);
    }

    #[test]
    fn test_apply_moves_roi_both_ways() {
        let mut camera = opened();
        apply(&mut camera, &params(100, 100, 1100, 900)).expect("shrink and move away");
        apply(&mut camera, &params(1282, 1026, 0, 0)).expect("grow back to full sensor");
        let actual = CaptureParameters::read_back(&camera).expect("read back");
        assert_eq!(actual, params(1282, 1026, 0, 0));
    }

    #[test]
    fn test_out_of_range_leaves_device_unchanged() {
        let mut camera = opened();
        let before = params(640, 480, 10, 20);
        apply(&mut camera, &before).expect("apply should succeed");

        let mut bad = params(320, 240, 0, 0);
        bad.gain = 2.0;
        bad.offset_y = 900;
        let result = apply(&mut camera, &bad);
        assert!(matches!(
            result,
            Err(CameraError::ParameterOutOfRange {
                parameter: "OffsetY",
                ..
            })
        ));

        let after = CaptureParameters::read_back(&camera).expect("read back");
        assert_eq!(after, before);
    }

    #[test]
    fn test_gain_out_of_range() {
        let mut camera = opened();
        let mut bad = params(640, 480, 0, 0);
        bad.gain = 18.5;
        let result = apply(&mut camera, &bad);
        assert!(matches!(
            result,
            Err(CameraError::ParameterOutOfRange { parameter: "Gain", .. })
        ));
    }

    #[test]
    fn test_exposure_out_of_range() {
        let mut camera = opened();
        let mut bad = params(640, 480, 0, 0);
        bad.exposure_us = 10.0;
        assert!(apply(&mut camera, &bad).is_err());
        let after = CaptureParameters::read_back(&camera).expect("read back");
        assert!((after.exposure_us - 10_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_apply_requires_open_camera() {
        let mut camera = EmulatedCamera::new();
        assert!(apply(&mut camera, &params(10, 10, 0, 0)).is_err());
    }

    #[test]
    fn test_axis_order() {
        assert_eq!(
            axis_order(100.0, 0.0, Parameter::OffsetX, Parameter::Width),
            [Parameter::OffsetX, Parameter::Width]
        );
        assert_eq!(
            axis_order(0.0, 100.0, Parameter::OffsetX, Parameter::Width),
            [Parameter::Width, Parameter::OffsetX]
        );
    }

    #[test]
    fn test_missing_exposure_control_is_skipped() {
        let mut camera = EmulatedCamera::new().without(Parameter::ExposureTime);
        camera.open().expect("open should succeed");
        apply(&mut camera, &params(200, 50, 30, 30)).expect("apply should succeed");

        assert!((camera.parameter(Parameter::Gain).expect("gain") - 5.0).abs() < f64::EPSILON);
        assert!((camera.parameter(Parameter::Width).expect("width") - 200.0).abs() < f64::EPSILON);
        assert!(matches!(
            CaptureParameters::read_back(&camera),
            Err(CameraError::Unsupported(Parameter::ExposureTime))
        ));
    }
}
