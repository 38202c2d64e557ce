//! Emulated camera for running without hardware.
//!
//! Behaves like a small industrial area-scan camera: a 1282x1026 monochrome
//! sensor, gain in dB, exposure in microseconds and a region of interest whose
//! bounds depend on the current offsets. Frames are synthesised on demand, so
//! every retrieve returns the newest image and `LatestImageOnly` needs no
//! extra buffering.

use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceInfo, Frame, FrameMetadata, GrabStrategy,
    Parameter, ParameterRange, Result, Roi,
};

/// Full sensor width of the emulated camera.
pub const SENSOR_WIDTH: u32 = 1282;
/// Full sensor height of the emulated camera.
pub const SENSOR_HEIGHT: u32 = 1026;

const GAIN_RANGE: ParameterRange = ParameterRange::new(0.0, 18.0);
const EXPOSURE_RANGE: ParameterRange = ParameterRange::new(20.0, 999_000.0);

/// Test pattern types for emulated frame generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPattern {
    /// Horizontal grey ramp that shifts a few pixels every frame.
    Ramp,
    /// Every pixel has the same intensity.
    Solid(u8),
}

/// In-process camera with the same lifecycle rules as real hardware.
pub struct EmulatedCamera {
    info: DeviceInfo,
    sensor_width: u32,
    sensor_height: u32,
    pattern: TestPattern,
    frame_limit: Option<u64>,
    unsupported: Vec<Parameter>,
    claimed: bool,
    open: bool,
    gain: f64,
    exposure_us: f64,
    roi: Roi,
    frame_count: u64,
    open_count: u32,
    close_count: u32,
}

impl Default for EmulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedCamera {
    /// Create an emulated camera with the full sensor selected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            info: DeviceInfo {
                driver: "emulated".to_owned(),
                model: "Emulated Mono Camera".to_owned(),
                location: "emu:0".to_owned(),
            },
            sensor_width: SENSOR_WIDTH,
            sensor_height: SENSOR_HEIGHT,
            pattern: TestPattern::Ramp,
            frame_limit: None,
            unsupported: Vec::new(),
            claimed: false,
            open: false,
            gain: 0.0,
            exposure_us: 10_000.0,
            roi: Roi {
                x: 0,
                y: 0,
                width: SENSOR_WIDTH,
                height: SENSOR_HEIGHT,
            },
            frame_count: 0,
            open_count: 0,
            close_count: 0,
        }
    }

    /// Use a smaller or larger sensor. The ROI is reset to the full sensor.
    #[must_use]
    pub const fn with_sensor(mut self, width: u32, height: u32) -> Self {
        self.sensor_width = width;
        self.sensor_height = height;
        self.roi = Roi {
            x: 0,
            y: 0,
            width,
            height,
        };
        self
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Never deliver frames; every retrieve runs into its timeout.
    #[must_use]
    pub const fn non_responding(self) -> Self {
        self.responding_for(0)
    }

    /// Deliver `frames` frames in total, then stop answering like a camera
    /// whose link went down.
    #[must_use]
    pub const fn responding_for(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    /// Drop the control behind `parameter`, as on sensors without it.
    #[must_use]
    pub fn without(mut self, parameter: Parameter) -> Self {
        self.unsupported.push(parameter);
        self
    }

    /// Pretend another process holds the device, so `open` fails.
    #[must_use]
    pub const fn claimed(mut self) -> Self {
        self.claimed = true;
        self
    }

    /// Number of successful opens.
    pub const fn open_count(&self) -> u32 {
        self.open_count
    }

    /// Number of closes that released an open handle.
    pub const fn close_count(&self) -> u32 {
        self.close_count
    }

    /// Frames delivered since creation.
    pub const fn frames_delivered(&self) -> u64 {
        self.frame_count
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(CameraError::Device("camera is not open".to_owned()))
        }
    }

    fn ensure_supported(&self, parameter: Parameter) -> Result<()> {
        self.ensure_open()?;
        if self.unsupported.contains(&parameter) {
            return Err(CameraError::Unsupported(parameter));
        }
        Ok(())
    }

    fn responding(&self) -> bool {
        self.frame_limit.is_none_or(|limit| self.frame_count < limit)
    }

    #[allow(clippy::cast_precision_loss)]
    fn render(&self, sequence: u64) -> Vec<u8> {
        let roi = self.roi;
        let multiplier = 10f64.powf(self.gain / 20.0);
        let mut data = Vec::with_capacity(roi.width as usize * roi.height as usize);

        for _row in roi.y..roi.y + roi.height {
            for col in roi.x..roi.x + roi.width {
                let base = match self.pattern {
                    TestPattern::Ramp => {
                        let shifted = (u64::from(col) + sequence * 4) % u64::from(self.sensor_width);
                        shifted as f64 * 255.0 / f64::from(self.sensor_width)
                    }
                    TestPattern::Solid(value) => f64::from(value),
                };
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                data.push((base * multiplier).min(255.0) as u8);
            }
        }

        data
    }
}

impl CameraDevice for EmulatedCamera {
    type Stream<'a> = EmulatedStream<'a>;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open(&mut self) -> Result<()> {
        if self.claimed {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} is claimed by another process",
                self.info.location
            )));
        }
        if self.open {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} is already open",
                self.info.location
            )));
        }
        self.open = true;
        self.open_count += 1;
        debug!(location = %self.info.location, "emulated camera opened");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.close_count += 1;
            debug!(location = %self.info.location, "emulated camera closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn range(&self, parameter: Parameter) -> Result<ParameterRange> {
        self.ensure_supported(parameter)?;
        let roi = self.roi;
        let range = match parameter {
            Parameter::Gain => GAIN_RANGE,
            Parameter::ExposureTime => EXPOSURE_RANGE,
            Parameter::Width => {
                ParameterRange::stepped(1.0, f64::from(self.sensor_width - roi.x), 1.0)
            }
            Parameter::Height => {
                ParameterRange::stepped(1.0, f64::from(self.sensor_height - roi.y), 1.0)
            }
            Parameter::OffsetX => {
                ParameterRange::stepped(0.0, f64::from(self.sensor_width - roi.width), 1.0)
            }
            Parameter::OffsetY => {
                ParameterRange::stepped(0.0, f64::from(self.sensor_height - roi.height), 1.0)
            }
        };
        Ok(range)
    }

    fn parameter(&self, parameter: Parameter) -> Result<f64> {
        self.ensure_supported(parameter)?;
        Ok(match parameter {
            Parameter::Gain => self.gain,
            Parameter::ExposureTime => self.exposure_us,
            Parameter::Width => f64::from(self.roi.width),
            Parameter::Height => f64::from(self.roi.height),
            Parameter::OffsetX => f64::from(self.roi.x),
            Parameter::OffsetY => f64::from(self.roi.y),
        })
    }

    fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()> {
        let range = self.range(parameter)?;
        if !range.contains(value) {
            return Err(range.rejection(parameter, value));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = value as u32;
        match parameter {
            Parameter::Gain => self.gain = value,
            Parameter::ExposureTime => self.exposure_us = value,
            Parameter::Width => self.roi.width = whole,
            Parameter::Height => self.roi.height = whole,
            Parameter::OffsetX => self.roi.x = whole,
            Parameter::OffsetY => self.roi.y = whole,
        }
        Ok(())
    }

    fn start_grabbing(&mut self, strategy: GrabStrategy) -> Result<Self::Stream<'_>> {
        self.ensure_open()?;
        debug!(?strategy, "emulated camera grabbing");
        Ok(EmulatedStream {
            device: self,
            strategy,
            delivered: 0,
            started: Instant::now(),
        })
    }
}

/// Active acquisition on an [`EmulatedCamera`].
pub struct EmulatedStream<'a> {
    device: &'a mut EmulatedCamera,
    strategy: GrabStrategy,
    delivered: u32,
    started: Instant,
}

impl CaptureStream for EmulatedStream<'_> {
    fn retrieve(&mut self, timeout: Duration) -> Result<Frame> {
        if let GrabStrategy::Count(limit) = self.strategy {
            if self.delivered >= limit {
                return Err(CameraError::Device(format!(
                    "all {limit} requested frames were already retrieved"
                )));
            }
        }

        let exposure = Duration::from_secs_f64(self.device.exposure_us / 1_000_000.0);
        if !self.device.responding() || exposure > timeout {
            thread::sleep(timeout);
            return Err(CameraError::AcquisitionTimeout(timeout));
        }
        thread::sleep(exposure);

        let sequence = self.device.frame_count;
        let data = self.device.render(sequence);
        self.device.frame_count += 1;
        self.delivered += 1;

        Ok(Frame {
            width: self.device.roi.width,
            height: self.device.roi.height,
            data,
            metadata: FrameMetadata {
                sequence,
                timestamp: self.started.elapsed(),
            },
        })
    }
}

impl Drop for EmulatedStream<'_> {
    fn drop(&mut self) {
        debug!(delivered = self.delivered, "emulated camera stopped grabbing");
    }
}
