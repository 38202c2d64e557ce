//! Core traits and types for the camera abstraction.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A tunable acquisition parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// Analog gain in dB.
    Gain,
    /// Exposure time in microseconds.
    ExposureTime,
    /// Region of interest width in pixels.
    Width,
    /// Region of interest height in pixels.
    Height,
    /// Horizontal offset of the region of interest.
    OffsetX,
    /// Vertical offset of the region of interest.
    OffsetY,
}

impl Parameter {
    /// Every parameter, in display order.
    pub const ALL: [Self; 6] = [
        Self::Gain,
        Self::ExposureTime,
        Self::Width,
        Self::Height,
        Self::OffsetX,
        Self::OffsetY,
    ];

    /// Stable feature name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Gain => "Gain",
            Self::ExposureTime => "ExposureTime",
            Self::Width => "Width",
            Self::Height => "Height",
            Self::OffsetX => "OffsetX",
            Self::OffsetY => "OffsetY",
        }
    }

    /// Whether the device only accepts whole numbers for this parameter.
    #[must_use]
    pub const fn is_integer(self) -> bool {
        !matches!(self, Self::Gain | Self::ExposureTime)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// Valid range of a parameter as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterRange {
    /// Smallest accepted value.
    pub min: f64,
    /// Largest accepted value.
    pub max: f64,
    /// Required step between `min` and any accepted value, if any.
    pub increment: Option<f64>,
}

impl ParameterRange {
    /// Continuous range without an increment constraint.
    #[must_use]
    pub const fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            increment: None,
        }
    }

    /// Range whose values must be `min + k * increment`.
    #[must_use]
    pub const fn stepped(min: f64, max: f64, increment: f64) -> Self {
        Self {
            min,
            max,
            increment: Some(increment),
        }
    }

    /// Whether `value` is accepted by this range.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        if !value.is_finite() || value < self.min || value > self.max {
            return false;
        }
        match self.increment {
            Some(step) if step > 0.0 => {
                let steps = (value - self.min) / step;
                (steps - steps.round()).abs() < 1e-9
            }
            _ => true,
        }
    }

    /// Build the out-of-range error for `value`.
    #[must_use]
    pub const fn rejection(&self, parameter: Parameter, value: f64) -> CameraError {
        CameraError::ParameterOutOfRange {
            parameter: parameter.name(),
            value,
            min: self.min,
            max: self.max,
        }
    }
}

/// Identification of an attached camera.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    /// Driver or transport name.
    pub driver: String,
    /// Model name.
    pub model: String,
    /// Device node or bus location.
    pub location: String,
}

/// Buffering policy used while grabbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabStrategy {
    /// Deliver exactly this many frames, then stop.
    Count(u32),
    /// Keep only the newest frame; unconsumed older frames are dropped.
    LatestImageOnly,
}

/// Rectangular sub-window of the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Metadata for a captured frame.
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    /// Frame sequence number since grabbing started.
    pub sequence: u64,
    /// Capture timestamp.
    pub timestamp: Duration,
}

/// A captured 8-bit monochrome frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row-major `Mono8` pixel data, `width * height` bytes.
    pub data: Vec<u8>,
    /// Frame metadata.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Intensity at `(x, y)`, or `None` outside the frame.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize) * (self.width as usize) + x as usize;
        self.data.get(offset).copied()
    }

    /// Copy out the `roi` sub-window.
    ///
    /// Returns `None` when the window does not fit inside the frame.
    #[must_use]
    pub fn crop(&self, roi: Roi) -> Option<Self> {
        let fits_x = roi.x.checked_add(roi.width).is_some_and(|r| r <= self.width);
        let fits_y = roi.y.checked_add(roi.height).is_some_and(|b| b <= self.height);
        if !fits_x || !fits_y {
            return None;
        }

        let stride = self.width as usize;
        let mut data = Vec::with_capacity(roi.width as usize * roi.height as usize);
        for row in roi.y..roi.y + roi.height {
            let start = row as usize * stride + roi.x as usize;
            data.extend_from_slice(self.data.get(start..start + roi.width as usize)?);
        }

        Some(Self {
            width: roi.width,
            height: roi.height,
            data,
            metadata: self.metadata.clone(),
        })
    }

    /// Expand the grey plane into packed 24-bit BGR.
    #[must_use]
    pub fn to_bgr(&self) -> Vec<u8> {
        self.data.iter().flat_map(|&v| [v, v, v]).collect()
    }
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// No device was found, or it is already open or claimed elsewhere.
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    /// A requested value lies outside the device-reported bounds.
    #[error("{parameter} = {value} is out of range [{min}, {max}]")]
    ParameterOutOfRange {
        /// Parameter name.
        parameter: &'static str,
        /// Rejected value.
        value: f64,
        /// Lower bound reported by the device.
        min: f64,
        /// Upper bound reported by the device.
        max: f64,
    },
    /// No frame arrived within the timeout window.
    #[error("no frame within {0:?}")]
    AcquisitionTimeout(Duration),
    /// The output image or video could not be written.
    #[error("failed to write output: {0}")]
    EncodingFailure(String),
    /// The camera has no control behind this parameter.
    #[error("{0} is not supported by this camera")]
    Unsupported(Parameter),
    /// Backend failure not covered by the other kinds.
    #[error("device error: {0}")]
    Device(String),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// Abstraction over a single camera handle.
///
/// A handle is created closed. Parameters and acquisition are only available
/// between [`open`](Self::open) and [`close`](Self::close).
pub trait CameraDevice {
    /// The stream type returned by `start_grabbing`.
    type Stream<'a>: CaptureStream
    where
        Self: 'a;

    /// Identification of the camera behind this handle.
    fn info(&self) -> &DeviceInfo;

    /// Claim the device for exclusive use.
    ///
    /// # Errors
    ///
    /// * `DeviceUnavailable` - the handle is already open, or another process
    ///   holds the device.
    /// * `Device` - the device was claimed but could not be configured.
    fn open(&mut self) -> Result<()>;

    /// Release the device. A no-op on a closed handle.
    ///
    /// # Errors
    ///
    /// Backend-specific failures while releasing; the handle counts as closed
    /// afterwards either way.
    fn close(&mut self) -> Result<()>;

    /// Whether the handle is currently open.
    fn is_open(&self) -> bool;

    /// Current valid range of `parameter`.
    ///
    /// ROI bounds depend on the other ROI fields, so the range must be read
    /// again after any of them changes.
    ///
    /// # Arguments
    ///
    /// * `parameter` - Parameter to query
    ///
    /// # Errors
    ///
    /// * `Unsupported` - the camera has no control for `parameter`.
    /// * `Device` - the handle is closed or the query failed.
    fn range(&self, parameter: Parameter) -> Result<ParameterRange>;

    /// Current value of `parameter`, in the units of [`Parameter`].
    ///
    /// # Errors
    ///
    /// * `Unsupported` - the camera has no control for `parameter`.
    /// * `Device` - the handle is closed or the read failed.
    fn parameter(&self, parameter: Parameter) -> Result<f64>;

    /// Write `parameter`.
    ///
    /// # Arguments
    ///
    /// * `parameter` - Parameter to write
    /// * `value` - New value, which must lie inside [`range`](Self::range)
    ///   and on its increment
    ///
    /// # Errors
    ///
    /// * `ParameterOutOfRange` - the value is outside the current range or
    ///   the device rejected it.
    /// * `Unsupported` - the camera has no control for `parameter`.
    fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()>;

    /// Start acquisition with the current parameters.
    ///
    /// Grabbing stops when the returned stream is dropped. The stream borrows
    /// the handle, so parameters cannot change while it is alive.
    ///
    /// # Arguments
    ///
    /// * `strategy` - Buffering policy for the stream
    ///
    /// # Returns
    ///
    /// A stream delivering frames of the current region of interest.
    ///
    /// # Errors
    ///
    /// * `DeviceUnavailable` - another process is streaming from the device.
    /// * `Device` - the handle is closed or buffers could not be allocated.
    fn start_grabbing(&mut self, strategy: GrabStrategy) -> Result<Self::Stream<'_>>;
}

/// Abstraction over an active acquisition.
pub trait CaptureStream {
    /// Block until the next frame arrives or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// * `AcquisitionTimeout` - no frame within `timeout`.
    /// * `Device` - a `Count` stream is exhausted or the driver failed.
    fn retrieve(&mut self, timeout: Duration) -> Result<Frame>;
}
