//! V4L2 device implementation using the v4l crate.
//!
//! Gain and exposure map onto the standard V4L2 user and camera class
//! controls. Most UVC and sensor drivers do not expose a cropping window, so
//! the region of interest is cut out of each full-sensor frame after dequeue.

use std::io;
use std::time::Duration;

use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::control::{Control, Description, Value};
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::traits::{
    CameraDevice, CameraError, CaptureStream, DeviceInfo, Frame, FrameMetadata, GrabStrategy,
    Parameter, ParameterRange, Result, Roi,
};

const V4L2_CID_BASE: u32 = 0x0098_0900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = 0x009a_0900;

const V4L2_CID_AUTOGAIN: u32 = V4L2_CID_BASE + 18;
const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;

/// `V4L2_EXPOSURE_MANUAL`
const EXPOSURE_MODE_MANUAL: i64 = 1;

/// `V4L2_CID_EXPOSURE_ABSOLUTE` counts in 100 us units.
const EXPOSURE_UNIT_US: f64 = 100.0;

/// Buffers queued for `LatestImageOnly`.
const LATEST_BUFFERS: u32 = 4;

/// Highest `/dev/videoN` index tried during discovery.
const MAX_DEVICE_INDEX: usize = 64;

const GREY: FourCC = FourCC { repr: *b"GREY" };
const YUYV: FourCC = FourCC { repr: *b"YUYV" };

/// Negotiated sensor format.
#[derive(Debug, Clone, Copy)]
struct SensorFormat {
    width: u32,
    height: u32,
    stride: u32,
    fourcc: FourCC,
}

/// V4L2 camera handle wrapping the v4l crate.
pub struct V4L2Camera {
    index: usize,
    info: DeviceInfo,
    device: Option<Device>,
    sensor: Option<SensorFormat>,
    controls: Vec<Description>,
    roi: Roi,
}

impl V4L2Camera {
    /// Discover the first capture-capable device (`/dev/video0` upwards).
    ///
    /// The device is not opened; call [`CameraDevice::open`] before use.
    ///
    /// # Returns
    ///
    /// A closed handle for the lowest-numbered node that supports streaming
    /// video capture.
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when no such node exists.
    pub fn first() -> Result<Self> {
        (0..MAX_DEVICE_INDEX)
            .find_map(Self::describe)
            .ok_or_else(|| CameraError::DeviceUnavailable("no V4L2 capture device found".to_owned()))
    }

    /// Describe `/dev/video<index>` without opening it.
    ///
    /// # Arguments
    ///
    /// * `index` - Device index (e.g., 0 for /dev/video0)
    ///
    /// # Errors
    ///
    /// `DeviceUnavailable` when the node is missing, unreadable, or not a
    /// streaming capture device.
    pub fn at(index: usize) -> Result<Self> {
        Self::describe(index).ok_or_else(|| {
            CameraError::DeviceUnavailable(format!("/dev/video{index} is not a capture device"))
        })
    }

    /// Describe the device at `index` if it supports streaming capture.
    fn describe(index: usize) -> Option<Self> {
        let device = Device::new(index).ok()?;
        let caps = device.query_caps().ok()?;
        let capture = caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            && caps.capabilities.contains(Flags::STREAMING);
        if !capture {
            return None;
        }

        info!(index, card = %caps.card, "discovered camera");
        Some(Self {
            index,
            info: DeviceInfo {
                driver: caps.driver,
                model: caps.card,
                location: format!("/dev/video{index}"),
            },
            device: None,
            sensor: None,
            controls: Vec::new(),
            roi: Roi {
                x: 0,
                y: 0,
                width: 0,
                height: 0,
            },
        })
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CameraError::Device("camera is not open".to_owned()))
    }

    fn sensor(&self) -> Result<SensorFormat> {
        self.sensor
            .ok_or_else(|| CameraError::Device("camera is not open".to_owned()))
    }

    /// Prefer 8-bit grey; fall back to YUYV and keep only the luma plane.
    ///
    /// `S_FMT` fails with `EBUSY` while another process streams, so the
    /// device's location is needed for the error.
    fn negotiate_format(device: &Device, location: &str) -> Result<SensorFormat> {
        let mut fmt = device.format().map_err(|err| claim_error(err, location))?;

        for fourcc in [GREY, YUYV] {
            fmt.fourcc = fourcc;
            let actual = device
                .set_format(&fmt)
                .map_err(|err| claim_error(err, location))?;
            if actual.fourcc == fourcc {
                return Ok(SensorFormat {
                    width: actual.width,
                    height: actual.height,
                    stride: actual.stride,
                    fourcc,
                });
            }
        }

        Err(CameraError::Device(
            "device supports neither GREY nor YUYV".to_owned(),
        ))
    }

    fn has_control(&self, id: u32) -> bool {
        self.controls.iter().any(|description| description.id == id)
    }

    /// Control description behind `parameter`, as queried on open.
    fn description(&self, parameter: Parameter, id: u32) -> Result<&Description> {
        self.device()?;
        self.controls
            .iter()
            .find(|description| description.id == id)
            .ok_or(CameraError::Unsupported(parameter))
    }

    #[allow(clippy::cast_precision_loss)]
    fn control_range(&self, parameter: Parameter, id: u32, scale: f64) -> Result<ParameterRange> {
        let description = self.description(parameter, id)?;
        Ok(ParameterRange::stepped(
            description.minimum as f64 * scale,
            description.maximum as f64 * scale,
            description.step.max(1) as f64 * scale,
        ))
    }

    fn control_value(&self, parameter: Parameter, id: u32, scale: f64) -> Result<f64> {
        self.description(parameter, id)?;
        let control = self.device()?.control(id).map_err(device_error)?;
        match control.value {
            #[allow(clippy::cast_precision_loss)]
            Value::Integer(value) => Ok(value as f64 * scale),
            other => Err(CameraError::Device(format!(
                "control {id:#x} has unexpected value {other:?}"
            ))),
        }
    }

    /// Turn an automatic mode off so the manual control it shadows is writable.
    fn disable_auto(&self, id: u32, manual: i64) -> Result<()> {
        if !self.has_control(id) {
            return Ok(());
        }
        let control = Control {
            id,
            value: Value::Integer(manual),
        };
        if let Err(err) = self.device()?.set_control(control) {
            debug!(id, %err, "could not switch control to manual");
        }
        Ok(())
    }

    fn write_control(
        &self,
        parameter: Parameter,
        range: &ParameterRange,
        id: u32,
        value: f64,
        scale: f64,
    ) -> Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let raw = (value / scale).round() as i64;
        self.device()?
            .set_control(Control {
                id,
                value: Value::Integer(raw),
            })
            .map_err(|err| {
                warn!(%parameter, value, %err, "device rejected control");
                range.rejection(parameter, value)
            })
    }
}

impl CameraDevice for V4L2Camera {
    type Stream<'a> = V4L2Stream<'a>;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} is already open",
                self.info.location
            )));
        }

        let device = Device::new(self.index).map_err(|err| {
            CameraError::DeviceUnavailable(format!("{}: {err}", self.info.location))
        })?;
        let sensor = Self::negotiate_format(&device, &self.info.location)?;
        debug!(
            width = sensor.width,
            height = sensor.height,
            fourcc = ?sensor.fourcc,
            "negotiated sensor format"
        );
        self.controls = device.query_controls().unwrap_or_else(|err| {
            warn!(%err, "could not list controls; gain and exposure unavailable");
            Vec::new()
        });

        self.roi = Roi {
            x: 0,
            y: 0,
            width: sensor.width,
            height: sensor.height,
        };
        self.sensor = Some(sensor);
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.device.take().is_some() {
            debug!(location = %self.info.location, "camera closed");
        }
        self.sensor = None;
        self.controls.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn range(&self, parameter: Parameter) -> Result<ParameterRange> {
        let sensor = self.sensor()?;
        let roi = self.roi;
        match parameter {
            Parameter::Gain => self.control_range(parameter, V4L2_CID_GAIN, 1.0),
            Parameter::ExposureTime => {
                self.control_range(parameter, V4L2_CID_EXPOSURE_ABSOLUTE, EXPOSURE_UNIT_US)
            }
            Parameter::Width => Ok(ParameterRange::stepped(
                1.0,
                f64::from(sensor.width - roi.x),
                1.0,
            )),
            Parameter::Height => Ok(ParameterRange::stepped(
                1.0,
                f64::from(sensor.height - roi.y),
                1.0,
            )),
            Parameter::OffsetX => Ok(ParameterRange::stepped(
                0.0,
                f64::from(sensor.width - roi.width),
                1.0,
            )),
            Parameter::OffsetY => Ok(ParameterRange::stepped(
                0.0,
                f64::from(sensor.height - roi.height),
                1.0,
            )),
        }
    }

    fn parameter(&self, parameter: Parameter) -> Result<f64> {
        self.sensor()?;
        match parameter {
            Parameter::Gain => self.control_value(parameter, V4L2_CID_GAIN, 1.0),
            Parameter::ExposureTime => {
                self.control_value(parameter, V4L2_CID_EXPOSURE_ABSOLUTE, EXPOSURE_UNIT_US)
            }
            Parameter::Width => Ok(f64::from(self.roi.width)),
            Parameter::Height => Ok(f64::from(self.roi.height)),
            Parameter::OffsetX => Ok(f64::from(self.roi.x)),
            Parameter::OffsetY => Ok(f64::from(self.roi.y)),
        }
    }

    fn set_parameter(&mut self, parameter: Parameter, value: f64) -> Result<()> {
        let range = self.range(parameter)?;
        if !range.contains(value) {
            return Err(range.rejection(parameter, value));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let whole = value as u32;
        match parameter {
            Parameter::Gain => {
                self.disable_auto(V4L2_CID_AUTOGAIN, 0)?;
                self.write_control(parameter, &range, V4L2_CID_GAIN, value, 1.0)?;
            }
            Parameter::ExposureTime => {
                self.disable_auto(V4L2_CID_EXPOSURE_AUTO, EXPOSURE_MODE_MANUAL)?;
                self.write_control(
                    parameter,
                    &range,
                    V4L2_CID_EXPOSURE_ABSOLUTE,
                    value,
                    EXPOSURE_UNIT_US,
                )?;
            }
            Parameter::Width => self.roi.width = whole,
            Parameter::Height => self.roi.height = whole,
            Parameter::OffsetX => self.roi.x = whole,
            Parameter::OffsetY => self.roi.y = whole,
        }
        Ok(())
    }

    fn start_grabbing(&mut self, strategy: GrabStrategy) -> Result<Self::Stream<'_>> {
        let sensor = self.sensor()?;
        let buffer_count = match strategy {
            // Spare buffers keep the driver filling while older frames wait
            // to be drained by `retrieve`.
            GrabStrategy::LatestImageOnly => LATEST_BUFFERS,
            GrabStrategy::Count(count) => count.clamp(2, 8),
        };

        let stream = Stream::with_buffers(self.device()?, Type::VideoCapture, buffer_count)
            .map_err(|err| claim_error(err, &self.info.location))?;

        debug!(?strategy, buffer_count, "started grabbing");
        Ok(V4L2Stream {
            stream,
            sensor,
            roi: self.roi,
            strategy,
            delivered: 0,
        })
    }
}

/// V4L2 capture stream wrapping mmap-based streaming.
pub struct V4L2Stream<'a> {
    stream: Stream<'a>,
    sensor: SensorFormat,
    roi: Roi,
    strategy: GrabStrategy,
    delivered: u32,
}

impl V4L2Stream<'_> {
    /// Dequeue one buffer and copy it out as a full-sensor frame.
    fn dequeue(&mut self, timeout: Duration) -> Result<Frame> {
        self.stream.set_timeout(timeout);
        let (buf, meta) = self.stream.next().map_err(|err| {
            if err.kind() == io::ErrorKind::TimedOut {
                CameraError::AcquisitionTimeout(timeout)
            } else {
                device_error(err)
            }
        })?;

        // Safe conversions: V4L2 timestamps are always non-negative in practice
        #[allow(clippy::cast_sign_loss)]
        let secs = meta.timestamp.sec.max(0) as u64;
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let nanos = (meta.timestamp.usec.max(0) as u32).saturating_mul(1000);

        let sensor = self.sensor;
        let data = luma_plane(buf, sensor.fourcc, sensor.width, sensor.height, sensor.stride)
            .ok_or_else(|| CameraError::Device("short frame buffer".to_owned()))?;

        Ok(Frame {
            width: sensor.width,
            height: sensor.height,
            data,
            metadata: FrameMetadata {
                sequence: u64::from(meta.sequence),
                timestamp: Duration::new(secs, nanos),
            },
        })
    }
}

impl CaptureStream for V4L2Stream<'_> {
    fn retrieve(&mut self, timeout: Duration) -> Result<Frame> {
        if let GrabStrategy::Count(limit) = self.strategy {
            if self.delivered >= limit {
                return Err(CameraError::Device(format!(
                    "all {limit} requested frames were already retrieved"
                )));
            }
        }

        let oldest = self.dequeue(timeout)?;
        let full = if self.strategy == GrabStrategy::LatestImageOnly {
            let (newest, skipped) = newest_ready(oldest, || self.dequeue(Duration::ZERO))?;
            if skipped > 0 {
                debug!(skipped, "dropped queued frames");
            }
            newest
        } else {
            oldest
        };
        self.delivered += 1;

        let sensor = self.sensor;
        if self.roi.width == sensor.width && self.roi.height == sensor.height {
            return Ok(full);
        }
        full.crop(self.roi)
            .ok_or_else(|| CameraError::Device("region of interest outside sensor".to_owned()))
    }
}

/// Keep pulling frames that are already waiting and return the last one.
///
/// `ready` is polled without blocking; `AcquisitionTimeout` means the queue
/// is empty. Also returns how many older frames were skipped.
fn newest_ready<F>(mut frame: Frame, mut ready: F) -> Result<(Frame, u32)>
where
    F: FnMut() -> Result<Frame>,
{
    let mut skipped = 0;
    loop {
        match ready() {
            Ok(newer) => {
                frame = newer;
                skipped += 1;
            }
            Err(CameraError::AcquisitionTimeout(_)) => return Ok((frame, skipped)),
            Err(err) => return Err(err),
        }
    }
}

/// Extract a tightly packed `Mono8` plane from a GREY or YUYV buffer.
fn luma_plane(buf: &[u8], fourcc: FourCC, width: u32, height: u32, stride: u32) -> Option<Vec<u8>> {
    let width = width as usize;
    let stride = stride as usize;
    let mut data = Vec::with_capacity(width * height as usize);

    for row in 0..height as usize {
        let start = row * stride;
        if fourcc == YUYV {
            // [Y0 U Y1 V] repeats; keep every Y sample
            let line = buf.get(start..start + width * 2)?;
            data.extend(line.iter().step_by(2));
        } else {
            data.extend_from_slice(buf.get(start..start + width)?);
        }
    }

    Some(data)
}

fn device_error(err: io::Error) -> CameraError {
    CameraError::Device(err.to_string())
}

/// `EBUSY` means another process holds the device's streaming queue.
fn claim_error(err: io::Error, location: &str) -> CameraError {
    if err.kind() == io::ErrorKind::ResourceBusy {
        CameraError::DeviceUnavailable(format!("{location} is claimed by another process"))
    } else {
        device_error(err)
    }
}
