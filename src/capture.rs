//! Still and video capture operations.
//!
//! Both operations own the camera for their whole duration through a
//! [`Session`], so the device is closed before they return on every path.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::output::{self, VideoEncoder, VideoWriter, STILL_EXTENSION, VIDEO_EXTENSION};
use crate::params::{self, CaptureParameters};
use crate::preview::{Preview, PreviewEvent};
use crate::session::Session;
use crate::traits::{CameraDevice, CameraError, CaptureStream, Frame, GrabStrategy, Result};

/// How long a retrieve may block before `AcquisitionTimeout`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Knobs shared by both operations.
#[derive(Debug, Clone, Copy)]
pub struct CaptureOptions {
    /// Per-frame retrieve timeout.
    pub timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Inputs of a still capture.
#[derive(Debug, Clone)]
pub struct StillRequest {
    /// Acquisition settings.
    pub parameters: CaptureParameters,
    /// Output base name; `.png` is appended.
    pub name: String,
}

impl StillRequest {
    /// Build a request, with arguments in the order of the capture-still call.
    #[must_use]
    pub fn new(
        gain: f64,
        exposure_us: f64,
        name: &str,
        height: u32,
        width: u32,
        offset_y: u32,
        offset_x: u32,
    ) -> Self {
        Self {
            parameters: CaptureParameters {
                gain,
                exposure_us,
                width,
                height,
                offset_x,
                offset_y,
            },
            name: name.to_owned(),
        }
    }
}

/// Inputs of a video capture.
#[derive(Debug, Clone)]
pub struct VideoRequest {
    /// Acquisition settings.
    pub parameters: CaptureParameters,
    /// Output base name; `.mp4` is appended.
    pub name: String,
    /// Target duration in seconds.
    pub seconds: f64,
    /// Frame rate of the output file.
    pub fps: u32,
}

impl VideoRequest {
    /// Build a request, with arguments in the order of the capture-video call.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gain: f64,
        exposure_us: f64,
        name: &str,
        seconds: f64,
        fps: u32,
        height: u32,
        width: u32,
        offset_y: u32,
        offset_x: u32,
    ) -> Self {
        Self {
            parameters: CaptureParameters {
                gain,
                exposure_us,
                width,
                height,
                offset_x,
                offset_y,
            },
            name: name.to_owned(),
            seconds,
            fps,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.seconds.is_finite() || self.seconds <= 0.0 {
            return Err(CameraError::ParameterOutOfRange {
                parameter: "Seconds",
                value: self.seconds,
                min: f64::MIN_POSITIVE,
                max: f64::MAX,
            });
        }
        if self.fps == 0 {
            return Err(CameraError::ParameterOutOfRange {
                parameter: "Fps",
                value: 0.0,
                min: 1.0,
                max: f64::from(u32::MAX),
            });
        }
        Ok(())
    }
}

/// Result of a successful still capture.
#[derive(Debug, Clone)]
pub struct StillSummary {
    /// Written image.
    pub path: PathBuf,
    /// Image width.
    pub width: u32,
    /// Image height.
    pub height: u32,
}

/// Why a video capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Wall-clock time exceeded the requested duration.
    Deadline,
    /// `frames / fps` exceeded the requested duration.
    FrameBudget,
    /// The user dismissed the preview.
    Dismissed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Deadline => "duration elapsed",
            Self::FrameBudget => "frame budget reached",
            Self::Dismissed => "dismissed",
        })
    }
}

/// Result of a successful video capture.
#[derive(Debug, Clone)]
pub struct VideoSummary {
    /// Written video.
    pub path: PathBuf,
    /// Frames appended to the video.
    pub frames_written: u64,
    /// Recording time, measured from the first written frame.
    pub elapsed: Duration,
    /// What ended the recording.
    pub stop_reason: StopReason,
}

/// Grab exactly one frame, save it as `<name>.png` and show it until dismissed.
///
/// # Errors
///
/// * `DeviceUnavailable` - the camera is missing or claimed.
/// * `ParameterOutOfRange` - a requested value is outside the device range;
///   the device keeps its previous settings.
/// * `AcquisitionTimeout` - no frame within `options.timeout`.
/// * `EncodingFailure` - the PNG could not be written.
///
/// The camera is closed on every path.
pub fn capture_still<C, P>(
    camera: &mut C,
    request: &StillRequest,
    preview: &mut P,
    options: &CaptureOptions,
) -> Result<StillSummary>
where
    C: CameraDevice,
    P: Preview + ?Sized,
{
    let path = output::output_path(&request.name, STILL_EXTENSION);
    let mut session = Session::open(camera)?;
    params::apply(&mut *session, &request.parameters)?;

    let frame = session
        .start_grabbing(GrabStrategy::Count(1))?
        .retrieve(options.timeout)?;
    debug!(sequence = frame.metadata.sequence, "frame retrieved");

    output::write_png(&frame, &path)?;
    preview.hold(&frame)?;

    let summary = StillSummary {
        path,
        width: frame.width,
        height: frame.height,
    };
    drop(frame);
    session.close()?;
    Ok(summary)
}

/// Record `<name>.mp4` until the duration, the frame budget or the user ends it.
///
/// # Errors
///
/// As [`capture_still`], plus `ParameterOutOfRange` for a non-positive
/// `seconds` or zero `fps` (checked before the camera is opened) and
/// `EncodingFailure` from the video writer. When the loop fails after the
/// writer exists, the writer is still finished, so the file holds every
/// frame written so far.
pub fn capture_video<C, E, P>(
    camera: &mut C,
    request: &VideoRequest,
    encoder: &mut E,
    preview: &mut P,
    options: &CaptureOptions,
) -> Result<VideoSummary>
where
    C: CameraDevice,
    E: VideoEncoder,
    P: Preview + ?Sized,
{
    request.validate()?;
    let path = output::output_path(&request.name, VIDEO_EXTENSION);
    let mut session = Session::open(camera)?;
    params::apply(&mut *session, &request.parameters)?;

    let mut stream = session.start_grabbing(GrabStrategy::LatestImageOnly)?;
    let first = stream.retrieve(options.timeout)?;
    let mut writer = encoder.create(&path, request.fps, first.width, first.height)?;
    info!(
        path = %path.display(),
        width = first.width,
        height = first.height,
        fps = request.fps,
        seconds = request.seconds,
        "recording"
    );

    let recorded = record(&mut stream, &mut writer, preview, request, options, first);
    drop(stream);
    let finished = writer.finish();
    let (frames_written, elapsed, stop_reason) = recorded?;
    finished?;
    session.close()?;

    info!(frames_written, ?elapsed, %stop_reason, "recording stopped");
    Ok(VideoSummary {
        path,
        frames_written,
        elapsed,
        stop_reason,
    })
}

/// Acquisition loop: convert, write, display, release, retrieve.
///
/// `first` is always written, so a sized writer never ends up empty. The
/// deadline is checked before every further retrieve.
fn record<S, W, P>(
    stream: &mut S,
    writer: &mut W,
    preview: &mut P,
    request: &VideoRequest,
    options: &CaptureOptions,
    first: Frame,
) -> Result<(u64, Duration, StopReason)>
where
    S: CaptureStream,
    W: VideoWriter,
    P: Preview + ?Sized,
{
    let started = Instant::now();
    let mut frame = first;
    let mut written = 0u64;

    let reason = loop {
        writer.write(&frame.to_bgr())?;
        let event = preview.show(&frame)?;
        drop(frame);
        written += 1;

        if frame_budget_spent(written, request.fps, request.seconds) {
            break StopReason::FrameBudget;
        }
        if event == PreviewEvent::Dismissed {
            break StopReason::Dismissed;
        }
        if deadline_passed(started.elapsed(), request.seconds) {
            break StopReason::Deadline;
        }

        frame = stream.retrieve(options.timeout)?;
    };

    Ok((written, started.elapsed(), reason))
}

fn deadline_passed(elapsed: Duration, seconds: f64) -> bool {
    elapsed.as_secs_f64() > seconds
}

/// `frames / fps > seconds`, checked independently of the wall clock.
fn frame_budget_spent(frames: u64, fps: u32, seconds: f64) -> bool {
    #[allow(clippy::cast_precision_loss)]
    let recorded = frames as f64 / f64::from(fps);
    recorded > seconds
}
