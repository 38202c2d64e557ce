//! Cam-Capture: still and video capture for industrial cameras
//!
//! This library configures gain, exposure and region of interest on a camera
//! and records either a single PNG still or a fixed-duration MP4 video. The
//! camera is reached through trait-based abstractions, backed by V4L2 for real
//! hardware and by an emulated camera for hardware-less runs and tests.

pub mod capture;
pub mod config;
pub mod device;
pub mod emulated;
pub mod output;
pub mod params;
pub mod preview;
pub mod session;
pub mod traits;
pub mod validation;

pub use capture::{
    capture_still, capture_video, CaptureOptions, StillRequest, StillSummary, StopReason,
    VideoRequest, VideoSummary,
};
pub use config::{Backend, CaptureConfig};
pub use device::V4L2Camera;
pub use emulated::{EmulatedCamera, TestPattern};
pub use output::{FfmpegEncoder, VideoEncoder, VideoWriter};
pub use params::CaptureParameters;
pub use preview::{HeadlessPreview, Preview, PreviewEvent, TerminalPreview};
pub use session::Session;
pub use traits::{
    CameraDevice, CameraError, CaptureStream, DeviceInfo, Frame, FrameMetadata, GrabStrategy,
    Parameter, ParameterRange,
};
