//! Runtime configuration from `.env` and the process environment.

use std::env;
use std::path::PathBuf;

use tracing::debug;

/// Selects the emulated camera instead of hardware.
pub const EMULATED_VAR: &str = "CAM_CAPTURE_EMULATED";
/// Path or name of the ffmpeg executable.
pub const FFMPEG_VAR: &str = "CAM_CAPTURE_FFMPEG";

/// Which camera backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// First V4L2 capture device.
    V4l2,
    /// In-process emulated camera.
    Emulated,
}

/// Settings read once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Camera backend.
    pub backend: Backend,
    /// ffmpeg executable used for video.
    pub ffmpeg: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            backend: Backend::V4l2,
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl CaptureConfig {
    /// Load `.env` if present, then read the environment.
    pub fn from_env() -> Self {
        // dotenv::dotenv() returns Err if .env doesn't exist, which is fine
        if let Ok(path) = dotenv::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let backend = if lookup(EMULATED_VAR).as_deref().is_some_and(is_enabled) {
            Backend::Emulated
        } else {
            defaults.backend
        };
        let ffmpeg = lookup(FFMPEG_VAR)
            .filter(|value| !value.trim().is_empty())
            .map_or(defaults.ffmpeg, PathBuf::from);

        Self { backend, ffmpeg }
    }
}

/// `1`, `true`, `yes`, `on`, or any positive device count.
fn is_enabled(value: &str) -> bool {
    let value = value.trim();
    if let Ok(count) = value.parse::<u32>() {
        return count > 0;
    }
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on"
    )
}
