//! Writing captured frames to disk.
//!
//! Stills are encoded in-process as 8-bit greyscale PNG. Video is handed to an
//! `ffmpeg` child process as raw BGR frames on stdin and muxed into MP4 with
//! the `mp4v` codec tag.

use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

use image::{ColorType, ImageFormat};
use tracing::{debug, info, warn};

use crate::traits::{CameraError, Frame, Result};

/// Extension of still outputs.
pub const STILL_EXTENSION: &str = "png";
/// Extension of video outputs.
pub const VIDEO_EXTENSION: &str = "mp4";

/// `<name>.<extension>`, keeping any directory part of `name`.
#[must_use]
pub fn output_path(name: &str, extension: &str) -> PathBuf {
    PathBuf::from(format!("{name}.{extension}"))
}

/// Encode `frame` as a greyscale PNG at `path`.
pub fn write_png(frame: &Frame, path: &Path) -> Result<()> {
    image::save_buffer_with_format(
        path,
        &frame.data,
        frame.width,
        frame.height,
        ColorType::L8,
        ImageFormat::Png,
    )
    .map_err(|err| CameraError::EncodingFailure(format!("{}: {err}", path.display())))?;

    info!(path = %path.display(), width = frame.width, height = frame.height, "image saved");
    Ok(())
}

/// Creates video writers for a given output file.
pub trait VideoEncoder {
    /// Writer produced by this encoder.
    type Writer: VideoWriter;

    /// Start a video at `path` with fixed frame geometry.
    fn create(&mut self, path: &Path, fps: u32, width: u32, height: u32) -> Result<Self::Writer>;
}

/// Accepts packed BGR frames and finalises the container.
pub trait VideoWriter {
    /// Append one `width * height * 3` byte BGR frame.
    fn write(&mut self, bgr: &[u8]) -> Result<()>;

    /// Flush and close the file.
    fn finish(self) -> Result<()>;
}

/// Encodes through an external `ffmpeg` executable.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegEncoder {
    /// Use the `ffmpeg` binary at `program` (a bare name is looked up in `PATH`).
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl VideoEncoder for FfmpegEncoder {
    type Writer = FfmpegWriter;

    fn create(&mut self, path: &Path, fps: u32, width: u32, height: u32) -> Result<FfmpegWriter> {
        let mut child = Command::new(&self.program)
            .args(ffmpeg_args(fps, width, height))
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                if err.kind() == io::ErrorKind::NotFound {
                    CameraError::EncodingFailure(format!(
                        "{} not found; install ffmpeg or set CAM_CAPTURE_FFMPEG",
                        self.program.display()
                    ))
                } else {
                    CameraError::EncodingFailure(format!("failed to spawn ffmpeg: {err}"))
                }
            })?;

        let stdin = child.stdin.take();
        // Drained concurrently so a chatty ffmpeg never blocks on a full pipe.
        let stderr = child.stderr.take().map(|pipe| thread::spawn(move || drain(pipe)));
        debug!(path = %path.display(), fps, width, height, "ffmpeg started");
        Ok(FfmpegWriter {
            child: Some(child),
            stdin,
            stderr,
            path: path.to_path_buf(),
            frame_len: width as usize * height as usize * 3,
            frames: 0,
        })
    }
}

/// Command line for raw BGR on stdin to MPEG-4 Part 2 in MP4.
fn ffmpeg_args(fps: u32, width: u32, height: u32) -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "bgr24",
        "-s",
        &format!("{width}x{height}"),
        "-r",
        &fps.to_string(),
        "-i",
        "-",
        // yuv420p needs even dimensions
        "-vf",
        "pad=ceil(iw/2)*2:ceil(ih/2)*2",
        "-c:v",
        "mpeg4",
        "-tag:v",
        "mp4v",
        "-q:v",
        "3",
        "-pix_fmt",
        "yuv420p",
    ]
    .iter()
    .map(|arg| (*arg).to_owned())
    .collect()
}

/// Collect ffmpeg's diagnostics until it closes stderr.
fn drain(pipe: ChildStderr) -> Vec<String> {
    let mut lines = Vec::new();
    for line in BufReader::new(pipe).lines() {
        match line {
            Ok(line) => {
                debug!(target: "ffmpeg", "{line}");
                lines.push(line);
            }
            Err(err) => {
                warn!(%err, "stopped reading ffmpeg stderr");
                break;
            }
        }
    }
    lines
}

/// A running `ffmpeg` process receiving frames.
pub struct FfmpegWriter {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<Vec<String>>>,
    path: PathBuf,
    frame_len: usize,
    frames: u64,
}

impl FfmpegWriter {
    /// Frames written so far.
    pub const fn frames(&self) -> u64 {
        self.frames
    }

    fn wait(&mut self) -> Result<()> {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let status = child.wait()?;
        let stderr = match self.stderr.take().map(JoinHandle::join) {
            Some(Ok(lines)) => lines.join("\n"),
            Some(Err(_)) => {
                warn!("ffmpeg stderr reader panicked");
                String::new()
            }
            None => String::new(),
        };
        if status.success() {
            Ok(())
        } else {
            Err(CameraError::EncodingFailure(format!(
                "ffmpeg exited with {status}: {}",
                stderr.trim()
            )))
        }
    }
}

impl VideoWriter for FfmpegWriter {
    fn write(&mut self, bgr: &[u8]) -> Result<()> {
        if bgr.len() != self.frame_len {
            return Err(CameraError::EncodingFailure(format!(
                "frame has {} bytes, expected {}",
                bgr.len(),
                self.frame_len
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CameraError::EncodingFailure("ffmpeg stdin closed".to_owned()))?;
        stdin
            .write_all(bgr)
            .map_err(|err| CameraError::EncodingFailure(format!("ffmpeg pipe: {err}")))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.wait()?;
        info!(path = %self.path.display(), frames = self.frames, "video saved");
        Ok(())
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(err) = self.wait() {
                warn!(%err, path = %self.path.display(), "ffmpeg did not finish cleanly");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;
    use crate::traits::FrameMetadata;

    /// Stand-in for ffmpeg: copies stdin into the last argument, then runs `tail`.
    fn fake_ffmpeg(dir: &TempDir, tail: &str) -> PathBuf {
        let path = dir.path().join("ffmpeg");
        let script = format!("#!/bin/sh\nfor last; do :; done\ncat > \"$last\"\n{tail}\n");
        fs::write(&path, script).expect("write script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        path
    }

    fn frame(width: u32, height: u32) -> Frame {
        Frame {
            width,
            height,
            data: vec![128; (width * height) as usize],
            metadata: FrameMetadata {
                sequence: 0,
                timestamp: Duration::ZERO,
            },
        }
    }

    #[test]
    fn test_output_path() {
        assert_eq!(output_path("test_image", STILL_EXTENSION), PathBuf::from("test_image.png"));
        assert_eq!(
            output_path("out/test_video", VIDEO_EXTENSION),
            PathBuf::from("out/test_video.mp4")
        );
    }

    #[test]
    fn test_write_png() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("still.png");
        write_png(&frame(20, 10), &path).expect("png should be written");

        let decoded = image::open(&path).expect("png should decode").to_luma8();
        assert_eq!(decoded.dimensions(), (20, 10));
        assert_eq!(decoded.get_pixel(5, 5).0, [128]);
    }

    #[test]
    fn test_write_png_bad_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("still.png");
        let result = write_png(&frame(4, 4), &path);
        assert!(matches!(result, Err(CameraError::EncodingFailure(_))));
    }

    #[test]
    fn test_ffmpeg_args() {
        let args = ffmpeg_args(30, 1282, 101);
        let joined = args.join(" ");
        assert!(joined.contains("-s 1282x101"));
        assert!(joined.contains("-r 30"));
        assert!(joined.contains("-tag:v mp4v"));
        assert!(joined.contains("-pix_fmt bgr24"));
    }

    #[test]
    #[serial]
    fn test_ffmpeg_receives_every_frame() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("video.mp4");
        let mut encoder = FfmpegEncoder::new(fake_ffmpeg(&dir, "exit 0"));

        let mut writer = encoder.create(&output, 30, 4, 2).expect("spawn");
        for _ in 0..3 {
            writer.write(&frame(4, 2).to_bgr()).expect("write");
        }
        assert_eq!(writer.frames(), 3);
        writer.finish().expect("finish");

        let piped = fs::metadata(&output).expect("output written").len();
        assert_eq!(piped, 3 * 4 * 2 * 3);
    }

    #[test]
    #[serial]
    fn test_ffmpeg_rejects_wrong_frame_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("video.mp4");
        let mut encoder = FfmpegEncoder::new(fake_ffmpeg(&dir, "exit 0"));

        let mut writer = encoder.create(&output, 30, 4, 2).expect("spawn");
        let result = writer.write(&frame(2, 2).to_bgr());
        assert!(matches!(result, Err(CameraError::EncodingFailure(_))));
        assert_eq!(writer.frames(), 0);
        writer.finish().expect("finish");
        assert_eq!(fs::metadata(&output).expect("output written").len(), 0);
    }

    #[test]
    #[serial]
    fn test_ffmpeg_failure_exit_reports_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut encoder = FfmpegEncoder::new(fake_ffmpeg(&dir, "echo 'muxer broke' >&2; exit 3"));

        let mut writer = encoder
            .create(&dir.path().join("video.mp4"), 30, 4, 2)
            .expect("spawn");
        writer.write(&frame(4, 2).to_bgr()).expect("write");
        match writer.finish() {
            Err(CameraError::EncodingFailure(message)) => {
                assert!(message.contains("muxer broke"), "{message}");
            }
            other => panic!("expected EncodingFailure, got {other:?}"),
        }
    }

    #[test]
    #[serial]
    fn test_dropped_writer_still_finalises() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("video.mp4");
        let mut encoder = FfmpegEncoder::new(fake_ffmpeg(&dir, "exit 0"));

        let mut writer = encoder.create(&output, 30, 4, 2).expect("spawn");
        writer.write(&frame(4, 2).to_bgr()).expect("write");
        drop(writer);

        assert_eq!(fs::metadata(&output).expect("output written").len(), 4 * 2 * 3);
    }

    #[test]
    #[serial]
    fn test_missing_ffmpeg_is_encoding_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut encoder = FfmpegEncoder::new(dir.path().join("no-such-ffmpeg"));
        let result = encoder.create(&dir.path().join("video.mp4"), 30, 16, 16);
        assert!(matches!(result, Err(CameraError::EncodingFailure(_))));
    }
}
