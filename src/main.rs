//! Cam-capture command line: grab a still or record a video from the first camera.

use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cam_capture::traits::Result;
use cam_capture::{
    capture_still, capture_video, Backend, CameraDevice, CameraError, CaptureConfig,
    CaptureOptions, EmulatedCamera, FfmpegEncoder, HeadlessPreview, Parameter, Preview, Session,
    StillRequest, TerminalPreview, V4L2Camera, VideoRequest,
};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cam-capture")]
#[command(about = "Still and video capture for monochrome industrial cameras")]
#[command(version)]
struct Cli {
    /// Never open the terminal preview
    #[arg(long, global = true)]
    no_preview: bool,

    /// Per-frame retrieve timeout in milliseconds
    #[arg(long, global = true, default_value = "5000")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one frame to <NAME>.png
    Still {
        #[command(flatten)]
        settings: Settings,

        /// Output base name, without extension
        #[arg(short, long, default_value = "image")]
        name: String,
    },

    /// Record <NAME>.mp4
    Video {
        #[command(flatten)]
        settings: Settings,

        /// Output base name, without extension
        #[arg(short, long, default_value = "video")]
        name: String,

        /// Recording duration in seconds
        #[arg(short, long, default_value = "5")]
        seconds: f64,

        /// Frame rate of the output file
        #[arg(short, long, default_value = "30")]
        fps: u32,
    },

    /// Print the device-reported range and current value of every parameter
    Ranges,
}

/// Acquisition settings shared by both capture commands.
#[derive(Args)]
struct Settings {
    /// Gain in dB
    #[arg(short, long, default_value = "0")]
    gain: f64,

    /// Exposure time in microseconds
    #[arg(short, long, default_value = "10000")]
    exposure: f64,

    /// Region of interest height (default: rest of the sensor below the offset)
    #[arg(long)]
    height: Option<u32>,

    /// Region of interest width (default: rest of the sensor right of the offset)
    #[arg(long)]
    width: Option<u32>,

    /// Region of interest top edge
    #[arg(long, default_value = "0")]
    y_offset: u32,

    /// Region of interest left edge
    #[arg(long, default_value = "0")]
    x_offset: u32,
}

fn main() {
    // Set RUST_LOG to control log level, e.g. RUST_LOG=cam_capture=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = CaptureConfig::from_env();

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(err) = ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)) {
        warn!(%err, "could not install Ctrl-C handler");
    }

    match config.backend {
        Backend::Emulated => {
            info!("using emulated camera");
            execute(&mut EmulatedCamera::new(), cli, &config, &interrupted)
        }
        Backend::V4l2 => execute(&mut V4L2Camera::first()?, cli, &config, &interrupted),
    }
}

fn execute<C: CameraDevice>(
    camera: &mut C,
    cli: &Cli,
    config: &CaptureConfig,
    interrupted: &Arc<AtomicBool>,
) -> Result<()> {
    let options = CaptureOptions {
        timeout: std::time::Duration::from_millis(cli.timeout_ms),
    };
    let interactive = !cli.no_preview && io::stdout().is_terminal();

    match &cli.command {
        Commands::Still { settings, name } => {
            let (width, height) = region(camera, settings)?;
            let request = StillRequest::new(
                settings.gain,
                settings.exposure,
                name,
                height,
                width,
                settings.y_offset,
                settings.x_offset,
            );

            let summary = {
                let mut preview = open_preview(interactive, name, interrupted)?;
                capture_still(camera, &request, preview.as_mut(), &options)?
            };
            println!(
                "Saved {} ({}x{})",
                summary.path.display(),
                summary.width,
                summary.height
            );
        }
        Commands::Video {
            settings,
            name,
            seconds,
            fps,
        } => {
            let (width, height) = region(camera, settings)?;
            let request = VideoRequest::new(
                settings.gain,
                settings.exposure,
                name,
                *seconds,
                *fps,
                height,
                width,
                settings.y_offset,
                settings.x_offset,
            );

            let mut encoder = FfmpegEncoder::new(config.ffmpeg.clone());
            let summary = {
                let mut preview = open_preview(interactive, name, interrupted)?;
                capture_video(camera, &request, &mut encoder, preview.as_mut(), &options)?
            };
            println!(
                "Saved {} ({} frames in {:.2}s, {})",
                summary.path.display(),
                summary.frames_written,
                summary.elapsed.as_secs_f64(),
                summary.stop_reason
            );
        }
        Commands::Ranges => print_ranges(camera)?,
    }

    Ok(())
}

/// Terminal preview when attached to a terminal, otherwise a Ctrl-C aware headless one.
fn open_preview(
    interactive: bool,
    title: &str,
    interrupted: &Arc<AtomicBool>,
) -> Result<Box<dyn Preview>> {
    if interactive {
        Ok(Box::new(TerminalPreview::new(title)?))
    } else {
        Ok(Box::new(
            HeadlessPreview::new().with_interrupt(Arc::clone(interrupted)),
        ))
    }
}

/// Resolve omitted width/height to the rest of the sensor past the offsets.
fn region<C: CameraDevice>(camera: &mut C, settings: &Settings) -> Result<(u32, u32)> {
    if let (Some(width), Some(height)) = (settings.width, settings.height) {
        return Ok((width, height));
    }

    let session = Session::open(camera)?;
    let sensor_width = extent(&*session, Parameter::OffsetX, Parameter::Width)?;
    let sensor_height = extent(&*session, Parameter::OffsetY, Parameter::Height)?;
    session.close()?;

    Ok((
        settings
            .width
            .unwrap_or_else(|| sensor_width.saturating_sub(settings.x_offset)),
        settings
            .height
            .unwrap_or_else(|| sensor_height.saturating_sub(settings.y_offset)),
    ))
}

/// Sensor size along one axis: current offset plus the largest size it allows.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn extent<C: CameraDevice>(camera: &C, offset: Parameter, size: Parameter) -> Result<u32> {
    let total = camera.parameter(offset)? + camera.range(size)?.max;
    Ok(total as u32)
}

fn print_ranges<C: CameraDevice>(camera: &mut C) -> Result<()> {
    let session = Session::open(camera)?;
    let info = session.info();
    println!("Device: {} ({})", info.model, info.location);
    println!("Driver: {}", info.driver);

    for parameter in Parameter::ALL {
        let range = match session.range(parameter) {
            Ok(range) => range,
            Err(CameraError::Unsupported(_)) => {
                println!("{parameter:>12}: not supported");
                continue;
            }
            Err(err) => return Err(err),
        };
        let value = session.parameter(parameter)?;
        match range.increment {
            Some(step) => println!(
                "{parameter:>12}: {value} (min {}, max {}, step {step})",
                range.min, range.max
            ),
            None => println!(
                "{parameter:>12}: {value} (min {}, max {})",
                range.min, range.max
            ),
        }
    }

    session.close()
}
