//! V4L2 backend tests against the vivid virtual camera.
//!
//! Run with `cargo test --features integration` after loading the vivid
//! module (`modprobe vivid n_devs=1 node_types=0x1`) and switching it to the
//! Gray Ramp pattern (`v4l2-ctl -d /dev/videoN -c test_pattern=20`). The
//! user needs read/write access to the video node.

#![cfg(feature = "integration")]

use std::time::Duration;

use cam_capture::validation::{validate_frame_sequence, validate_gradient};
use cam_capture::{
    capture_still, CameraDevice, CameraError, CaptureOptions, CaptureStream, GrabStrategy,
    HeadlessPreview, Parameter, ParameterRange, StillRequest, V4L2Camera,
};
use serial_test::serial;

const TIMEOUT: Duration = Duration::from_secs(2);

/// Index range scanned for vivid nodes; vivid registers after real cameras.
const SCAN: std::ops::Range<usize> = 0..16;

/// First capture node whose driver reports itself as vivid.
///
/// Integration tests MUST have vivid loaded - they fail instead of skipping,
/// so CI notices a missing module.
fn vivid() -> V4L2Camera {
    SCAN.filter_map(|index| V4L2Camera::at(index).ok())
        .find(|camera| camera.info().driver == "vivid")
        .unwrap_or_else(|| {
            panic!(
                "no vivid capture node among /dev/video{}..{}.\n\
                 Load it with: sudo modprobe vivid n_devs=1 node_types=0x1\n\
                 Or run unit tests only: cargo test --lib",
                SCAN.start, SCAN.end
            )
        })
}

#[test]
#[serial]
fn test_vivid_device_open() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");
    assert!(camera.is_open());
    assert!(
        matches!(camera.open(), Err(CameraError::DeviceUnavailable(_))),
        "Second open should be refused"
    );
    camera.close().expect("close failed");
    assert!(!camera.is_open());

    println!("{} at {}", camera.info().model, camera.info().location);
}

#[test]
#[serial]
fn test_vivid_ranges() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");

    for parameter in [Parameter::Width, Parameter::Height, Parameter::OffsetX] {
        let range = camera.range(parameter).expect("range failed");
        let value = camera.parameter(parameter).expect("parameter failed");
        println!("{parameter}: {value} in [{}, {}]", range.min, range.max);
        assert!(range.min <= range.max);
    }
    camera.close().expect("close failed");
}

#[test]
#[serial]
fn test_vivid_roi_crop() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");

    camera.set_parameter(Parameter::Width, 200.0).expect("width");
    camera.set_parameter(Parameter::Height, 50.0).expect("height");
    camera.set_parameter(Parameter::OffsetX, 40.0).expect("offset x");
    camera.set_parameter(Parameter::OffsetY, 30.0).expect("offset y");

    let frame = {
        let mut stream = camera
            .start_grabbing(GrabStrategy::Count(1))
            .expect("Failed to start grabbing");
        stream.retrieve(TIMEOUT).expect("Failed to capture frame")
    };
    assert_eq!((frame.width, frame.height), (200, 50));
    assert_eq!(frame.data.len(), 200 * 50);

    camera.close().expect("close failed");
}

#[test]
#[serial]
fn test_vivid_capture_multiple_frames() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");

    let frames = {
        let mut stream = camera
            .start_grabbing(GrabStrategy::Count(10))
            .expect("Failed to start grabbing");
        (0..10)
            .map(|_| stream.retrieve(TIMEOUT).expect("Failed to capture frame"))
            .collect::<Vec<_>>()
    };

    if let Err(err) = validate_frame_sequence(&frames) {
        panic!("vivid dropped frames while streaming: {err}");
    }
    camera.close().expect("close failed");
}

#[test]
#[serial]
fn test_vivid_gradient_pattern() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");

    let frame = {
        let mut stream = camera
            .start_grabbing(GrabStrategy::LatestImageOnly)
            .expect("Failed to start grabbing");
        stream.retrieve(TIMEOUT).expect("Failed to capture frame")
    };

    if let Err(err) = validate_gradient(&frame) {
        panic!("expected the Gray Ramp pattern (v4l2-ctl -c test_pattern=20): {err}");
    }
    camera.close().expect("close failed");
}

/// A value on the increment grid roughly half way through `range`.
fn midpoint(range: &ParameterRange) -> f64 {
    let step = range.increment.unwrap_or(1.0);
    let steps = ((range.max - range.min) / 2.0 / step).floor();
    steps.mul_add(step, range.min)
}

/// Write a mid-range value and read it back; returns `false` when the
/// driver has no control for `parameter`.
fn round_trip(camera: &mut V4L2Camera, parameter: Parameter) -> bool {
    let range = match camera.range(parameter) {
        Ok(range) => range,
        Err(CameraError::Unsupported(unsupported)) => {
            assert_eq!(unsupported, parameter);
            assert!(matches!(
                camera.set_parameter(parameter, 1.0),
                Err(CameraError::Unsupported(_))
            ));
            return false;
        }
        Err(err) => panic!("range of {parameter} failed: {err}"),
    };

    let wanted = midpoint(&range);
    camera
        .set_parameter(parameter, wanted)
        .unwrap_or_else(|err| panic!("{parameter} = {wanted} rejected: {err}"));
    let actual = camera.parameter(parameter).expect("read back");
    assert!(
        (actual - wanted).abs() < 1e-6,
        "{parameter}: wrote {wanted}, read back {actual}"
    );

    let above = range.max + range.increment.unwrap_or(1.0);
    assert!(matches!(
        camera.set_parameter(parameter, above),
        Err(CameraError::ParameterOutOfRange { .. })
    ));
    true
}

#[test]
#[serial]
fn test_vivid_gain_round_trip() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");
    assert!(
        round_trip(&mut camera, Parameter::Gain),
        "vivid exposes V4L2_CID_GAIN"
    );
    camera.close().expect("close failed");
}

#[test]
#[serial]
fn test_vivid_exposure_round_trip() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");
    if !round_trip(&mut camera, Parameter::ExposureTime) {
        println!("vivid has no absolute exposure control");
    }
    camera.close().expect("close failed");
}

#[test]
#[serial]
fn test_vivid_capture_still_writes_png() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");
    let gain = camera.range(Parameter::Gain).expect("gain range").min;
    let exposure = match camera.range(Parameter::ExposureTime) {
        Ok(range) => midpoint(&range),
        Err(_) => 10_000.0,
    };
    camera.close().expect("close failed");

    let dir = tempfile::tempdir().expect("tempdir");
    let name = dir.path().join("vivid_still");
    let request = StillRequest::new(
        gain,
        exposure,
        name.to_str().expect("utf-8 temp path"),
        50,
        200,
        30,
        40,
    );
    let options = CaptureOptions { timeout: TIMEOUT };
    let summary = capture_still(&mut camera, &request, &mut HeadlessPreview::new(), &options)
        .expect("still capture should succeed");

    assert_eq!(summary.path, dir.path().join("vivid_still.png"));
    let decoded = image::open(&summary.path).expect("png decodes").to_luma8();
    assert_eq!(decoded.dimensions(), (200, 50));
    assert!(!camera.is_open());

    camera.open().expect("reopen after capture");
    let applied = camera.parameter(Parameter::Gain).expect("gain");
    assert!((applied - gain).abs() < 1e-6);
    camera.close().expect("close failed");
}

#[test]
#[serial]
fn test_vivid_latest_image_skips_queued_frames() {
    let mut camera = vivid();
    camera.open().expect("Failed to open vivid device");

    let (first, latest) = {
        let mut stream = camera
            .start_grabbing(GrabStrategy::LatestImageOnly)
            .expect("Failed to start grabbing");
        let first = stream.retrieve(TIMEOUT).expect("Failed to capture frame");
        // Several frame periods at vivid's default 30 fps
        std::thread::sleep(Duration::from_millis(300));
        let latest = stream.retrieve(TIMEOUT).expect("Failed to capture frame");
        (first, latest)
    };

    assert!(
        latest.metadata.sequence > first.metadata.sequence + 1,
        "expected queued frames to be skipped, got {} after {}",
        latest.metadata.sequence,
        first.metadata.sequence
    );
    camera.close().expect("close failed");
}
