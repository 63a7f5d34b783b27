use std::process::{Command, Output};

use robot_backend::startup::STARTUP_BANNER;
#[cfg(not(feature = "opencv"))]
use robot_backend::startup::EXIT_FAILURE;
#[cfg(feature = "opencv")]
use robot_backend::startup::{CAMERA_OPEN_ERROR, READY_BANNER};

fn run_backend(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_robot-backend"))
        .args(args)
        .env_remove("RUST_LOG")
        .env("OPENCV_LOG_LEVEL", "SILENT")
        .env("NO_COLOR", "1")
        .output()
        .unwrap()
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Index far past anything a build host exposes, so opening it always fails.
#[cfg(feature = "opencv")]
const ABSENT_CAMERA: &str = "63";

#[cfg(feature = "opencv")]
fn assert_banner_only(stdout: &str) {
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 3, "stdout was {stdout:?}");
    assert_eq!(lines[0], STARTUP_BANNER);
    assert!(lines[1].starts_with("[INFO] OpenCV Version: "));
    assert!(lines[1].len() > "[INFO] OpenCV Version: ".len());
    assert_eq!(lines[2], READY_BANNER);
}

#[cfg(feature = "opencv")]
#[test]
fn missing_camera_run_prints_banners_and_one_error_line() {
    let output = run_backend(&["--camera", ABSENT_CAMERA]);

    assert_eq!(output.status.code(), Some(0));
    assert_banner_only(&text(&output.stdout));
    assert_eq!(text(&output.stderr), format!("{CAMERA_OPEN_ERROR}\n"));
}

#[cfg(feature = "opencv")]
#[test]
fn verbose_logging_goes_to_stderr_only() {
    let output = run_backend(&["--camera", ABSENT_CAMERA, "--verbose"]);

    assert_eq!(output.status.code(), Some(0));
    assert_banner_only(&text(&output.stdout));
    let stderr = text(&output.stderr);
    assert!(stderr.lines().any(|line| line == CAMERA_OPEN_ERROR));
    assert!(
        stderr.contains(&format!("camera probe on /dev/video{ABSENT_CAMERA} failed")),
        "stderr was {stderr:?}"
    );
}

#[cfg(not(feature = "opencv"))]
#[test]
fn build_without_opencv_exits_with_one_exception_line() {
    let output = run_backend(&[]);

    assert_eq!(output.status.code(), Some(EXIT_FAILURE));
    assert!(output.stdout.is_empty());
    let stderr = text(&output.stderr);
    assert_eq!(stderr.lines().count(), 1, "stderr was {stderr:?}");
    assert!(stderr.starts_with("[ERROR] Exception: robot-backend was built without OpenCV support"));
}

#[test]
fn invalid_camera_index_is_a_usage_error() {
    let output = run_backend(&["--camera", "-4"]);

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
    assert!(!text(&output.stderr).contains(STARTUP_BANNER));
}
