//! End-to-end scan tests against synthetic video files.
//!
//! These generate small MJPG AVIs with a known motion pattern and run the
//! full pipeline over them. If the local OpenCV build cannot encode MJPG
//! the tests skip rather than fail, since every other code path is covered
//! by unit tests.

use std::path::{Path, PathBuf};

use opencv::core::{Mat, Rect as CvRect, Scalar, Size, CV_8UC3};
use opencv::prelude::*;
use opencv::videoio::VideoWriter;

use mscan_media::config::{OutputMode, ScanConfig};
use mscan_media::{MotionScanner, ScanError};
use mscan_models::TimeValue;

const WIDTH: i32 = 320;
const HEIGHT: i32 = 240;
const FPS: f64 = 30.0;

/// Write a test video: static gray background with a bright square visible
/// on the frame ranges in `motion`. Returns false when MJPG encoding is
/// unavailable.
fn write_test_video(path: &Path, total: u64, motion: &[(u64, u64)], fps: f64) -> bool {
    let fourcc = VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap();
    let mut writer = VideoWriter::new(
        &path.to_string_lossy(),
        fourcc,
        fps,
        Size::new(WIDTH, HEIGHT),
        true,
    )
    .unwrap();
    if !writer.is_opened().unwrap() {
        return false;
    }
    for index in 0..total {
        let mut frame =
            Mat::new_rows_cols_with_default(HEIGHT, WIDTH, CV_8UC3, Scalar::all(64.0)).unwrap();
        let in_motion = motion.iter().any(|(a, b)| (*a..*b).contains(&index));
        if in_motion {
            // Move the square a little every frame so the subtractor keeps
            // seeing fresh foreground.
            let x = 60 + (index % 20) as i32 * 4;
            let roi = CvRect::new(x, 80, 64, 64);
            let mut patch = Mat::roi_mut(&mut frame, roi).unwrap();
            patch
                .set_to(&Scalar::new(240.0, 240.0, 240.0, 0.0), &opencv::core::no_array())
                .unwrap();
        }
        writer.write(&frame).unwrap();
    }
    writer.release().unwrap();
    true
}

fn scan_only_config(inputs: Vec<PathBuf>) -> ScanConfig {
    let mut config = ScanConfig {
        inputs,
        ..ScanConfig::default()
    };
    config.output.mode = OutputMode::ScanOnly;
    // Robust against compression noise on synthetic frames.
    config.detector.threshold = 5.0;
    config.detector.downscale_factor = 1;
    config.tracker.min_event_length = TimeValue::Frames(4);
    config.tracker.time_before_event = TimeValue::Frames(0);
    config.tracker.time_post_event = TimeValue::Frames(15);
    config
}

#[test]
fn test_scan_finds_single_motion_event() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("burst.avi");
    if !write_test_video(&video, 240, &[(100, 150)], FPS) {
        eprintln!("MJPG encoder unavailable, skipping");
        return;
    }

    let config = scan_only_config(vec![video]);
    let mut scanner = MotionScanner::new(config).unwrap();
    let summary = scanner.scan().unwrap();

    assert_eq!(summary.events.len(), 1, "events: {:?}", summary.events);
    let event = &summary.events[0];
    let start = event.start.frame();
    let end = event.end.frame();
    assert!((95..=110).contains(&start), "start = {}", start);
    assert!((155..=175).contains(&end), "end = {}", end);
    assert!(event.peak_frame >= start && event.peak_frame < end);
    assert!(summary.outputs.is_empty());
    assert!(!summary.canceled);
    assert_eq!(summary.frames_read, 240);
}

#[test]
fn test_scan_without_motion_finds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("static.avi");
    if !write_test_video(&video, 120, &[], FPS) {
        eprintln!("MJPG encoder unavailable, skipping");
        return;
    }

    let config = scan_only_config(vec![video]);
    let mut scanner = MotionScanner::new(config).unwrap();
    let summary = scanner.scan().unwrap();
    assert!(summary.events.is_empty(), "events: {:?}", summary.events);
}

#[test]
fn test_mismatched_framerates_rejected_before_reading() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.avi");
    let second = dir.path().join("b.avi");
    if !write_test_video(&first, 30, &[], 30.0) || !write_test_video(&second, 30, &[], 25.0) {
        eprintln!("MJPG encoder unavailable, skipping");
        return;
    }

    let config = scan_only_config(vec![first, second]);
    let mut scanner = MotionScanner::new(config).unwrap();
    let result = scanner.scan();
    assert!(
        matches!(result, Err(ScanError::FramerateMismatch { .. })),
        "expected FramerateMismatch, got {:?}",
        result.map(|s| s.events)
    );
}

#[test]
fn test_concatenated_inputs_share_frame_numbering() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("part1.avi");
    let second = dir.path().join("part2.avi");
    // Motion only in the second file, frames 20-59 of that file.
    if !write_test_video(&first, 100, &[], FPS) || !write_test_video(&second, 100, &[(20, 60)], FPS)
    {
        eprintln!("MJPG encoder unavailable, skipping");
        return;
    }

    let config = scan_only_config(vec![first, second]);
    let mut scanner = MotionScanner::new(config).unwrap();
    let summary = scanner.scan().unwrap();

    assert_eq!(summary.frames_read, 200);
    assert_eq!(summary.events.len(), 1, "events: {:?}", summary.events);
    // Global index 120 = frame 20 of the second input.
    let start = summary.events[0].start.frame();
    assert!((115..=130).contains(&start), "start = {}", start);
}

#[test]
fn test_scan_range_trimming() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("two_bursts.avi");
    if !write_test_video(&video, 300, &[(50, 80), (200, 240)], FPS) {
        eprintln!("MJPG encoder unavailable, skipping");
        return;
    }

    // Scan only the tail; the first burst is outside the range.
    let mut config = scan_only_config(vec![video]);
    config.start_time = Some(TimeValue::Frames(150));
    let mut scanner = MotionScanner::new(config).unwrap();
    let summary = scanner.scan().unwrap();

    assert_eq!(summary.events.len(), 1, "events: {:?}", summary.events);
    let start = summary.events[0].start.frame();
    assert!((195..=210).contains(&start), "start = {}", start);
}
