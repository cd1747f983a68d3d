//! Motion detection and event extraction core.
//!
//! This crate provides:
//! - A multi-file video source presenting one contiguous frame stream
//! - The background-subtraction motion detector and event tracker
//! - Output sinks (OpenCV re-encode, external ffmpeg cut, scan-only)
//! - A three-thread decode/detect/encode pipeline with cancellation
//! - The [`MotionScanner`] façade tying it all together

pub mod config;
pub mod detector;
pub mod error;
pub mod ffmpeg;
pub mod mask;
pub mod overlay;
pub mod pipeline;
pub mod scanner;
pub mod sink;
pub mod source;
pub mod subtractor;
pub mod tracker;

pub use config::{
    ConfigFile, DetectorConfig, DetectorKind, KernelSize, OutputConfig, OutputMode, OverlayConfig,
    ScanConfig, ThumbnailMode, TrackerConfig,
};
pub use detector::{Detection, MotionDetector};
pub use error::{ScanError, ScanResult};
pub use pipeline::{Progress, ScanObserver};
pub use scanner::{MotionScanner, ScanSummary};
pub use source::{Frame, Metadata, VideoSource};
