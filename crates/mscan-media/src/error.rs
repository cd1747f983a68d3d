//! Error types for scanning operations.

use std::path::PathBuf;
use thiserror::Error;

use mscan_models::{RegionError, TimecodeError};

/// Result type for scanning operations.
pub type ScanResult<T> = Result<T, ScanError>;

/// Errors that can occur while scanning for motion events.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error(
        "resolution of {path} ({got_width}x{got_height}) does not match the first input \
         ({width}x{height})"
    )]
    ResolutionMismatch {
        path: PathBuf,
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("framerate of {path} ({got:.3} FPS) does not match the first input ({expected:.3} FPS)")]
    FramerateMismatch {
        path: PathBuf,
        expected: f64,
        got: f64,
    },

    #[error("failed to decode frame {index} of {path} after repeated attempts")]
    DecodeFailure { path: PathBuf, index: u64 },

    #[error("invalid region: {0}")]
    Region(#[from] RegionError),

    #[error("encoder binary not found in PATH")]
    EncoderUnavailable,

    #[error("encoder failed: {message}")]
    EncoderFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("scan canceled")]
    Canceled,

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigInvalid(message.into())
    }

    /// Create an encoder failure error.
    pub fn encoder_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::EncoderFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<TimecodeError> for ScanError {
    fn from(err: TimecodeError) -> Self {
        Self::ConfigInvalid(err.to_string())
    }
}
