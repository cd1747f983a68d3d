//! Video input: an ordered list of files presented as one contiguous stream.
//!
//! All inputs must share resolution and framerate with the first file. The
//! global frame index keeps counting across file boundaries, so timecodes
//! refer to the virtual concatenated stream.

use std::path::{Path, PathBuf};

use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{
    VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
    CAP_PROP_FRAME_WIDTH, CAP_PROP_POS_FRAMES, CAP_PROP_POS_MSEC,
};
use tracing::{debug, info, warn};

use mscan_models::Timecode;

use crate::error::{ScanError, ScanResult};

/// Framerates within this delta are considered equal; container metadata is
/// rarely exact.
const FRAMERATE_TOLERANCE: f64 = 0.1;

/// Consecutive decode failures tolerated before the scan aborts.
const MAX_DECODE_FAILURES: u32 = 5;

/// Stream parameters established by the first input file.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Total frame estimate across all inputs; containers may be off by a
    /// few frames.
    pub total_frames: u64,
}

/// One decoded frame of the virtual stream.
pub struct Frame {
    /// Global index, contiguous across input files.
    pub index: u64,
    /// BGR pixel data at source resolution.
    pub pixels: Mat,
    /// Presentation time: `index / fps`, or the container timestamp when
    /// `use_pts` is on.
    pub presentation_time: Timecode,
}

pub struct VideoSource {
    paths: Vec<PathBuf>,
    caps: Vec<VideoCapture>,
    /// Per-file frame count estimates, aligned with `caps`.
    frame_counts: Vec<u64>,
    current: usize,
    metadata: Metadata,
    /// Global index of the next frame `read` will return.
    position: u64,
    /// Milliseconds of stream time contributed by already-finished files.
    pts_offset_ms: f64,
    consecutive_failures: u32,
    use_pts: bool,
}

impl VideoSource {
    /// Open all inputs and validate they form one coherent stream.
    pub fn open(paths: &[PathBuf], use_pts: bool) -> ScanResult<Self> {
        assert!(!paths.is_empty(), "VideoSource requires at least one input");
        let mut caps = Vec::with_capacity(paths.len());
        let mut frame_counts = Vec::with_capacity(paths.len());
        let mut metadata: Option<Metadata> = None;

        for path in paths {
            if !path.is_file() {
                return Err(ScanError::InputNotFound(path.clone()));
            }
            let path_str = path.to_string_lossy();
            let cap = VideoCapture::from_file(&path_str, CAP_ANY)?;
            if !cap.is_opened()? {
                return Err(ScanError::InputNotFound(path.clone()));
            }
            let width = cap.get(CAP_PROP_FRAME_WIDTH)? as u32;
            let height = cap.get(CAP_PROP_FRAME_HEIGHT)? as u32;
            let fps = cap.get(CAP_PROP_FPS)?;
            let frames = cap.get(CAP_PROP_FRAME_COUNT)?.max(0.0) as u64;
            if width == 0 || height == 0 || fps <= 0.0 {
                return Err(ScanError::config(format!(
                    "could not read video parameters from {}",
                    path.display()
                )));
            }
            match &mut metadata {
                None => {
                    info!(
                        "Opened video {} ({} x {} at {:.3} FPS).",
                        path.display(),
                        width,
                        height,
                        fps
                    );
                    metadata = Some(Metadata {
                        width,
                        height,
                        fps,
                        total_frames: frames,
                    });
                }
                Some(meta) => {
                    if (width, height) != (meta.width, meta.height) {
                        return Err(ScanError::ResolutionMismatch {
                            path: path.clone(),
                            width: meta.width,
                            height: meta.height,
                            got_width: width,
                            got_height: height,
                        });
                    }
                    if (fps - meta.fps).abs() > FRAMERATE_TOLERANCE {
                        return Err(ScanError::FramerateMismatch {
                            path: path.clone(),
                            expected: meta.fps,
                            got: fps,
                        });
                    }
                    info!("Appended video {}.", path.display());
                    meta.total_frames += frames;
                }
            }
            caps.push(cap);
            frame_counts.push(frames);
        }

        Ok(Self {
            paths: paths.to_vec(),
            caps,
            frame_counts,
            current: 0,
            metadata: metadata.expect("at least one input"),
            position: 0,
            pts_offset_ms: 0.0,
            consecutive_failures: 0,
            use_pts,
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Stem of the first input, used to name output clips.
    pub fn first_input_stem(&self) -> String {
        self.paths[0]
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string())
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Decode the next frame, or `None` at end of stream.
    pub fn read(&mut self) -> ScanResult<Option<Frame>> {
        loop {
            if self.current >= self.caps.len() {
                return Ok(None);
            }
            let pts_ms = if self.use_pts {
                self.caps[self.current].get(CAP_PROP_POS_MSEC).unwrap_or(0.0)
            } else {
                0.0
            };
            let mut pixels = Mat::default();
            let ok = self.caps[self.current].read(&mut pixels)?;
            if ok && !pixels.empty() {
                self.consecutive_failures = 0;
                let index = self.position;
                self.position += 1;
                let presentation_time = if self.use_pts {
                    Timecode::from_seconds(
                        (self.pts_offset_ms + pts_ms) / 1000.0,
                        self.metadata.fps,
                    )
                } else {
                    Timecode::new(index, self.metadata.fps)
                };
                return Ok(Some(Frame {
                    index,
                    pixels,
                    presentation_time,
                }));
            }

            let cap_pos = self.caps[self.current].get(CAP_PROP_POS_FRAMES)?.max(0.0) as u64;
            let expected = self.frame_counts[self.current];
            if expected == 0 || cap_pos + 1 >= expected {
                // Clean end of this file; continue with the next one.
                self.advance_file()?;
                continue;
            }

            // Mid-file decode failure: skip the frame but keep counting it.
            self.consecutive_failures += 1;
            warn!(
                index = self.position,
                failures = self.consecutive_failures,
                "failed to decode frame, skipping"
            );
            if self.consecutive_failures > MAX_DECODE_FAILURES {
                return Err(ScanError::DecodeFailure {
                    path: self.paths[self.current].clone(),
                    index: self.position,
                });
            }
            self.position += 1;
            self.caps[self.current].set(CAP_PROP_POS_FRAMES, (cap_pos + 1) as f64)?;
        }
    }

    /// Position the stream so the next `read` returns `target`. Only used
    /// before scanning starts, so seeking backwards is not supported.
    pub fn seek(&mut self, target: u64) -> ScanResult<()> {
        let mut remaining = target;
        let mut file = 0;
        while file < self.frame_counts.len()
            && self.frame_counts[file] > 0
            && remaining >= self.frame_counts[file]
        {
            remaining -= self.frame_counts[file];
            self.pts_offset_ms +=
                self.frame_counts[file] as f64 * 1000.0 / self.metadata.fps;
            file += 1;
        }
        if file >= self.caps.len() {
            // Past the end: let the next read report end of stream.
            self.current = self.caps.len();
            self.position = target;
            return Ok(());
        }

        self.current = file;
        let cap = &mut self.caps[file];
        cap.set(CAP_PROP_POS_FRAMES, remaining as f64)?;
        let landed = cap.get(CAP_PROP_POS_FRAMES)?.max(0.0) as u64;
        if landed != remaining {
            // Container cannot seek exactly; decode forward from wherever
            // the keyframe seek landed, discarding frames.
            debug!(target = remaining, landed, "inexact seek, decoding forward");
            if landed > remaining {
                cap.set(CAP_PROP_POS_FRAMES, 0.0)?;
            }
            let mut pos = cap.get(CAP_PROP_POS_FRAMES)?.max(0.0) as u64;
            while pos < remaining {
                if !cap.grab()? {
                    break;
                }
                pos += 1;
            }
        }
        self.position = target;
        Ok(())
    }

    fn advance_file(&mut self) -> ScanResult<()> {
        if let Some(count) = self.frame_counts.get(self.current) {
            self.pts_offset_ms += *count as f64 * 1000.0 / self.metadata.fps;
        }
        self.current += 1;
        if self.current < self.paths.len() {
            info!(
                "Processing complete, opening next video: {}",
                self.paths[self.current].display()
            );
        } else {
            debug!("no more input to process");
        }
        Ok(())
    }
}

/// Reject input sets whose parameters cannot be validated without opening
/// them (used by the controller for early checks).
pub fn validate_inputs(paths: &[PathBuf]) -> ScanResult<()> {
    if paths.is_empty() {
        return Err(ScanError::config("at least one input file is required"));
    }
    for path in paths {
        if !Path::new(path).is_file() {
            return Err(ScanError::InputNotFound(path.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_input_rejected() {
        let missing = PathBuf::from("/definitely/not/here.mp4");
        assert!(matches!(
            VideoSource::open(&[missing.clone()], false),
            Err(ScanError::InputNotFound(p)) if p == missing
        ));
        assert!(matches!(
            validate_inputs(&[missing.clone()]),
            Err(ScanError::InputNotFound(_))
        ));
    }

    #[test]
    fn test_empty_input_list_rejected() {
        assert!(matches!(
            validate_inputs(&[]),
            Err(ScanError::ConfigInvalid(_))
        ));
    }
}
