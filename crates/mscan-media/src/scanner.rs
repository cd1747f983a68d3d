//! The scan controller: validates a configuration, composes the pipeline,
//! and runs it to completion.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use mscan_models::MotionEvent;

use crate::config::{DetectorKind, OutputMode, ScanConfig};
use crate::detector::MotionDetector;
use crate::error::{ScanError, ScanResult};
use crate::mask::RegionMask;
use crate::pipeline::{self, PipelineParams, ScanObserver};
use crate::sink::{FfmpegSink, NativeSink, OutputSink, ScanOnlySink};
use crate::source::{validate_inputs, VideoSource};
use crate::tracker::EventTracker;

/// Everything a finished scan produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub events: Vec<MotionEvent>,
    /// Files written by the output sink, in creation order.
    pub outputs: Vec<PathBuf>,
    pub frames_read: u64,
    pub frames_processed: u64,
    /// True when the scan stopped on a cancel request; the events emitted up
    /// to that point are still valid.
    pub canceled: bool,
    /// Wall-clock processing rate, frames per second.
    pub processing_fps: f64,
}

/// High-level interface to the motion scanning pipeline.
///
/// Re-entrant per instance (one scan at a time), not thread-safe across
/// instances sharing a configuration.
pub struct MotionScanner {
    config: ScanConfig,
    cancel: Arc<AtomicBool>,
    observers: Vec<Arc<dyn ScanObserver>>,
}

impl MotionScanner {
    /// Validate `config` and build a scanner. Everything that can fail
    /// before reading frames fails here.
    pub fn new(config: ScanConfig) -> ScanResult<Self> {
        validate_inputs(&config.inputs)?;

        if config.detector.kind == DetectorKind::Mog2Gpu {
            return Err(ScanError::config(
                "MOG2_CUDA requires a CUDA-enabled OpenCV build, which this binary was not \
                 compiled against",
            ));
        }
        if config.detector.threshold < 0.0 {
            return Err(ScanError::config("threshold must be non-negative"));
        }
        if config.detector.max_threshold < config.detector.threshold {
            return Err(ScanError::config(
                "max-threshold must be greater than or equal to threshold",
            ));
        }
        if !(-1.0..=1.0).contains(&config.detector.learning_rate) {
            return Err(ScanError::config(
                "learning-rate must be between -1 and 1",
            ));
        }
        if config.output.single_output.is_some() {
            if config.inputs.len() != 1 {
                return Err(ScanError::config(
                    "a single output file requires exactly one input",
                ));
            }
            if config.output.mode != OutputMode::Opencv {
                return Err(ScanError::config(
                    "a single output file is only supported in opencv output mode",
                ));
            }
        }
        if matches!(config.output.mode, OutputMode::Ffmpeg | OutputMode::Copy)
            && config.inputs.len() != 1
        {
            return Err(ScanError::config(
                "ffmpeg and copy output modes only support a single input file",
            ));
        }
        for polygon in &config.regions {
            if polygon.len() < 3 {
                return Err(ScanError::Region(
                    mscan_models::RegionError::TooFewPoints(polygon.len()),
                ));
            }
        }

        Ok(Self {
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            observers: Vec::new(),
        })
    }

    /// The shared cancel flag. Raise it (e.g. from a signal handler) to stop
    /// the scan at the next frame boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Register an observer for progress and event callbacks.
    pub fn add_observer(&mut self, observer: Arc<dyn ScanObserver>) {
        self.observers.push(observer);
    }

    /// Run the scan to completion (or cancellation) and return the results.
    pub fn scan(&mut self) -> ScanResult<ScanSummary> {
        let started = Instant::now();
        let mut source = VideoSource::open(&self.config.inputs, self.config.use_pts)?;
        let meta = source.metadata().clone();
        info!(
            "Scanning {} for motion events...",
            if self.config.inputs.len() > 1 {
                format!("{} input videos", self.config.inputs.len())
            } else {
                "input video".to_string()
            }
        );

        // Resolve the scan range against the stream framerate.
        let start_index = match &self.config.start_time {
            Some(value) => value.to_frames(meta.fps),
            None => 0,
        };
        let stop_index = match (&self.config.end_time, &self.config.duration) {
            (Some(end), _) => Some(end.to_frames(meta.fps)),
            (None, Some(duration)) => Some(start_index + duration.to_frames(meta.fps)),
            (None, None) => None,
        };
        if let Some(stop) = stop_index {
            if stop <= start_index {
                return Err(ScanError::config(
                    "scan end position must be after the start position",
                ));
            }
        }
        if start_index > 0 {
            source.seek(start_index)?;
        }

        let keep_mask = self.config.output.mask_output.is_some()
            && self.config.output.mode == OutputMode::Opencv;
        if self.config.output.mask_output.is_some() && !keep_mask {
            warn!("mask output is only supported in opencv output mode, ignoring");
        }

        let mask = RegionMask::build(&self.config.regions, meta.width, meta.height)?;
        let detector =
            MotionDetector::new(&self.config.detector, meta.width, meta.height, mask, keep_mask)?;

        let fps = meta.fps;
        let skip = self.config.detector.frame_skip;
        let tracker = EventTracker::new(
            self.config.tracker.min_event_length.to_frames(fps).max(1),
            self.config.tracker.time_before_event.to_frames(fps),
            self.config.tracker.time_post_event.to_frames(fps).max(1),
            skip,
            start_index,
        );

        let stem = source.first_input_stem();
        let sink: Box<dyn OutputSink> = match self.config.output.mode {
            OutputMode::ScanOnly => Box::new(ScanOnlySink),
            OutputMode::Opencv => Box::new(NativeSink::new(
                &self.config.output,
                &self.config.overlay,
                stem,
                meta.width,
                meta.height,
                fps,
                skip,
            )?),
            OutputMode::Ffmpeg | OutputMode::Copy => Box::new(FfmpegSink::new(
                &self.config.output,
                &self.config.inputs,
                stem,
                self.cancel.clone(),
            )?),
        };

        let params = PipelineParams {
            frame_skip: skip,
            start_index,
            stop_index,
            fps,
            total_frames: stop_index.unwrap_or(meta.total_frames).min(meta.total_frames)
                - start_index.min(meta.total_frames),
        };

        let output = pipeline::run(
            source,
            detector,
            tracker,
            sink,
            params,
            self.cancel.clone(),
            &self.observers,
        )?;

        let elapsed = started.elapsed().as_secs_f64();
        let processing_fps = if elapsed > 0.0 {
            output.frames_read as f64 / elapsed
        } else {
            0.0
        };
        info!(
            "Processed {} frames read in {:.1} secs (avg {:.1} FPS).",
            output.frames_read, elapsed, processing_fps
        );
        if output.events.is_empty() {
            info!("No motion events detected in input.");
        } else {
            info!("Detected {} motion events in input.", output.events.len());
        }

        Ok(ScanSummary {
            events: output.events,
            outputs: output.outputs,
            frames_read: output.frames_read,
            frames_processed: output.frames_processed,
            canceled: output.canceled,
            processing_fps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OutputConfig, TrackerConfig};

    /// A config whose input path exists, so validation reaches the checks
    /// after the input test. The temp file must outlive the config.
    fn config_with_real_input() -> (tempfile::NamedTempFile, ScanConfig) {
        let file = tempfile::Builder::new()
            .suffix(".mp4")
            .tempfile()
            .expect("temp file");
        let config = ScanConfig {
            inputs: vec![file.path().to_path_buf()],
            ..ScanConfig::default()
        };
        (file, config)
    }

    #[test]
    fn test_missing_input_rejected() {
        let config = ScanConfig {
            inputs: vec![PathBuf::from("/no/such/file.mp4")],
            ..ScanConfig::default()
        };
        assert!(matches!(
            MotionScanner::new(config),
            Err(ScanError::InputNotFound(_))
        ));
    }

    #[test]
    fn test_gpu_detector_rejected() {
        let (_file, mut config) = config_with_real_input();
        config.detector.kind = DetectorKind::Mog2Gpu;
        assert!(matches!(
            MotionScanner::new(config),
            Err(ScanError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_single_output_requires_one_input() {
        let (_file, mut config) = config_with_real_input();
        config.inputs.push(config.inputs[0].clone());
        config.output = OutputConfig {
            single_output: Some(PathBuf::from("out.avi")),
            ..OutputConfig::default()
        };
        assert!(matches!(
            MotionScanner::new(config),
            Err(ScanError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_ffmpeg_mode_rejects_multiple_inputs() {
        let (_file, mut config) = config_with_real_input();
        config.inputs.push(config.inputs[0].clone());
        config.output.mode = OutputMode::Ffmpeg;
        assert!(matches!(
            MotionScanner::new(config),
            Err(ScanError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_degenerate_region_rejected() {
        let (_file, mut config) = config_with_real_input();
        config.regions = vec![vec![
            mscan_models::Point::new(0, 0),
            mscan_models::Point::new(1, 1),
        ]];
        assert!(matches!(
            MotionScanner::new(config),
            Err(ScanError::Region(_))
        ));
    }

    #[test]
    fn test_valid_config_accepted() {
        let (_file, mut config) = config_with_real_input();
        config.tracker = TrackerConfig::default();
        config.output.mode = OutputMode::ScanOnly;
        assert!(MotionScanner::new(config).is_ok());
    }
}
