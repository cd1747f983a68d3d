//! Output sinks: where event frames go.
//!
//! The pipeline only hands sinks frames that belong to an event, bracketed
//! by event-start/event-end calls. Scan-only discards everything, the native
//! sink re-encodes with the OpenCV writer (and owns overlays, thumbnails,
//! and the mask side output), and the ffmpeg sink cuts clips from the
//! original file once an event's bounds are known.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use opencv::core::{AlgorithmHint, Mat, Size, Vector};
use opencv::imgcodecs;
use opencv::imgproc;
use opencv::prelude::*;
use opencv::videoio::VideoWriter;
use tracing::{debug, info, warn};

use mscan_models::{MotionEvent, Timecode};

use crate::config::{OutputConfig, OutputMode, OverlayConfig, ThumbnailMode};
use crate::detector::Detection;
use crate::error::{ScanError, ScanResult};
use crate::ffmpeg::{check_ffmpeg, FfmpegCommand, FfmpegRunner};
use crate::overlay::OverlayRenderer;
use crate::source::Frame;

/// Event clip name: `<stem>.DSME_NNNN.<ext>`, numbered from 0001.
pub fn event_file_name(stem: &str, event_id: u32, ext: &str) -> String {
    format!("{}.DSME_{:04}.{}", stem, event_id, ext)
}

/// Consumes event frames. Methods are called from the encode worker only.
pub trait OutputSink: Send {
    /// A new event began; `event_id` counts from 1.
    fn event_start(&mut self, event_id: u32, start: &Timecode) -> ScanResult<()>;

    /// One frame inside the current event, in source order.
    fn write(&mut self, frame: Frame, detection: &Detection) -> ScanResult<()>;

    /// The current event closed with its final bounds.
    fn event_end(&mut self, event: &MotionEvent) -> ScanResult<()>;

    /// Post-morphology motion mask for one processed frame (side output).
    fn write_mask(&mut self, _mask: &Mat) -> ScanResult<()> {
        Ok(())
    }

    /// End of stream; returns every file written.
    fn finish(&mut self, canceled: bool) -> ScanResult<Vec<PathBuf>>;
}

/// Detects events without writing anything.
pub struct ScanOnlySink;

impl OutputSink for ScanOnlySink {
    fn event_start(&mut self, _event_id: u32, _start: &Timecode) -> ScanResult<()> {
        Ok(())
    }

    fn write(&mut self, _frame: Frame, _detection: &Detection) -> ScanResult<()> {
        Ok(())
    }

    fn event_end(&mut self, _event: &MotionEvent) -> ScanResult<()> {
        Ok(())
    }

    fn finish(&mut self, _canceled: bool) -> ScanResult<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// Re-encodes event frames with the OpenCV video writer.
pub struct NativeSink {
    output_dir: PathBuf,
    stem: String,
    fourcc: i32,
    fps: f64,
    frame_size: Size,
    /// `Some` = everything goes into this one file; `None` = file per event.
    single_output: Option<PathBuf>,
    writer: Option<VideoWriter>,
    current_path: Option<PathBuf>,
    overlay: OverlayRenderer,
    mask_output: Option<PathBuf>,
    mask_writer: Option<VideoWriter>,
    thumbnails: Option<ThumbnailMode>,
    /// Best-scoring frame of the current event, kept pre-overlay.
    best_frame: Option<(f32, Mat)>,
    outputs: Vec<PathBuf>,
    events_written: u32,
}

impl NativeSink {
    pub fn new(
        output: &OutputConfig,
        overlay: &OverlayConfig,
        stem: String,
        width: u32,
        height: u32,
        fps: f64,
        frame_skip: u32,
    ) -> ScanResult<Self> {
        let codec: Vec<char> = output.opencv_codec.chars().collect();
        if codec.len() != 4 {
            return Err(ScanError::config(format!(
                "opencv-codec must be a four character code, got '{}'",
                output.opencv_codec
            )));
        }
        let fourcc = VideoWriter::fourcc(codec[0], codec[1], codec[2], codec[3])?;
        Ok(Self {
            output_dir: output.output_dir.clone(),
            stem,
            fourcc,
            fps,
            frame_size: Size::new(width as i32, height as i32),
            single_output: output.single_output.clone(),
            writer: None,
            current_path: None,
            overlay: OverlayRenderer::new(overlay, fps, frame_skip),
            mask_output: output.mask_output.clone(),
            mask_writer: None,
            thumbnails: output.thumbnails,
            best_frame: None,
            outputs: Vec::new(),
            events_written: 0,
        })
    }

    fn open_writer(&self, path: &Path) -> ScanResult<VideoWriter> {
        let writer = VideoWriter::new(
            &path.to_string_lossy(),
            self.fourcc,
            self.fps,
            self.frame_size,
            true,
        )?;
        if !writer.is_opened()? {
            return Err(ScanError::encoder_failed(
                format!("failed to open video writer for {}", path.display()),
                None,
                None,
            ));
        }
        Ok(writer)
    }

    fn clip_path(&self, event_id: u32) -> PathBuf {
        self.output_dir
            .join(event_file_name(&self.stem, event_id, "avi"))
    }

    fn thumbnail_path(&self, event_id: u32) -> PathBuf {
        self.output_dir
            .join(event_file_name(&self.stem, event_id, "jpg"))
    }
}

impl OutputSink for NativeSink {
    fn event_start(&mut self, event_id: u32, _start: &Timecode) -> ScanResult<()> {
        self.overlay.reset();
        self.best_frame = None;
        match self.single_output.clone() {
            Some(path) => {
                if self.writer.is_none() {
                    self.writer = Some(self.open_writer(&path)?);
                    self.current_path = Some(path);
                }
            }
            None => {
                let path = self.clip_path(event_id);
                debug!("writing event {} to {}", event_id, path.display());
                self.writer = Some(self.open_writer(&path)?);
                self.current_path = Some(path);
            }
        }
        Ok(())
    }

    fn write(&mut self, mut frame: Frame, detection: &Detection) -> ScanResult<()> {
        if self.thumbnails.is_some() {
            let better = self
                .best_frame
                .as_ref()
                .map(|(score, _)| detection.score > *score)
                .unwrap_or(true);
            if better {
                self.best_frame = Some((detection.score, frame.pixels.clone()));
            }
        }
        if !self.overlay.is_empty() {
            self.overlay
                .annotate(&mut frame.pixels, detection, &frame.presentation_time)?;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ScanError::internal("frame written outside of an event"))?;
        writer.write(&frame.pixels)?;
        Ok(())
    }

    fn event_end(&mut self, event: &MotionEvent) -> ScanResult<()> {
        self.events_written += 1;
        let event_id = self.events_written;
        if self.single_output.is_none() {
            if let Some(mut writer) = self.writer.take() {
                writer.release()?;
            }
            if let Some(path) = self.current_path.take() {
                self.outputs.push(path);
            }
        }
        if let Some(ThumbnailMode::Highscore) = self.thumbnails {
            if let Some((_, pixels)) = self.best_frame.take() {
                let path = self.thumbnail_path(event_id);
                imgcodecs::imwrite(&path.to_string_lossy(), &pixels, &Vector::<i32>::new())?;
                info!(
                    "saved thumbnail for event {} (peak frame {}) to {}",
                    event_id,
                    event.peak_frame,
                    path.display()
                );
                self.outputs.push(path);
            }
        }
        Ok(())
    }

    fn write_mask(&mut self, mask: &Mat) -> ScanResult<()> {
        let Some(path) = self.mask_output.clone() else {
            return Ok(());
        };
        if self.mask_writer.is_none() {
            let writer = VideoWriter::new(
                &path.to_string_lossy(),
                self.fourcc,
                self.fps,
                self.frame_size,
                true,
            )?;
            if !writer.is_opened()? {
                return Err(ScanError::encoder_failed(
                    format!("failed to open mask writer for {}", path.display()),
                    None,
                    None,
                ));
            }
            self.mask_writer = Some(writer);
        }
        let mut bgr = Mat::default();
        imgproc::cvt_color(
            mask,
            &mut bgr,
            imgproc::COLOR_GRAY2BGR,
            0,
            AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;
        self.mask_writer
            .as_mut()
            .expect("mask writer opened above")
            .write(&bgr)?;
        Ok(())
    }

    fn finish(&mut self, canceled: bool) -> ScanResult<Vec<PathBuf>> {
        if let Some(mut writer) = self.writer.take() {
            writer.release()?;
        }
        if let Some(mut writer) = self.mask_writer.take() {
            writer.release()?;
            if let Some(path) = &self.mask_output {
                self.outputs.push(path.clone());
            }
        }
        let current_path = self.current_path.take();
        match (&self.single_output, current_path) {
            (Some(_), Some(path)) => {
                if self.events_written == 0 {
                    // No events: leave nothing behind.
                    std::fs::remove_file(&path).ok();
                } else {
                    self.outputs.push(path);
                }
            }
            (None, Some(path)) => {
                // Per-event writer still open means the scan was interrupted
                // mid-event; a partial clip is not useful.
                if canceled {
                    warn!("removing partial clip {}", path.display());
                    std::fs::remove_file(&path).ok();
                } else {
                    self.outputs.push(path);
                }
            }
            _ => {}
        }
        Ok(std::mem::take(&mut self.outputs))
    }
}

/// Cuts event clips from the source file with an external ffmpeg.
pub struct FfmpegSink {
    input: PathBuf,
    output_dir: PathBuf,
    stem: String,
    ext: String,
    input_args: String,
    output_args: String,
    cancel: Arc<AtomicBool>,
    timeout: Option<Duration>,
    outputs: Vec<PathBuf>,
    events_written: u32,
}

impl FfmpegSink {
    pub fn new(
        output: &OutputConfig,
        inputs: &[PathBuf],
        stem: String,
        cancel: Arc<AtomicBool>,
    ) -> ScanResult<Self> {
        // Timestamp-based cutting cannot span file boundaries.
        if inputs.len() != 1 {
            return Err(ScanError::config(
                "ffmpeg and copy output modes only support a single input file",
            ));
        }
        // Fail before scanning rather than at the first event.
        check_ffmpeg()?;
        let input = inputs[0].clone();
        let ext = input
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mp4".to_string());
        let output_args = match output.mode {
            OutputMode::Copy => crate::config::COPY_FFMPEG_OUTPUT_ARGS.to_string(),
            _ => output.ffmpeg_output_args.clone(),
        };
        Ok(Self {
            input,
            output_dir: output.output_dir.clone(),
            stem,
            ext,
            input_args: output.ffmpeg_input_args.clone(),
            output_args,
            cancel,
            timeout: output.encoder_timeout,
            outputs: Vec::new(),
            events_written: 0,
        })
    }
}

impl OutputSink for FfmpegSink {
    fn event_start(&mut self, _event_id: u32, _start: &Timecode) -> ScanResult<()> {
        Ok(())
    }

    fn write(&mut self, _frame: Frame, _detection: &Detection) -> ScanResult<()> {
        // The encoder reads straight from the source file.
        Ok(())
    }

    fn event_end(&mut self, event: &MotionEvent) -> ScanResult<()> {
        self.events_written += 1;
        let path = self
            .output_dir
            .join(event_file_name(&self.stem, self.events_written, &self.ext));
        let start = event.start.seconds();
        let duration = (event.end.seconds() - start).max(0.0);
        info!(
            "extracting event {} ({} -> {}) to {}",
            self.events_written,
            event.start,
            event.end,
            path.display()
        );
        let cmd = FfmpegCommand::new(&self.input, &path)
            .input_args(&self.input_args)
            .seek(start)
            .duration(duration)
            .output_args(&self.output_args);
        let mut runner = FfmpegRunner::new().with_cancel(self.cancel.clone());
        if let Some(timeout) = self.timeout {
            runner = runner.with_timeout(timeout);
        }
        match runner.run(&cmd) {
            Ok(()) => {
                self.outputs.push(path);
                Ok(())
            }
            Err(ScanError::Canceled) => {
                // A cancel mid-encode leaves a partial clip behind.
                std::fs::remove_file(&path).ok();
                warn!("encode of event {} canceled", self.events_written);
                Ok(())
            }
            Err(err) => {
                std::fs::remove_file(&path).ok();
                Err(err)
            }
        }
    }

    fn finish(&mut self, _canceled: bool) -> ScanResult<Vec<PathBuf>> {
        Ok(std::mem::take(&mut self.outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_file_name() {
        assert_eq!(event_file_name("cam1", 1, "avi"), "cam1.DSME_0001.avi");
        assert_eq!(event_file_name("cam1", 123, "mp4"), "cam1.DSME_0123.mp4");
        assert_eq!(
            event_file_name("front door", 10000, "jpg"),
            "front door.DSME_10000.jpg"
        );
    }

    #[test]
    fn test_ffmpeg_sink_rejects_multiple_inputs() {
        let config = OutputConfig {
            mode: OutputMode::Ffmpeg,
            ..OutputConfig::default()
        };
        let inputs = vec![PathBuf::from("a.mp4"), PathBuf::from("b.mp4")];
        let result = FfmpegSink::new(
            &config,
            &inputs,
            "a".to_string(),
            Arc::new(AtomicBool::new(false)),
        );
        assert!(matches!(result, Err(ScanError::ConfigInvalid(_))));
    }

    #[test]
    fn test_native_sink_rejects_bad_codec() {
        let config = OutputConfig {
            opencv_codec: "TOOLONG".to_string(),
            ..OutputConfig::default()
        };
        let result = NativeSink::new(
            &config,
            &OverlayConfig::default(),
            "clip".to_string(),
            640,
            480,
            30.0,
            0,
        );
        assert!(matches!(result, Err(ScanError::ConfigInvalid(_))));
    }
}
