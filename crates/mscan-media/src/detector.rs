//! Per-frame motion detection.
//!
//! The pipeline per frame: downscale, grayscale, region mask, background
//! subtraction, morphological opening, score, bounding box, size gates.
//! The detector is stateful (it owns the subtractor model) and must see
//! frames in source order.

use opencv::core::{AlgorithmHint, Mat, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;
use tracing::debug;

use mscan_models::Rect;

use crate::config::{DetectorConfig, KernelSize};
use crate::error::ScanResult;
use crate::mask::RegionMask;
use crate::subtractor::{create_subtractor, Subtractor};

/// Result of processing one frame.
#[derive(Debug, Clone)]
pub struct Detection {
    /// Global frame index this result belongs to.
    pub index: u64,
    /// Fraction of in-region pixels in the foreground mask, scaled to 0-255.
    pub score: f32,
    /// Whether the score passed the threshold and size gates.
    pub has_motion: bool,
    /// Enclosing box of the in-region foreground, in source coordinates.
    /// Absent when the frame has no foreground or failed a gate.
    pub bounding_box: Option<Rect>,
    /// Post-morphology mask at source resolution; only populated when mask
    /// output is enabled.
    pub mask: Option<Mat>,
}

impl Detection {
    /// Placeholder result for frames skipped by `frame_skip`, carrying the
    /// last processed frame's score forward for overlays.
    pub fn carried(index: u64, previous: Option<&Detection>) -> Self {
        Self {
            index,
            score: previous.map(|d| d.score).unwrap_or(0.0),
            has_motion: false,
            bounding_box: previous.and_then(|d| d.bounding_box),
            mask: None,
        }
    }

    /// Copy without the (large) mask preview, for queuing alongside frames.
    pub fn without_mask(&self) -> Self {
        Self {
            index: self.index,
            score: self.score,
            has_motion: self.has_motion,
            bounding_box: self.bounding_box,
            mask: None,
        }
    }
}

pub struct MotionDetector {
    subtractor: Box<dyn Subtractor>,
    mask: RegionMask,
    /// Resolved subsampling factor (>= 1).
    downscale: u32,
    kernel: Option<Mat>,
    learning_rate: f64,
    threshold: f32,
    max_threshold: f32,
    max_area: f32,
    max_width: f32,
    max_height: f32,
    frame_width: i32,
    frame_height: i32,
    keep_mask: bool,
}

impl MotionDetector {
    pub fn new(
        config: &DetectorConfig,
        width: u32,
        height: u32,
        mask: RegionMask,
        keep_mask: bool,
    ) -> ScanResult<Self> {
        let subtractor = create_subtractor(config.kind, config.variance_threshold)?;
        let downscale = match config.downscale_factor {
            0 => auto_downscale(height),
            k => k.max(1),
        };
        let kernel_size = match config.kernel_size {
            KernelSize::Auto => Some(auto_kernel_size(height, downscale)),
            KernelSize::Off => None,
            KernelSize::Size(s) => Some(s),
        };
        let kernel = match kernel_size {
            Some(size) => Some(
                imgproc::get_structuring_element(
                    imgproc::MORPH_RECT,
                    Size::new(size as i32, size as i32),
                    opencv::core::Point::new(-1, -1),
                )?,
            ),
            None => None,
        };
        debug!(
            downscale,
            kernel_size = kernel_size.unwrap_or(0),
            subtractor = %config.kind,
            "motion detector initialized"
        );
        let mask = mask.downscaled(downscale)?;
        Ok(Self {
            subtractor,
            mask,
            downscale,
            kernel,
            learning_rate: config.learning_rate,
            threshold: config.threshold,
            max_threshold: config.max_threshold,
            max_area: config.max_area,
            max_width: config.max_width,
            max_height: config.max_height,
            frame_width: width as i32,
            frame_height: height as i32,
            keep_mask,
        })
    }

    /// Resolved subsampling factor.
    pub fn downscale(&self) -> u32 {
        self.downscale
    }

    /// Run the detection chain on one frame (BGR, source resolution).
    pub fn process(&mut self, frame: &Mat, index: u64) -> ScanResult<Detection> {
        let working = self.downscale_frame(frame)?;

        let mut gray = Mat::default();
        imgproc::cvt_color(
            &working,
            &mut gray,
            imgproc::COLOR_BGR2GRAY,
            0,
            AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;

        let masked = if self.mask.is_all_in() {
            gray
        } else {
            self.mask.apply(&gray)?
        };

        let mut fg = Mat::default();
        self.subtractor.apply(&masked, &mut fg, self.learning_rate)?;

        if let Some(kernel) = &self.kernel {
            let mut opened = Mat::default();
            imgproc::morphology_ex(
                &fg,
                &mut opened,
                imgproc::MORPH_OPEN,
                kernel,
                opencv::core::Point::new(-1, -1),
                1,
                opencv::core::BORDER_CONSTANT,
                Scalar::default(),
            )?;
            fg = opened;
        }

        let (fg_pixels, in_region) = self.mask.count_in_region(&fg)?;
        let active = self.mask.active_pixels();
        let score = if active > 0 {
            255.0 * fg_pixels as f32 / active as f32
        } else {
            0.0
        };

        let mut has_motion = score >= self.threshold && score <= self.max_threshold;

        let bounding_box = if fg_pixels > 0 {
            let raw = imgproc::bounding_rect(in_region.as_ref().unwrap_or(&fg))?;
            let rect = Rect::new(raw.x, raw.y, raw.width, raw.height)
                .scaled(self.downscale as i32)
                .clamp(self.frame_width, self.frame_height);
            // Oversized boxes are usually global changes (lighting, camera
            // shake), not motion.
            let frame_area = (self.frame_width as i64 * self.frame_height as i64) as f32;
            if rect.area() as f32 / frame_area > self.max_area
                || rect.width as f32 / self.frame_width as f32 > self.max_width
                || rect.height as f32 / self.frame_height as f32 > self.max_height
            {
                has_motion = false;
            }
            Some(rect)
        } else {
            None
        };

        let mask = if self.keep_mask {
            let mut full = Mat::default();
            imgproc::resize(
                &fg,
                &mut full,
                Size::new(self.frame_width, self.frame_height),
                0.0,
                0.0,
                imgproc::INTER_NEAREST,
            )?;
            Some(full)
        } else {
            None
        };

        Ok(Detection {
            index,
            score,
            has_motion,
            bounding_box: if has_motion { bounding_box } else { None },
            mask,
        })
    }

    fn downscale_frame(&self, frame: &Mat) -> ScanResult<Mat> {
        if self.downscale <= 1 {
            return Ok(frame.clone());
        }
        let k = self.downscale as i32;
        let mut small = Mat::default();
        imgproc::resize(
            frame,
            &mut small,
            Size::new(
                (frame.cols() + k - 1) / k,
                (frame.rows() + k - 1) / k,
            ),
            0.0,
            0.0,
            imgproc::INTER_NEAREST,
        )?;
        Ok(small)
    }
}

/// Subsampling factor by source height: full rate up to 480p, then 2/3/4.
fn auto_downscale(height: u32) -> u32 {
    match height {
        0..=480 => 1,
        481..=720 => 2,
        721..=1080 => 3,
        _ => 4,
    }
}

/// Kernel side by source height, reduced when downscaling so the absolute
/// filter scale stays constant. Always odd and >= 3.
fn auto_kernel_size(height: u32, downscale: u32) -> u32 {
    let base: u32 = match height {
        0..=480 => 3,
        481..=720 => 5,
        _ => 7,
    };
    if downscale <= 1 {
        return base;
    }
    let mut size = ((base as f64 / downscale as f64).round() as u32).max(3);
    if size % 2 == 0 {
        size += 1;
    }
    size
}

#[cfg(test)]
fn solid_frame(width: i32, height: i32, value: f64) -> Mat {
    Mat::new_rows_cols_with_default(
        height,
        width,
        opencv::core::CV_8UC3,
        Scalar::new(value, value, value, 0.0),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mscan_models::Point;

    fn frame_with_square(width: i32, height: i32, x: i32, y: i32, side: i32) -> Mat {
        let mut frame = solid_frame(width, height, 32.0);
        let roi = opencv::core::Rect::new(x, y, side, side);
        let mut patch = Mat::roi_mut(&mut frame, roi).unwrap();
        patch.set_to(&Scalar::new(255.0, 255.0, 255.0, 0.0), &opencv::core::no_array())
            .unwrap();
        frame
    }

    fn detector(config: &DetectorConfig, width: u32, height: u32) -> MotionDetector {
        let mask = RegionMask::build(&[], width, height).unwrap();
        MotionDetector::new(config, width, height, mask, false).unwrap()
    }

    fn warm_up(det: &mut MotionDetector, width: i32, height: i32, frames: u64) {
        for i in 0..frames {
            det.process(&solid_frame(width, height, 32.0), i).unwrap();
        }
    }

    #[test]
    fn test_static_scene_scores_zero() {
        let config = DetectorConfig {
            threshold: 1.0,
            ..DetectorConfig::default()
        };
        let mut det = detector(&config, 128, 96);
        warm_up(&mut det, 128, 96, 30);
        let result = det
            .process(&solid_frame(128, 96, 32.0), 30)
            .unwrap();
        assert!(result.score < 1.0, "score = {}", result.score);
        assert!(!result.has_motion);
    }

    #[test]
    fn test_square_triggers_motion_with_box() {
        let config = DetectorConfig {
            threshold: 1.0,
            ..DetectorConfig::default()
        };
        let mut det = detector(&config, 128, 96);
        warm_up(&mut det, 128, 96, 30);
        let result = det
            .process(&frame_with_square(128, 96, 40, 24, 32), 30)
            .unwrap();
        assert!(result.has_motion, "score = {}", result.score);
        let rect = result.bounding_box.expect("bounding box expected");
        // The box encloses the bright square, within kernel-size slack.
        assert!(rect.x >= 32 && rect.x <= 44, "rect = {:?}", rect);
        assert!(rect.y >= 16 && rect.y <= 28, "rect = {:?}", rect);
        assert!(rect.right() >= 68 && rect.right() <= 80, "rect = {:?}", rect);
    }

    #[test]
    fn test_region_limits_detection() {
        // Region covers only the left half; motion on the right is invisible.
        let region = vec![
            Point::new(0, 0),
            Point::new(63, 0),
            Point::new(63, 95),
            Point::new(0, 95),
        ];
        let config = DetectorConfig {
            threshold: 1.0,
            ..DetectorConfig::default()
        };
        let mask = RegionMask::build(&[region], 128, 96).unwrap();
        let mut det = MotionDetector::new(&config, 128, 96, mask, false).unwrap();
        warm_up(&mut det, 128, 96, 30);
        let result = det
            .process(&frame_with_square(128, 96, 80, 24, 32), 30)
            .unwrap();
        assert!(!result.has_motion, "score = {}", result.score);
    }

    #[test]
    fn test_max_area_gate() {
        let config = DetectorConfig {
            threshold: 1.0,
            max_area: 0.05,
            ..DetectorConfig::default()
        };
        let mut det = detector(&config, 128, 96);
        warm_up(&mut det, 128, 96, 30);
        // A 48x48 square covers ~19% of the frame, above the 5% cap.
        let result = det
            .process(&frame_with_square(128, 96, 30, 20, 48), 30)
            .unwrap();
        assert!(!result.has_motion);
        assert!(result.score > 1.0, "gate should not zero the score");
    }

    #[test]
    fn test_threshold_above_255_never_fires() {
        let config = DetectorConfig {
            threshold: 256.0,
            ..DetectorConfig::default()
        };
        let mut det = detector(&config, 128, 96);
        warm_up(&mut det, 128, 96, 30);
        let result = det
            .process(&frame_with_square(128, 96, 40, 24, 32), 30)
            .unwrap();
        assert!(!result.has_motion);
    }

    #[test]
    fn test_downscale_maps_box_to_source_coords() {
        let config = DetectorConfig {
            threshold: 1.0,
            downscale_factor: 2,
            kernel_size: KernelSize::Off,
            ..DetectorConfig::default()
        };
        let mut det = detector(&config, 256, 192);
        assert_eq!(det.downscale(), 2);
        warm_up(&mut det, 256, 192, 30);
        let result = det
            .process(&frame_with_square(256, 192, 64, 64, 64), 30)
            .unwrap();
        let rect = result.bounding_box.expect("bounding box expected");
        assert!(rect.x >= 56 && rect.x <= 66, "rect = {:?}", rect);
        assert!(rect.width >= 56 && rect.width <= 72, "rect = {:?}", rect);
    }

    #[test]
    fn test_auto_parameters() {
        assert_eq!(auto_downscale(480), 1);
        assert_eq!(auto_downscale(720), 2);
        assert_eq!(auto_downscale(1080), 3);
        assert_eq!(auto_downscale(2160), 4);
        assert_eq!(auto_kernel_size(480, 1), 3);
        assert_eq!(auto_kernel_size(720, 1), 5);
        assert_eq!(auto_kernel_size(1080, 1), 7);
        // Downscaling shrinks the kernel but never below 3, staying odd.
        assert_eq!(auto_kernel_size(1080, 3), 3);
        assert_eq!(auto_kernel_size(2160, 2), 5);
    }
}
