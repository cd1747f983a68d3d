//! Frame overlays: timecode, frame metrics, and the smoothed bounding box.
//!
//! Overlays are drawn only when re-encoding with the native writer; the
//! external encoder path never decodes frames for writing.

use opencv::core::{Mat, Point as CvPoint, Rect as CvRect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;

use mscan_models::{Rect, Rgb, Timecode};

use crate::config::OverlayConfig;
use crate::detector::Detection;
use crate::error::ScanResult;

/// OpenCV wants BGR ordering.
fn scalar_from(color: Rgb) -> Scalar {
    Scalar::new(color.b as f64, color.g as f64, color.r as f64, 0.0)
}

/// Horizontal anchor for text overlays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    TopLeft,
    TopRight,
}

/// Renders a line of text on a filled background rectangle.
struct TextOverlay {
    font_scale: f64,
    thickness: i32,
    margin: i32,
    border: i32,
    color: Scalar,
    bg_color: Scalar,
    anchor: Anchor,
}

impl TextOverlay {
    fn new(config: &OverlayConfig, anchor: Anchor) -> Self {
        Self {
            font_scale: config.text_font_scale,
            thickness: config.text_font_thickness,
            margin: config.text_margin,
            border: config.text_border,
            color: scalar_from(config.text_font_color),
            bg_color: scalar_from(config.text_bg_color),
            anchor,
        }
    }

    fn draw(&self, frame: &mut Mat, text: &str) -> ScanResult<()> {
        let mut baseline = 0;
        let size = imgproc::get_text_size(
            text,
            imgproc::FONT_HERSHEY_SIMPLEX,
            self.font_scale,
            self.thickness,
            &mut baseline,
        )?;
        let box_width = size.width + 2 * self.border;
        let box_height = size.height + baseline + 2 * self.border;
        let x = match self.anchor {
            Anchor::TopLeft => self.margin,
            Anchor::TopRight => (frame.cols() - self.margin - box_width).max(0),
        };
        let y = self.margin;
        imgproc::rectangle(
            frame,
            CvRect::new(x, y, box_width, box_height),
            self.bg_color,
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            frame,
            text,
            CvPoint::new(x + self.border, y + self.border + size.height),
            imgproc::FONT_HERSHEY_SIMPLEX,
            self.font_scale,
            self.color,
            self.thickness,
            imgproc::LINE_8,
            false,
        )?;
        Ok(())
    }
}

/// Draws the motion bounding box, temporally smoothed with an exponential
/// moving average so it does not jitter frame to frame.
struct BoundingBoxOverlay {
    color: Scalar,
    thickness_ratio: f64,
    min_size_ratio: f64,
    /// EMA coefficient from the smooth time constant and frame interval.
    alpha: f64,
    /// Smoothed box as (x, y, w, h) in floats; `None` until the first box.
    smoothed: Option<[f64; 4]>,
}

impl BoundingBoxOverlay {
    fn new(config: &OverlayConfig, fps: f64, frame_skip: u32) -> Self {
        let smooth_secs = config.bounding_box_smooth_time.to_seconds(fps);
        // Frame skip stretches the interval between drawn boxes.
        let dt = (frame_skip as f64 + 1.0) / fps;
        let alpha = if smooth_secs > 0.0 {
            1.0 - (-dt / smooth_secs).exp()
        } else {
            1.0
        };
        Self {
            color: scalar_from(config.bounding_box_color),
            thickness_ratio: config.bounding_box_thickness,
            min_size_ratio: config.bounding_box_min_size,
            alpha,
            smoothed: None,
        }
    }

    /// Fold the frame's raw box into the smoothed state. With no raw box the
    /// smoothed box shrinks in place and disappears once it collapses.
    fn update(&mut self, raw: Option<Rect>) -> Option<Rect> {
        let target = match (raw, self.smoothed) {
            (Some(rect), _) => [
                rect.x as f64,
                rect.y as f64,
                rect.width as f64,
                rect.height as f64,
            ],
            (None, Some(prev)) => [
                prev[0] + prev[2] / 2.0,
                prev[1] + prev[3] / 2.0,
                0.0,
                0.0,
            ],
            (None, None) => return None,
        };
        let next = match self.smoothed {
            Some(prev) => {
                let mut out = [0.0; 4];
                for i in 0..4 {
                    out[i] = self.alpha * target[i] + (1.0 - self.alpha) * prev[i];
                }
                out
            }
            None => target,
        };
        if next[2] < 1.0 || next[3] < 1.0 {
            self.smoothed = None;
            return None;
        }
        self.smoothed = Some(next);
        Some(Rect::new(
            next[0].round() as i32,
            next[1].round() as i32,
            next[2].round() as i32,
            next[3].round() as i32,
        ))
    }

    fn clear(&mut self) {
        self.smoothed = None;
    }

    fn draw(&self, frame: &mut Mat, rect: Rect) -> ScanResult<()> {
        let max_side = frame.cols().max(frame.rows());
        let thickness = ((self.thickness_ratio * max_side as f64 / 2.0).round() as i32 * 2).max(2);
        // Pad undersized boxes up to the minimum drawable side length.
        let min_side = ((self.min_size_ratio * max_side as f64).round() as i32).max(1);
        let pad_x = (min_side - rect.width).max(0);
        let pad_y = (min_side - rect.height).max(0);
        let top_left = CvPoint::new((rect.x - pad_x / 2).max(0), (rect.y - pad_y / 2).max(0));
        let bottom_right = CvPoint::new(
            (rect.right() + pad_x / 2).max(0),
            (rect.bottom() + pad_y / 2).max(0),
        );
        imgproc::rectangle(
            frame,
            CvRect::new(
                top_left.x,
                top_left.y,
                bottom_right.x - top_left.x,
                bottom_right.y - top_left.y,
            ),
            self.color,
            thickness,
            imgproc::LINE_8,
            0,
        )?;
        Ok(())
    }
}

/// Applies the enabled overlays to outgoing event frames.
pub struct OverlayRenderer {
    timecode: Option<TextOverlay>,
    metrics: Option<TextOverlay>,
    bounding_box: Option<BoundingBoxOverlay>,
}

impl OverlayRenderer {
    pub fn new(config: &OverlayConfig, fps: f64, frame_skip: u32) -> Self {
        Self {
            timecode: config
                .time_code
                .then(|| TextOverlay::new(config, Anchor::TopLeft)),
            metrics: config
                .frame_metrics
                .then(|| TextOverlay::new(config, Anchor::TopRight)),
            bounding_box: config
                .bounding_box
                .then(|| BoundingBoxOverlay::new(config, fps, frame_skip)),
        }
    }

    /// True when no overlay is enabled, letting the sink skip frame clones.
    pub fn is_empty(&self) -> bool {
        self.timecode.is_none() && self.metrics.is_none() && self.bounding_box.is_none()
    }

    /// Draw all enabled overlays onto `frame`.
    pub fn annotate(
        &mut self,
        frame: &mut Mat,
        detection: &Detection,
        time: &Timecode,
    ) -> ScanResult<()> {
        if let Some(bbox) = &mut self.bounding_box {
            if let Some(rect) = bbox.update(detection.bounding_box) {
                bbox.draw(frame, rect)?;
            }
        }
        if let Some(timecode) = &self.timecode {
            timecode.draw(frame, &time.format(3))?;
        }
        if let Some(metrics) = &self.metrics {
            metrics.draw(
                frame,
                &format!("frame={}  score={:.2}", detection.index, detection.score),
            )?;
        }
        Ok(())
    }

    /// Reset temporal state between events.
    pub fn reset(&mut self) {
        if let Some(bbox) = &mut self.bounding_box {
            bbox.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smoother(smooth_secs: f64) -> BoundingBoxOverlay {
        let config = OverlayConfig {
            bounding_box: true,
            bounding_box_smooth_time: mscan_models::TimeValue::Seconds(smooth_secs),
            ..OverlayConfig::default()
        };
        BoundingBoxOverlay::new(&config, 30.0, 0)
    }

    #[test]
    fn test_no_smoothing_passes_box_through() {
        let mut bbox = smoother(0.0);
        let rect = Rect::new(10, 20, 30, 40);
        assert_eq!(bbox.update(Some(rect)), Some(rect));
    }

    #[test]
    fn test_smoothing_converges() {
        let mut bbox = smoother(0.1);
        let first = Rect::new(0, 0, 10, 10);
        assert_eq!(bbox.update(Some(first)), Some(first));
        let target = Rect::new(90, 90, 10, 10);
        let mut last = first;
        for _ in 0..60 {
            last = bbox.update(Some(target)).unwrap();
        }
        // Two seconds of a 0.1 s time constant: effectively converged.
        assert!((last.x - target.x).abs() <= 1, "last = {:?}", last);
        assert!((last.y - target.y).abs() <= 1, "last = {:?}", last);
    }

    #[test]
    fn test_box_decays_and_disappears() {
        let mut bbox = smoother(0.05);
        bbox.update(Some(Rect::new(50, 50, 20, 20)));
        let mut gone = false;
        for _ in 0..90 {
            if bbox.update(None).is_none() {
                gone = true;
                break;
            }
        }
        assert!(gone, "smoothed box never decayed away");
    }

    #[test]
    fn test_no_box_without_input() {
        let mut bbox = smoother(0.1);
        assert_eq!(bbox.update(None), None);
    }

    #[test]
    fn test_renderer_empty_when_disabled() {
        let renderer = OverlayRenderer::new(&OverlayConfig::default(), 30.0, 0);
        assert!(renderer.is_empty());
    }
}
