//! Background subtraction backends.
//!
//! Both implementations are OpenCV-backed; the trait keeps the detector
//! independent of which one is in use.

use opencv::bgsegm;
use opencv::core::{Mat, Ptr};
use opencv::prelude::*;
use opencv::video::{self, BackgroundSubtractorTrait};

use crate::config::DetectorKind;
use crate::error::{ScanError, ScanResult};

/// MOG2 model history length, in frames.
const MOG2_HISTORY: i32 = 500;
/// CNT pixel stability window, in frames (assumes ~15 FPS footage minimum).
const CNT_MIN_PIXEL_STABILITY: i32 = 15;
const CNT_MAX_PIXEL_STABILITY: i32 = 15 * 60;

/// Maps successive frames to foreground masks. Stateful; owned by the
/// detector for the lifetime of one scan.
pub trait Subtractor: Send {
    /// Compute the foreground mask of `frame`, updating the model.
    /// `learning_rate` follows OpenCV semantics: -1 automatic, 0 frozen,
    /// 1 reinitialize from the last frame.
    fn apply(&mut self, frame: &Mat, fgmask: &mut Mat, learning_rate: f64) -> ScanResult<()>;
}

/// Gaussian-mixture background subtractor.
pub struct Mog2Subtractor {
    inner: Ptr<video::BackgroundSubtractorMOG2>,
}

impl Mog2Subtractor {
    pub fn new(variance_threshold: f64) -> ScanResult<Self> {
        let mut inner =
            video::create_background_subtractor_mog2(MOG2_HISTORY, variance_threshold, false)?;
        // Default shadow value is 127; force 0 so shadows never count as
        // foreground even if shadow detection gets enabled upstream.
        inner.set_shadow_value(0)?;
        Ok(Self { inner })
    }
}

impl Subtractor for Mog2Subtractor {
    fn apply(&mut self, frame: &Mat, fgmask: &mut Mat, learning_rate: f64) -> ScanResult<()> {
        BackgroundSubtractorTrait::apply(&mut self.inner, frame, fgmask, learning_rate)?;
        Ok(())
    }
}

/// Counting-based background subtractor. Faster than MOG2 on low-power
/// hardware; ignores the variance threshold.
pub struct CntSubtractor {
    inner: Ptr<bgsegm::BackgroundSubtractorCNT>,
}

impl CntSubtractor {
    pub fn new() -> ScanResult<Self> {
        let inner = bgsegm::create_background_subtractor_cnt(
            CNT_MIN_PIXEL_STABILITY,
            true,
            CNT_MAX_PIXEL_STABILITY,
            true,
        )?;
        Ok(Self { inner })
    }
}

impl Subtractor for CntSubtractor {
    fn apply(&mut self, frame: &Mat, fgmask: &mut Mat, learning_rate: f64) -> ScanResult<()> {
        BackgroundSubtractorTrait::apply(&mut self.inner, frame, fgmask, learning_rate)?;
        Ok(())
    }
}

/// Create the subtractor for `kind`.
///
/// `Mog2Gpu` is not available in this build and is rejected here, which
/// surfaces the problem before any frame is read.
pub fn create_subtractor(
    kind: DetectorKind,
    variance_threshold: f64,
) -> ScanResult<Box<dyn Subtractor>> {
    match kind {
        DetectorKind::Mog2 => Ok(Box::new(Mog2Subtractor::new(variance_threshold)?)),
        DetectorKind::Cnt => Ok(Box::new(CntSubtractor::new()?)),
        DetectorKind::Mog2Gpu => Err(ScanError::config(
            "MOG2_CUDA requires a CUDA-enabled OpenCV build, which this binary was not \
             compiled against",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Scalar, CV_8UC1};

    fn gray_frame(value: f64) -> Mat {
        Mat::new_rows_cols_with_default(32, 32, CV_8UC1, Scalar::all(value)).unwrap()
    }

    #[test]
    fn test_mog2_settles_on_static_input() {
        let mut sub = Mog2Subtractor::new(16.0).unwrap();
        let frame = gray_frame(128.0);
        let mut fgmask = Mat::default();
        for _ in 0..30 {
            sub.apply(&frame, &mut fgmask, -1.0).unwrap();
        }
        let foreground = opencv::core::count_non_zero(&fgmask).unwrap();
        assert_eq!(foreground, 0, "static input still reported as foreground");
    }

    #[test]
    fn test_mog2_flags_changed_pixels() {
        let mut sub = Mog2Subtractor::new(16.0).unwrap();
        let mut fgmask = Mat::default();
        for _ in 0..30 {
            sub.apply(&gray_frame(128.0), &mut fgmask, -1.0).unwrap();
        }
        sub.apply(&gray_frame(255.0), &mut fgmask, -1.0).unwrap();
        let foreground = opencv::core::count_non_zero(&fgmask).unwrap();
        assert!(foreground > 900, "foreground = {}", foreground);
    }

    #[test]
    fn test_gpu_kind_rejected() {
        assert!(matches!(
            create_subtractor(DetectorKind::Mog2Gpu, 16.0),
            Err(ScanError::ConfigInvalid(_))
        ));
    }
}
