//! Region mask rasterization.
//!
//! Polygons are filled individually and OR-ed into a single-channel 0/255
//! mask. An empty region list means the whole frame is active.

use opencv::core::{self, Mat, Point as CvPoint, Scalar, Size, Vector, CV_8UC1};
use opencv::imgproc;
use opencv::prelude::*;

use mscan_models::Polygon;

use crate::error::ScanResult;

/// Binary mask limiting detection to a set of polygons.
///
/// `mat` is `None` when no regions were supplied, meaning every pixel is
/// active; this skips the masking work entirely in the per-frame path.
pub struct RegionMask {
    mat: Option<Mat>,
    width: i32,
    height: i32,
    active_pixels: i32,
}

impl RegionMask {
    /// Rasterize `regions` into a mask for a `width` x `height` frame.
    /// Polygons reaching outside the frame are clipped by the fill.
    pub fn build(regions: &[Polygon], width: u32, height: u32) -> ScanResult<Self> {
        let (width, height) = (width as i32, height as i32);
        if regions.is_empty() {
            return Ok(Self {
                mat: None,
                width,
                height,
                active_pixels: width * height,
            });
        }
        let mut mat = Mat::new_rows_cols_with_default(height, width, CV_8UC1, Scalar::all(0.0))?;
        for polygon in regions {
            let points: Vector<CvPoint> = polygon
                .iter()
                .map(|p| CvPoint::new(p.x, p.y))
                .collect();
            let shapes: Vector<Vector<CvPoint>> = Vector::from_iter([points]);
            imgproc::fill_poly(
                &mut mat,
                &shapes,
                Scalar::all(255.0),
                imgproc::LINE_4,
                0,
                CvPoint::new(0, 0),
            )?;
        }
        let active_pixels = core::count_non_zero(&mat)?;
        Ok(Self {
            mat: Some(mat),
            width,
            height,
            active_pixels,
        })
    }

    /// Subsample the mask by an integer stride so it matches the detector's
    /// working resolution.
    pub fn downscaled(&self, factor: u32) -> ScanResult<Self> {
        if factor <= 1 {
            return Ok(self.shallow_copy());
        }
        let factor = factor as i32;
        let width = (self.width + factor - 1) / factor;
        let height = (self.height + factor - 1) / factor;
        let Some(mat) = &self.mat else {
            return Ok(Self {
                mat: None,
                width,
                height,
                active_pixels: width * height,
            });
        };
        let mut scaled = Mat::default();
        imgproc::resize(
            mat,
            &mut scaled,
            Size::new(width, height),
            0.0,
            0.0,
            imgproc::INTER_NEAREST,
        )?;
        let active_pixels = core::count_non_zero(&scaled)?;
        Ok(Self {
            mat: Some(scaled),
            width,
            height,
            active_pixels,
        })
    }

    /// Zero out-of-region pixels of `src`.
    pub fn apply(&self, src: &Mat) -> ScanResult<Mat> {
        match &self.mat {
            None => Ok(src.clone()),
            Some(mask) => {
                let mut out =
                    Mat::new_rows_cols_with_default(src.rows(), src.cols(), src.typ(), Scalar::all(0.0))?;
                src.copy_to_masked(&mut out, mask)?;
                Ok(out)
            }
        }
    }

    /// Count non-zero pixels of `fg` that fall inside the region. Also
    /// returns the in-region foreground when masking was needed (`None`
    /// means `fg` itself is already fully in-region).
    pub fn count_in_region(&self, fg: &Mat) -> ScanResult<(i32, Option<Mat>)> {
        match &self.mat {
            None => Ok((core::count_non_zero(fg)?, None)),
            Some(mask) => {
                let mut masked = Mat::default();
                core::bitwise_and(fg, mask, &mut masked, &core::no_array())?;
                let count = core::count_non_zero(&masked)?;
                Ok((count, Some(masked)))
            }
        }
    }

    /// Number of active (in-region) pixels at this mask's resolution.
    pub fn active_pixels(&self) -> i32 {
        self.active_pixels
    }

    pub fn is_all_in(&self) -> bool {
        self.mat.is_none()
    }

    fn shallow_copy(&self) -> Self {
        Self {
            mat: self.mat.clone(),
            width: self.width,
            height: self.height,
            active_pixels: self.active_pixels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mscan_models::Point;

    fn square(x: i32, y: i32, side: i32) -> Polygon {
        vec![
            Point::new(x, y),
            Point::new(x + side, y),
            Point::new(x + side, y + side),
            Point::new(x, y + side),
        ]
    }

    #[test]
    fn test_empty_region_is_all_in() {
        let mask = RegionMask::build(&[], 64, 48).unwrap();
        assert!(mask.is_all_in());
        assert_eq!(mask.active_pixels(), 64 * 48);
    }

    #[test]
    fn test_polygon_coverage() {
        let mask = RegionMask::build(&[square(0, 0, 16)], 64, 64).unwrap();
        // Scanline fill includes the boundary, so expect roughly 16x16 pixels.
        let active = mask.active_pixels();
        assert!((256..=289).contains(&active), "active = {}", active);
    }

    #[test]
    fn test_polygons_are_or_ed() {
        let one = RegionMask::build(&[square(0, 0, 16)], 64, 64)
            .unwrap()
            .active_pixels();
        let two = RegionMask::build(&[square(0, 0, 16), square(32, 32, 16)], 64, 64)
            .unwrap()
            .active_pixels();
        assert_eq!(two, one * 2);
        // Overlapping polygons cover no extra pixels.
        let overlapping = RegionMask::build(&[square(0, 0, 16), square(0, 0, 16)], 64, 64)
            .unwrap()
            .active_pixels();
        assert_eq!(overlapping, one);
    }

    #[test]
    fn test_rotation_invariance() {
        let polygon = vec![
            Point::new(5, 5),
            Point::new(40, 8),
            Point::new(33, 50),
            Point::new(2, 30),
        ];
        let reference = RegionMask::build(&[polygon.clone()], 64, 64)
            .unwrap()
            .active_pixels();
        for shift in 1..polygon.len() {
            let mut rotated = polygon.clone();
            rotated.rotate_left(shift);
            let active = RegionMask::build(&[rotated], 64, 64).unwrap().active_pixels();
            assert_eq!(active, reference, "rotation by {} changed the mask", shift);
        }
    }

    #[test]
    fn test_out_of_frame_polygon_is_clipped() {
        let mask = RegionMask::build(&[square(56, 56, 32)], 64, 64).unwrap();
        assert!(mask.active_pixels() <= 9 * 9);
        assert!(mask.active_pixels() > 0);
    }

    #[test]
    fn test_downscale() {
        let mask = RegionMask::build(&[square(0, 0, 32)], 64, 64).unwrap();
        let small = mask.downscaled(2).unwrap();
        assert!(!small.is_all_in());
        let active = small.active_pixels();
        assert!((256..=324).contains(&active), "active = {}", active);
    }
}
