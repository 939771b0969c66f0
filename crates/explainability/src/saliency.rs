//! Grad-CAM saliency computation and resampling

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use ndarray::{Array2, ArrayView3, Axis};
use tracing::debug;

use crate::HookError;

/// Per-location importance for one class, values in [0, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap(Array2<f32>);

impl SaliencyMap {
    /// (height, width)
    #[must_use]
    pub fn dim(&self) -> (usize, usize) {
        self.0.dim()
    }

    #[must_use]
    pub fn values(&self) -> &Array2<f32> {
        &self.0
    }

    /// True when the map carries no signal (max == min before normalization)
    #[must_use]
    pub fn is_degenerate(&self) -> bool {
        self.0.iter().all(|&v| v == 0.0)
    }

    /// Linear (triangle filter) resample to `width` x `height`
    ///
    /// Goes through `image::imageops::resize` on a `Luma<f32>` plane, the same
    /// resampler the preprocessing resize uses.
    #[must_use]
    pub fn upsample(&self, width: u32, height: u32) -> SaliencyMap {
        if width == 0 || height == 0 {
            return SaliencyMap(Array2::zeros((height as usize, width as usize)));
        }

        let (src_h, src_w) = self.0.dim();
        let plane: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(src_w as u32, src_h as u32, |x, y| {
                Luma([self.0[[y as usize, x as usize]]])
            });
        let resized = imageops::resize(&plane, width, height, FilterType::Triangle);

        SaliencyMap(Array2::from_shape_fn(
            (height as usize, width as usize),
            |(y, x)| resized.get_pixel(x as u32, y as u32)[0].clamp(0.0, 1.0),
        ))
    }
}

/// Combine a (C, H, W) activation with the gradient of the class score at it
///
/// Channel weights are the spatial mean of each gradient channel; the map is
/// the rectified weighted sum of activation channels, min-max normalized.
/// A constant map normalizes to all zeros.
///
/// # Errors
/// `HookError::ShapeMismatch` if the arrays differ in shape or are empty
pub fn grad_cam(
    activation: ArrayView3<f32>,
    gradient: ArrayView3<f32>,
) -> Result<SaliencyMap, HookError> {
    let (c, h, w) = activation.dim();
    if gradient.dim() != (c, h, w) || c == 0 || h == 0 || w == 0 {
        return Err(HookError::ShapeMismatch {
            activation: activation.dim(),
            gradient: gradient.dim(),
        });
    }

    let weights = gradient.sum_axis(Axis(2)).sum_axis(Axis(1)) / (h * w) as f32;

    let mut cam = Array2::<f32>::zeros((h, w));
    for (channel, weight) in activation.axis_iter(Axis(0)).zip(weights.iter()) {
        cam.scaled_add(*weight, &channel);
    }
    cam.mapv_inplace(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });

    let (min, max) = cam
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    debug!("Grad-CAM raw range [{:.4}, {:.4}] over {}x{}", min, max, h, w);

    if range > 0.0 {
        cam.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
    } else {
        cam.fill(0.0);
    }
    Ok(SaliencyMap(cam))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_weighted_sum_and_normalization() {
        // Channel 0 carries a ramp, channel 1 a spot; gradient favours channel 0
        let activation = Array3::from_shape_fn((2, 2, 2), |(c, y, x)| {
            if c == 0 {
                (y * 2 + x) as f32
            } else if (y, x) == (0, 0) {
                10.0
            } else {
                0.0
            }
        });
        let gradient = Array3::from_shape_fn((2, 2, 2), |(c, _, _)| if c == 0 { 1.0 } else { 0.0 });

        let map = grad_cam(activation.view(), gradient.view()).unwrap();
        assert_eq!(map.values(), &array![[0.0, 1.0 / 3.0], [2.0 / 3.0, 1.0]]);
    }

    #[test]
    fn test_negative_evidence_is_rectified() {
        let activation = Array3::from_shape_fn((1, 2, 2), |(_, y, x)| (y * 2 + x) as f32);
        let gradient = Array3::from_elem((1, 2, 2), -1.0);

        // Everything negative -> rectified to a constant zero map
        let map = grad_cam(activation.view(), gradient.view()).unwrap();
        assert!(map.is_degenerate());
    }

    #[test]
    fn test_constant_activation_is_degenerate() {
        let activation = Array3::from_elem((3, 4, 4), 0.7);
        let gradient = Array3::from_elem((3, 4, 4), 0.2);
        let map = grad_cam(activation.view(), gradient.view()).unwrap();
        assert_eq!(map.dim(), (4, 4));
        assert!(map.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array3::<f32>::zeros((2, 3, 3));
        let g = Array3::<f32>::zeros((2, 3, 4));
        assert!(matches!(
            grad_cam(a.view(), g.view()),
            Err(HookError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_upsample_preserves_corners_and_bounds() {
        let map = SaliencyMap(array![[0.0, 1.0], [1.0, 0.0]]);
        let up = map.upsample(8, 6);
        assert_eq!(up.dim(), (6, 8));
        assert_eq!(up.values()[[0, 0]], 0.0);
        assert_eq!(up.values()[[0, 7]], 1.0);
        assert_eq!(up.values()[[5, 0]], 1.0);
        assert!(up.values().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_upsample_keeps_ramp_monotonic() {
        let map = SaliencyMap(array![[0.0, 0.5, 1.0], [0.0, 0.5, 1.0]]);
        let up = map.upsample(12, 4);
        for row in up.values().rows() {
            assert!(row.windows(2).into_iter().all(|w| w[0] <= w[1] + 1e-6));
        }
        assert!(up.values()[[0, 0]] < 0.1);
        assert!(up.values()[[0, 11]] > 0.9);
    }

    #[test]
    fn test_upsample_to_same_size_is_identity() {
        let map = SaliencyMap(array![[0.1, 0.9], [0.4, 0.6]]);
        assert_eq!(map.upsample(2, 2), map);
    }

    #[test]
    fn test_upsample_single_cell() {
        let map = SaliencyMap(array![[0.25]]);
        let up = map.upsample(5, 3);
        assert!(up.values().iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }
}
