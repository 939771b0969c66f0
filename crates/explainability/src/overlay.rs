//! Heatmap rendering over the visualization image

use image::{Rgb, RgbImage};
use retina_common::{BlendedImage, VisualizationImage};

use crate::colormap::JetPalette;
use crate::saliency::SaliencyMap;

/// Upsample `saliency` to the base image, colorize and alpha-blend
///
/// `alpha` is the heatmap weight; the base keeps `1 - alpha`. Both images are
/// RGB, so the palette color is composited channel for channel.
#[must_use]
pub fn overlay(saliency: &SaliencyMap, base: &VisualizationImage, alpha: f32) -> BlendedImage {
    let (width, height) = base.dimensions();
    let heat = saliency.upsample(width, height);
    let palette = JetPalette::new();
    let a = alpha.clamp(0.0, 1.0);
    let base = base.as_rgb();

    let blended = RgbImage::from_fn(width, height, |x, y| {
        let Rgb(hot) = palette.color(heat.values()[[y as usize, x as usize]]);
        let Rgb(under) = *base.get_pixel(x, y);
        Rgb([
            blend(under[0], hot[0], a),
            blend(under[1], hot[1], a),
            blend(under[2], hot[2], a),
        ])
    });
    BlendedImage::new(blended)
}

/// Colorized saliency alone, without a base image
#[must_use]
pub fn colorize(saliency: &SaliencyMap, width: u32, height: u32) -> RgbImage {
    let heat = saliency.upsample(width, height);
    let palette = JetPalette::new();
    RgbImage::from_fn(width, height, |x, y| {
        palette.color(heat.values()[[y as usize, x as usize]])
    })
}

fn blend(base: u8, heat: u8, alpha: f32) -> u8 {
    ((1.0 - alpha) * f32::from(base) + alpha * f32::from(heat))
        .round()
        .clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saliency::grad_cam;
    use ndarray::Array3;

    fn zero_map(size: usize) -> SaliencyMap {
        let flat = Array3::<f32>::zeros((1, size, size));
        grad_cam(flat.view(), flat.view()).unwrap()
    }

    #[test]
    fn test_blend_weights() {
        assert_eq!(blend(100, 200, 0.5), 150);
        assert_eq!(blend(100, 200, 0.0), 100);
        assert_eq!(blend(100, 200, 1.0), 200);
        assert_eq!(blend(255, 255, 0.5), 255);
    }

    #[test]
    fn test_degenerate_map_renders_cold() {
        let base = VisualizationImage::new(RgbImage::from_pixel(16, 12, Rgb([128, 128, 128])));
        let out = overlay(&zero_map(4), &base, 0.5);

        assert_eq!(out.dimensions(), (16, 12));
        // gray (128) blended with jet(0) = (0, 0, 128)
        assert!(out.as_rgb().pixels().all(|p| *p == Rgb([64, 64, 128])));
    }

    #[test]
    fn test_colorize_dimensions() {
        let img = colorize(&zero_map(7), 30, 20);
        assert_eq!(img.dimensions(), (30, 20));
        assert!(img.pixels().all(|p| *p == Rgb([0, 0, 128])));
    }
}
