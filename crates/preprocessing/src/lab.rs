//! sRGB <-> CIE L*a*b* (D65) for the lightness-only CLAHE step
//!
//! Lightness is kept as `f32` in [0, 100]; `lightness_to_u8` / `u8_to_lightness`
//! map it onto the 8-bit plane CLAHE operates on (L * 255 / 100).

use image::Rgb;
use palette::{FromColor, IntoColor, LinSrgb, Srgb};

pub use palette::Lab;

/// Convert an 8-bit sRGB pixel to L*a*b*
#[must_use]
pub fn rgb_to_lab(pixel: Rgb<u8>) -> Lab {
    let srgb: Srgb<f32> = Srgb::new(pixel[0], pixel[1], pixel[2]).into_format();
    let linear: LinSrgb<f32> = srgb.into_linear();
    Lab::from_color(linear)
}

/// Convert L*a*b* back to an 8-bit sRGB pixel, saturating out-of-gamut values
#[must_use]
pub fn lab_to_rgb(lab: Lab) -> Rgb<u8> {
    let linear: LinSrgb<f32> = lab.into_color();
    let srgb: Srgb<f32> = Srgb::from_linear(linear);
    Rgb([srgb.red, srgb.green, srgb.blue].map(|c| (c.clamp(0.0, 1.0) * 255.0).round() as u8))
}

/// Replace the lightness of `lab`, keeping its chroma
#[inline]
#[must_use]
pub fn with_lightness(lab: Lab, l: f32) -> Lab {
    Lab::new(l, lab.a, lab.b)
}

/// Quantize lightness [0, 100] onto an 8-bit plane
#[inline]
#[must_use]
pub fn lightness_to_u8(l: f32) -> u8 {
    (l * 255.0 / 100.0).round().clamp(0.0, 255.0) as u8
}

#[inline]
#[must_use]
pub fn u8_to_lightness(v: u8) -> f32 {
    f32::from(v) * 100.0 / 255.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_black_and_white() {
        let black = rgb_to_lab(Rgb([0, 0, 0]));
        assert!(black.l.abs() < 1e-3);

        let white = rgb_to_lab(Rgb([255, 255, 255]));
        assert!((white.l - 100.0).abs() < 0.05);
        assert!(white.a.abs() < 0.1);
        assert!(white.b.abs() < 0.1);
    }

    #[test]
    fn test_gray_is_neutral() {
        let gray = rgb_to_lab(Rgb([128, 128, 128]));
        assert!((gray.l - 53.59).abs() < 0.2);
        assert!(gray.a.abs() < 0.1);
        assert!(gray.b.abs() < 0.1);
    }

    #[test]
    fn test_red_has_positive_a() {
        let red = rgb_to_lab(Rgb([255, 0, 0]));
        assert!((red.l - 53.24).abs() < 0.3);
        assert!(red.a > 75.0);
        assert!(red.b > 60.0);
    }

    #[test]
    fn test_conversion_is_reversible() {
        for pixel in [
            Rgb([0u8, 0, 0]),
            Rgb([255, 255, 255]),
            Rgb([200, 30, 40]),
            Rgb([12, 180, 90]),
            Rgb([70, 60, 220]),
            Rgb([143, 87, 33]),
        ] {
            let back = lab_to_rgb(rgb_to_lab(pixel));
            for c in 0..3 {
                let diff = (i16::from(back[c]) - i16::from(pixel[c])).abs();
                assert!(diff <= 1, "{pixel:?} -> {back:?}");
            }
        }
    }

    #[test]
    fn test_with_lightness_keeps_chroma() {
        let lab = rgb_to_lab(Rgb([200, 30, 40]));
        let brighter = with_lightness(lab, 80.0);
        assert_eq!(brighter.l, 80.0);
        assert_eq!(brighter.a, lab.a);
        assert_eq!(brighter.b, lab.b);
    }

    #[test]
    fn test_lightness_quantization() {
        assert_eq!(lightness_to_u8(0.0), 0);
        assert_eq!(lightness_to_u8(100.0), 255);
        assert_eq!(lightness_to_u8(150.0), 255);
        assert!((u8_to_lightness(255) - 100.0).abs() < 1e-4);
    }
}
