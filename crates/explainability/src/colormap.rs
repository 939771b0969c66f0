//! Jet palette (dark blue -> cyan -> yellow -> red)

use image::Rgb;

fn channel(x: f32, center: f32) -> u8 {
    let v = (1.5 - (4.0 * x - center).abs()).clamp(0.0, 1.0);
    (v * 255.0).round() as u8
}

/// Continuous jet color for an intensity in [0, 1]
#[must_use]
pub fn jet(value: f32) -> Rgb<u8> {
    let x = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
    Rgb([channel(x, 3.0), channel(x, 2.0), channel(x, 1.0)])
}

/// 256-entry jet lookup table, indexed by quantized intensity
#[derive(Debug, Clone)]
pub struct JetPalette {
    lut: [Rgb<u8>; 256],
}

impl Default for JetPalette {
    fn default() -> Self {
        Self::new()
    }
}

impl JetPalette {
    #[must_use]
    pub fn new() -> Self {
        let mut lut = [Rgb([0, 0, 0]); 256];
        for (i, entry) in lut.iter_mut().enumerate() {
            *entry = jet(i as f32 / 255.0);
        }
        Self { lut }
    }

    /// Color for an intensity in [0, 1], truncated to 8 bits first
    #[must_use]
    pub fn color(&self, value: f32) -> Rgb<u8> {
        let v = if value.is_finite() { value.clamp(0.0, 1.0) } else { 0.0 };
        self.lut[(v * 255.0) as usize]
    }
}
