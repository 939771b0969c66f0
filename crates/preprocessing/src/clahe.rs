//! Contrast-limited adaptive histogram equalization on an 8-bit plane
//!
//! The plane is split into a `cols x rows` grid of tiles. Each tile gets a
//! clipped, redistributed histogram and a cumulative lookup table; every output
//! pixel is a bilinear blend of the four nearest tile LUTs, so tile seams do
//! not show.

use image::GrayImage;

const BINS: usize = 256;

/// CLAHE parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    /// Clip limit relative to the uniform bin height of a tile
    pub clip_limit: f32,
    /// Tile grid (columns, rows)
    pub tile_grid: (u32, u32),
}

impl Clahe {
    #[must_use]
    pub fn new(clip_limit: f32, tile_grid: (u32, u32)) -> Self {
        Self {
            clip_limit,
            tile_grid,
        }
    }

    /// Equalize a single-channel image
    #[must_use]
    pub fn apply(&self, plane: &GrayImage) -> GrayImage {
        let (width, height) = plane.dimensions();
        if width == 0 || height == 0 {
            return plane.clone();
        }

        let (cols, tile_w) = tiling(width as usize, self.tile_grid.0 as usize);
        let (rows, tile_h) = tiling(height as usize, self.tile_grid.1 as usize);

        let luts = self.tile_luts(plane, cols, rows, tile_w, tile_h);

        GrayImage::from_fn(width, height, |x, y| {
            let (tx1, tx2, xa) = neighbours(x as usize, tile_w, cols);
            let (ty1, ty2, ya) = neighbours(y as usize, tile_h, rows);
            let v = plane.get_pixel(x, y)[0] as usize;

            let top = f32::from(luts[ty1 * cols + tx1][v]) * (1.0 - xa)
                + f32::from(luts[ty1 * cols + tx2][v]) * xa;
            let bottom = f32::from(luts[ty2 * cols + tx1][v]) * (1.0 - xa)
                + f32::from(luts[ty2 * cols + tx2][v]) * xa;

            image::Luma([(top * (1.0 - ya) + bottom * ya).round().clamp(0.0, 255.0) as u8])
        })
    }

    fn tile_luts(
        &self,
        plane: &GrayImage,
        cols: usize,
        rows: usize,
        tile_w: usize,
        tile_h: usize,
    ) -> Vec<[u8; BINS]> {
        let (width, height) = (plane.width() as usize, plane.height() as usize);
        let mut luts = Vec::with_capacity(cols * rows);

        for ty in 0..rows {
            for tx in 0..cols {
                let x0 = (tx * tile_w).min(width);
                let x1 = ((tx + 1) * tile_w).min(width);
                let y0 = (ty * tile_h).min(height);
                let y1 = ((ty + 1) * tile_h).min(height);

                let mut hist = [0u32; BINS];
                for y in y0..y1 {
                    for x in x0..x1 {
                        hist[plane.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                    }
                }

                let area = ((x1 - x0) * (y1 - y0)) as u32;
                luts.push(self.lut_from_histogram(hist, area));
            }
        }

        luts
    }

    fn lut_from_histogram(&self, mut hist: [u32; BINS], area: u32) -> [u8; BINS] {
        let mut lut = [0u8; BINS];
        let limit = ((self.clip_limit * area as f32 / BINS as f32) as u32).max(1);
        clip_histogram(&mut hist, limit);

        let scale = 255.0 / area as f32;
        let mut cumulative = 0u32;
        for (bin, count) in hist.iter().enumerate() {
            cumulative += count;
            lut[bin] = (cumulative as f32 * scale).round().min(255.0) as u8;
        }
        lut
    }
}

/// Clip every bin at `limit` and spread the excess evenly over all bins
fn clip_histogram(hist: &mut [u32; BINS], limit: u32) {
    let mut excess = 0u32;
    for count in hist.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }

    let batch = excess / BINS as u32;
    let residual = (excess % BINS as u32) as usize;
    for count in hist.iter_mut() {
        *count += batch;
    }
    if residual > 0 {
        let step = (BINS / residual).max(1);
        for count in hist.iter_mut().step_by(step).take(residual) {
            *count += 1;
        }
    }
}

/// Tile count and tile length along one axis
///
/// Tiles are `ceil(len / requested)` long; the count is then recomputed so
/// that every tile holds at least one pixel. A grid that does not divide the
/// plane ends in one shorter tile instead of trailing empty ones.
fn tiling(len: usize, requested: usize) -> (usize, usize) {
    let tile = len.div_ceil(requested.clamp(1, len));
    (len.div_ceil(tile), tile)
}

/// Indices of the two tiles bracketing `pos` along one axis and the blend weight
#[inline]
fn neighbours(pos: usize, tile: usize, count: usize) -> (usize, usize, f32) {
    let f = pos as f32 / tile as f32 - 0.5;
    let lo = f.floor();
    let weight = f - lo;
    let lo = lo as isize;
    let first = lo.clamp(0, count as isize - 1) as usize;
    let second = (lo + 1).clamp(0, count as isize - 1) as usize;
    (first, second, weight)
}
