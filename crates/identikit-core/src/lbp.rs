//! Local binary pattern descriptors and the chi-square distance between them.

use crate::normalizer::NormalizedFace;
use image::GrayImage;
use serde::{Deserialize, Serialize};

const NEIGHBORS: usize = 8;
const BINS: usize = 1 << NEIGHBORS;

/// Bins whose stored mass is at or below this are skipped by [`chi_square`].
pub const CHI_SQUARE_EPSILON: f32 = f32::EPSILON;

/// Descriptor geometry. Two descriptors are only comparable when they were
/// computed with identical parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureParams {
    pub radius: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    pub face_size: u32,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            radius: 1,
            grid_x: 8,
            grid_y: 8,
            face_size: 200,
        }
    }
}

impl FeatureParams {
    /// Number of `f32` values in one descriptor.
    pub fn descriptor_len(&self) -> usize {
        self.grid_x as usize * self.grid_y as usize * BINS
    }

    /// Spatial LBP histogram of a normalized face.
    pub fn describe(&self, face: &NormalizedFace) -> Vec<f32> {
        let codes = lbp_codes(face.image(), self.radius);
        spatial_histogram(&codes, self.grid_x, self.grid_y)
    }
}

/// Circular LBP codes with 8 sampling points at `radius`.
///
/// The output is `(w - 2r) × (h - 2r)`; border pixels without a full
/// neighborhood are dropped. Bit `p` is set when neighbor `p` is at least as
/// bright as the center.
pub fn lbp_codes(gray: &GrayImage, radius: u32) -> GrayImage {
    let r = radius.max(1);
    let (w, h) = gray.dimensions();
    if w <= 2 * r || h <= 2 * r {
        return GrayImage::new(0, 0);
    }
    let (out_w, out_h) = (w - 2 * r, h - 2 * r);
    let raw = gray.as_raw();
    let stride = w as usize;
    let at = |x: usize, y: usize| raw[y * stride + x] as f32;

    // Sampling offsets and bilinear weights are the same for every pixel.
    let taps: Vec<(f32, f32, usize, usize, [f32; 4])> = (0..NEIGHBORS)
        .map(|p| {
            let angle = 2.0 * std::f32::consts::PI * p as f32 / NEIGHBORS as f32;
            let dx = snap(r as f32 * angle.cos());
            let dy = snap(-(r as f32) * angle.sin());
            let fx = dx.floor();
            let fy = dy.floor();
            let tx = dx - fx;
            let ty = dy - fy;
            let weights = [
                (1.0 - tx) * (1.0 - ty),
                tx * (1.0 - ty),
                (1.0 - tx) * ty,
                tx * ty,
            ];
            (fx, fy, tx.ceil() as usize, ty.ceil() as usize, weights)
        })
        .collect();

    let mut out = GrayImage::new(out_w, out_h);
    for y in 0..out_h as usize {
        for x in 0..out_w as usize {
            let cx = x + r as usize;
            let cy = y + r as usize;
            let center = at(cx, cy);
            let mut code = 0u8;
            for (p, &(fx, fy, step_x, step_y, w)) in taps.iter().enumerate() {
                let x0 = (cx as i64 + fx as i64) as usize;
                let y0 = (cy as i64 + fy as i64) as usize;
                let x1 = x0 + step_x;
                let y1 = y0 + step_y;
                let sample =
                    w[0] * at(x0, y0) + w[1] * at(x1, y0) + w[2] * at(x0, y1) + w[3] * at(x1, y1);
                // Tolerance absorbs interpolation error on flat regions.
                if sample - center >= -1e-4 {
                    code |= 1 << p;
                }
            }
            out.put_pixel(x as u32, y as u32, image::Luma([code]));
        }
    }
    out
}

/// Round trig results that land next to an integer so axis-aligned samples
/// never reach past the radius.
fn snap(v: f32) -> f32 {
    if (v - v.round()).abs() < 1e-5 {
        v.round()
    } else {
        v
    }
}

/// Concatenated per-cell 256-bin histograms over a `grid_x × grid_y` grid,
/// each cell normalized to unit mass.
pub fn spatial_histogram(codes: &GrayImage, grid_x: u32, grid_y: u32) -> Vec<f32> {
    let gx = grid_x.max(1) as usize;
    let gy = grid_y.max(1) as usize;
    let mut hist = vec![0f32; gx * gy * BINS];
    let (w, h) = (codes.width() as usize, codes.height() as usize);
    if w == 0 || h == 0 {
        return hist;
    }
    let cell_w = (w / gx).max(1);
    let cell_h = (h / gy).max(1);

    for row in 0..gy {
        for col in 0..gx {
            let cell = &mut hist[(row * gx + col) * BINS..(row * gx + col + 1) * BINS];
            let (y0, x0) = (row * cell_h, col * cell_w);
            let (y1, x1) = ((y0 + cell_h).min(h), (x0 + cell_w).min(w));
            let mut total = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    cell[codes.get_pixel(x as u32, y as u32)[0] as usize] += 1.0;
                    total += 1;
                }
            }
            if total > 0 {
                let inv = 1.0 / total as f32;
                cell.iter_mut().for_each(|v| *v *= inv);
            }
        }
    }
    hist
}

/// Chi-square distance from a stored descriptor to a query.
///
/// `Σ (s - q)² / s` over bins where the stored value exceeds
/// [`CHI_SQUARE_EPSILON`]; accumulated in `f64`. Asymmetric in its arguments.
pub fn chi_square(stored: &[f32], query: &[f32]) -> f64 {
    stored
        .iter()
        .zip(query)
        .filter(|(&s, _)| s > CHI_SQUARE_EPSILON)
        .map(|(&s, &q)| {
            let d = (s - q) as f64;
            d * d / s as f64
        })
        .sum()
}
