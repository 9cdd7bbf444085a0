//! Face normalization: crop, grayscale, area resize, illumination correction,
//! optional sharpening.
//!
//! Every stored or queried face passes through here, so the output is
//! deterministic and always exactly `face_size × face_size`.

use crate::types::BoundingBox;
use image::{imageops, DynamicImage, GrayImage, Luma};
use thiserror::Error;

/// Fraction of the Laplacian subtracted when sharpening.
pub const SHARPEN_AMOUNT: f32 = 0.15;
/// Gaussian sigma of the denoise pass that precedes sharpening (3x3 scale).
const DENOISE_SIGMA: f32 = 0.8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("face region {0:?} has no area inside the image")]
    DegenerateRegion(BoundingBox),
    #[error("expected a {expected}x{expected} face, got {width}x{height}")]
    WrongSize {
        expected: u32,
        width: u32,
        height: u32,
    },
}

/// Illumination correction applied after resizing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Illumination {
    None,
    /// Global histogram equalization.
    Equalize,
    /// Tiled contrast-limited equalization. `clip_limit` is a fraction of
    /// the tile's pixel count.
    Clahe { tiles: u32, clip_limit: f32 },
}

impl Default for Illumination {
    fn default() -> Self {
        Illumination::Clahe {
            tiles: 8,
            clip_limit: 0.02,
        }
    }
}

/// A canonical-size grayscale face, the unit the classifier consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFace {
    pixels: GrayImage,
}

impl NormalizedFace {
    /// Wrap an already-normalized image (e.g. one loaded from the dataset).
    pub fn from_gray(pixels: GrayImage, face_size: u32) -> Result<Self, NormalizeError> {
        if pixels.width() != face_size || pixels.height() != face_size {
            return Err(NormalizeError::WrongSize {
                expected: face_size,
                width: pixels.width(),
                height: pixels.height(),
            });
        }
        Ok(Self { pixels })
    }

    pub fn size(&self) -> u32 {
        self.pixels.width()
    }

    pub fn image(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn into_image(self) -> GrayImage {
        self.pixels
    }
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    face_size: u32,
    illumination: Illumination,
    sharpen: bool,
}

impl Normalizer {
    pub fn new(face_size: u32, illumination: Illumination) -> Self {
        Self {
            face_size: face_size.max(1),
            illumination,
            sharpen: false,
        }
    }

    /// Denoise and sharpen after illumination correction.
    pub fn with_sharpening(mut self, sharpen: bool) -> Self {
        self.sharpen = sharpen;
        self
    }

    pub fn face_size(&self) -> u32 {
        self.face_size
    }

    /// Crop `bbox` (clamped to the image), convert to grayscale, resize and
    /// correct illumination.
    pub fn normalize(
        &self,
        image: &DynamicImage,
        bbox: &BoundingBox,
    ) -> Result<NormalizedFace, NormalizeError> {
        let region = bbox
            .clamp_to(image.width(), image.height())
            .ok_or(NormalizeError::DegenerateRegion(*bbox))?;

        let gray = image.to_luma8();
        let crop = imageops::crop_imm(
            &gray,
            region.x as u32,
            region.y as u32,
            region.width,
            region.height,
        )
        .to_image();

        let mut face = resize_area(&crop, self.face_size, self.face_size);
        match self.illumination {
            Illumination::None => {}
            Illumination::Equalize => {
                face = imageproc::contrast::equalize_histogram(&face);
            }
            Illumination::Clahe { tiles, clip_limit } => {
                clahe_enhance(&mut face, tiles, clip_limit);
            }
        }
        if self.sharpen {
            face = sharpen(&face, SHARPEN_AMOUNT);
        }

        Ok(NormalizedFace { pixels: face })
    }
}

/// Light Gaussian denoise, then subtract `amount` times the Laplacian.
/// Results are folded to their magnitude and saturated to `u8`.
pub fn sharpen(img: &GrayImage, amount: f32) -> GrayImage {
    let blurred = imageproc::filter::gaussian_blur_f32(img, DENOISE_SIGMA);
    let laplacian = imageproc::filter::laplacian_filter(&blurred);
    GrayImage::from_fn(blurred.width(), blurred.height(), |x, y| {
        let v = blurred.get_pixel(x, y)[0] as f32 - amount * laplacian.get_pixel(x, y)[0] as f32;
        Luma([v.abs().round().min(255.0) as u8])
    })
}

/// Per-axis resampling taps: for each destination index, the source indices
/// it covers and the fraction of the destination pixel each one fills.
fn area_taps(src: u32, dst: u32) -> Vec<Vec<(usize, f32)>> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|d| {
            let start = d as f64 * scale;
            let end = start + scale;
            let mut taps = Vec::with_capacity(scale.ceil() as usize + 1);
            let mut s = start.floor() as usize;
            while (s as f64) < end && s < src as usize {
                let lo = start.max(s as f64);
                let hi = end.min(s as f64 + 1.0);
                if hi > lo {
                    taps.push((s, ((hi - lo) / scale) as f32));
                }
                s += 1;
            }
            taps
        })
        .collect()
}

/// Resize by averaging the source area each destination pixel covers.
///
/// Downscaling behaves as a box filter; upscaling degrades to linear blending
/// between the (at most two) source pixels a destination pixel overlaps.
pub fn resize_area(src: &GrayImage, dst_w: u32, dst_h: u32) -> GrayImage {
    let (src_w, src_h) = src.dimensions();
    if src_w == dst_w && src_h == dst_h {
        return src.clone();
    }
    let x_taps = area_taps(src_w, dst_w);
    let y_taps = area_taps(src_h, dst_h);
    let raw = src.as_raw();
    let sw = src_w as usize;

    // Horizontal pass: src_h rows of dst_w floats.
    let mut rows = vec![0f32; dst_w as usize * src_h as usize];
    for y in 0..src_h as usize {
        for (dx, taps) in x_taps.iter().enumerate() {
            rows[y * dst_w as usize + dx] = taps
                .iter()
                .map(|&(sx, w)| raw[y * sw + sx] as f32 * w)
                .sum();
        }
    }

    let mut out = GrayImage::new(dst_w, dst_h);
    for (dy, taps) in y_taps.iter().enumerate() {
        for dx in 0..dst_w as usize {
            let v: f32 = taps
                .iter()
                .map(|&(sy, w)| rows[sy * dst_w as usize + dx] * w)
                .sum();
            out.put_pixel(dx as u32, dy as u32, image::Luma([v.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place.
///
/// Divides the image into a `tiles × tiles` grid, clips each tile histogram
/// at `clip_limit × tile pixels`, redistributes the excess, and blends the
/// neighboring tile CDFs bilinearly.
pub fn clahe_enhance(gray: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let t = tiles.max(1) as usize;
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;
    let clip = ((clip_limit * tile_pixels as f32) as u32).max(1);

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray.get_pixel(x as u32, y as u32)[0] as usize] += 1;
                }
            }

            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist + u32::from(i < leftover);
            }

            let mut cdf = [0f32; 256];
            let mut acc = 0f32;
            for (i, &count) in hist.iter().enumerate() {
                acc += count as f32;
                cdf[i] = acc;
            }
            let cdf_min = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let r1 = (r0 + 1).min(t - 1);
        let dy = fy - r0 as f32;
        for x in 0..w {
            let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
            let c0 = fx as usize;
            let c1 = (c0 + 1).min(t - 1);
            let dx = fx - c0 as f32;

            let p = gray.get_pixel(x as u32, y as u32)[0] as usize;
            let top = cdfs[r0 * t + c0][p] * (1.0 - dx) + cdfs[r0 * t + c1][p] * dx;
            let bot = cdfs[r1 * t + c0][p] * (1.0 - dx) + cdfs[r1 * t + c1][p] * dx;
            let val = top * (1.0 - dy) + bot * dy;
            gray.put_pixel(x as u32, y as u32, image::Luma([val.round().clamp(0.0, 255.0) as u8]));
        }
    }
}
