#![allow(dead_code)]

use identikit_core::{BoundingBox, Detection, FaceLocator};
use identikit_engine::config::IlluminationKind;
use identikit_engine::Config;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use rand::{Rng, SeedableRng};
use std::io::Cursor;
use std::path::Path;

/// Finds one centered "face" in any image that is not a single flat color.
pub struct FakeLocator;

impl FaceLocator for FakeLocator {
    fn detect(&self, gray: &GrayImage) -> Vec<Detection> {
        let first = gray.get_pixel(0, 0)[0];
        if gray.pixels().all(|p| p[0] == first) {
            return Vec::new();
        }
        let (w, h) = gray.dimensions();
        vec![Detection {
            bbox: BoundingBox::new((w / 8) as i32, (h / 8) as i32, w * 3 / 4, h * 3 / 4),
            neighbors: 10,
        }]
    }
}

pub fn config(dir: &Path) -> Config {
    let mut config = Config {
        data_dir: dir.to_path_buf(),
        ..Config::default()
    };
    // One crop at the enrollment padding, so a re-submitted image matches
    // its own sample exactly.
    config.detection.crop_variants = vec![config.detection.crop_padding];
    config.normalization.face_size = 32;
    config.normalization.illumination = IlluminationKind::Clahe;
    config.normalization.clahe_tiles = 4;
    config.recognition.grid_x = 4;
    config.recognition.grid_y = 4;
    config.recognition.adaptive_margin = 0.0;
    config
}

fn png(img: GrayImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

/// Random texture; one seed per distinct "person".
pub fn face_png(seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    png(GrayImage::from_fn(64, 64, |_, _| Luma([rng.gen()])))
}

/// Flat image the fake locator finds nothing in.
pub fn blank_png() -> Vec<u8> {
    png(GrayImage::from_pixel(64, 64, Luma([128])))
}

pub fn garbage() -> Vec<u8> {
    b"definitely not an image".to_vec()
}
