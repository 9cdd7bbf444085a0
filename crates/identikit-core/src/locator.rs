//! Face location: pick the primary face region in an arbitrary image.

use crate::cascade::{DetectParams, Detection, HaarCascade};
use crate::types::BoundingBox;
use image::{DynamicImage, GrayImage};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocatorError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
}

/// Geometry a detection must satisfy to count as a face.
#[derive(Debug, Clone)]
pub struct Acceptance {
    pub min_aspect: f32,
    pub max_aspect: f32,
}

impl Default for Acceptance {
    fn default() -> Self {
        Self {
            min_aspect: 0.7,
            max_aspect: 1.4,
        }
    }
}

/// Finds face regions in grayscale frames.
///
/// Implementors supply [`detect`](Self::detect); [`locate`](Self::locate)
/// validates the input, converts it to grayscale and chooses the primary face.
pub trait FaceLocator: Send + Sync {
    /// All detections in `gray`, in any order.
    fn detect(&self, gray: &GrayImage) -> Vec<Detection>;

    /// Acceptance rule applied to every detection.
    fn acceptance(&self) -> Acceptance {
        Acceptance::default()
    }

    /// Strongest face in `image`, or `None` when no region qualifies.
    fn locate(&self, image: &DynamicImage) -> Result<Option<BoundingBox>, LocatorError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(LocatorError::InvalidImage(format!(
                "degenerate {}x{} image",
                image.width(),
                image.height()
            )));
        }
        let gray = image.to_luma8();
        let acceptance = self.acceptance();
        let detections: Vec<Detection> = self
            .detect(&gray)
            .into_iter()
            .filter(|d| {
                let aspect = d.bbox.aspect_ratio();
                d.bbox.area() > 0 && aspect >= acceptance.min_aspect && aspect <= acceptance.max_aspect
            })
            .collect();
        tracing::debug!(count = detections.len(), "face candidates");
        Ok(primary_face(&detections))
    }
}

/// Highest neighbor count wins; ties go to the larger area, then to the
/// earlier detection.
///
/// Area alone would let a large, weakly supported window (a textured
/// background patch that a few scales accept) displace a face the cascade
/// confirmed at many neighboring positions; area only separates faces with
/// equal support.
pub fn primary_face(detections: &[Detection]) -> Option<BoundingBox> {
    detections
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            a.neighbors
                .cmp(&b.neighbors)
                .then(a.bbox.area().cmp(&b.bbox.area()))
                .then(ib.cmp(ia))
        })
        .map(|(_, d)| d.bbox)
}

/// Haar-cascade locator with optional histogram equalization before the scan.
pub struct CascadeLocator {
    cascade: HaarCascade,
    params: DetectParams,
    acceptance: Acceptance,
    equalize: bool,
}

impl CascadeLocator {
    pub fn new(cascade: HaarCascade, params: DetectParams) -> Self {
        Self {
            cascade,
            params,
            acceptance: Acceptance::default(),
            equalize: true,
        }
    }

    pub fn with_acceptance(mut self, acceptance: Acceptance) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn with_equalization(mut self, equalize: bool) -> Self {
        self.equalize = equalize;
        self
    }
}

impl FaceLocator for CascadeLocator {
    fn detect(&self, gray: &GrayImage) -> Vec<Detection> {
        if self.equalize {
            let equalized = imageproc::contrast::equalize_histogram(gray);
            self.cascade.detect(&equalized, &self.params)
        } else {
            self.cascade.detect(gray, &self.params)
        }
    }

    fn acceptance(&self) -> Acceptance {
        self.acceptance.clone()
    }
}
