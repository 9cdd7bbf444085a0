//! Inference: locate → crop variants → normalize → classify → vote →
//! resolve → threshold.

use crate::error::EngineError;
use identikit_core::{
    BoundingBox, Classification, Distance, FaceLocator, Label, LabelId, LabelMetadata,
    NormalizeError, NormalizedFace, Normalizer, Recognizer,
};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::sync::Arc;

/// How an inference call ended. Only `Recognized` carries a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Recognized,
    /// Nearest label is farther than its threshold.
    AboveThreshold,
    NoFace,
    /// Nothing to match against.
    Untrained,
    /// Nearest entry belongs to a label that no longer exists as trained.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub outcome: Outcome,
    pub label: Option<Label>,
    pub distance: Option<Distance>,
    /// Threshold the distance was compared against.
    pub threshold: f64,
    pub bbox: Option<BoundingBox>,
    pub metadata: Option<LabelMetadata>,
}

impl Inference {
    fn unknown(outcome: Outcome, threshold: f64) -> Self {
        Self {
            outcome,
            label: None,
            distance: None,
            threshold,
            bbox: None,
            metadata: None,
        }
    }
}

/// A located and normalized face.
#[derive(Debug, Clone)]
pub struct PreparedFace {
    pub bbox: BoundingBox,
    pub face: NormalizedFace,
}

/// How several crops of one located face combine into one answer.
#[derive(Debug, Clone, PartialEq)]
pub struct CropVoting {
    /// Padding fractions around the located face, one crop each.
    pub paddings: Vec<f32>,
    /// Without a majority, the closest crop must be at least this far under
    /// its label's threshold.
    pub fallback_margin: f64,
}

/// Nearest label for one crop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vote {
    pub id: LabelId,
    pub distance: Distance,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// The winning label, with its mean in-threshold distance when chosen by
    /// majority or the single closest distance when chosen by fallback.
    Accepted(Vote),
    /// Nothing qualified; carries the closest crop.
    Rejected(Vote),
}

/// Combine per-crop votes.
///
/// A crop votes for its nearest label when the distance is within that
/// label's threshold. The label with the most votes wins, provided it has at
/// least two (or one, when only one crop was taken); equal counts go to the
/// lower mean distance, then the lower id. Otherwise the closest crop is
/// accepted only if it clears its threshold by `fallback_margin`.
pub fn tally(
    votes: &[Vote],
    threshold_for: impl Fn(LabelId) -> f64,
    fallback_margin: f64,
) -> Option<Verdict> {
    let best = votes
        .iter()
        .copied()
        .min_by(|a, b| a.distance.value().total_cmp(&b.distance.value()))?;

    let mut within: BTreeMap<LabelId, Vec<f64>> = BTreeMap::new();
    for vote in votes {
        if vote.distance.is_within(threshold_for(vote.id)) {
            within.entry(vote.id).or_default().push(vote.distance.value());
        }
    }
    let quorum = votes.len().min(2);
    let mut chosen: Option<(LabelId, usize, f64)> = None;
    for (&id, distances) in &within {
        let count = distances.len();
        if count < quorum {
            continue;
        }
        let mean = distances.iter().sum::<f64>() / count as f64;
        let better = match chosen {
            None => true,
            Some((_, n, m)) => count > n || (count == n && mean < m),
        };
        if better {
            chosen = Some((id, count, mean));
        }
    }

    if let Some((id, _, mean)) = chosen {
        return Some(Verdict::Accepted(Vote {
            id,
            distance: Distance::new(mean),
        }));
    }
    if best
        .distance
        .is_within(threshold_for(best.id) - fallback_margin)
    {
        Some(Verdict::Accepted(best))
    } else {
        Some(Verdict::Rejected(best))
    }
}

/// Read-only inference pipeline shared by every caller.
pub struct Orchestrator {
    locator: Arc<dyn FaceLocator>,
    normalizer: Normalizer,
    crop_padding: f32,
    voting: CropVoting,
    threshold: f64,
    recognizer: Arc<Recognizer>,
}

impl Orchestrator {
    pub fn new(
        locator: Arc<dyn FaceLocator>,
        normalizer: Normalizer,
        crop_padding: f32,
        threshold: f64,
        recognizer: Arc<Recognizer>,
    ) -> Self {
        Self {
            locator,
            normalizer,
            crop_padding,
            voting: CropVoting {
                paddings: vec![crop_padding],
                fallback_margin: 0.0,
            },
            threshold,
            recognizer,
        }
    }

    /// Classify several crops per query and vote instead of using the
    /// enrollment crop alone.
    pub fn with_voting(mut self, voting: CropVoting) -> Self {
        self.voting = voting;
        self
    }

    pub fn recognizer(&self) -> &Arc<Recognizer> {
        &self.recognizer
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Locate the primary face and normalize the enrollment crop around it.
    /// `None` when no usable face is found.
    pub fn prepare(&self, image: &DynamicImage) -> Result<Option<PreparedFace>, EngineError> {
        let Some(bbox) = self.locator.locate(image)? else {
            return Ok(None);
        };
        let face = self.crop(image, &bbox, self.crop_padding)?;
        Ok(face.map(|face| PreparedFace { bbox, face }))
    }

    fn crop(
        &self,
        image: &DynamicImage,
        bbox: &BoundingBox,
        padding: f32,
    ) -> Result<Option<NormalizedFace>, EngineError> {
        let region = bbox
            .expand(padding, image.width(), image.height())
            .unwrap_or(*bbox);
        match self.normalizer.normalize(image, &region) {
            Ok(face) => Ok(Some(face)),
            Err(NormalizeError::DegenerateRegion(region)) => {
                tracing::debug!(?region, padding, "face crop has no area");
                Ok(None)
            }
            Err(e) => Err(EngineError::InvalidImage(e.to_string())),
        }
    }

    /// Decode `bytes` and run inference on the result.
    pub fn infer_bytes(&self, bytes: &[u8]) -> Result<Inference, EngineError> {
        let image = decode_image(bytes)?;
        self.infer(&image)
    }

    pub fn infer(&self, image: &DynamicImage) -> Result<Inference, EngineError> {
        let live = self.recognizer.snapshot();
        if !live.is_trained() {
            return Ok(Inference::unknown(Outcome::Untrained, self.threshold));
        }

        let Some(located) = self.locator.locate(image)? else {
            return Ok(Inference::unknown(Outcome::NoFace, self.threshold));
        };
        let bbox = Some(located);

        let mut votes = Vec::with_capacity(self.voting.paddings.len());
        for &padding in &self.voting.paddings {
            let Some(face) = self.crop(image, &located, padding)? else {
                continue;
            };
            match live.classify(&face) {
                Classification::Nearest { id, distance } => votes.push(Vote { id, distance }),
                Classification::NoCandidates => {
                    return Ok(Inference {
                        bbox,
                        ..Inference::unknown(Outcome::Untrained, self.threshold)
                    });
                }
            }
        }

        let verdict = tally(
            &votes,
            |id| live.threshold_for(id, self.threshold),
            self.voting.fallback_margin,
        );
        let (Vote { id, distance }, accepted) = match verdict {
            Some(Verdict::Accepted(vote)) => (vote, true),
            Some(Verdict::Rejected(vote)) => (vote, false),
            None => return Ok(Inference::unknown(Outcome::NoFace, self.threshold)),
        };
        tracing::trace!(crops = votes.len(), %id, %distance, accepted, "crop votes tallied");

        let Some(label) = live.resolve(id) else {
            return Ok(Inference {
                distance: Some(distance),
                bbox,
                ..Inference::unknown(Outcome::Stale, self.threshold)
            });
        };

        let threshold = live.threshold_for(id, self.threshold);
        if !accepted {
            tracing::debug!(%label, %distance, threshold, "no crop accepted within threshold");
            return Ok(Inference {
                distance: Some(distance),
                bbox,
                ..Inference::unknown(Outcome::AboveThreshold, threshold)
            });
        }

        tracing::debug!(%label, %distance, threshold, "face recognized");
        Ok(Inference {
            outcome: Outcome::Recognized,
            label: Some(label.clone()),
            distance: Some(distance),
            threshold,
            bbox,
            metadata: live.metadata(label).cloned(),
        })
    }
}

/// Decode an encoded image (any format `image` recognizes).
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, EngineError> {
    let image = image::load_from_memory(bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(EngineError::InvalidImage("image has no pixels".into()));
    }
    Ok(image)
}
