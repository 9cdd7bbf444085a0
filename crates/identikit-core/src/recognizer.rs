//! Live model holder and nearest-neighbor classification.

use crate::lbp::chi_square;
use crate::normalizer::NormalizedFace;
use crate::registry::LabelRegistry;
use crate::trainer::Artifact;
use crate::types::{Distance, Label, LabelId, LabelMetadata};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Nearest training entry for a query face.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Classification {
    Nearest { id: LabelId, distance: Distance },
    /// Nothing to compare against: the artifact is untrained or no label
    /// meets the minimum sample count.
    NoCandidates,
}

impl Classification {
    pub fn distance(&self) -> Distance {
        match self {
            Classification::Nearest { distance, .. } => *distance,
            Classification::NoCandidates => Distance::INFINITE,
        }
    }
}

/// Everything inference reads, published as one immutable snapshot.
#[derive(Debug, Clone)]
pub struct LiveModel {
    pub artifact: Arc<Artifact>,
    pub registry: LabelRegistry,
    pub metadata: BTreeMap<Label, LabelMetadata>,
    /// Labels with fewer trained samples are not matched.
    pub min_samples: u32,
}

impl LiveModel {
    pub fn new(artifact: Arc<Artifact>, registry: LabelRegistry, min_samples: u32) -> Self {
        Self {
            artifact,
            registry,
            metadata: BTreeMap::new(),
            min_samples,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<Label, LabelMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_trained(&self) -> bool {
        self.artifact.is_trained()
    }

    /// Minimum chi-square distance over the eligible entries. Ties keep the
    /// lowest `(label id, sample id)`.
    pub fn classify(&self, face: &NormalizedFace) -> Classification {
        if !self.artifact.is_trained() {
            return Classification::NoCandidates;
        }
        let query = self.artifact.params().describe(face);
        let mut best: Option<(LabelId, Distance)> = None;
        for entry in self.artifact.entries() {
            if self.artifact.samples_for(entry.label) < self.min_samples {
                continue;
            }
            let d = Distance::new(chi_square(&entry.histogram, &query));
            if best.map_or(true, |(_, b)| d < b) {
                best = Some((entry.label, d));
            }
        }
        match best {
            Some((id, distance)) => Classification::Nearest { id, distance },
            None => Classification::NoCandidates,
        }
    }

    /// Live label for `id`, or `None` when the id is unknown now or was
    /// bound to a different label when the artifact was trained.
    pub fn resolve(&self, id: LabelId) -> Option<&Label> {
        let live = self.registry.resolve(id)?;
        match self.artifact.trained_label(id) {
            Some(trained) if trained == live => Some(live),
            trained => {
                tracing::debug!(%id, live = %live, ?trained, "stale artifact reference");
                None
            }
        }
    }

    /// Acceptance threshold for `id`, falling back to `global`.
    pub fn threshold_for(&self, id: LabelId, global: f64) -> f64 {
        self.artifact.threshold_for(id).unwrap_or(global)
    }

    pub fn metadata(&self, label: &Label) -> Option<&LabelMetadata> {
        self.metadata.get(label)
    }
}

/// Holds the current [`LiveModel`]. Readers take a cheap `Arc` snapshot;
/// the writer swaps in a whole new one.
#[derive(Debug)]
pub struct Recognizer {
    live: RwLock<Arc<LiveModel>>,
}

impl Recognizer {
    pub fn new(initial: LiveModel) -> Self {
        Self {
            live: RwLock::new(Arc::new(initial)),
        }
    }

    pub fn snapshot(&self) -> Arc<LiveModel> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, model: LiveModel) {
        let model = Arc::new(model);
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = model;
    }
}
