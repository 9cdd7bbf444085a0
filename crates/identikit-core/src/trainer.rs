//! Nearest-neighbor artifact and the trainer that builds it.
//!
//! The artifact keeps every training histogram tagged with its label id,
//! along with the label each id meant at training time. That binding is
//! what lets the recognizer discard matches whose id was since reassigned.

use crate::lbp::{chi_square, FeatureParams};
use crate::registry::LabelRegistry;
use crate::store::Sample;
use crate::types::{Label, LabelId, SampleId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArtifactError {
    #[error("entry {label}/{sample:?} has {found} values, expected {expected}")]
    DescriptorLength {
        label: LabelId,
        sample: SampleId,
        expected: usize,
        found: usize,
    },
    #[error("entry references id {0} with no trained label")]
    UnknownId(LabelId),
    #[error("feature parameters differ: artifact {artifact:?}, trainer {trainer:?}")]
    IncompatibleParams {
        artifact: FeatureParams,
        trainer: FeatureParams,
    },
    #[error("artifact holds {trained} samples of {label}, registry implies {expected}")]
    OutOfDate {
        label: Label,
        trained: u32,
        expected: u32,
    },
}

/// One training histogram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub label: LabelId,
    pub sample: SampleId,
    pub histogram: Vec<f32>,
}

/// The label an id was bound to when the artifact was trained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedLabel {
    pub id: LabelId,
    pub label: Label,
    pub samples: u32,
    /// Acceptance threshold for matches against this label.
    pub threshold: f64,
}

/// Immutable trained classifier state.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    params: FeatureParams,
    labels: BTreeMap<LabelId, TrainedLabel>,
    entries: Vec<Entry>,
}

impl Artifact {
    /// The sentinel with no entries; every classification against it is a
    /// no-match.
    pub fn untrained(params: FeatureParams) -> Self {
        Self {
            params,
            labels: BTreeMap::new(),
            entries: Vec::new(),
        }
    }

    /// Reassemble a persisted artifact, checking that it is self-consistent.
    pub fn from_parts(
        params: FeatureParams,
        labels: Vec<TrainedLabel>,
        mut entries: Vec<Entry>,
    ) -> Result<Self, ArtifactError> {
        let labels: BTreeMap<LabelId, TrainedLabel> =
            labels.into_iter().map(|l| (l.id, l)).collect();
        let expected = params.descriptor_len();
        for e in &entries {
            if e.histogram.len() != expected {
                return Err(ArtifactError::DescriptorLength {
                    label: e.label,
                    sample: e.sample,
                    expected,
                    found: e.histogram.len(),
                });
            }
            if !labels.contains_key(&e.label) {
                return Err(ArtifactError::UnknownId(e.label));
            }
        }
        entries.sort_by_key(|e| (e.label, e.sample));
        Ok(Self {
            params,
            labels,
            entries,
        })
    }

    pub fn params(&self) -> &FeatureParams {
        &self.params
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn labels(&self) -> impl Iterator<Item = &TrainedLabel> {
        self.labels.values()
    }

    pub fn is_trained(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }

    /// Label `id` was bound to at training time.
    pub fn trained_label(&self, id: LabelId) -> Option<&Label> {
        self.labels.get(&id).map(|l| &l.label)
    }

    pub fn threshold_for(&self, id: LabelId) -> Option<f64> {
        self.labels.get(&id).map(|l| l.threshold)
    }

    pub fn samples_for(&self, id: LabelId) -> u32 {
        self.labels.get(&id).map_or(0, |l| l.samples)
    }
}

/// Fixed training parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingParams {
    pub features: FeatureParams,
    /// Global acceptance threshold (inclusive).
    pub threshold: f64,
    /// How far above `threshold` a label's adaptive threshold may rise.
    /// Zero disables adaptation.
    pub adaptive_margin: f64,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            features: FeatureParams::default(),
            threshold: 60.0,
            adaptive_margin: 10.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trainer {
    params: TrainingParams,
}

impl Trainer {
    pub fn new(params: TrainingParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TrainingParams {
        &self.params
    }

    /// Train from scratch on every sample.
    ///
    /// Samples whose label is not in `registry` are skipped. Deterministic in
    /// its inputs.
    pub fn rebuild(
        &self,
        samples: &BTreeMap<Label, Vec<Sample>>,
        registry: &LabelRegistry,
    ) -> Artifact {
        let entries = self.describe_all(samples, registry);
        let artifact = self.assemble(entries, registry, None);
        tracing::info!(
            labels = artifact.label_count(),
            entries = artifact.len(),
            "model rebuilt"
        );
        artifact
    }

    /// Add `new` samples to `base`.
    ///
    /// Entries whose id now belongs to a different label are dropped, and
    /// labels whose entries did not change keep their computed thresholds.
    /// The result equals a [`rebuild`](Self::rebuild) over the same data.
    ///
    /// Fails with [`ArtifactError::OutOfDate`] when `base` does not hold
    /// exactly the samples `registry` counts minus those in `new`; the
    /// caller must rebuild instead.
    pub fn extend(
        &self,
        base: &Artifact,
        new: &BTreeMap<Label, Vec<Sample>>,
        registry: &LabelRegistry,
    ) -> Result<Artifact, ArtifactError> {
        if base.params != self.params.features {
            return Err(ArtifactError::IncompatibleParams {
                artifact: base.params,
                trainer: self.params.features,
            });
        }
        for (label, entry) in registry.iter() {
            let fresh = new.get(label).map_or(0, |list| list.len() as u32);
            let expected = entry.samples.saturating_sub(fresh);
            let trained = if base.trained_label(entry.id) == Some(label) {
                base.samples_for(entry.id)
            } else {
                0
            };
            if trained != expected {
                return Err(ArtifactError::OutOfDate {
                    label: label.clone(),
                    trained,
                    expected,
                });
            }
        }

        let valid = |id: LabelId| -> bool {
            matches!(
                (registry.resolve(id), base.trained_label(id)),
                (Some(now), Some(then)) if now == then
            )
        };
        let mut entries: Vec<Entry> = base
            .entries
            .iter()
            .filter(|e| valid(e.label))
            .cloned()
            .collect();
        let dropped = base.entries.len() - entries.len();

        let existing: BTreeSet<(LabelId, SampleId)> =
            entries.iter().map(|e| (e.label, e.sample)).collect();
        let added: Vec<Entry> = self
            .describe_all(new, registry)
            .into_iter()
            .filter(|e| !existing.contains(&(e.label, e.sample)))
            .collect();
        let touched: BTreeSet<LabelId> = added.iter().map(|e| e.label).collect();
        let added_count = added.len();
        entries.extend(added);

        let reusable: BTreeMap<LabelId, TrainedLabel> = base
            .labels
            .values()
            .filter(|l| valid(l.id) && !touched.contains(&l.id))
            .map(|l| (l.id, l.clone()))
            .collect();

        let artifact = self.assemble(entries, registry, Some(&reusable));
        tracing::info!(
            added = added_count,
            dropped,
            entries = artifact.len(),
            "model extended"
        );
        Ok(artifact)
    }

    fn describe_all(
        &self,
        samples: &BTreeMap<Label, Vec<Sample>>,
        registry: &LabelRegistry,
    ) -> Vec<Entry> {
        let mut entries = Vec::new();
        for (label, list) in samples {
            let Some(id) = registry.id_of(label) else {
                tracing::warn!(%label, "samples for unregistered label ignored");
                continue;
            };
            for sample in list {
                entries.push(Entry {
                    label: id,
                    sample: sample.id,
                    histogram: self.params.features.describe(&sample.face),
                });
            }
        }
        entries
    }

    fn assemble(
        &self,
        mut entries: Vec<Entry>,
        registry: &LabelRegistry,
        reusable: Option<&BTreeMap<LabelId, TrainedLabel>>,
    ) -> Artifact {
        entries.sort_by_key(|e| (e.label, e.sample));
        entries.dedup_by_key(|e| (e.label, e.sample));

        let mut labels = BTreeMap::new();
        let mut start = 0;
        while start < entries.len() {
            let id = entries[start].label;
            let end = entries[start..]
                .iter()
                .position(|e| e.label != id)
                .map_or(entries.len(), |n| start + n);
            let group = &entries[start..end];
            start = end;
            if let Some(kept) = reusable.and_then(|r| r.get(&id)) {
                labels.insert(id, kept.clone());
                continue;
            }
            let Some(label) = registry.resolve(id) else {
                continue;
            };
            labels.insert(
                id,
                TrainedLabel {
                    id,
                    label: label.clone(),
                    samples: group.len() as u32,
                    threshold: self.adaptive_threshold(group),
                },
            );
        }

        Artifact {
            params: self.params.features,
            labels,
            entries,
        }
    }

    /// `mean + 2·std` of each sample's leave-one-out nearest same-label
    /// distance, clamped into `[threshold, threshold + adaptive_margin]`.
    fn adaptive_threshold(&self, group: &[Entry]) -> f64 {
        let base = self.params.threshold;
        if group.len() < 2 || self.params.adaptive_margin <= 0.0 {
            return base;
        }
        let nearest: Vec<f64> = group
            .iter()
            .enumerate()
            .map(|(i, query)| {
                group
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, stored)| chi_square(&stored.histogram, &query.histogram))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let n = nearest.len() as f64;
        let mean = nearest.iter().sum::<f64>() / n;
        let var = nearest.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;
        (mean + 2.0 * var.sqrt()).clamp(base, base + self.params.adaptive_margin)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::normalizer::NormalizedFace;
    use image::{GrayImage, Luma};
    use rand::{Rng, SeedableRng};

    pub(crate) const FACE: u32 = 32;

    pub(crate) fn params() -> TrainingParams {
        TrainingParams {
            features: FeatureParams {
                radius: 1,
                grid_x: 4,
                grid_y: 4,
                face_size: FACE,
            },
            threshold: 60.0,
            adaptive_margin: 10.0,
        }
    }

    /// Deterministic texture; same seed, same face.
    pub(crate) fn face(seed: u64) -> NormalizedFace {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let img = GrayImage::from_fn(FACE, FACE, |_, _| Luma([rng.gen()]));
        NormalizedFace::from_gray(img, FACE).unwrap()
    }

    pub(crate) fn samples(seeds: &[u64]) -> Vec<Sample> {
        seeds
            .iter()
            .enumerate()
            .map(|(i, &s)| Sample {
                id: SampleId(i as u32 + 1),
                face: face(s),
            })
            .collect()
    }

    pub(crate) fn label(s: &str) -> Label {
        Label::new(s).unwrap()
    }

    fn two_label_setup() -> (LabelRegistry, BTreeMap<Label, Vec<Sample>>) {
        let mut registry = LabelRegistry::new();
        let data = BTreeMap::from([
            (label("ann"), samples(&[1, 2, 3])),
            (label("bob"), samples(&[10, 11])),
        ]);
        for (l, s) in &data {
            registry.ensure(l);
            registry.set_samples(l, s.len() as u32);
        }
        (registry, data)
    }

    #[test]
    fn test_rebuild_empty_is_untrained() {
        let trainer = Trainer::new(params());
        let artifact = trainer.rebuild(&BTreeMap::new(), &LabelRegistry::new());
        assert!(!artifact.is_trained());
        assert_eq!(artifact, Artifact::untrained(params().features));
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let trainer = Trainer::new(params());
        let (registry, data) = two_label_setup();
        let a = trainer.rebuild(&data, &registry);
        let b = trainer.rebuild(&data, &registry);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert_eq!(a.trained_label(LabelId(1)), Some(&label("bob")));
        assert_eq!(a.samples_for(LabelId(0)), 3);
        // Sorted by (label, sample)
        let keys: Vec<_> = a.entries().iter().map(|e| (e.label.0, e.sample.0)).collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (0, 3), (1, 1), (1, 2)]);
    }

    #[test]
    fn test_unregistered_samples_skipped() {
        let trainer = Trainer::new(params());
        let (mut registry, data) = two_label_setup();
        registry.remove(&label("bob"));
        let artifact = trainer.rebuild(&data, &registry);
        assert_eq!(artifact.len(), 3);
        assert_eq!(artifact.label_count(), 1);
    }

    #[test]
    fn test_extend_matches_rebuild() {
        let trainer = Trainer::new(params());
        let (mut registry, data) = two_label_setup();
        let base = trainer.rebuild(&data, &registry);

        let carl = label("carl");
        let more = BTreeMap::from([
            (carl.clone(), samples(&[20, 21])),
            (label("ann"), vec![Sample { id: SampleId(4), face: face(4) }]),
        ]);
        registry.ensure(&carl);
        registry.set_samples(&carl, 2);
        registry.set_samples(&label("ann"), 4);
        let extended = trainer.extend(&base, &more, &registry).unwrap();

        let mut all = data.clone();
        all.get_mut(&label("ann")).unwrap().push(Sample { id: SampleId(4), face: face(4) });
        all.insert(carl, samples(&[20, 21]));
        assert_eq!(extended, trainer.rebuild(&all, &registry));
        assert_eq!(extended.len(), 8);
    }

    #[test]
    fn test_extend_drops_reassigned_ids() {
        let trainer = Trainer::new(params());
        let (mut registry, data) = two_label_setup();
        let base = trainer.rebuild(&data, &registry);

        // bob's id 1 is freed and handed to dave.
        registry.remove(&label("bob"));
        let dave = label("dave");
        assert_eq!(registry.ensure(&dave), LabelId(1));
        registry.set_samples(&dave, 1);
        let new = BTreeMap::from([(dave.clone(), samples(&[30]))]);
        let extended = trainer.extend(&base, &new, &registry).unwrap();

        assert_eq!(extended.trained_label(LabelId(1)), Some(&dave));
        assert_eq!(extended.samples_for(LabelId(1)), 1);
        assert_eq!(extended.len(), 4);
    }

    #[test]
    fn test_extend_refuses_base_with_deleted_samples() {
        let trainer = Trainer::new(params());
        let mut registry = LabelRegistry::new();
        let ann = label("ann");
        registry.ensure(&ann);
        registry.set_samples(&ann, 1);
        let base = trainer.rebuild(&BTreeMap::from([(ann.clone(), samples(&[1]))]), &registry);

        // ann was deleted and re-enrolled with a new face under the same id
        // and sample number, but `base` was never retrained in between.
        registry.remove(&ann);
        registry.ensure(&ann);
        registry.set_samples(&ann, 1);
        let new = BTreeMap::from([(ann.clone(), samples(&[50]))]);
        assert_eq!(
            trainer.extend(&base, &new, &registry),
            Err(ArtifactError::OutOfDate {
                label: ann,
                trained: 1,
                expected: 0,
            })
        );
    }

    #[test]
    fn test_extend_refuses_base_missing_samples() {
        let trainer = Trainer::new(params());
        let (mut registry, data) = two_label_setup();
        let base = trainer.rebuild(&data, &registry);
        // Two more ann samples on disk, only one of them handed to extend.
        registry.set_samples(&label("ann"), 5);
        let new = BTreeMap::from([(
            label("ann"),
            vec![Sample { id: SampleId(5), face: face(5) }],
        )]);
        assert!(matches!(
            trainer.extend(&base, &new, &registry),
            Err(ArtifactError::OutOfDate { trained: 3, expected: 4, .. })
        ));
    }

    #[test]
    fn test_extend_rejects_other_params() {
        let trainer = Trainer::new(params());
        let other = Artifact::untrained(FeatureParams::default());
        assert!(matches!(
            trainer.extend(&other, &BTreeMap::new(), &LabelRegistry::new()),
            Err(ArtifactError::IncompatibleParams { .. })
        ));
    }

    #[test]
    fn test_adaptive_threshold_bounds() {
        let (registry, data) = two_label_setup();
        let adaptive = Trainer::new(params()).rebuild(&data, &registry);
        for l in adaptive.labels() {
            assert!(l.threshold >= 60.0 && l.threshold <= 70.0, "{l:?}");
        }

        let fixed = Trainer::new(TrainingParams {
            adaptive_margin: 0.0,
            ..params()
        })
        .rebuild(&data, &registry);
        assert!(fixed.labels().all(|l| l.threshold == 60.0));
    }

    #[test]
    fn test_single_sample_uses_global_threshold() {
        let mut registry = LabelRegistry::new();
        registry.ensure(&label("solo"));
        let data = BTreeMap::from([(label("solo"), samples(&[5]))]);
        let artifact = Trainer::new(params()).rebuild(&data, &registry);
        assert_eq!(artifact.threshold_for(LabelId(0)), Some(60.0));
    }

    #[test]
    fn test_from_parts_validates() {
        let features = params().features;
        let entry = Entry {
            label: LabelId(0),
            sample: SampleId(1),
            histogram: vec![0.0; 3],
        };
        let trained = TrainedLabel {
            id: LabelId(0),
            label: label("x"),
            samples: 1,
            threshold: 60.0,
        };
        assert!(matches!(
            Artifact::from_parts(features, vec![trained.clone()], vec![entry.clone()]),
            Err(ArtifactError::DescriptorLength { found: 3, .. })
        ));
        let good = Entry {
            histogram: vec![0.0; features.descriptor_len()],
            ..entry
        };
        assert!(matches!(
            Artifact::from_parts(features, vec![], vec![good.clone()]),
            Err(ArtifactError::UnknownId(LabelId(0)))
        ));
        assert!(Artifact::from_parts(features, vec![trained], vec![good]).is_ok());
    }
}
