//! Label ↔ numeric id mapping with per-label sample counts.

use crate::types::{Label, LabelId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("labels {first} and {second} share id {id}")]
    DuplicateId { id: LabelId, first: Label, second: Label },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEntry {
    pub id: LabelId,
    pub samples: u32,
}

/// Active labels and the dense ids the classifier indexes them by.
///
/// New ids are the smallest integer no active label holds, so an id freed by
/// [`remove`](Self::remove) can be handed to a later label. Artifacts guard
/// against that reuse by comparing the label they were trained with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRegistry {
    #[serde(default)]
    labels: BTreeMap<Label, LabelEntry>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject registries (typically freshly deserialized) that bind one id
    /// to two labels.
    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut seen: BTreeMap<LabelId, &Label> = BTreeMap::new();
        for (label, entry) in &self.labels {
            if let Some(first) = seen.insert(entry.id, label) {
                return Err(RegistryError::DuplicateId {
                    id: entry.id,
                    first: first.clone(),
                    second: label.clone(),
                });
            }
        }
        Ok(())
    }

    /// Id of `label`, allocating the smallest free one if it is new.
    pub fn ensure(&mut self, label: &Label) -> LabelId {
        if let Some(entry) = self.labels.get(label) {
            return entry.id;
        }
        let used: BTreeSet<u32> = self.labels.values().map(|e| e.id.0).collect();
        let id = LabelId((0..).find(|n| !used.contains(n)).unwrap_or(0));
        self.labels.insert(label.clone(), LabelEntry { id, samples: 0 });
        tracing::debug!(%label, %id, "allocated label id");
        id
    }

    pub fn id_of(&self, label: &Label) -> Option<LabelId> {
        self.labels.get(label).map(|e| e.id)
    }

    pub fn resolve(&self, id: LabelId) -> Option<&Label> {
        self.labels
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(label, _)| label)
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.labels.contains_key(label)
    }

    pub fn samples(&self, label: &Label) -> u32 {
        self.labels.get(label).map_or(0, |e| e.samples)
    }

    /// Add `n` to the count of an existing label. Unknown labels are ignored.
    pub fn add_samples(&mut self, label: &Label, n: u32) {
        if let Some(entry) = self.labels.get_mut(label) {
            entry.samples = entry.samples.saturating_add(n);
        }
    }

    pub fn set_samples(&mut self, label: &Label, n: u32) {
        if let Some(entry) = self.labels.get_mut(label) {
            entry.samples = n;
        }
    }

    /// Retire `label` and free its id.
    pub fn remove(&mut self, label: &Label) -> Option<LabelEntry> {
        self.labels.remove(label)
    }

    /// Label → sample count.
    pub fn all(&self) -> BTreeMap<Label, u32> {
        self.labels
            .iter()
            .map(|(label, e)| (label.clone(), e.samples))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Label, &LabelEntry)> {
        self.labels.iter()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn total_samples(&self) -> u64 {
        self.labels.values().map(|e| e.samples as u64).sum()
    }

    /// Make the registry agree with what the dataset actually holds.
    ///
    /// Labels without samples are retired; labels present only in the dataset
    /// get fresh ids; surviving labels keep theirs. Returns true when anything
    /// changed.
    pub fn reconcile(&mut self, dataset: &BTreeMap<Label, u32>) -> bool {
        let before = self.clone();
        self.labels
            .retain(|label, _| dataset.get(label).is_some_and(|&n| n > 0));
        for (label, &count) in dataset.iter().filter(|(_, n)| **n > 0) {
            self.ensure(label);
            self.set_samples(label, count);
        }
        *self != before
    }
}
