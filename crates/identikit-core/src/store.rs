//! Storage seams. The engine owns one of each behind its writer thread;
//! `identikit-store` provides the on-disk implementations.

use crate::normalizer::NormalizedFace;
use crate::registry::LabelRegistry;
use crate::trainer::Artifact;
use crate::types::{Label, LabelMetadata, SampleId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("image codec error: {0}")]
    Codec(String),
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// One stored face.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub id: SampleId,
    pub face: NormalizedFace,
}

/// Append-only per-label sample collection.
pub trait DatasetStore: Send {
    /// Store `face` under a fresh id. Never overwrites an existing sample.
    fn append(&mut self, label: &Label, face: &NormalizedFace) -> Result<SampleId, StoreError>;

    /// Remove one sample. Missing samples are ignored.
    fn remove_sample(&mut self, label: &Label, id: SampleId) -> Result<(), StoreError>;

    /// Samples of `label` in id order; empty for unknown labels.
    fn list(&self, label: &Label) -> Result<Vec<Sample>, StoreError>;

    /// Remove every sample of `label`. Unknown labels are a no-op.
    fn delete(&mut self, label: &Label) -> Result<(), StoreError>;

    fn count(&self, label: &Label) -> Result<u32, StoreError>;

    /// Labels with at least one sample.
    fn labels(&self) -> Result<Vec<Label>, StoreError>;

    /// Append all of `faces` or none of them.
    fn append_all(
        &mut self,
        label: &Label,
        faces: &[NormalizedFace],
    ) -> Result<Vec<SampleId>, StoreError> {
        let mut written = Vec::with_capacity(faces.len());
        for face in faces {
            match self.append(label, face) {
                Ok(id) => written.push(id),
                Err(e) => {
                    for id in written {
                        if let Err(undo) = self.remove_sample(label, id) {
                            tracing::warn!(%label, ?id, error = %undo, "rollback failed");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Label → number of stored samples.
    fn counts(&self) -> Result<BTreeMap<Label, u32>, StoreError> {
        self.labels()?
            .into_iter()
            .map(|label| Ok((label.clone(), self.count(&label)?)))
            .collect()
    }

    /// Every sample, grouped by label.
    fn load_all(&self) -> Result<BTreeMap<Label, Vec<Sample>>, StoreError> {
        self.labels()?
            .into_iter()
            .map(|label| Ok((label.clone(), self.list(&label)?)))
            .collect()
    }
}

pub trait RegistryStore: Send {
    /// `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<LabelRegistry>, StoreError>;
    fn save(&mut self, registry: &LabelRegistry) -> Result<(), StoreError>;
}

pub trait ModelStore: Send {
    /// `None` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Artifact>, StoreError>;
    /// Replace the stored artifact atomically.
    fn save(&mut self, artifact: &Artifact) -> Result<(), StoreError>;
}

pub trait MetadataStore: Send {
    fn get(&self, label: &Label) -> Result<Option<LabelMetadata>, StoreError>;

    /// Merge the non-blank fields of `update` into the stored record and
    /// return the result.
    fn upsert(&mut self, label: &Label, update: &LabelMetadata)
        -> Result<LabelMetadata, StoreError>;

    fn delete(&mut self, label: &Label) -> Result<(), StoreError>;

    fn all(&self) -> Result<BTreeMap<Label, LabelMetadata>, StoreError>;
}
