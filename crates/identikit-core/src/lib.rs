//! identikit-core: face location and recognition engine.
//!
//! Haar cascade detection picks the face, the normalizer turns it into a
//! canonical grayscale sample, and a nearest-neighbor classifier over local
//! binary pattern histograms decides who it is.

pub mod cascade;
pub mod lbp;
pub mod locator;
pub mod normalizer;
pub mod recognizer;
pub mod registry;
pub mod store;
pub mod trainer;
pub mod types;

pub use cascade::{CascadeError, DetectParams, Detection, HaarCascade};
pub use lbp::FeatureParams;
pub use locator::{Acceptance, CascadeLocator, FaceLocator, LocatorError};
pub use normalizer::{Illumination, NormalizeError, NormalizedFace, Normalizer};
pub use recognizer::{Classification, LiveModel, Recognizer};
pub use registry::{LabelEntry, LabelRegistry, RegistryError};
pub use store::{DatasetStore, MetadataStore, ModelStore, RegistryStore, Sample, StoreError};
pub use trainer::{Artifact, ArtifactError, Entry, TrainedLabel, Trainer, TrainingParams};
pub use types::{BoundingBox, Distance, Label, LabelError, LabelId, LabelMetadata, SampleId};
