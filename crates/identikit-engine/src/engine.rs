//! Single-writer engine.
//!
//! One OS thread owns the dataset, registry, model and metadata stores and
//! handles every write in arrival order. Inference never goes through it:
//! callers read the recognizer's current snapshot directly.

use crate::config::Config;
use crate::error::EngineError;
use crate::orchestrator::{decode_image, Inference, Orchestrator};
use crate::responses::{DeleteResponse, EnrollResponse, HealthResponse, RebuildResponse};
use identikit_core::{
    Artifact, CascadeLocator, DatasetStore, FaceLocator, HaarCascade, Label, LabelMetadata,
    LabelRegistry, LiveModel, MetadataStore, ModelStore, NormalizedFace, Normalizer, Recognizer,
    RegistryStore, Sample, StoreError, Trainer,
};
use identikit_store::{FsDataset, JsonRegistry, ModelFile, SqliteMetadata};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// The four stores the writer thread owns.
pub struct Stores {
    pub dataset: Box<dyn DatasetStore>,
    pub registry: Box<dyn RegistryStore>,
    pub models: Box<dyn ModelStore>,
    pub metadata: Box<dyn MetadataStore>,
}

impl Stores {
    /// Open the on-disk stores under `config.data_dir`.
    pub fn open(config: &Config) -> Result<Self, EngineError> {
        let layout = config.layout();
        Ok(Self {
            dataset: Box::new(FsDataset::open(
                layout.dataset_dir(),
                config.normalization.face_size,
            )?),
            registry: Box::new(JsonRegistry::new(layout.registry_path())),
            models: Box::new(ModelFile::new(layout.model_path())),
            metadata: Box::new(SqliteMetadata::open(&layout.metadata_path())?),
        })
    }
}

/// Messages sent from callers to the writer thread.
enum WriteRequest {
    Enroll {
        label: Label,
        images: Vec<Vec<u8>>,
        metadata: LabelMetadata,
        reply: oneshot::Sender<Result<EnrollResponse, EngineError>>,
    },
    Rebuild {
        reply: oneshot::Sender<Result<RebuildResponse, EngineError>>,
    },
    Delete {
        label: Label,
        reply: oneshot::Sender<Result<DeleteResponse, EngineError>>,
    },
    SetMetadata {
        label: Label,
        metadata: LabelMetadata,
        reply: oneshot::Sender<Result<LabelMetadata, EngineError>>,
    },
}

/// Clone-safe handle to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<WriteRequest>,
    orchestrator: Arc<Orchestrator>,
}

impl EngineHandle {
    pub fn health(&self) -> HealthResponse {
        HealthResponse::ok()
    }

    /// Label → sample count, from the current snapshot.
    pub fn list_labels(&self) -> BTreeMap<Label, u32> {
        self.orchestrator.recognizer().snapshot().registry.all()
    }

    /// Recognize the face in an encoded image. Runs on the caller's thread.
    pub fn infer(&self, image: &[u8]) -> Result<Inference, EngineError> {
        self.orchestrator.infer_bytes(image)
    }

    /// Stored metadata for `label`; empty when none exists.
    pub fn label_metadata(&self, label: &str) -> Result<LabelMetadata, EngineError> {
        let label = Label::new(label)?;
        Ok(self
            .orchestrator
            .recognizer()
            .snapshot()
            .metadata(&label)
            .cloned()
            .unwrap_or_default())
    }

    /// Store faces from `images` under `label`, merge `metadata`, retrain.
    pub async fn enroll(
        &self,
        label: &str,
        images: Vec<Vec<u8>>,
        metadata: LabelMetadata,
    ) -> Result<EnrollResponse, EngineError> {
        let label = Label::new(label)?;
        self.request(|reply| WriteRequest::Enroll {
            label,
            images,
            metadata,
            reply,
        })
        .await
    }

    /// Retrain from every stored sample.
    pub async fn rebuild(&self) -> Result<RebuildResponse, EngineError> {
        self.request(|reply| WriteRequest::Rebuild { reply }).await
    }

    /// Delete a label with its samples and metadata, then retrain.
    pub async fn delete_label(&self, label: &str) -> Result<DeleteResponse, EngineError> {
        let Ok(label) = Label::new(label) else {
            let registry = self.orchestrator.recognizer().snapshot().registry.clone();
            return Ok(DeleteResponse {
                removed: None,
                labels_count: registry.len(),
                images_count: registry.total_samples(),
            });
        };
        self.request(|reply| WriteRequest::Delete { label, reply })
            .await
    }

    /// Merge non-blank `metadata` fields into the record for `label`.
    pub async fn set_metadata(
        &self,
        label: &str,
        metadata: LabelMetadata,
    ) -> Result<LabelMetadata, EngineError> {
        let label = Label::new(label)?;
        self.request(|reply| WriteRequest::SetMetadata {
            label,
            metadata,
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> WriteRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load the cascade, open the stores under `config.data_dir` and start.
pub fn open_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let cascade = HaarCascade::load(&config.cascade_path())?;
    let locator = CascadeLocator::new(cascade, config.detect_params())
        .with_acceptance(config.acceptance())
        .with_equalization(config.detection.equalize);
    let stores = Stores::open(config)?;
    spawn_engine(config, Arc::new(locator), stores)
}

/// Recover persisted state, publish it, and spawn the writer thread.
///
/// Fails fast if the stores cannot be read or a needed retrain cannot be
/// saved.
pub fn spawn_engine(
    config: &Config,
    locator: Arc<dyn FaceLocator>,
    stores: Stores,
) -> Result<EngineHandle, EngineError> {
    config.validate()?;
    let trainer = Trainer::new(config.training_params());
    let min_samples = config.recognition.min_samples_per_label;
    let recognizer = Arc::new(Recognizer::new(LiveModel::new(
        Arc::new(Artifact::untrained(config.feature_params())),
        LabelRegistry::new(),
        min_samples,
    )));
    let normalizer = Normalizer::new(config.normalization.face_size, config.illumination())
        .with_sharpening(config.normalization.sharpen);
    let orchestrator = Arc::new(
        Orchestrator::new(
            locator,
            normalizer,
            config.detection.crop_padding,
            config.recognition.threshold,
            recognizer,
        )
        .with_voting(config.crop_voting()),
    );

    let mut writer = Writer::recover(stores, trainer, min_samples, orchestrator.clone())?;
    writer.publish();

    let (tx, mut rx) = mpsc::channel::<WriteRequest>(4);
    std::thread::Builder::new()
        .name("identikit-writer".into())
        .spawn(move || {
            tracing::info!("writer thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    WriteRequest::Enroll {
                        label,
                        images,
                        metadata,
                        reply,
                    } => {
                        let _ = reply.send(writer.enroll(&label, &images, &metadata));
                    }
                    WriteRequest::Rebuild { reply } => {
                        let _ = reply.send(writer.rebuild());
                    }
                    WriteRequest::Delete { label, reply } => {
                        let _ = reply.send(writer.delete(&label));
                    }
                    WriteRequest::SetMetadata {
                        label,
                        metadata,
                        reply,
                    } => {
                        let _ = reply.send(writer.set_metadata(&label, &metadata));
                    }
                }
            }
            tracing::info!("writer thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, orchestrator })
}

/// State owned by the writer thread. `registry`, `artifact` and `metadata`
/// mirror what is persisted.
struct Writer {
    stores: Stores,
    trainer: Trainer,
    min_samples: u32,
    orchestrator: Arc<Orchestrator>,
    registry: LabelRegistry,
    artifact: Arc<Artifact>,
    metadata: BTreeMap<Label, LabelMetadata>,
}

impl Writer {
    /// Load the registry, reconcile it with the dataset, and load the model,
    /// retraining when it is missing, unreadable or out of date.
    fn recover(
        mut stores: Stores,
        trainer: Trainer,
        min_samples: u32,
        orchestrator: Arc<Orchestrator>,
    ) -> Result<Self, EngineError> {
        let mut registry = match stores.registry.load() {
            Ok(Some(registry)) => registry,
            Ok(None) => LabelRegistry::new(),
            Err(e @ StoreError::Corrupt { .. }) => {
                tracing::warn!(error = %e, "registry unreadable; rebuilding from dataset");
                LabelRegistry::new()
            }
            Err(e) => return Err(e.into()),
        };
        let counts = stores.dataset.counts()?;
        if registry.reconcile(&counts) {
            tracing::info!(labels = registry.len(), "registry reconciled with dataset");
            stores.registry.save(&registry)?;
        }

        let metadata = stores.metadata.all()?;

        let loaded = match stores.models.load() {
            Ok(artifact) => artifact,
            Err(e @ StoreError::Corrupt { .. }) => {
                tracing::warn!(error = %e, "model file unreadable; retraining");
                None
            }
            Err(e) => return Err(e.into()),
        };
        let artifact = match loaded {
            Some(artifact) if matches_registry(&artifact, &registry, &trainer) => artifact,
            Some(_) => {
                tracing::warn!("model out of date with dataset or settings; retraining");
                Self::train_and_save(&mut stores, &trainer, &registry)?
            }
            None if registry.is_empty() => Artifact::untrained(trainer.params().features),
            None => Self::train_and_save(&mut stores, &trainer, &registry)?,
        };
        tracing::info!(
            labels = registry.len(),
            samples = registry.total_samples(),
            trained = artifact.is_trained(),
            "engine state recovered"
        );

        Ok(Self {
            stores,
            trainer,
            min_samples,
            orchestrator,
            registry,
            artifact: Arc::new(artifact),
            metadata,
        })
    }

    fn train_and_save(
        stores: &mut Stores,
        trainer: &Trainer,
        registry: &LabelRegistry,
    ) -> Result<Artifact, EngineError> {
        let artifact = if registry.is_empty() {
            Artifact::untrained(trainer.params().features)
        } else {
            trainer.rebuild(&stores.dataset.load_all()?, registry)
        };
        stores.models.save(&artifact)?;
        Ok(artifact)
    }

    /// Swap the current state into the recognizer.
    fn publish(&self) {
        let model = LiveModel::new(self.artifact.clone(), self.registry.clone(), self.min_samples)
            .with_metadata(self.metadata.clone());
        self.orchestrator.recognizer().publish(model);
        tracing::debug!(
            labels = self.registry.len(),
            entries = self.artifact.len(),
            "live model published"
        );
    }

    fn enroll(
        &mut self,
        label: &Label,
        images: &[Vec<u8>],
        update: &LabelMetadata,
    ) -> Result<EnrollResponse, EngineError> {
        let mut faces: Vec<NormalizedFace> = Vec::with_capacity(images.len());
        let mut skipped = 0u32;
        for (index, bytes) in images.iter().enumerate() {
            let prepared = decode_image(bytes).and_then(|img| self.orchestrator.prepare(&img));
            match prepared {
                Ok(Some(p)) => faces.push(p.face),
                Ok(None) => {
                    tracing::debug!(%label, index, "no face in enrollment image");
                    skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(%label, index, error = %e, "enrollment image rejected");
                    skipped += 1;
                }
            }
        }

        if !update.is_empty() {
            let merged = self.stores.metadata.upsert(label, update)?;
            self.metadata.insert(label.clone(), merged);
        }

        if faces.is_empty() {
            self.publish();
            return Ok(self.enroll_response(0, skipped));
        }

        let ids = self.stores.dataset.append_all(label, &faces)?;
        let mut registry = self.registry.clone();
        registry.ensure(label);
        registry.add_samples(label, ids.len() as u32);

        let new_samples = BTreeMap::from([(
            label.clone(),
            ids.iter()
                .zip(faces)
                .map(|(&id, face)| Sample { id, face })
                .collect::<Vec<_>>(),
        )]);
        let committed = self
            .stores
            .registry
            .save(&registry)
            .map_err(EngineError::from)
            .and_then(|_| self.retrain_with(&new_samples, &registry));

        match committed {
            Ok(artifact) => {
                self.registry = registry;
                self.artifact = Arc::new(artifact);
                self.publish();
                tracing::info!(%label, added = ids.len(), skipped, "enrollment complete");
                Ok(self.enroll_response(ids.len() as u32, skipped))
            }
            Err(e) => {
                tracing::warn!(%label, error = %e, "enrollment failed; rolling back");
                for id in &ids {
                    if let Err(undo) = self.stores.dataset.remove_sample(label, *id) {
                        tracing::warn!(%label, ?id, error = %undo, "sample rollback failed");
                    }
                }
                if let Err(undo) = self.stores.registry.save(&self.registry) {
                    tracing::warn!(error = %undo, "registry rollback failed");
                }
                self.publish();
                Err(e)
            }
        }
    }

    /// Extend the live artifact with `new` samples and persist the result.
    /// Falls back to a full rebuild when the artifact cannot be extended.
    fn retrain_with(
        &mut self,
        new: &BTreeMap<Label, Vec<Sample>>,
        registry: &LabelRegistry,
    ) -> Result<Artifact, EngineError> {
        let artifact = match self.trainer.extend(&self.artifact, new, registry) {
            Ok(artifact) => artifact,
            Err(e) => {
                tracing::info!(reason = %e, "extend unavailable; rebuilding");
                self.trainer
                    .rebuild(&self.stores.dataset.load_all()?, registry)
            }
        };
        self.stores.models.save(&artifact)?;
        Ok(artifact)
    }

    fn rebuild(&mut self) -> Result<RebuildResponse, EngineError> {
        let samples = self.stores.dataset.load_all()?;
        let counts: BTreeMap<Label, u32> = samples
            .iter()
            .map(|(label, list)| (label.clone(), list.len() as u32))
            .collect();
        let mut registry = self.registry.clone();
        if registry.reconcile(&counts) {
            self.stores.registry.save(&registry)?;
            self.registry = registry;
        }

        let artifact = if self.registry.is_empty() {
            Artifact::untrained(self.trainer.params().features)
        } else {
            self.trainer.rebuild(&samples, &self.registry)
        };
        let saved = self.stores.models.save(&artifact);
        if let Err(e) = saved {
            self.publish();
            return Err(e.into());
        }
        self.artifact = Arc::new(artifact);
        self.publish();
        Ok(RebuildResponse {
            labels_count: self.registry.len(),
            images_count: self.registry.total_samples(),
        })
    }

    fn delete(&mut self, label: &Label) -> Result<DeleteResponse, EngineError> {
        let present =
            self.registry.contains(label) || self.stores.dataset.count(label)? > 0;
        if !present {
            if self.metadata.remove(label).is_some() {
                self.stores.metadata.delete(label)?;
                self.publish();
            }
            return Ok(self.delete_response(None));
        }

        let mut registry = self.registry.clone();
        registry.remove(label);
        self.stores.registry.save(&registry)?;
        if let Err(e) = self.stores.dataset.delete(label) {
            if let Err(undo) = self.stores.registry.save(&self.registry) {
                tracing::warn!(error = %undo, "registry rollback failed");
            }
            return Err(e.into());
        }
        self.registry = registry;
        if let Err(e) = self.stores.metadata.delete(label) {
            tracing::warn!(%label, error = %e, "metadata not removed");
        } else {
            self.metadata.remove(label);
        }
        tracing::info!(%label, "label deleted");
        // The old artifact still holds the label; the registry alone makes
        // its entries stale until the retrain lands.
        self.publish();

        let artifact = Self::train_and_save(&mut self.stores, &self.trainer, &self.registry)?;
        self.artifact = Arc::new(artifact);
        self.publish();
        Ok(self.delete_response(Some(label.to_string())))
    }

    fn set_metadata(
        &mut self,
        label: &Label,
        update: &LabelMetadata,
    ) -> Result<LabelMetadata, EngineError> {
        let merged = self.stores.metadata.upsert(label, update)?;
        self.metadata.insert(label.clone(), merged.clone());
        self.publish();
        Ok(merged)
    }

    fn enroll_response(&self, added: u32, skipped: u32) -> EnrollResponse {
        EnrollResponse {
            added,
            skipped,
            labels_count: self.registry.len(),
            images_count: self.registry.total_samples(),
        }
    }

    fn delete_response(&self, removed: Option<String>) -> DeleteResponse {
        DeleteResponse {
            removed,
            labels_count: self.registry.len(),
            images_count: self.registry.total_samples(),
        }
    }
}

/// True when `artifact` was trained with the current settings on exactly the
/// labels and sample counts in `registry`.
fn matches_registry(artifact: &Artifact, registry: &LabelRegistry, trainer: &Trainer) -> bool {
    if *artifact.params() != trainer.params().features {
        return false;
    }
    if artifact.label_count() != registry.len() {
        return false;
    }
    registry.iter().all(|(label, entry)| {
        artifact.trained_label(entry.id) == Some(label)
            && artifact.samples_for(entry.id) == entry.samples
    })
}
