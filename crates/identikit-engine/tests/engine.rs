mod common;

use common::{blank_png, config, face_png, garbage, FakeLocator};
use identikit_core::{Artifact, Label, LabelId, LabelMetadata, ModelStore, RegistryStore, StoreError};
use identikit_engine::{
    spawn_engine, EngineError, EngineHandle, InferResponse, Outcome, Stores, UNKNOWN_LABEL,
};
use identikit_store::{DataLayout, JsonRegistry, ModelFile};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn start(dir: &Path) -> EngineHandle {
    let config = config(dir);
    let stores = Stores::open(&config).unwrap();
    spawn_engine(&config, Arc::new(FakeLocator), stores).unwrap()
}

fn label(s: &str) -> Label {
    Label::new(s).unwrap()
}

fn infer(engine: &EngineHandle, image: &[u8]) -> InferResponse {
    InferResponse::from(engine.infer(image).unwrap())
}

#[test]
fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    assert_eq!(
        serde_json::to_value(engine.health()).unwrap(),
        serde_json::json!({ "status": "ok" })
    );
}

#[tokio::test]
async fn test_enroll_rebuild_infer() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());

    let images = vec![face_png(1), face_png(2), face_png(3), garbage()];
    let enrolled = engine
        .enroll("A", images, LabelMetadata::default())
        .await
        .unwrap();
    assert_eq!((enrolled.added, enrolled.skipped), (3, 1));
    assert_eq!((enrolled.labels_count, enrolled.images_count), (1, 3));

    let rebuilt = engine.rebuild().await.unwrap();
    assert_eq!((rebuilt.labels_count, rebuilt.images_count), (1, 3));

    let resp = infer(&engine, &face_png(2));
    assert_eq!(resp.label, "A");
    let distance = resp.confidence.unwrap();
    assert!(distance <= 60.0, "distance {distance}");
    assert_eq!(resp.bbox, Some([8, 8, 48, 48]));
}

#[tokio::test]
async fn test_fresh_engine_is_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    for image in [face_png(1), blank_png()] {
        let inf = engine.infer(&image).unwrap();
        assert_eq!(inf.outcome, Outcome::Untrained);
        let resp = InferResponse::from(inf);
        assert_eq!(resp.label, UNKNOWN_LABEL);
        assert_eq!(resp.confidence, None);
        assert_eq!(resp.bbox, None);
    }
    assert!(engine.list_labels().is_empty());
}

#[tokio::test]
async fn test_no_face_is_null_result() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    engine
        .enroll("A", vec![face_png(1)], LabelMetadata::default())
        .await
        .unwrap();

    let inf = engine.infer(&blank_png()).unwrap();
    assert_eq!(inf.outcome, Outcome::NoFace);
    assert_eq!(
        serde_json::to_value(InferResponse::from(inf)).unwrap(),
        serde_json::json!({ "label": "Unknown", "confidence": null, "score": null, "bbox": null })
    );
}

#[tokio::test]
async fn test_undecodable_infer_is_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    engine
        .enroll("A", vec![face_png(1)], LabelMetadata::default())
        .await
        .unwrap();
    assert!(matches!(
        engine.infer(&garbage()),
        Err(EngineError::InvalidImage(_))
    ));
}

#[tokio::test]
async fn test_above_threshold_reports_distance() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.recognition.threshold = 1.0;
    let stores = Stores::open(&cfg).unwrap();
    let engine = spawn_engine(&cfg, Arc::new(FakeLocator), stores).unwrap();
    engine
        .enroll("A", vec![face_png(1), face_png(2)], LabelMetadata::default())
        .await
        .unwrap();

    let inf = engine.infer(&face_png(77)).unwrap();
    assert_eq!(inf.outcome, Outcome::AboveThreshold);
    let resp = InferResponse::from(inf);
    assert_eq!(resp.label, UNKNOWN_LABEL);
    assert!(resp.confidence.unwrap() > 1.0);
    assert_eq!(resp.score, Some(0.0));
    assert!(resp.bbox.is_some());

    // The enrolled image itself is still an exact match.
    assert_eq!(infer(&engine, &face_png(1)).label, "A");
}

#[tokio::test]
async fn test_infer_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    engine
        .enroll("A", vec![face_png(1), face_png(2)], LabelMetadata::default())
        .await
        .unwrap();
    engine
        .enroll("B", vec![face_png(3)], LabelMetadata::default())
        .await
        .unwrap();
    let query = face_png(40);
    assert_eq!(engine.infer(&query).unwrap(), engine.infer(&query).unwrap());
}

#[tokio::test]
async fn test_delete_label_never_matches_again() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    engine
        .enroll(
            "A",
            vec![face_png(1), face_png(2), face_png(3)],
            LabelMetadata {
                title: Some("Subject A".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    engine
        .enroll("B", vec![face_png(11), face_png(12)], LabelMetadata::default())
        .await
        .unwrap();
    assert_eq!(infer(&engine, &face_png(1)).label, "A");

    let deleted = engine.delete_label("A").await.unwrap();
    assert_eq!(deleted.removed.as_deref(), Some("A"));
    assert_eq!((deleted.labels_count, deleted.images_count), (1, 2));

    for seed in [1, 2, 3] {
        assert_ne!(infer(&engine, &face_png(seed)).label, "A");
    }
    assert!(!engine.list_labels().contains_key(&label("A")));
    assert_eq!(engine.label_metadata("A").unwrap(), LabelMetadata::default());
    assert!(!dir.path().join("dataset").join("A").exists());

    let again = engine.delete_label("A").await.unwrap();
    assert_eq!(again.removed, None);
    assert_eq!(again.labels_count, 1);
    let nonsense = engine.delete_label("   ").await.unwrap();
    assert_eq!(nonsense.removed, None);
}

#[tokio::test]
async fn test_deleting_last_label_untrains() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    engine
        .enroll("A", vec![face_png(1)], LabelMetadata::default())
        .await
        .unwrap();
    engine.delete_label("A").await.unwrap();

    let inf = engine.infer(&face_png(1)).unwrap();
    assert_eq!(inf.outcome, Outcome::Untrained);
    assert_eq!(inf.label, None);
}

#[tokio::test]
async fn test_label_counts_follow_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    engine
        .enroll("A", vec![face_png(1), face_png(2)], LabelMetadata::default())
        .await
        .unwrap();
    engine
        .enroll("A", vec![face_png(3), blank_png()], LabelMetadata::default())
        .await
        .unwrap();
    engine
        .enroll("B", vec![face_png(4)], LabelMetadata::default())
        .await
        .unwrap();
    engine.delete_label("B").await.unwrap();
    engine
        .enroll("C", vec![face_png(5), face_png(6)], LabelMetadata::default())
        .await
        .unwrap();

    let labels = engine.list_labels();
    for (label, count) in &labels {
        let on_disk = std::fs::read_dir(dir.path().join("dataset").join(label.as_str()))
            .unwrap()
            .count() as u32;
        assert_eq!(*count, on_disk, "{label}");
    }
    assert_eq!(labels.get(&label("A")), Some(&3));
    assert_eq!(labels.get(&label("C")), Some(&2));
    assert_eq!(labels.len(), 2);
}

#[tokio::test]
async fn test_freed_id_goes_to_new_label() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    for (name, seed) in [("A", 1), ("B", 2)] {
        engine
            .enroll(name, vec![face_png(seed)], LabelMetadata::default())
            .await
            .unwrap();
    }
    engine.delete_label("A").await.unwrap();
    engine
        .enroll("C", vec![face_png(3)], LabelMetadata::default())
        .await
        .unwrap();

    let registry = JsonRegistry::new(DataLayout::new(dir.path()).registry_path())
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(registry.id_of(&label("B")), Some(LabelId(1)));
    assert_eq!(registry.id_of(&label("C")), Some(LabelId(0)));

    assert_eq!(infer(&engine, &face_png(3)).label, "C");
    assert_eq!(infer(&engine, &face_png(2)).label, "B");
}

#[tokio::test]
async fn test_metadata_flow() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    engine
        .enroll(
            "A",
            vec![face_png(1)],
            LabelMetadata {
                title: Some("Ms. A".into()),
                case_ref: Some("2024-117".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let resp = infer(&engine, &face_png(1));
    let md = resp.metadata.unwrap();
    assert_eq!(md.title.as_deref(), Some("Ms. A"));

    let merged = engine
        .set_metadata(
            "A",
            LabelMetadata {
                notes: Some("left-handed".into()),
                title: Some(" ".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(merged.title.as_deref(), Some("Ms. A"));
    assert_eq!(merged.notes.as_deref(), Some("left-handed"));
    assert_eq!(engine.label_metadata("A").unwrap(), merged);
    assert!(matches!(
        engine.label_metadata(""),
        Err(EngineError::InvalidLabel(_))
    ));
}

#[tokio::test]
async fn test_invalid_label_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    let long = "x".repeat(26);
    for bad in ["", "a/b", long.as_str()] {
        assert!(matches!(
            engine
                .enroll(bad, vec![face_png(1)], LabelMetadata::default())
                .await,
            Err(EngineError::InvalidLabel(_))
        ));
    }
    assert!(engine.list_labels().is_empty());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = start(dir.path());
        engine
            .enroll("A", vec![face_png(1), face_png(2)], LabelMetadata::default())
            .await
            .unwrap();
    }
    let engine = start(dir.path());
    assert_eq!(engine.list_labels().get(&label("A")), Some(&2));
    assert_eq!(infer(&engine, &face_png(2)).label, "A");
}

#[tokio::test]
async fn test_corrupt_model_is_retrained_on_start() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = start(dir.path());
        engine
            .enroll("A", vec![face_png(1)], LabelMetadata::default())
            .await
            .unwrap();
    }
    let model_path = DataLayout::new(dir.path()).model_path();
    std::fs::write(&model_path, b"garbage").unwrap();

    let engine = start(dir.path());
    assert_eq!(infer(&engine, &face_png(1)).label, "A");
    assert!(std::fs::read(&model_path).unwrap().len() > 100);
}

/// Model store whose writes always fail.
struct BrokenModels;

impl ModelStore for BrokenModels {
    fn load(&self) -> Result<Option<Artifact>, StoreError> {
        Ok(None)
    }

    fn save(&mut self, _artifact: &Artifact) -> Result<(), StoreError> {
        Err(StoreError::io(
            "lbph.model",
            std::io::Error::new(std::io::ErrorKind::Other, "read-only filesystem"),
        ))
    }
}

#[tokio::test]
async fn test_failed_training_changes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let mut stores = Stores::open(&cfg).unwrap();
    stores.models = Box::new(BrokenModels);
    let engine = spawn_engine(&cfg, Arc::new(FakeLocator), stores).unwrap();

    let result = engine
        .enroll("A", vec![face_png(1), face_png(2)], LabelMetadata::default())
        .await;
    assert!(matches!(result, Err(EngineError::Storage(_))));
    assert!(engine.list_labels().is_empty());
    assert!(!dir.path().join("dataset").join("A").exists());
    assert_eq!(engine.infer(&face_png(1)).unwrap().outcome, Outcome::Untrained);
}

/// Model file whose next save fails once armed.
struct FlakyModels {
    inner: ModelFile,
    fail_next: Arc<AtomicBool>,
}

impl ModelStore for FlakyModels {
    fn load(&self) -> Result<Option<Artifact>, StoreError> {
        self.inner.load()
    }

    fn save(&mut self, artifact: &Artifact) -> Result<(), StoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::io(
                self.inner.path(),
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ));
        }
        self.inner.save(artifact)
    }
}

#[tokio::test]
async fn test_reenroll_after_failed_delete_forgets_old_face() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.recognition.threshold = 1.0;
    let fail_next = Arc::new(AtomicBool::new(false));
    let mut stores = Stores::open(&cfg).unwrap();
    stores.models = Box::new(FlakyModels {
        inner: ModelFile::new(cfg.layout().model_path()),
        fail_next: fail_next.clone(),
    });
    let engine = spawn_engine(&cfg, Arc::new(FakeLocator), stores).unwrap();

    engine
        .enroll("A", vec![face_png(1)], LabelMetadata::default())
        .await
        .unwrap();
    assert_eq!(infer(&engine, &face_png(1)).label, "A");

    fail_next.store(true, Ordering::SeqCst);
    assert!(matches!(
        engine.delete_label("A").await,
        Err(EngineError::Storage(_))
    ));
    assert!(engine.list_labels().is_empty());
    assert_ne!(infer(&engine, &face_png(1)).label, "A");

    // Same label, same id, same sample number, different face.
    engine
        .enroll("A", vec![face_png(50)], LabelMetadata::default())
        .await
        .unwrap();
    let old = engine.infer(&face_png(1)).unwrap();
    assert_eq!(old.outcome, Outcome::AboveThreshold);
    assert!(old.distance.unwrap().value() > 0.0);

    let new = engine.infer(&face_png(50)).unwrap();
    assert_eq!(new.outcome, Outcome::Recognized);
    assert_eq!(new.distance.unwrap().value(), 0.0);

    // The persisted model agrees after a restart.
    drop(engine);
    let stores = Stores::open(&cfg).unwrap();
    let engine = spawn_engine(&cfg, Arc::new(FakeLocator), stores).unwrap();
    assert_eq!(engine.infer(&face_png(1)).unwrap().label, None);
    assert_eq!(engine.infer(&face_png(50)).unwrap().label, Some(label("A")));
}

#[tokio::test]
async fn test_crop_majority_outvotes_stray_crop() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    let padding = cfg.detection.crop_padding;
    cfg.detection.crop_variants = vec![padding, padding, 0.3];
    let stores = Stores::open(&cfg).unwrap();
    let engine = spawn_engine(&cfg, Arc::new(FakeLocator), stores).unwrap();
    for (name, seed) in [("A", 1), ("B", 2), ("C", 3)] {
        engine
            .enroll(name, vec![face_png(seed)], LabelMetadata::default())
            .await
            .unwrap();
    }

    for (name, seed) in [("A", 1), ("B", 2), ("C", 3)] {
        let inf = engine.infer(&face_png(seed)).unwrap();
        assert_eq!(inf.outcome, Outcome::Recognized);
        assert_eq!(inf.label, Some(label(name)));
        assert_eq!(inf.bbox, Some(identikit_core::BoundingBox::new(8, 8, 48, 48)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inference_runs_alongside_writes() {
    let dir = tempfile::tempdir().unwrap();
    let engine = start(dir.path());
    engine
        .enroll("A", vec![face_png(1), face_png(2)], LabelMetadata::default())
        .await
        .unwrap();

    let query = face_png(1);
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let query = query.clone();
            std::thread::spawn(move || {
                (0..15)
                    .map(|_| infer(&engine, &query).label)
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for (i, name) in ["B", "C", "D"].iter().enumerate() {
        engine
            .enroll(name, vec![face_png(100 + i as u64)], LabelMetadata::default())
            .await
            .unwrap();
    }

    for reader in readers {
        for seen in reader.join().unwrap() {
            assert_eq!(seen, "A");
        }
    }
    assert_eq!(engine.list_labels().len(), 4);
}
