//! Per-label directories of lossless PNG face samples.

use identikit_core::normalizer::resize_area;
use identikit_core::{DatasetStore, Label, NormalizedFace, Sample, SampleId, StoreError};
use image::ImageFormat;
use std::io::{Cursor, ErrorKind, Write};
use std::path::{Path, PathBuf};

/// `root/<label>/image_NNNN.png`, ids starting at 1.
pub struct FsDataset {
    root: PathBuf,
    face_size: u32,
}

impl FsDataset {
    pub fn open(root: impl Into<PathBuf>, face_size: u32) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root, face_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn label_dir(&self, label: &Label) -> PathBuf {
        self.root.join(label.as_str())
    }

    fn sample_path(dir: &Path, id: SampleId) -> PathBuf {
        dir.join(format!("image_{:04}.png", id.0))
    }

    fn parse_sample_name(name: &str) -> Option<SampleId> {
        let digits = name.strip_prefix("image_")?.strip_suffix(".png")?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(SampleId)
    }

    /// Sample ids present for `label`, ascending.
    fn sample_ids(&self, label: &Label) -> Result<Vec<SampleId>, StoreError> {
        let dir = self.label_dir(label);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&dir, e)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            if let Some(id) = entry.file_name().to_str().and_then(Self::parse_sample_name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn encode(face: &NormalizedFace) -> Result<Vec<u8>, StoreError> {
        let mut bytes = Vec::new();
        face.image()
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| StoreError::Codec(e.to_string()))?;
        Ok(bytes)
    }

    fn decode(&self, path: &Path) -> Result<NormalizedFace, StoreError> {
        let gray = image::open(path)
            .map_err(|e| StoreError::corrupt(path, e.to_string()))?
            .to_luma8();
        let gray = if gray.dimensions() == (self.face_size, self.face_size) {
            gray
        } else {
            tracing::debug!(path = %path.display(), "resizing sample to current face size");
            resize_area(&gray, self.face_size, self.face_size)
        };
        NormalizedFace::from_gray(gray, self.face_size)
            .map_err(|e| StoreError::corrupt(path, e.to_string()))
    }
}

impl DatasetStore for FsDataset {
    fn append(&mut self, label: &Label, face: &NormalizedFace) -> Result<SampleId, StoreError> {
        let dir = self.label_dir(label);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let bytes = Self::encode(face)?;

        let mut next = self.sample_ids(label)?.last().map_or(1, |id| id.0 + 1);
        loop {
            let id = SampleId(next);
            let path = Self::sample_path(&dir, id);
            let mut file = match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    next += 1;
                    continue;
                }
                Err(e) => return Err(StoreError::io(&path, e)),
            };
            if let Err(e) = file.write_all(&bytes).and_then(|_| file.sync_all()) {
                let _ = std::fs::remove_file(&path);
                return Err(StoreError::io(&path, e));
            }
            tracing::debug!(%label, sample = id.0, "sample stored");
            return Ok(id);
        }
    }

    fn remove_sample(&mut self, label: &Label, id: SampleId) -> Result<(), StoreError> {
        let dir = self.label_dir(label);
        let path = Self::sample_path(&dir, id);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }
        // Drop the directory once its last sample is gone.
        if self.sample_ids(label)?.is_empty() {
            let _ = std::fs::remove_dir(&dir);
        }
        Ok(())
    }

    fn list(&self, label: &Label) -> Result<Vec<Sample>, StoreError> {
        let dir = self.label_dir(label);
        self.sample_ids(label)?
            .into_iter()
            .map(|id| {
                Ok(Sample {
                    id,
                    face: self.decode(&Self::sample_path(&dir, id))?,
                })
            })
            .collect()
    }

    fn delete(&mut self, label: &Label) -> Result<(), StoreError> {
        let dir = self.label_dir(label);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(%label, "dataset label removed");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    fn count(&self, label: &Label) -> Result<u32, StoreError> {
        Ok(self.sample_ids(label)?.len() as u32)
    }

    fn labels(&self) -> Result<Vec<Label>, StoreError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let mut labels = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.root, e))?;
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            match Label::new(name) {
                Ok(label) if label.as_str() == name => {
                    if !self.sample_ids(&label)?.is_empty() {
                        labels.push(label);
                    }
                }
                _ => tracing::warn!(dir = name, "ignoring dataset directory with invalid label"),
            }
        }
        labels.sort();
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use rand::{Rng, SeedableRng};

    const SIZE: u32 = 24;

    fn face(seed: u64) -> NormalizedFace {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let img = GrayImage::from_fn(SIZE, SIZE, |_, _| Luma([rng.gen()]));
        NormalizedFace::from_gray(img, SIZE).unwrap()
    }

    fn label(s: &str) -> Label {
        Label::new(s).unwrap()
    }

    #[test]
    fn test_append_and_list_roundtrip_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = FsDataset::open(dir.path(), SIZE).unwrap();
        let a = label("Ann");
        assert_eq!(ds.append(&a, &face(1)).unwrap(), SampleId(1));
        assert_eq!(ds.append(&a, &face(2)).unwrap(), SampleId(2));
        assert!(dir.path().join("Ann").join("image_0002.png").exists());

        let samples = ds.list(&a).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].face, face(1));
        assert_eq!(samples[1].id, SampleId(2));
    }

    #[test]
    fn test_append_continues_after_max() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = FsDataset::open(dir.path(), SIZE).unwrap();
        let a = label("a");
        ds.append(&a, &face(1)).unwrap();
        ds.append(&a, &face(2)).unwrap();
        ds.append(&a, &face(3)).unwrap();
        ds.remove_sample(&a, SampleId(2)).unwrap();
        // Gaps are never refilled; the next id follows the highest.
        assert_eq!(ds.append(&a, &face(4)).unwrap(), SampleId(4));
        assert_eq!(ds.count(&a).unwrap(), 3);
    }

    #[test]
    fn test_delete_and_unknown_label() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = FsDataset::open(dir.path(), SIZE).unwrap();
        let a = label("a");
        ds.append(&a, &face(1)).unwrap();
        ds.delete(&a).unwrap();
        ds.delete(&label("never")).unwrap();
        assert_eq!(ds.count(&a).unwrap(), 0);
        assert!(ds.list(&a).unwrap().is_empty());
        assert!(ds.labels().unwrap().is_empty());
    }

    #[test]
    fn test_labels_skip_empty_and_foreign_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = FsDataset::open(dir.path(), SIZE).unwrap();
        ds.append(&label("b"), &face(1)).unwrap();
        ds.append(&label("a"), &face(2)).unwrap();
        std::fs::create_dir(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("README"), "x").unwrap();
        std::fs::write(dir.path().join("a").join("notes.txt"), "x").unwrap();

        assert_eq!(ds.labels().unwrap(), vec![label("a"), label("b")]);
        assert_eq!(ds.count(&label("a")).unwrap(), 1);
    }

    #[test]
    fn test_list_resizes_foreign_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let a = label("a");
        std::fs::create_dir(dir.path().join("a")).unwrap();
        GrayImage::from_pixel(48, 48, Luma([90]))
            .save(dir.path().join("a").join("image_0001.png"))
            .unwrap();
        let ds = FsDataset::open(dir.path(), SIZE).unwrap();
        let samples = ds.list(&a).unwrap();
        assert_eq!(samples[0].face.size(), SIZE);
    }

    #[test]
    fn test_corrupt_sample_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a").join("image_0001.png"), b"not a png").unwrap();
        let ds = FsDataset::open(dir.path(), SIZE).unwrap();
        assert!(matches!(ds.list(&label("a")), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_parse_sample_name() {
        assert_eq!(FsDataset::parse_sample_name("image_0007.png"), Some(SampleId(7)));
        assert_eq!(FsDataset::parse_sample_name("image_12345.png"), Some(SampleId(12345)));
        assert_eq!(FsDataset::parse_sample_name("image_.png"), None);
        assert_eq!(FsDataset::parse_sample_name("image_00a1.png"), None);
        assert_eq!(FsDataset::parse_sample_name("photo_0001.png"), None);
    }
}
