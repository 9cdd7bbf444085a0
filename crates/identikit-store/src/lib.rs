//! identikit-store: on-disk implementations of the core storage traits.
//!
//! Layout under the data directory:
//!
//! ```text
//! dataset/<label>/image_NNNN.png
//! model/lbph.model
//! labels.json
//! metadata.db
//! ```

pub mod dataset;
pub mod metadata;
pub mod model_file;
pub mod registry_file;

pub use dataset::FsDataset;
pub use metadata::SqliteMetadata;
pub use model_file::ModelFile;
pub use registry_file::JsonRegistry;

use identikit_core::StoreError;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Paths of every persisted component under one data directory.
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join("dataset")
    }

    pub fn model_path(&self) -> PathBuf {
        self.root.join("model").join("lbph.model")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join("labels.json")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("metadata.db")
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}
