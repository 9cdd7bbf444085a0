use crate::write_atomic;
use identikit_core::{LabelRegistry, RegistryStore, StoreError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Label registry persisted as pretty-printed JSON.
pub struct JsonRegistry {
    path: PathBuf,
}

impl JsonRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryStore for JsonRegistry {
    fn load(&self) -> Result<Option<LabelRegistry>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        let registry: LabelRegistry = serde_json::from_str(&text)
            .map_err(|e| StoreError::corrupt(&self.path, e.to_string()))?;
        registry
            .validate()
            .map_err(|e| StoreError::corrupt(&self.path, e.to_string()))?;
        tracing::debug!(path = %self.path.display(), labels = registry.len(), "registry loaded");
        Ok(Some(registry))
    }

    fn save(&mut self, registry: &LabelRegistry) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(registry)
            .map_err(|e| StoreError::corrupt(&self.path, e.to_string()))?;
        write_atomic(&self.path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identikit_core::{Label, LabelId};

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRegistry::new(dir.path().join("labels.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonRegistry::new(dir.path().join("labels.json"));
        let mut registry = LabelRegistry::new();
        let bo = Label::new("Bo").unwrap();
        registry.ensure(&Label::new("Al").unwrap());
        registry.ensure(&bo);
        registry.set_samples(&bo, 7);
        store.save(&registry).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, registry);
        assert_eq!(loaded.id_of(&bo), Some(LabelId(1)));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonRegistry::new(&path).load(),
            Err(StoreError::Corrupt { .. })
        ));

        std::fs::write(&path, r#"{"labels":{"x":{"id":3,"samples":1},"y":{"id":3,"samples":2}}}"#)
            .unwrap();
        assert!(matches!(
            JsonRegistry::new(&path).load(),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
