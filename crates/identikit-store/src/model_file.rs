//! Checksummed binary artifact file.
//!
//! ```text
//! magic "IDKLBPH2" | MessagePack payload | SHA-256
//! ```
//!
//! The trailing digest covers every preceding byte.

use crate::write_atomic;
use identikit_core::lbp::FeatureParams;
use identikit_core::{Artifact, Entry, ModelStore, StoreError, TrainedLabel};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"IDKLBPH2";
const DIGEST_LEN: usize = 32;
const FORMAT_VERSION: u32 = 2;

#[derive(Serialize)]
struct PayloadRef<'a> {
    version: u32,
    params: &'a FeatureParams,
    labels: Vec<&'a TrainedLabel>,
    entries: &'a [Entry],
}

#[derive(Deserialize)]
struct Payload {
    version: u32,
    params: FeatureParams,
    labels: Vec<TrainedLabel>,
    entries: Vec<Entry>,
}

pub struct ModelFile {
    path: PathBuf,
}

impl ModelFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn encode(artifact: &Artifact) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        let payload = rmp_serde::to_vec(&PayloadRef {
            version: FORMAT_VERSION,
            params: artifact.params(),
            labels: artifact.labels().collect(),
            entries: artifact.entries(),
        })?;

        let mut out = Vec::with_capacity(MAGIC.len() + payload.len() + DIGEST_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&payload);
        let digest = Sha256::digest(&out);
        out.extend_from_slice(&digest);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Artifact, String> {
        if bytes.len() < MAGIC.len() + DIGEST_LEN {
            return Err(format!("file too short ({} bytes)", bytes.len()));
        }
        let (body, digest) = bytes.split_at(bytes.len() - DIGEST_LEN);
        if Sha256::digest(body).as_slice() != digest {
            return Err("checksum mismatch".into());
        }
        let Some(payload) = body.strip_prefix(MAGIC.as_slice()) else {
            return Err("bad magic".into());
        };

        let payload: Payload =
            rmp_serde::from_slice(payload).map_err(|e| format!("payload: {e}"))?;
        if payload.version != FORMAT_VERSION {
            return Err(format!("unsupported version {}", payload.version));
        }
        Artifact::from_parts(payload.params, payload.labels, payload.entries)
            .map_err(|e| e.to_string())
    }
}

impl ModelStore for ModelFile {
    fn load(&self) -> Result<Option<Artifact>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        let artifact =
            Self::decode(&bytes).map_err(|reason| StoreError::corrupt(&self.path, reason))?;
        tracing::info!(
            path = %self.path.display(),
            labels = artifact.label_count(),
            entries = artifact.len(),
            "model loaded"
        );
        Ok(Some(artifact))
    }

    fn save(&mut self, artifact: &Artifact) -> Result<(), StoreError> {
        let bytes = Self::encode(artifact).map_err(|e| StoreError::Codec(e.to_string()))?;
        write_atomic(&self.path, &bytes)?;
        tracing::debug!(path = %self.path.display(), bytes = bytes.len(), "model saved");
        Ok(())
    }
}
