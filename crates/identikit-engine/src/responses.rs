//! Serializable result shapes for the transport layer.
//!
//! `confidence` is the raw chi-square distance (lower is better). `score` is
//! the only "higher is better" value and is derived here, nowhere else.

use crate::orchestrator::{Inference, Outcome};
use identikit_core::{Label, LabelMetadata};
use serde::Serialize;
use std::collections::BTreeMap;

pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self { status: "ok" }
    }
}

/// Label → sample count.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct LabelsResponse(pub BTreeMap<String, u32>);

impl From<BTreeMap<Label, u32>> for LabelsResponse {
    fn from(counts: BTreeMap<Label, u32>) -> Self {
        Self(counts.into_iter().map(|(l, n)| (l.into(), n)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferResponse {
    pub label: String,
    /// Distance to the nearest enrolled face; `null` when none was compared.
    pub confidence: Option<f64>,
    /// `clamp((threshold - distance) / threshold, 0, 1)`.
    pub score: Option<f64>,
    /// `[x, y, w, h]` of the located face.
    pub bbox: Option<[i64; 4]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<LabelMetadata>,
}

impl From<Inference> for InferResponse {
    fn from(inf: Inference) -> Self {
        let label = match (&inf.outcome, &inf.label) {
            (Outcome::Recognized, Some(label)) => label.to_string(),
            _ => UNKNOWN_LABEL.to_string(),
        };
        let confidence = inf.distance.map(|d| d.value()).filter(|d| d.is_finite());
        Self {
            label,
            confidence,
            score: confidence.map(|d| score(d, inf.threshold)),
            bbox: inf.bbox.map(|b| b.to_array()),
            metadata: inf.metadata,
        }
    }
}

/// Presentation-only similarity in `[0, 1]`.
pub fn score(distance: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 0.0;
    }
    ((threshold - distance) / threshold).clamp(0.0, 1.0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollResponse {
    pub added: u32,
    /// Images that could not be decoded or had no usable face.
    pub skipped: u32,
    pub labels_count: usize,
    pub images_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildResponse {
    pub labels_count: usize,
    pub images_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteResponse {
    /// The deleted label, or `null` when nothing matched.
    pub removed: Option<String>,
    pub labels_count: usize,
    pub images_count: u64,
}
