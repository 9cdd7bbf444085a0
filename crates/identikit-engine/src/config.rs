use identikit_core::lbp::FeatureParams;
use identikit_core::{Acceptance, DetectParams, Illumination, TrainingParams};
use crate::orchestrator::CropVoting;
use identikit_store::DataLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration: TOML file (optional) overlaid by `IDENTIKIT_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the dataset, model, registry and metadata files.
    pub data_dir: PathBuf,
    /// Haar cascade XML (default: `<data_dir>/haarcascade_frontalface_default.xml`).
    pub cascade_path: Option<PathBuf>,
    pub detection: DetectionConfig,
    pub normalization: NormalizationConfig,
    pub recognition: RecognitionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub scale_factor: f32,
    pub min_neighbors: u32,
    pub min_face_size: u32,
    pub max_face_size: Option<u32>,
    /// Histogram-equalize the frame before scanning.
    pub equalize: bool,
    /// Fraction of the face size added on each side of an enrollment crop.
    pub crop_padding: f32,
    /// Paddings of the crops that vote at inference, one crop each.
    pub crop_variants: Vec<f32>,
    pub min_aspect: f32,
    pub max_aspect: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 7,
            min_face_size: 100,
            max_face_size: None,
            equalize: true,
            crop_padding: 0.10,
            crop_variants: vec![0.08, 0.12, 0.16],
            min_aspect: 0.7,
            max_aspect: 1.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IlluminationKind {
    None,
    Equalize,
    Clahe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub face_size: u32,
    pub illumination: IlluminationKind,
    pub clahe_tiles: u32,
    pub clahe_clip: f32,
    /// Denoise and Laplacian-sharpen every face after illumination.
    pub sharpen: bool,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            face_size: 200,
            illumination: IlluminationKind::Clahe,
            clahe_tiles: 8,
            clahe_clip: 0.02,
            sharpen: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub radius: u32,
    pub grid_x: u32,
    pub grid_y: u32,
    /// Chi-square distance at or below which a match is accepted.
    pub threshold: f64,
    /// Upper bound on per-label threshold growth; 0 disables it.
    pub adaptive_margin: f64,
    /// Labels with fewer samples are not matched.
    pub min_samples_per_label: u32,
    /// Without a crop majority, the closest crop is accepted only this far
    /// under its threshold.
    pub fallback_margin: f64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            radius: 1,
            grid_x: 8,
            grid_y: 8,
            threshold: 60.0,
            adaptive_margin: 10.0,
            min_samples_per_label: 1,
            fallback_margin: 5.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cascade_path: None,
            detection: DetectionConfig::default(),
            normalization: NormalizationConfig::default(),
            recognition: RecognitionConfig::default(),
        }
    }
}

impl Config {
    /// Load `path` (or defaults when `None`), apply environment overrides
    /// and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Overlay `IDENTIKIT_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("IDENTIKIT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(path) = std::env::var("IDENTIKIT_CASCADE_PATH") {
            self.cascade_path = Some(PathBuf::from(path));
        }
        self.recognition.threshold = env_f64("IDENTIKIT_THRESHOLD", self.recognition.threshold);
        self.recognition.min_samples_per_label =
            env_u32("IDENTIKIT_MIN_SAMPLES", self.recognition.min_samples_per_label);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.detection;
        let n = &self.normalization;
        let r = &self.recognition;
        let problem = if d.scale_factor <= 1.0 {
            Some("detection.scale_factor must be greater than 1")
        } else if !(d.min_aspect > 0.0 && d.min_aspect <= d.max_aspect) {
            Some("detection aspect range is empty")
        } else if !(0.0..1.0).contains(&d.crop_padding) {
            Some("detection.crop_padding must be in [0, 1)")
        } else if d.crop_variants.is_empty() {
            Some("detection.crop_variants needs at least one padding")
        } else if !d.crop_variants.iter().all(|p| (0.0..1.0).contains(p)) {
            Some("detection.crop_variants must be in [0, 1)")
        } else if n.face_size < 16 {
            Some("normalization.face_size must be at least 16")
        } else if r.radius == 0 || r.radius.saturating_mul(2) >= n.face_size {
            Some("recognition.radius does not fit the face size")
        } else if r.grid_x == 0 || r.grid_y == 0 {
            Some("recognition grid must be at least 1x1")
        } else if !(r.threshold.is_finite() && r.threshold > 0.0) {
            Some("recognition.threshold must be positive")
        } else if !(r.adaptive_margin.is_finite() && r.adaptive_margin >= 0.0) {
            Some("recognition.adaptive_margin must be non-negative")
        } else if !(r.fallback_margin.is_finite() && r.fallback_margin >= 0.0) {
            Some("recognition.fallback_margin must be non-negative")
        } else {
            None
        };
        match problem {
            Some(msg) => Err(ConfigError::Invalid(msg.to_string())),
            None => Ok(()),
        }
    }

    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }

    pub fn cascade_path(&self) -> PathBuf {
        self.cascade_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("haarcascade_frontalface_default.xml"))
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            scale_factor: self.detection.scale_factor,
            min_neighbors: self.detection.min_neighbors,
            min_size: self.detection.min_face_size,
            max_size: self.detection.max_face_size,
        }
    }

    pub fn acceptance(&self) -> Acceptance {
        Acceptance {
            min_aspect: self.detection.min_aspect,
            max_aspect: self.detection.max_aspect,
        }
    }

    pub fn illumination(&self) -> Illumination {
        match self.normalization.illumination {
            IlluminationKind::None => Illumination::None,
            IlluminationKind::Equalize => Illumination::Equalize,
            IlluminationKind::Clahe => Illumination::Clahe {
                tiles: self.normalization.clahe_tiles,
                clip_limit: self.normalization.clahe_clip,
            },
        }
    }

    pub fn crop_voting(&self) -> CropVoting {
        CropVoting {
            paddings: self.detection.crop_variants.clone(),
            fallback_margin: self.recognition.fallback_margin,
        }
    }

    pub fn feature_params(&self) -> FeatureParams {
        FeatureParams {
            radius: self.recognition.radius,
            grid_x: self.recognition.grid_x,
            grid_y: self.recognition.grid_y,
            face_size: self.normalization.face_size,
        }
    }

    pub fn training_params(&self) -> TrainingParams {
        TrainingParams {
            features: self.feature_params(),
            threshold: self.recognition.threshold,
            adaptive_margin: self.recognition.adaptive_margin,
        }
    }
}

/// `$XDG_DATA_HOME/identikit`, falling back to `~/.local/share/identikit`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("identikit")
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
