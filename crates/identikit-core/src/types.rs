use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Longest accepted label, in characters.
pub const MAX_LABEL_CHARS: usize = 25;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("label is empty")]
    Empty,
    #[error("label is longer than {MAX_LABEL_CHARS} characters")]
    TooLong,
    #[error("label contains a path separator or control character: {0:?}")]
    InvalidCharacter(String),
    #[error("label {0:?} is reserved")]
    Reserved(String),
}

/// Identity label for one enrolled person.
///
/// Trimmed on construction and compared case-sensitively. Labels double as
/// directory names in the dataset store, so separators and control characters
/// are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(String);

impl Label {
    pub fn new(raw: &str) -> Result<Self, LabelError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LabelError::Empty);
        }
        if trimmed.chars().count() > MAX_LABEL_CHARS {
            return Err(LabelError::TooLong);
        }
        if trimmed
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(LabelError::InvalidCharacter(trimmed.to_string()));
        }
        if trimmed == "." || trimmed == ".." {
            return Err(LabelError::Reserved(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Label {
    type Error = LabelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Label::new(&value)
    }
}

impl From<Label> for String {
    fn from(label: Label) -> Self {
        label.0
    }
}

/// Dense numeric identity the classifier indexes by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelId(pub u32);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-label sample sequence number (the `NNNN` in `image_NNNN.png`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SampleId(pub u32);

/// Axis-aligned face region in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f32 / self.height as f32
    }

    /// Intersect with a `width × height` image. `None` when nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        let x0 = (self.x as i64).clamp(0, width as i64);
        let y0 = (self.y as i64).clamp(0, height as i64);
        let x1 = (self.x as i64 + self.width as i64).clamp(0, width as i64);
        let y1 = (self.y as i64 + self.height as i64).clamp(0, height as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(BoundingBox {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }

    /// Grow by `fraction` of the box size on every side, then clamp.
    pub fn expand(&self, fraction: f32, width: u32, height: u32) -> Option<BoundingBox> {
        let pad_x = (fraction * self.width as f32) as i64;
        let pad_y = (fraction * self.height as f32) as i64;
        let grown = BoundingBox {
            x: (self.x as i64 - pad_x) as i32,
            y: (self.y as i64 - pad_y) as i32,
            width: (self.width as i64 + 2 * pad_x).max(0) as u32,
            height: (self.height as i64 + 2 * pad_y).max(0) as u32,
        };
        grown.clamp_to(width, height)
    }

    /// `[x, y, w, h]`, the wire form callers render overlays from.
    pub fn to_array(&self) -> [i64; 4] {
        [
            self.x as i64,
            self.y as i64,
            self.width as i64,
            self.height as i64,
        ]
    }
}

/// Nearest-neighbor dissimilarity. Lower = more similar.
///
/// Never converted to a "higher is better" value inside the core; see
/// `score` in the engine's response types for the presentation form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distance(f64);

impl Distance {
    pub const ZERO: Distance = Distance(0.0);
    pub const INFINITE: Distance = Distance(f64::INFINITY);

    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.is_finite()
    }

    /// Accepted as a match under `threshold` (inclusive).
    pub fn is_within(&self, threshold: f64) -> bool {
        self.0 <= threshold
    }
}

impl Eq for Distance {}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

/// Descriptive record attached to a label, independent of the model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "case", default, skip_serializing_if = "Option::is_none")]
    pub case_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl LabelMetadata {
    /// True when no descriptive field carries a value.
    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|f| f.is_none())
    }

    /// Overlay the non-blank fields of `update` onto `self`.
    pub fn merge(&mut self, update: &LabelMetadata) {
        fn pick(slot: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value.as_deref().map(str::trim) {
                if !v.is_empty() {
                    *slot = Some(v.to_string());
                }
            }
        }
        pick(&mut self.title, &update.title);
        pick(&mut self.case_ref, &update.case_ref);
        pick(&mut self.sex, &update.sex);
        pick(&mut self.age, &update.age);
        pick(&mut self.address, &update.address);
        pick(&mut self.notes, &update.notes);
    }

    fn fields(&self) -> [&Option<String>; 6] {
        [
            &self.title,
            &self.case_ref,
            &self.sex,
            &self.age,
            &self.address,
            &self.notes,
        ]
    }
}
