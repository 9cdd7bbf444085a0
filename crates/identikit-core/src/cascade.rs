//! Haar cascade face detector.
//!
//! Loads OpenCV (>= 2.4) boosted Haar cascades from their XML form and runs a
//! multi-scale sliding-window search over an integral image, followed by
//! OpenCV-compatible rectangle grouping.

use crate::types::BoundingBox;
use image::GrayImage;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
/// Relative tolerance used when clustering overlapping windows.
const GROUP_EPS: f64 = 0.2;
/// Scale steps at or below this are rejected; the pyramid would never end.
const MIN_SCALE_FACTOR: f64 = 1.01;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}; point cascade_path at an OpenCV haarcascade XML")]
    NotFound(String),
    #[error("failed to read cascade: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cascade XML: {0}")]
    Parse(String),
    #[error("unsupported cascade: {0}")]
    Unsupported(String),
}

/// Multi-scale search parameters.
#[derive(Debug, Clone)]
pub struct DetectParams {
    /// Window growth per pyramid level (e.g. 1.1).
    pub scale_factor: f32,
    /// Candidate windows a cluster needs beyond itself to survive grouping.
    /// Zero disables grouping.
    pub min_neighbors: u32,
    /// Smallest face side in pixels.
    pub min_size: u32,
    /// Largest face side in pixels.
    pub max_size: Option<u32>,
}

impl Default for DetectParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.1,
            min_neighbors: 7,
            min_size: 100,
            max_size: None,
        }
    }
}

/// One grouped detection.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Number of raw windows merged into this detection.
    pub neighbors: u32,
}

#[derive(Debug, Clone, Copy)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

#[derive(Debug, Clone)]
struct Node {
    feature: usize,
    threshold: f64,
    left: i32,
    right: i32,
}

/// A weak classifier: a decision tree whose leaf references are `<= 0`.
#[derive(Debug, Clone)]
struct Tree {
    nodes: Vec<Node>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Stage {
    threshold: f64,
    trees: Vec<Tree>,
}

/// A pretrained boosted Haar cascade.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

// --- XML schema (new-style OpenCV cascade) ---

#[derive(Deserialize)]
struct StorageXml {
    cascade: CascadeXml,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CascadeXml {
    stage_type: String,
    feature_type: String,
    height: String,
    width: String,
    stages: SeqXml<StageXml>,
    features: SeqXml<FeatureXml>,
}

/// OpenCV serializes sequences as repeated `<_>` children.
#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct SeqXml<T> {
    #[serde(rename = "_", default)]
    items: Vec<T>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StageXml {
    stage_threshold: String,
    weak_classifiers: SeqXml<WeakXml>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeakXml {
    internal_nodes: String,
    leaf_values: String,
}

#[derive(Deserialize)]
struct FeatureXml {
    rects: SeqXml<String>,
    #[serde(default)]
    tilted: Option<String>,
}

impl HaarCascade {
    /// Load a cascade XML file from disk.
    pub fn load(path: &Path) -> Result<Self, CascadeError> {
        if !path.exists() {
            return Err(CascadeError::NotFound(path.display().to_string()));
        }
        let xml = std::fs::read_to_string(path)?;
        let cascade = Self::from_xml(&xml)?;
        tracing::info!(
            path = %path.display(),
            stages = cascade.stages.len(),
            features = cascade.features.len(),
            window = ?(cascade.window_width, cascade.window_height),
            "loaded Haar cascade"
        );
        Ok(cascade)
    }

    /// Parse a cascade from its XML text.
    pub fn from_xml(xml: &str) -> Result<Self, CascadeError> {
        let storage: StorageXml =
            quick_xml::de::from_str(xml).map_err(|e| CascadeError::Parse(e.to_string()))?;
        let raw = storage.cascade;

        if raw.stage_type.trim() != "BOOST" {
            return Err(CascadeError::Unsupported(format!(
                "stage type {:?}",
                raw.stage_type.trim()
            )));
        }
        if raw.feature_type.trim() != "HAAR" {
            return Err(CascadeError::Unsupported(format!(
                "feature type {:?}",
                raw.feature_type.trim()
            )));
        }

        let window_width: u32 = parse_num(&raw.width, "width")?;
        let window_height: u32 = parse_num(&raw.height, "height")?;
        if window_width < 3 || window_height < 3 {
            return Err(CascadeError::Parse(format!(
                "window {window_width}x{window_height} is too small"
            )));
        }

        let features = raw
            .features
            .items
            .iter()
            .map(|f| parse_feature(f, window_width, window_height))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = raw
            .stages
            .items
            .iter()
            .map(|s| parse_stage(s, features.len()))
            .collect::<Result<Vec<_>, _>>()?;

        if stages.is_empty() {
            return Err(CascadeError::Parse("cascade has no stages".into()));
        }

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    /// Base detection window `(width, height)`.
    pub fn window(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    pub fn feature_count(&self) -> usize {
        self.features.len()
    }

    /// Scan `gray` at every scale and return grouped detections.
    pub fn detect(&self, gray: &GrayImage, params: &DetectParams) -> Vec<Detection> {
        let (img_w, img_h) = gray.dimensions();
        if img_w < self.window_width || img_h < self.window_height {
            return Vec::new();
        }

        let integral = IntegralImage::new(gray);
        let factor = (params.scale_factor as f64).max(MIN_SCALE_FACTOR);
        let base_side = self.window_width.min(self.window_height) as f64;
        let base_norm_area =
            ((self.window_width - 2) as f64) * ((self.window_height - 2) as f64);

        let mut scale = (params.min_size as f64 / base_side).max(1.0);
        let mut candidates = Vec::new();

        loop {
            let win_w = (self.window_width as f64 * scale).round() as u32;
            let win_h = (self.window_height as f64 * scale).round() as u32;
            if win_w > img_w || win_h > img_h {
                break;
            }
            if let Some(max) = params.max_size {
                if win_w > max || win_h > max {
                    break;
                }
            }

            let scaled = ScaledCascade::new(self, scale, win_w, win_h);
            let step = if scale <= 2.0 { 2.0 * scale } else { scale };
            let step = (step.round() as u32).max(1);

            let mut y = 0;
            while y + win_h <= img_h {
                let mut x = 0;
                while x + win_w <= img_w {
                    if scaled.accepts(self, &integral, x, y, base_norm_area) {
                        candidates.push(BoundingBox::new(x as i32, y as i32, win_w, win_h));
                    }
                    x += step;
                }
                y += step;
            }

            scale *= factor;
        }

        tracing::trace!(candidates = candidates.len(), "cascade scan finished");
        group_rectangles(candidates, params.min_neighbors, GROUP_EPS)
    }
}

fn parse_num<T: std::str::FromStr>(text: &str, what: &str) -> Result<T, CascadeError> {
    text.trim()
        .parse()
        .map_err(|_| CascadeError::Parse(format!("{what}: {:?} is not a number", text.trim())))
}

fn parse_numbers(text: &str, what: &str) -> Result<Vec<f64>, CascadeError> {
    text.split_whitespace()
        .map(|tok| parse_num::<f64>(tok, what))
        .collect()
}

fn parse_feature(
    raw: &FeatureXml,
    window_width: u32,
    window_height: u32,
) -> Result<HaarFeature, CascadeError> {
    if let Some(tilted) = &raw.tilted {
        if tilted.trim() != "0" {
            return Err(CascadeError::Unsupported("tilted Haar features".into()));
        }
    }

    let mut rects = Vec::with_capacity(raw.rects.items.len());
    for text in &raw.rects.items {
        let v = parse_numbers(text, "rect")?;
        if v.len() != 5 {
            return Err(CascadeError::Parse(format!(
                "rect needs 5 values, got {}",
                v.len()
            )));
        }
        let (x, y, w, h) = (v[0] as u32, v[1] as u32, v[2] as u32, v[3] as u32);
        if w == 0 || h == 0 || x + w > window_width || y + h > window_height {
            return Err(CascadeError::Parse(format!(
                "rect {x},{y},{w},{h} outside {window_width}x{window_height} window"
            )));
        }
        rects.push(WeightedRect {
            x,
            y,
            width: w,
            height: h,
            weight: v[4],
        });
    }
    if rects.is_empty() {
        return Err(CascadeError::Parse("feature without rects".into()));
    }
    Ok(HaarFeature { rects })
}

fn parse_stage(raw: &StageXml, feature_count: usize) -> Result<Stage, CascadeError> {
    let threshold = parse_num(&raw.stage_threshold, "stageThreshold")?;
    let trees = raw
        .weak_classifiers
        .items
        .iter()
        .map(|w| parse_tree(w, feature_count))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage { threshold, trees })
}

fn parse_tree(raw: &WeakXml, feature_count: usize) -> Result<Tree, CascadeError> {
    let values = parse_numbers(&raw.internal_nodes, "internalNodes")?;
    if values.is_empty() || values.len() % 4 != 0 {
        return Err(CascadeError::Parse(format!(
            "internalNodes needs groups of 4 values, got {}",
            values.len()
        )));
    }
    let leaves = parse_numbers(&raw.leaf_values, "leafValues")?;

    let nodes: Vec<Node> = values
        .chunks_exact(4)
        .map(|c| Node {
            left: c[0] as i32,
            right: c[1] as i32,
            feature: c[2] as usize,
            threshold: c[3],
        })
        .collect();

    for node in &nodes {
        if node.feature >= feature_count {
            return Err(CascadeError::Parse(format!(
                "feature index {} out of range ({feature_count} features)",
                node.feature
            )));
        }
        for child in [node.left, node.right] {
            let valid = if child > 0 {
                (child as usize) < nodes.len()
            } else {
                ((-child) as usize) < leaves.len()
            };
            if !valid {
                return Err(CascadeError::Parse(format!("dangling tree reference {child}")));
            }
        }
    }

    Ok(Tree { nodes, leaves })
}

/// Summed-area tables for pixel values and their squares.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sq_sum = vec![0u64; stride * (h + 1)];
        let raw = gray.as_raw();

        for y in 0..h {
            let mut row = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = raw[y * w + x] as u64;
                row += p;
                row_sq += p * p;
                let idx = (y + 1) * stride + (x + 1);
                sum[idx] = sum[idx - stride] + row;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq;
            }
        }

        Self { stride, sum, sq_sum }
    }

    fn rect(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y1 * stride + x0]
            - table[y0 * stride + x1]
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sq_sum(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        Self::rect(&self.sq_sum, self.stride, x, y, w, h)
    }
}

/// Feature rectangles rescaled for one pyramid level. Weights are corrected
/// for rounding so every feature keeps its base-window response.
struct ScaledCascade {
    features: Vec<Vec<WeightedRect>>,
    norm: (u32, u32, u32, u32),
}

impl ScaledCascade {
    fn new(cascade: &HaarCascade, scale: f64, win_w: u32, win_h: u32) -> Self {
        let features = cascade
            .features
            .iter()
            .map(|f| {
                f.rects
                    .iter()
                    .map(|r| {
                        let x = ((r.x as f64 * scale).round() as u32).min(win_w - 1);
                        let y = ((r.y as f64 * scale).round() as u32).min(win_h - 1);
                        let w = ((r.width as f64 * scale).round() as u32)
                            .max(1)
                            .min(win_w - x);
                        let h = ((r.height as f64 * scale).round() as u32)
                            .max(1)
                            .min(win_h - y);
                        let base_area = (r.width * r.height) as f64;
                        let area = (w * h) as f64;
                        WeightedRect {
                            x,
                            y,
                            width: w,
                            height: h,
                            weight: r.weight * base_area / area,
                        }
                    })
                    .collect()
            })
            .collect();

        let inset = (scale.round() as u32).max(1);
        let norm = (
            inset,
            inset,
            win_w.saturating_sub(2 * inset).max(1),
            win_h.saturating_sub(2 * inset).max(1),
        );

        Self { features, norm }
    }

    fn feature_value(&self, integral: &IntegralImage, index: usize, x: u32, y: u32) -> f64 {
        self.features[index]
            .iter()
            .map(|r| r.weight * integral.sum(x + r.x, y + r.y, r.width, r.height) as f64)
            .sum()
    }

    fn accepts(
        &self,
        cascade: &HaarCascade,
        integral: &IntegralImage,
        x: u32,
        y: u32,
        base_norm_area: f64,
    ) -> bool {
        let (nx, ny, nw, nh) = self.norm;
        let area = (nw * nh) as f64;
        let mean = integral.sum(x + nx, y + ny, nw, nh) as f64 / area;
        let variance = integral.sq_sum(x + nx, y + ny, nw, nh) as f64 / area - mean * mean;
        let std_dev = if variance > 0.0 { variance.sqrt() } else { 1.0 };
        let norm_factor = base_norm_area * std_dev;

        for stage in &cascade.stages {
            let mut stage_sum = 0.0;
            for tree in &stage.trees {
                let mut idx = 0usize;
                stage_sum += loop {
                    let node = &tree.nodes[idx];
                    let value = self.feature_value(integral, node.feature, x, y);
                    let next = if value < node.threshold * norm_factor {
                        node.left
                    } else {
                        node.right
                    };
                    if next <= 0 {
                        break tree.leaves[(-next) as usize];
                    }
                    idx = next as usize;
                };
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }
}

fn similar(a: &BoundingBox, b: &BoundingBox, eps: f64) -> bool {
    let delta = eps * (a.width.min(b.width) as f64 + a.height.min(b.height) as f64) * 0.5;
    let close = |p: i64, q: i64| ((p - q).abs() as f64) <= delta;
    close(a.x as i64, b.x as i64)
        && close(a.y as i64, b.y as i64)
        && close(
            a.x as i64 + a.width as i64,
            b.x as i64 + b.width as i64,
        )
        && close(
            a.y as i64 + a.height as i64,
            b.y as i64 + b.height as i64,
        )
}

fn find(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster overlapping windows and keep clusters with more than
/// `min_neighbors` members, averaged. Weak clusters nested inside stronger
/// ones are dropped.
fn group_rectangles(rects: Vec<BoundingBox>, min_neighbors: u32, eps: f64) -> Vec<Detection> {
    if min_neighbors == 0 {
        return rects
            .into_iter()
            .map(|bbox| Detection { bbox, neighbors: 1 })
            .collect();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    // Accumulate per cluster in first-seen order so output is deterministic.
    let mut cluster_of = vec![usize::MAX; n];
    let mut sums: Vec<([i64; 4], u32)> = Vec::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        if cluster_of[root] == usize::MAX {
            cluster_of[root] = sums.len();
            sums.push(([0; 4], 0));
        }
        let entry = &mut sums[cluster_of[root]];
        let r = &rects[i];
        entry.0[0] += r.x as i64;
        entry.0[1] += r.y as i64;
        entry.0[2] += r.width as i64;
        entry.0[3] += r.height as i64;
        entry.1 += 1;
    }

    let averaged: Vec<Detection> = sums
        .into_iter()
        .map(|(s, count)| {
            let c = count as f64;
            Detection {
                bbox: BoundingBox::new(
                    (s[0] as f64 / c).round() as i32,
                    (s[1] as f64 / c).round() as i32,
                    (s[2] as f64 / c).round() as u32,
                    (s[3] as f64 / c).round() as u32,
                ),
                neighbors: count,
            }
        })
        .collect();

    let mut kept = Vec::new();
    for (i, d1) in averaged.iter().enumerate() {
        if d1.neighbors <= min_neighbors {
            continue;
        }
        let r1 = &d1.bbox;
        let nested = averaged.iter().enumerate().any(|(j, d2)| {
            if i == j || d2.neighbors <= min_neighbors {
                return false;
            }
            let r2 = &d2.bbox;
            let dx = (r2.width as f64 * eps).round() as i64;
            let dy = (r2.height as f64 * eps).round() as i64;
            r1.x as i64 >= r2.x as i64 - dx
                && r1.y as i64 >= r2.y as i64 - dy
                && r1.x as i64 + r1.width as i64 <= r2.x as i64 + r2.width as i64 + dx
                && r1.y as i64 + r1.height as i64 <= r2.y as i64 + r2.height as i64 + dy
                && (d2.neighbors > d1.neighbors.max(3) || d1.neighbors < 3)
        });
        if !nested {
            kept.push(d1.clone());
        }
    }
    kept
}
