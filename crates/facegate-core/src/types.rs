use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// An 8-bit grayscale image: a decoded reference photo or a captured camera frame.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Wrap grayscale pixels. `is_dark` starts false; capture code sets it.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence: 0,
            is_dark: false,
        }
    }

    /// True when the buffer holds at least `width * height` pixels and neither
    /// dimension is zero.
    pub fn is_well_formed(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= self.width as usize * self.height as usize
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish_non_exhaustive()
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
///
/// Never mutated after the provider hands it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Zero when either vector has zero norm or
    /// the lengths differ.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between two embeddings. Infinite when the lengths
    /// differ (embeddings from different models are never comparable).
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled identity and every embedding recorded for it.
#[derive(Debug, Clone)]
pub struct ReferenceEntry {
    pub label: String,
    pub embeddings: Vec<Embedding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("reference set must contain at least one embedding")]
pub struct EmptyReferenceSet;

/// Ordered, non-empty collection of enrolled identities.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    entries: Vec<ReferenceEntry>,
}

impl ReferenceSet {
    /// Build a set from `(label, embedding)` pairs.
    ///
    /// Pairs sharing a label are merged into one entry, which keeps the
    /// position of the label's first occurrence.
    pub fn new<I>(pairs: I) -> Result<Self, EmptyReferenceSet>
    where
        I: IntoIterator<Item = (String, Embedding)>,
    {
        let mut entries: Vec<ReferenceEntry> = Vec::new();
        for (label, embedding) in pairs {
            match entries.iter_mut().find(|e| e.label == label) {
                Some(entry) => entry.embeddings.push(embedding),
                None => entries.push(ReferenceEntry {
                    label,
                    embeddings: vec![embedding],
                }),
            }
        }

        if entries.is_empty() {
            return Err(EmptyReferenceSet);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    /// Number of distinct labels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: construction rejects empty sets.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }
}

/// Label half of a [`MatchResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchLabel {
    Known(String),
    Unknown,
}

impl fmt::Display for MatchLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchLabel::Known(label) => f.write_str(label),
            MatchLabel::Unknown => f.write_str("unknown"),
        }
    }
}

/// Result of classifying one probe embedding. Produced once per tick.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: MatchLabel,
    /// Distance to the nearest reference embedding.
    pub distance: f32,
}
