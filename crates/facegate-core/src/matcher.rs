//! Nearest-reference matching with an acceptance distance threshold.

use crate::types::{Embedding, MatchLabel, MatchResult, ReferenceSet};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Strategy for classifying a probe embedding against the enrolled references.
pub trait Matcher: Send + Sync {
    fn classify(&self, probe: &Embedding) -> MatchResult;
}

/// How the distance between two embeddings is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// L2 distance. Range [0, 2] for normalized embeddings.
    #[default]
    Euclidean,
    /// `1 - cosine similarity`. Range [0, 2].
    Cosine,
}

impl DistanceMetric {
    /// Distance between `a` and `b`; infinite when their lengths differ.
    pub fn distance(self, a: &Embedding, b: &Embedding) -> f32 {
        if a.values.len() != b.values.len() {
            return f32::INFINITY;
        }
        match self {
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::Cosine => 1.0 - a.similarity(b),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Nearest-neighbour matcher over a [`ReferenceSet`].
///
/// Every reference embedding is compared; the minimum distance wins. A label is
/// accepted only when that minimum is strictly below `threshold`.
pub struct DistanceMatcher {
    references: ReferenceSet,
    threshold: f32,
    metric: DistanceMetric,
}

impl DistanceMatcher {
    pub fn new(references: ReferenceSet, threshold: f32, metric: DistanceMetric) -> Self {
        Self {
            references,
            threshold,
            metric,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }
}

impl Matcher for DistanceMatcher {
    fn classify(&self, probe: &Embedding) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_label: Option<&str> = None;

        for entry in self.references.entries() {
            for reference in &entry.embeddings {
                let distance = self.metric.distance(probe, reference);
                if distance < best_distance {
                    best_distance = distance;
                    best_label = Some(&entry.label);
                }
            }
        }

        match best_label {
            Some(label) if best_distance < self.threshold => MatchResult {
                label: MatchLabel::Known(label.to_string()),
                distance: best_distance,
            },
            _ => MatchResult {
                label: MatchLabel::Unknown,
                distance: best_distance,
            },
        }
    }
}
