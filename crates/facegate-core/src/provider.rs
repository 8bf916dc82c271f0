//! Embedding provider contract.

use crate::types::{Embedding, Frame};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("model not loaded")]
    NotLoaded,
    #[error("invalid input image: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("embedding engine exited")]
    EngineClosed,
}

/// Detector sensitivity, fixed when the provider is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectorOptions {
    /// Square detector input resolution in pixels. Must be a multiple of 32.
    pub input_size: u32,
    /// Minimum detection score for a face to count.
    pub score_threshold: f32,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            input_size: 416,
            score_threshold: 0.5,
        }
    }
}

/// Produces a face embedding for the most prominent face in an image.
///
/// "No face" is a normal outcome (`Ok(None)`), never an error. Errors are
/// reserved for malformed input and provider-internal failures.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Bring the model to a ready state. Calling it again once loaded is a no-op.
    async fn load(&self) -> Result<(), ProviderError>;

    /// Embed the highest-confidence face in `image`, if any.
    async fn embed(&self, image: &Frame) -> Result<Option<Embedding>, ProviderError>;
}
