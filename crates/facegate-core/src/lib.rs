//! facegate-core: Reference enrollment and face matching.
//!
//! Defines the embedding provider and matcher contracts consumed by the
//! verification session, a distance-based matcher, the reference enrollment
//! loader, and an ONNX-backed provider (SCRFD detection + ArcFace embedding).

pub mod alignment;
pub mod detector;
pub mod enrollment;
pub mod matcher;
pub mod onnx;
pub mod provider;
pub mod recognizer;
pub mod types;

pub use enrollment::{
    EnrollmentError, EnrollmentReport, FetchError, FsImageFetcher, ImageFetcher, ReferenceLoader,
    ReferenceSource, SkippedReference,
};
pub use matcher::{DistanceMatcher, DistanceMetric, Matcher};
pub use onnx::OnnxEmbedder;
pub use provider::{DetectorOptions, EmbeddingProvider, ProviderError};
pub use types::{
    BoundingBox, Embedding, EmptyReferenceSet, Frame, MatchLabel, MatchResult, ReferenceEntry,
    ReferenceSet,
};
