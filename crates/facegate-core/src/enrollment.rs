//! Reference enrollment: turn a list of labelled reference images into a
//! [`ReferenceSet`].
//!
//! Entries whose image cannot be read, or in which no face is found, are
//! skipped with a warning. Only a completely empty result is fatal.

use crate::provider::{EmbeddingProvider, ProviderError};
use crate::types::{Embedding, Frame, ReferenceSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("no reference face could be read; check {} (close-up, well lit)", .sources.join(", "))]
    NoReferenceFaces { sources: Vec<String> },
    #[error("embedding provider failed on {source_ref}: {error}")]
    Provider {
        source_ref: String,
        error: ProviderError,
    },
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("image not readable: {0}")]
    Io(String),
    #[error("image decode failed: {0}")]
    Decode(String),
}

/// A labelled reference image. `image` is an opaque locator handed to the
/// [`ImageFetcher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSource {
    pub label: String,
    pub image: String,
}

impl ReferenceSource {
    pub fn new(label: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            image: image.into(),
        }
    }
}

/// Resolves a reference locator to a grayscale image.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, image: &str) -> Result<Frame, FetchError>;
}

/// Reads reference images from the file system, relative to `base_dir`.
pub struct FsImageFetcher {
    base_dir: PathBuf,
}

impl FsImageFetcher {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn resolve(&self, image: &str) -> PathBuf {
        let path = Path::new(image);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

#[async_trait]
impl ImageFetcher for FsImageFetcher {
    async fn fetch(&self, image: &str) -> Result<Frame, FetchError> {
        let path = self.resolve(image);
        if !path.exists() {
            return Err(FetchError::Io(format!("{} does not exist", path.display())));
        }

        tokio::task::spawn_blocking(move || {
            let decoded = image::open(&path)
                .map_err(|e| FetchError::Decode(format!("{}: {e}", path.display())))?;
            let gray = decoded.to_luma8();
            let (width, height) = gray.dimensions();
            Ok(Frame::new(gray.into_raw(), width, height))
        })
        .await
        .map_err(|e| FetchError::Decode(format!("decode task failed: {e}")))?
    }
}

/// Why a reference entry did not make it into the set.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedReference {
    pub label: String,
    pub image: String,
    pub reason: String,
}

/// Outcome of an enrollment pass, for diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrollmentReport {
    pub enrolled: Vec<ReferenceSource>,
    pub skipped: Vec<SkippedReference>,
}

/// Builds a [`ReferenceSet`] by embedding each reference image.
pub struct ReferenceLoader {
    provider: Arc<dyn EmbeddingProvider>,
    fetcher: Arc<dyn ImageFetcher>,
}

impl ReferenceLoader {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, fetcher: Arc<dyn ImageFetcher>) -> Self {
        Self { provider, fetcher }
    }

    /// Enroll every entry, failing only when nothing could be enrolled.
    pub async fn load(&self, entries: &[ReferenceSource]) -> Result<ReferenceSet, EnrollmentError> {
        self.load_with_report(entries).await.map(|(set, _)| set)
    }

    /// Like [`load`](Self::load), also returning which entries were skipped and why.
    pub async fn load_with_report(
        &self,
        entries: &[ReferenceSource],
    ) -> Result<(ReferenceSet, EnrollmentReport), EnrollmentError> {
        let mut pairs: Vec<(String, Embedding)> = Vec::with_capacity(entries.len());
        let mut report = EnrollmentReport::default();

        for entry in entries {
            let frame = match self.fetcher.fetch(&entry.image).await {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(label = %entry.label, image = %entry.image, error = %err, "reference image unreadable; skipping");
                    report.skipped.push(SkippedReference {
                        label: entry.label.clone(),
                        image: entry.image.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            let embedding = self
                .provider
                .embed(&frame)
                .await
                .map_err(|error| EnrollmentError::Provider {
                    source_ref: entry.image.clone(),
                    error,
                })?;

            match embedding {
                Some(embedding) => {
                    tracing::debug!(label = %entry.label, image = %entry.image, "reference enrolled");
                    pairs.push((entry.label.clone(), embedding));
                    report.enrolled.push(entry.clone());
                }
                None => {
                    tracing::warn!(label = %entry.label, image = %entry.image, "no face detected in reference image; skipping");
                    report.skipped.push(SkippedReference {
                        label: entry.label.clone(),
                        image: entry.image.clone(),
                        reason: "no face detected".into(),
                    });
                }
            }
        }

        let set = ReferenceSet::new(pairs).map_err(|_| EnrollmentError::NoReferenceFaces {
            sources: entries.iter().map(|e| e.image.clone()).collect(),
        })?;

        tracing::info!(
            labels = set.len(),
            enrolled = report.enrolled.len(),
            skipped = report.skipped.len(),
            "reference enrollment complete"
        );

        Ok((set, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds a frame as `[first_pixel]`; frames whose first pixel is 0 have no face,
    /// 255 triggers an inference error.
    struct PixelProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for PixelProvider {
        async fn load(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn embed(&self, image: &Frame) -> Result<Option<Embedding>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match image.data[0] {
                0 => Ok(None),
                255 => Err(ProviderError::Inference("boom".into())),
                v => Ok(Some(Embedding::new(vec![v as f32]))),
            }
        }
    }

    struct MapFetcher(HashMap<String, u8>);

    #[async_trait]
    impl ImageFetcher for MapFetcher {
        async fn fetch(&self, image: &str) -> Result<Frame, FetchError> {
            self.0
                .get(image)
                .map(|&v| Frame::new(vec![v; 4], 2, 2))
                .ok_or_else(|| FetchError::Io(format!("{image} missing")))
        }
    }

    fn loader(images: &[(&str, u8)]) -> (ReferenceLoader, Arc<PixelProvider>) {
        let provider = Arc::new(PixelProvider {
            calls: AtomicUsize::new(0),
        });
        let fetcher = MapFetcher(images.iter().map(|(k, v)| (k.to_string(), *v)).collect());
        (
            ReferenceLoader::new(provider.clone(), Arc::new(fetcher)),
            provider,
        )
    }

    #[tokio::test]
    async fn test_all_undetectable_is_rejected() {
        let (loader, _) = loader(&[("known/a.jpg", 0), ("known/b.jpg", 0)]);
        let entries = vec![
            ReferenceSource::new("a", "known/a.jpg"),
            ReferenceSource::new("b", "known/b.jpg"),
        ];

        let err = loader.load(&entries).await.unwrap_err();
        match &err {
            EnrollmentError::NoReferenceFaces { sources } => {
                assert_eq!(sources, &vec!["known/a.jpg".to_string(), "known/b.jpg".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        let message = err.to_string();
        assert!(message.contains("known/a.jpg") && message.contains("known/b.jpg"));
    }

    #[tokio::test]
    async fn test_partial_enrollment_keeps_valid_entry() {
        let (loader, _) = loader(&[("known/a.jpg", 10), ("known/b.jpg", 0)]);
        let entries = vec![
            ReferenceSource::new("a", "known/a.jpg"),
            ReferenceSource::new("b", "known/b.jpg"),
        ];

        let (set, report) = loader.load_with_report(&entries).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.labels().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].label, "b");
    }

    #[tokio::test]
    async fn test_unreadable_image_is_skipped() {
        let (loader, provider) = loader(&[("known/a.jpg", 10)]);
        let entries = vec![
            ReferenceSource::new("missing", "known/missing.jpg"),
            ReferenceSource::new("a", "known/a.jpg"),
        ];

        let set = loader.load(&entries).await.unwrap();
        assert_eq!(set.labels().collect::<Vec<_>>(), vec!["a"]);
        // The unreadable entry never reaches the provider.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_labels_merge() {
        let (loader, _) = loader(&[("a1.jpg", 10), ("a2.jpg", 20)]);
        let entries = vec![
            ReferenceSource::new("a", "a1.jpg"),
            ReferenceSource::new("a", "a2.jpg"),
        ];

        let set = loader.load(&entries).await.unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.entries()[0].embeddings.len(), 2);
    }

    #[tokio::test]
    async fn test_provider_error_is_fatal() {
        let (loader, _) = loader(&[("ok.jpg", 10), ("bad.jpg", 255)]);
        let entries = vec![
            ReferenceSource::new("a", "ok.jpg"),
            ReferenceSource::new("b", "bad.jpg"),
        ];

        let err = loader.load(&entries).await.unwrap_err();
        assert!(matches!(err, EnrollmentError::Provider { ref source_ref, .. } if source_ref == "bad.jpg"));
    }

    #[tokio::test]
    async fn test_fs_fetcher_decodes_grayscale() {
        let dir = tempfile::tempdir().unwrap();
        let img = image::GrayImage::from_pixel(4, 3, image::Luma([90u8]));
        img.save(dir.path().join("a.png")).unwrap();

        let fetcher = FsImageFetcher::new(dir.path());
        let frame = fetcher.fetch("a.png").await.unwrap();
        assert_eq!((frame.width, frame.height), (4, 3));
        assert!(frame.data.iter().all(|&p| p == 90));
    }

    #[tokio::test]
    async fn test_fs_fetcher_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FsImageFetcher::new(dir.path());
        let err = fetcher.fetch("nope.jpg").await.unwrap_err();
        assert!(matches!(err, FetchError::Io(_)));
    }
}
