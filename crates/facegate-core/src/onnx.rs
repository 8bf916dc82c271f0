//! ONNX-backed [`EmbeddingProvider`]: SCRFD detection followed by ArcFace
//! embedding, running on a dedicated engine thread.

use crate::detector::FaceDetector;
use crate::provider::{DetectorOptions, EmbeddingProvider, ProviderError};
use crate::recognizer::FaceRecognizer;
use crate::types::{Embedding, Frame};
use async_trait::async_trait;
use std::path::Path;
use tokio::sync::{mpsc, oneshot, OnceCell};

/// Messages sent from async callers to the engine thread.
struct EmbedRequest {
    frame: Frame,
    reply: oneshot::Sender<Result<Option<Embedding>, ProviderError>>,
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
struct EngineHandle {
    tx: mpsc::Sender<EmbedRequest>,
}

/// SCRFD + ArcFace embedding provider.
///
/// Models are loaded by [`EmbeddingProvider::load`]; inference runs on an OS
/// thread so the async runtime never blocks on ONNX Runtime.
pub struct OnnxEmbedder {
    scrfd_path: String,
    arcface_path: String,
    options: DetectorOptions,
    engine: OnceCell<EngineHandle>,
}

impl OnnxEmbedder {
    pub fn new(scrfd_path: impl Into<String>, arcface_path: impl Into<String>, options: DetectorOptions) -> Self {
        Self {
            scrfd_path: scrfd_path.into(),
            arcface_path: arcface_path.into(),
            options,
            engine: OnceCell::new(),
        }
    }

    /// Provider using the standard model file names inside `model_dir`.
    pub fn from_model_dir(model_dir: &Path, options: DetectorOptions) -> Self {
        Self::new(
            model_dir.join("det_10g.onnx").to_string_lossy().into_owned(),
            model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned(),
            options,
        )
    }
}

#[async_trait]
impl EmbeddingProvider for OnnxEmbedder {
    async fn load(&self) -> Result<(), ProviderError> {
        self.engine
            .get_or_try_init(|| spawn_engine(&self.scrfd_path, &self.arcface_path, self.options))
            .await
            .map(|_| ())
    }

    async fn embed(&self, image: &Frame) -> Result<Option<Embedding>, ProviderError> {
        if !image.is_well_formed() {
            return Err(ProviderError::InvalidInput(format!(
                "{}x{} frame with {} bytes",
                image.width,
                image.height,
                image.data.len()
            )));
        }
        let engine = self.engine.get().ok_or(ProviderError::NotLoaded)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        engine
            .tx
            .send(EmbedRequest {
                frame: image.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProviderError::EngineClosed)?;
        reply_rx.await.map_err(|_| ProviderError::EngineClosed)?
    }
}

/// Load both models on a fresh engine thread and wait until they are ready.
async fn spawn_engine(
    scrfd_path: &str,
    arcface_path: &str,
    options: DetectorOptions,
) -> Result<EngineHandle, ProviderError> {
    let (tx, mut rx) = mpsc::channel::<EmbedRequest>(4);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), ProviderError>>();
    let scrfd_path = scrfd_path.to_string();
    let arcface_path = arcface_path.to_string();

    std::thread::Builder::new()
        .name("facegate-embedder".into())
        .spawn(move || {
            let loaded = FaceDetector::load(&scrfd_path, options)
                .map_err(|e| ProviderError::ModelLoad(e.to_string()))
                .and_then(|detector| {
                    FaceRecognizer::load(&arcface_path)
                        .map(|recognizer| (detector, recognizer))
                        .map_err(|e| ProviderError::ModelLoad(e.to_string()))
                });

            let (mut detector, mut recognizer) = match loaded {
                Ok(models) => {
                    let _ = ready_tx.send(Ok(()));
                    models
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            tracing::info!("embedding engine started");
            while let Some(req) = rx.blocking_recv() {
                let result = embed_frame(&mut detector, &mut recognizer, &req.frame);
                let _ = req.reply.send(result);
            }
            tracing::info!("embedding engine exiting");
        })
        .map_err(|e| ProviderError::ModelLoad(format!("failed to spawn engine thread: {e}")))?;

    ready_rx.await.map_err(|_| ProviderError::EngineClosed)??;
    Ok(EngineHandle { tx })
}

fn embed_frame(
    detector: &mut FaceDetector,
    recognizer: &mut FaceRecognizer,
    frame: &Frame,
) -> Result<Option<Embedding>, ProviderError> {
    let faces = detector
        .detect(frame)
        .map_err(|e| ProviderError::Inference(e.to_string()))?;

    let Some(face) = faces.first() else {
        return Ok(None);
    };
    tracing::debug!(confidence = face.confidence, candidates = faces.len(), "face detected");

    recognizer
        .extract(frame, face)
        .map(Some)
        .map_err(|e| ProviderError::Inference(e.to_string()))
}
