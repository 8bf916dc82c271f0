//! Ownership of the live camera stream for the session.

use crate::observer::SessionObserver;
use crate::state::AttemptToken;
use facegate_core::Frame;
use facegate_hw::{CameraError, CameraSource, VideoStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A bound stream. Captures lock the stream itself, never the session slot,
/// so releasing does not wait for device I/O.
struct ActiveStream {
    stream: Mutex<Box<dyn VideoStream>>,
}

impl ActiveStream {
    fn lock(&self) -> MutexGuard<'_, Box<dyn VideoStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.stream.get_mut().unwrap_or_else(PoisonError::into_inner).stop();
    }
}

type StreamSlot = Arc<Mutex<Option<Arc<ActiveStream>>>>;

/// Acquires, serves and releases the single active camera stream.
///
/// Device I/O runs on the blocking pool. Binding a freshly opened stream and
/// detaching the active one both happen under the slot lock, so a stream
/// opened for an attempt that was stopped in the meantime is closed instead
/// of bound. A capture in flight during release keeps the stream alive until
/// it returns; the stream is stopped when that capture drops its handle.
pub struct CameraSession {
    source: Arc<dyn CameraSource>,
    observer: Arc<dyn SessionObserver>,
    active: StreamSlot,
}

fn lock(slot: &StreamSlot) -> MutexGuard<'_, Option<Arc<ActiveStream>>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CameraSession {
    pub fn new(source: Arc<dyn CameraSource>, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            source,
            observer,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the camera for `attempt` and bind it to the preview surface.
    ///
    /// Returns `Ok(false)` when the attempt stopped while the device was being
    /// opened; the new stream is closed and nothing stays bound.
    pub async fn acquire(&self, attempt: &Arc<AttemptToken>) -> Result<bool, CameraError> {
        let source = Arc::clone(&self.source);
        let observer = Arc::clone(&self.observer);
        let slot = Arc::clone(&self.active);
        let attempt = Arc::clone(attempt);

        tokio::task::spawn_blocking(move || -> Result<bool, CameraError> {
            let mut stream = source.open()?;
            let mut active = lock(&slot);
            if !attempt.is_running() {
                stream.stop();
                tracing::debug!(device = %source.describe(), "attempt stopped during camera open; stream closed");
                return Ok(false);
            }
            let previous = active.replace(Arc::new(ActiveStream {
                stream: Mutex::new(stream),
            }));
            observer.surface(true);
            drop(active);
            drop(previous);
            Ok(true)
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("camera task failed: {e}")))?
    }

    /// Detach the active stream from the surface and stop it. A capture still
    /// running on it finishes first and the stream stops when it returns.
    /// No-op when nothing is active.
    pub fn release(&self) {
        let Some(stream) = lock(&self.active).take() else {
            return;
        };
        self.observer.surface(false);
        if let Ok(mut idle) = stream.stream.try_lock() {
            idle.stop();
        }
        tracing::debug!(device = %self.source.describe(), "camera released");
    }

    /// Current frame of the active stream, `None` when no stream is bound or
    /// it was released before the frame could be taken.
    pub async fn frame(&self) -> Result<Option<Frame>, CameraError> {
        let Some(stream) = lock(&self.active).clone() else {
            return Ok(None);
        };
        tokio::task::spawn_blocking(move || -> Result<Option<Frame>, CameraError> {
            let mut guard = stream.lock();
            if !guard.is_active() {
                return Ok(None);
            }
            guard.capture_frame().map(Some)
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("capture task failed: {e}")))?
    }

    pub fn is_active(&self) -> bool {
        lock(&self.active).is_some()
    }
}
