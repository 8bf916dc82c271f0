//! In-process doubles for the provider, fetcher, camera, store and observer.
//!
//! Images are identified by their first pixel: a reference "a.jpg" decodes to
//! a frame of pixel 1, and the fake camera captures frames of whatever pixel
//! it is currently set to.

use crate::error::SessionError;
use crate::observer::SessionObserver;
use crate::state::{AttemptToken, ControlState, SessionState};
use crate::storage::{LabelStore, MemoryLabelStore, StoreError, VerifiedRecord};
use crate::verification::TickSink;
use async_trait::async_trait;
use facegate_core::{
    DistanceMatcher, DistanceMetric, Embedding, EmbeddingProvider, FetchError, Frame, ImageFetcher,
    Matcher, ProviderError, ReferenceSet,
};
use facegate_hw::{CameraError, CameraSource, VideoStream};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Embedding for reference "a".
pub(crate) const FACE_A: [f32; 2] = [1.0, 0.0];
/// Embedding for reference "b".
pub(crate) const FACE_B: [f32; 2] = [0.0, 1.0];

fn frame_of(pixel: u8) -> Frame {
    Frame::new(vec![pixel; 16], 4, 4)
}

/// Matcher over references `a` = [`FACE_A`] and `b` = [`FACE_B`].
pub(crate) fn reference_matcher(threshold: f32) -> Arc<dyn Matcher> {
    let references = ReferenceSet::new(vec![
        ("a".to_string(), Embedding::new(FACE_A.to_vec())),
        ("b".to_string(), Embedding::new(FACE_B.to_vec())),
    ])
    .unwrap();
    Arc::new(DistanceMatcher::new(references, threshold, DistanceMetric::Euclidean))
}

/// Provider answering from a pixel → embedding table.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    faces: Mutex<HashMap<u8, Vec<f32>>>,
    failing: Mutex<HashSet<u8>>,
    fail_load: AtomicBool,
    panic_on_load: AtomicBool,
    load_gate: Mutex<Option<Arc<Notify>>>,
    embed_gate: Mutex<Option<Arc<Semaphore>>>,
    loads: AtomicUsize,
    embeds: AtomicUsize,
}

impl ScriptedProvider {
    /// Pixel 1 is face a, 2 is face b, 51 is close to a, 50 matches nobody.
    /// Everything else has no face.
    pub(crate) fn with_default_faces() -> Self {
        let provider = Self::default();
        provider.set_face(1, &FACE_A);
        provider.set_face(2, &FACE_B);
        provider.set_face(51, &[0.9, 0.1]);
        provider.set_face(50, &[0.7, 0.7]);
        provider
    }

    pub(crate) fn set_face(&self, pixel: u8, values: &[f32]) {
        self.faces.lock().unwrap().insert(pixel, values.to_vec());
    }

    pub(crate) fn remove_face(&self, pixel: u8) {
        self.faces.lock().unwrap().remove(&pixel);
    }

    pub(crate) fn fail_embeds_on(&self, pixel: u8) {
        self.failing.lock().unwrap().insert(pixel);
    }

    pub(crate) fn fail_load(&self) {
        self.fail_load.store(true, Ordering::SeqCst);
    }

    pub(crate) fn panic_on_load(&self) {
        self.panic_on_load.store(true, Ordering::SeqCst);
    }

    /// Make `load` wait until the returned gate is notified.
    pub(crate) fn gate_load(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.load_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Make every `embed` wait for a permit of the returned semaphore.
    pub(crate) fn gate_embeds(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.embed_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Embed calls entered, including ones still waiting on a gate.
    pub(crate) fn embeds(&self) -> usize {
        self.embeds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedProvider {
    async fn load(&self) -> Result<(), ProviderError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let gate = self.load_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.panic_on_load.load(Ordering::SeqCst) {
            panic!("scripted panic in load");
        }
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(ProviderError::ModelLoad("scripted failure".into()));
        }
        Ok(())
    }

    async fn embed(&self, image: &Frame) -> Result<Option<Embedding>, ProviderError> {
        self.embeds.fetch_add(1, Ordering::SeqCst);
        let gate = self.embed_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        let pixel = image.data[0];
        if self.failing.lock().unwrap().contains(&pixel) {
            return Err(ProviderError::Inference("scripted failure".into()));
        }
        Ok(self.faces.lock().unwrap().get(&pixel).cloned().map(Embedding::new))
    }
}

/// Resolves `a.jpg` to pixel 1 and `b.jpg` to pixel 2.
pub(crate) struct MapFetcher(pub(crate) HashMap<String, u8>);

impl Default for MapFetcher {
    fn default() -> Self {
        Self(HashMap::from([("a.jpg".to_string(), 1), ("b.jpg".to_string(), 2)]))
    }
}

#[async_trait]
impl ImageFetcher for MapFetcher {
    async fn fetch(&self, image: &str) -> Result<Frame, FetchError> {
        self.0
            .get(image)
            .map(|&pixel| frame_of(pixel))
            .ok_or_else(|| FetchError::Io(format!("{image}: not found")))
    }
}

/// Camera producing uniform frames of a settable pixel value.
pub(crate) struct FakeCamera {
    pixel: Arc<AtomicU8>,
    dark: Arc<AtomicBool>,
    deny: AtomicBool,
    opens: AtomicUsize,
    live: Arc<AtomicUsize>,
    captures: Arc<AtomicUsize>,
    open_delay_ms: AtomicU64,
    capture_delay_ms: Arc<AtomicU64>,
}

impl FakeCamera {
    pub(crate) fn new(pixel: u8) -> Self {
        Self {
            pixel: Arc::new(AtomicU8::new(pixel)),
            dark: Arc::new(AtomicBool::new(false)),
            deny: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            captures: Arc::new(AtomicUsize::new(0)),
            open_delay_ms: AtomicU64::new(0),
            capture_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make `open` block for `delay` before the device is available.
    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.open_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make every capture block for `delay` after it starts.
    pub(crate) fn set_capture_delay(&self, delay: Duration) {
        self.capture_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_pixel(&self, pixel: u8) {
        self.pixel.store(pixel, Ordering::SeqCst);
    }

    pub(crate) fn set_dark(&self, dark: bool) {
        self.dark.store(dark, Ordering::SeqCst);
    }

    pub(crate) fn deny_permission(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    /// Completed opens.
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Streams opened and not yet stopped.
    pub(crate) fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub(crate) fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl CameraSource for FakeCamera {
    fn open(&self) -> Result<Box<dyn VideoStream>, CameraError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CameraError::PermissionDenied("fake camera".into()));
        }
        std::thread::sleep(Duration::from_millis(self.open_delay_ms.load(Ordering::SeqCst)));
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeStream {
            pixel: self.pixel.clone(),
            dark: self.dark.clone(),
            live: self.live.clone(),
            captures: self.captures.clone(),
            capture_delay_ms: self.capture_delay_ms.clone(),
            active: true,
            sequence: 0,
        }))
    }

    fn describe(&self) -> String {
        "fake camera".into()
    }
}

struct FakeStream {
    pixel: Arc<AtomicU8>,
    dark: Arc<AtomicBool>,
    live: Arc<AtomicUsize>,
    captures: Arc<AtomicUsize>,
    capture_delay_ms: Arc<AtomicU64>,
    active: bool,
    sequence: u32,
}

impl VideoStream for FakeStream {
    fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        if !self.active {
            return Err(CameraError::Stopped);
        }
        self.captures.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(self.capture_delay_ms.load(Ordering::SeqCst)));
        self.sequence += 1;
        let mut frame = frame_of(self.pixel.load(Ordering::SeqCst));
        frame.sequence = self.sequence;
        frame.is_dark = self.dark.load(Ordering::SeqCst);
        Ok(frame)
    }

    fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Memory store that counts writes and can be told to fail them.
#[derive(Default)]
pub(crate) struct CountingStore {
    inner: MemoryLabelStore,
    sets: AtomicUsize,
    clears: AtomicUsize,
    fail_sets: AtomicBool,
}

impl CountingStore {
    pub(crate) fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub(crate) fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_sets(&self) {
        self.fail_sets.store(true, Ordering::SeqCst);
    }

    pub(crate) fn label(&self) -> Option<String> {
        self.inner.get().unwrap().map(|r| r.label)
    }
}

impl LabelStore for CountingStore {
    fn get(&self) -> Result<Option<VerifiedRecord>, StoreError> {
        self.inner.get()
    }

    fn set(&self, record: &VerifiedRecord) -> Result<(), StoreError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: "fake".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "scripted failure"),
            });
        }
        self.inner.set(record)
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear()
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    statuses: Mutex<Vec<String>>,
    states: Mutex<Vec<SessionState>>,
    controls: Mutex<Vec<ControlState>>,
    surfaces: Mutex<Vec<bool>>,
    navigations: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub(crate) fn statuses(&self) -> Vec<String> {
        self.statuses.lock().unwrap().clone()
    }

    pub(crate) fn states(&self) -> Vec<SessionState> {
        self.states.lock().unwrap().clone()
    }

    pub(crate) fn last_controls(&self) -> Option<ControlState> {
        self.controls.lock().unwrap().last().copied()
    }

    pub(crate) fn surfaces(&self) -> Vec<bool> {
        self.surfaces.lock().unwrap().clone()
    }

    pub(crate) fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }
}

impl SessionObserver for RecordingObserver {
    fn status(&self, text: &str) {
        self.statuses.lock().unwrap().push(text.to_string());
    }

    fn state_changed(&self, state: SessionState) {
        self.states.lock().unwrap().push(state);
    }

    fn controls(&self, controls: ControlState) {
        self.controls.lock().unwrap().push(controls);
    }

    fn surface(&self, attached: bool) {
        self.surfaces.lock().unwrap().push(attached);
    }

    fn navigate(&self, destination: &str) {
        self.navigations.lock().unwrap().push(destination.to_string());
    }
}

/// Tick sink that finalizes through the attempt token alone.
#[derive(Default)]
pub(crate) struct RecordingSink {
    finalized: Mutex<Vec<String>>,
    unknown: AtomicUsize,
    failures: AtomicUsize,
}

impl RecordingSink {
    pub(crate) fn finalized(&self) -> Vec<String> {
        self.finalized.lock().unwrap().clone()
    }

    pub(crate) fn unknown_count(&self) -> usize {
        self.unknown.load(Ordering::SeqCst)
    }

    pub(crate) fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl TickSink for RecordingSink {
    fn finalize(&self, attempt: &Arc<AttemptToken>, label: &str, _distance: f32) -> Result<bool, SessionError> {
        if !attempt.try_finish() {
            return Ok(false);
        }
        self.finalized.lock().unwrap().push(label.to_string());
        Ok(true)
    }

    fn unknown_face(&self, _attempt: &Arc<AttemptToken>, _distance: f32) {
        self.unknown.fetch_add(1, Ordering::SeqCst);
    }

    fn fail(&self, attempt: &Arc<AttemptToken>, _err: &SessionError) -> bool {
        if !attempt.try_finish() {
            return false;
        }
        self.failures.fetch_add(1, Ordering::SeqCst);
        true
    }
}
