//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. Input resolution and
//! score threshold come from [`DetectorOptions`].

use crate::provider::DetectorOptions;
use crate::types::{BoundingBox, Frame};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("invalid detector options: {0}")]
    InvalidOptions(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    resized_w: usize,
    resized_h: usize,
}

impl Letterbox {
    fn fit(width: usize, height: usize, input: usize) -> Self {
        let scale = (input as f32 / width as f32).min(input as f32 / height as f32);
        let resized_w = ((width as f32 * scale).round() as usize).min(input);
        let resized_h = ((height as f32 * scale).round() as usize).min(input);
        Self {
            scale,
            pad_x: (input - resized_w) as f32 / 2.0,
            pad_y: (input - resized_h) as f32 / 2.0,
            resized_w,
            resized_h,
        }
    }

    /// Map a point in detector input space back to frame coordinates.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputIndices = (usize, usize, usize);

/// Raw head outputs for one stride level.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideOutputs<'_> {
    fn decode(&self, input_size: usize, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let grid = input_size / self.stride;
        let stride = self.stride as f32;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut detections = Vec::new();

        for idx in 0..anchors {
            let score = self.scores.get(idx).copied().unwrap_or(0.0);
            if score < threshold {
                continue;
            }
            let Some(b) = self.bboxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * stride;
            let cy = (cell / grid) as f32 * stride;

            let (x1, y1) = letterbox.to_frame(cx - b[0] * stride, cy - b[1] * stride);
            let (x2, y2) = letterbox.to_frame(cx + b[2] * stride, cy + b[3] * stride);

            let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.to_frame(cx + k[i * 2] * stride, cy + k[i * 2 + 1] * stride)
                })
            });

            detections.push(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            });
        }

        detections
    }
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_size: usize,
    score_threshold: f32,
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from `model_path`.
    pub fn load(model_path: &str, options: DetectorOptions) -> Result<Self, DetectorError> {
        let input_size = options.input_size as usize;
        if input_size == 0 || input_size % 32 != 0 {
            return Err(DetectorError::InvalidOptions(format!(
                "input_size must be a positive multiple of 32, got {input_size}"
            )));
        }
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::info!(
            path = model_path,
            input_size,
            score_threshold = options.score_threshold,
            ?stride_indices,
            "loaded SCRFD model"
        );

        Ok(Self {
            session,
            input_size,
            score_threshold: options.score_threshold,
            stride_indices,
        })
    }

    /// Detect faces in a grayscale frame, highest confidence first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame, self.input_size);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };

            let head = StrideOutputs {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            detections.extend(head.decode(self.input_size, &letterbox, self.score_threshold));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD))
    }
}

/// Bilinear resize of a grayscale buffer.
fn resize_bilinear(src: &[u8], width: usize, height: usize, out_w: usize, out_h: usize) -> Vec<u8> {
    let sx = width as f32 / out_w as f32;
    let sy = height as f32 / out_h as f32;
    let mut out = vec![0u8; out_w * out_h];

    for y in 0..out_h {
        let fy_src = ((y as f32 + 0.5) * sy - 0.5).max(0.0);
        let y0 = (fy_src as usize).min(height - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fy = fy_src - y0 as f32;

        for x in 0..out_w {
            let fx_src = ((x as f32 + 0.5) * sx - 0.5).max(0.0);
            let x0 = (fx_src as usize).min(width - 1);
            let x1 = (x0 + 1).min(width - 1);
            let fx = fx_src - x0 as f32;

            let top = src[y0 * width + x0] as f32 * (1.0 - fx) + src[y0 * width + x1] as f32 * fx;
            let bottom = src[y1 * width + x0] as f32 * (1.0 - fx) + src[y1 * width + x1] as f32 * fx;
            out[y * out_w + x] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Letterbox a grayscale frame into a normalized 1×3×N×N tensor.
fn preprocess(frame: &Frame, input_size: usize) -> (Array4<f32>, Letterbox) {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let letterbox = Letterbox::fit(w, h, input_size);
    let resized = resize_bilinear(&frame.data, w, h, letterbox.resized_w, letterbox.resized_h);

    let x_start = letterbox.pad_x.floor() as usize;
    let y_start = letterbox.pad_y.floor() as usize;

    // Padding normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    for y in 0..letterbox.resized_h {
        for x in 0..letterbox.resized_w {
            let value = (resized[y * letterbox.resized_w + x] as f32 - SCRFD_MEAN) / SCRFD_STD;
            for c in 0..3 {
                tensor[[0, c, y + y_start, x + x_start]] = value;
            }
        }
    }

    (tensor, letterbox)
}

/// Map SCRFD outputs to stride slots.
///
/// Exports named `score_8`, `bbox_16`, `kps_32`, ... are matched by name; anything
/// else falls back to the positional layout `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized; using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Non-maximum suppression; returns survivors sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::new();
    for candidate in detections {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}
