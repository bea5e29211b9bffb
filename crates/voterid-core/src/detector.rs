//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the working image into the 640×640 network input, decodes the
//! three anchor-free stride heads (scores, boxes, five-point landmarks) and
//! suppresses overlaps with NMS.

use crate::types::FaceLocation;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.4;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unsupported SCRFD export: {0}")]
    UnsupportedModel(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("detector session poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection tuning.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Minimum face score kept before NMS.
    pub confidence_threshold: f32,
    /// IoU above which the weaker of two boxes is dropped.
    pub nms_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: DEFAULT_NMS_THRESHOLD,
        }
    }
}

/// Letterbox placement of the working image inside the network input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let input = SCRFD_INPUT_SIZE as f32;
        let scale = (input / width as f32).min(input / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((input - new_w) / 2.0).floor(),
            pad_y: ((input - new_h) / 2.0).floor(),
        }
    }

    /// Network-input point → image point.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector. Safe to share across threads; inference calls
/// are serialized on the underlying session.
pub struct FaceDetector {
    session: Mutex<Session>,
    stride_outputs: [StrideOutputs; 3],
    config: DetectorConfig,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::UnsupportedModel(format!(
                "expected 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session: Mutex::new(session),
            stride_outputs,
            config,
        })
    }

    /// Detect faces, strongest first. Locations are in `image` coordinates.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<FaceLocation>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(image);

        let mut session = self.session.lock().map_err(|_| DetectorError::Poisoned)?;
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };

            let heads = StrideHeads {
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(heads.decode(stride, &letterbox, self.config.confidence_threshold));
        }

        Ok(nms(candidates, self.config.nms_threshold))
    }
}

/// Resize into the letterboxed NCHW input; padding normalizes to 0.0.
fn letterbox_tensor(image: &RgbImage) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let letterbox = Letterbox::fit(width, height);
    let new_w = ((width as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((height as f32 * letterbox.scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    let (off_x, off_y) = (letterbox.pad_x as usize, letterbox.pad_y as usize);

    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + off_x, y as usize + off_y);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Map stride slots to output tensors.
///
/// Exports named `score_8`, `bbox_16`, `kps_32`, … are matched by name; anything
/// else falls back to the reference layout [scores 8/16/32, bboxes 8/16/32,
/// kps 8/16/32].
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named.as_deref() {
        Some(&[s8, s16, s32]) => [s8, s16, s32],
        _ => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Raw head outputs for one stride.
struct StrideHeads<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHeads<'_> {
    fn decode(&self, stride: usize, letterbox: &Letterbox, threshold: f32) -> Vec<FaceLocation> {
        let grid_w = SCRFD_INPUT_SIZE as usize / stride;
        let grid_h = SCRFD_INPUT_SIZE as usize / stride;
        let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
        let step = stride as f32;

        let mut faces = Vec::new();
        for idx in 0..anchors.min(self.scores.len()) {
            let score = self.scores[idx];
            if score <= threshold {
                continue;
            }
            let Some(d) = self.bboxes.get(idx * 4..idx * 4 + 4) else {
                continue;
            };

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * step;
            let ay = (cell / grid_w) as f32 * step;

            let (left, top) = letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
            let (right, bottom) = letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

            let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step)
                })
            });

            faces.push(FaceLocation {
                top,
                right,
                bottom,
                left,
                confidence: score,
                landmarks,
            });
        }
        faces
    }
}

/// Non-maximum suppression; output sorted by descending confidence.
fn nms(mut faces: Vec<FaceLocation>, iou_threshold: f32) -> Vec<FaceLocation> {
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceLocation> = Vec::with_capacity(faces.len());
    for face in faces {
        if keep.iter().all(|k| iou(k, &face) <= iou_threshold) {
            keep.push(face);
        }
    }
    keep
}

fn iou(a: &FaceLocation, b: &FaceLocation) -> f32 {
    let inter_w = (a.right.min(b.right) - a.left.max(b.left)).max(0.0);
    let inter_h = (a.bottom.min(b.bottom) - a.top.max(b.top)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
