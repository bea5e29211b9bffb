//! ArcFace face recognizer via ONNX Runtime.
//!
//! Aligns a detected face to 112×112 and extracts an L2-normalized
//! 512-dimensional embedding (w600k_r50).

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{FaceEmbedding, FaceLocation};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks")]
    NoLandmarks,
    #[error("landmarks are degenerate, face cannot be aligned")]
    DegenerateLandmarks,
    #[error("model produced a zero embedding")]
    ZeroEmbedding,
    #[error("recognizer session poisoned")]
    Poisoned,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Mutex<Session>,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self {
            session: Mutex::new(session),
        })
    }

    pub fn version(&self) -> &'static str {
        ARCFACE_MODEL_VERSION
    }

    /// Extract the embedding of `face`, located in `image` coordinates.
    pub fn extract(
        &self,
        image: &RgbImage,
        face: &FaceLocation,
    ) -> Result<FaceEmbedding, RecognizerError> {
        let landmarks = face.landmarks.as_ref().ok_or(RecognizerError::NoLandmarks)?;
        let aligned =
            alignment::align_face(image, landmarks).ok_or(RecognizerError::DegenerateLandmarks)?;
        let input = to_tensor(&aligned);

        let raw: Vec<f32> = {
            let mut session = self.session.lock().map_err(|_| RecognizerError::Poisoned)?;
            let outputs =
                session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| RecognizerError::InferenceFailed(format!("embedding: {e}")))?;
            data.to_vec()
        };

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let values = l2_normalize(raw).ok_or(RecognizerError::ZeroEmbedding)?;
        Ok(FaceEmbedding::new(values, ARCFACE_MODEL_VERSION))
    }
}

/// NCHW float tensor from a 112×112 RGB crop.
fn to_tensor(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(mut values: Vec<f32>) -> Option<Vec<f32>> {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if !norm.is_finite() || norm <= f32::EPSILON {
        return None;
    }
    values.iter_mut().for_each(|v| *v /= norm);
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_tensor_shape() {
        let crop = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
        assert_eq!(to_tensor(&crop).shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_tensor_normalization_per_channel() {
        let crop = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([0, 128, 255]));
        let t = to_tensor(&crop);
        assert!((t[[0, 0, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 5, 5]] - 0.5 / 127.5).abs() < 1e-6);
        assert!((t[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]).unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero() {
        assert!(l2_normalize(vec![0.0; 8]).is_none());
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/w600k_r50.onnx")).err();
        assert!(matches!(err, Some(RecognizerError::ModelNotFound(_))));
    }
}
