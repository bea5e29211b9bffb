//! Anti-spoofing classifier via ONNX Runtime.
//!
//! Expects a single-input image classifier whose first output holds one logit
//! per class, class 0 = spoof and class 1 = real. Three-class exports
//! (MiniFASNet style, 0 = print, 1 = real, 2 = replay) work unchanged: every
//! class other than 1 counts as spoof.

use crate::capability::{InferenceError, LivenessDetector};
use crate::preprocess::PreprocessedImage;
use crate::types::LivenessVerdict;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

pub const DEFAULT_LIVENESS_INPUT_SIZE: u32 = 80;

#[derive(Error, Debug)]
pub enum LivenessModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX-backed [`LivenessDetector`].
pub struct OnnxLivenessClassifier {
    session: Mutex<Session>,
    input_size: u32,
}

impl OnnxLivenessClassifier {
    pub fn load(model_path: &Path, input_size: u32) -> Result<Self, LivenessModelError> {
        if !model_path.exists() {
            return Err(LivenessModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            input_size,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded liveness model"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_size,
        })
    }

    /// Square NCHW tensor scaled to [0, 1].
    fn to_tensor(&self, image: &PreprocessedImage) -> Array4<f32> {
        let size = self.input_size;
        let resized = imageops::resize(image.rgb(), size, size, FilterType::Triangle);
        let mut tensor = Array4::<f32>::zeros((1, 3, size as usize, size as usize));
        for (x, y, px) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = px.0[c] as f32 / 255.0;
            }
        }
        tensor
    }
}

impl LivenessDetector for OnnxLivenessClassifier {
    fn classify(&self, image: &PreprocessedImage) -> Result<LivenessVerdict, InferenceError> {
        let input = self.to_tensor(image);

        let logits: Vec<f32> = {
            let mut session = self.session.lock().map_err(|_| InferenceError::Poisoned)?;
            let view = TensorRef::from_array_view(input.view())
                .map_err(|e| InferenceError::Shape(e.to_string()))?;
            let outputs = session
                .run(ort::inputs![view])
                .map_err(|e| InferenceError::Runtime(e.to_string()))?;
            let (_, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| InferenceError::Shape(e.to_string()))?;
            data.to_vec()
        };

        let verdict = verdict_from_logits(&logits)?;
        tracing::debug!(
            label = verdict.label,
            confidence = verdict.confidence,
            is_live = verdict.is_live,
            "liveness classified"
        );
        Ok(verdict)
    }
}

/// Softmax the class logits and take the arg-max class.
pub fn verdict_from_logits(logits: &[f32]) -> Result<LivenessVerdict, InferenceError> {
    if logits.len() < 2 {
        return Err(InferenceError::Shape(format!(
            "expected at least 2 class logits, got {}",
            logits.len()
        )));
    }
    if logits.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::Runtime("non-finite logits".into()));
    }

    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();

    let (label, best) = exps
        .iter()
        .enumerate()
        .fold((0usize, f32::NEG_INFINITY), |acc, (i, &e)| if e > acc.1 { (i, e) } else { acc });

    let label = u8::try_from(label).unwrap_or(u8::MAX);
    Ok(LivenessVerdict::from_label(label, best / sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{REAL_LABEL, SPOOF_LABEL};

    #[test]
    fn test_real_class_wins() {
        let v = verdict_from_logits(&[-1.0, 3.0]).unwrap();
        assert!(v.is_live);
        assert_eq!(v.label, REAL_LABEL);
        assert!(v.confidence > 0.95);
    }

    #[test]
    fn test_spoof_class_wins() {
        let v = verdict_from_logits(&[2.0, 0.5]).unwrap();
        assert!(!v.is_live);
        assert_eq!(v.label, SPOOF_LABEL);
    }

    #[test]
    fn test_third_class_is_spoof() {
        let v = verdict_from_logits(&[0.1, 0.2, 4.0]).unwrap();
        assert!(!v.is_live);
        assert_eq!(v.label, 2);
    }

    #[test]
    fn test_tie_is_not_live() {
        // First maximum wins, which is the spoof class.
        let v = verdict_from_logits(&[1.0, 1.0]).unwrap();
        assert!(!v.is_live);
        assert!((v.confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_too_few_logits() {
        assert!(matches!(verdict_from_logits(&[0.9]), Err(InferenceError::Shape(_))));
    }

    #[test]
    fn test_nan_logits_fail() {
        assert!(verdict_from_logits(&[f32::NAN, 1.0]).is_err());
    }

    #[test]
    fn test_load_missing_model() {
        let err = OnnxLivenessClassifier::load(Path::new("/nonexistent/anti_spoof.onnx"), 80).err();
        assert!(matches!(err, Some(LivenessModelError::ModelNotFound(_))));
    }
}
