//! Binds catalog entries to the ONNX adapters.

use crate::detector::{DetectorConfig, DetectorError, FaceDetector};
use crate::encoder::OnnxFaceEncoder;
use crate::liveness::{LivenessModelError, OnnxLivenessClassifier, DEFAULT_LIVENESS_INPUT_SIZE};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::registry::{LoadCause, Model, ModelKind, ModelLoader, ModelSpec};
use std::path::Path;
use std::sync::Arc;

/// Loads liveness models as [`OnnxLivenessClassifier`] and encoders as
/// [`OnnxFaceEncoder`] (SCRFD + ArcFace).
#[derive(Debug, Clone, Copy)]
pub struct OnnxModelLoader {
    pub detector: DetectorConfig,
    pub liveness_input_size: u32,
}

impl Default for OnnxModelLoader {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            liveness_input_size: DEFAULT_LIVENESS_INPUT_SIZE,
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Model, LoadCause> {
        match &spec.kind {
            ModelKind::Liveness { path } => {
                let classifier = OnnxLivenessClassifier::load(path, self.liveness_input_size)
                    .map_err(|e| liveness_cause(path, e))?;
                Ok(Model::Liveness(Arc::new(classifier)))
            }
            ModelKind::Encoder {
                detector_path,
                recognizer_path,
            } => {
                let detector = FaceDetector::load(detector_path, self.detector)
                    .map_err(|e| detector_cause(detector_path, e))?;
                let recognizer = FaceRecognizer::load(recognizer_path)
                    .map_err(|e| recognizer_cause(recognizer_path, e))?;
                Ok(Model::Encoder(Arc::new(OnnxFaceEncoder::new(detector, recognizer))))
            }
        }
    }
}

fn liveness_cause(path: &Path, err: LivenessModelError) -> LoadCause {
    match err {
        LivenessModelError::ModelNotFound(_) => LoadCause::FileNotFound(path.to_path_buf()),
        other => LoadCause::Rejected(other.to_string()),
    }
}

fn detector_cause(path: &Path, err: DetectorError) -> LoadCause {
    match err {
        DetectorError::ModelNotFound(_) => LoadCause::FileNotFound(path.to_path_buf()),
        other => LoadCause::Rejected(other.to_string()),
    }
}

fn recognizer_cause(path: &Path, err: RecognizerError) -> LoadCause {
    match err {
        RecognizerError::ModelNotFound(_) => LoadCause::FileNotFound(path.to_path_buf()),
        other => LoadCause::Rejected(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_liveness_file() {
        let spec = ModelSpec {
            name: "liveness".into(),
            kind: ModelKind::Liveness {
                path: PathBuf::from("/nonexistent/anti_spoof.onnx"),
            },
        };
        let cause = OnnxModelLoader::default().load(&spec).err();
        assert_eq!(
            cause,
            Some(LoadCause::FileNotFound(PathBuf::from("/nonexistent/anti_spoof.onnx")))
        );
    }

    #[test]
    fn test_missing_detector_file_reported_first() {
        let spec = ModelSpec {
            name: "face_encoder".into(),
            kind: ModelKind::Encoder {
                detector_path: PathBuf::from("/nonexistent/det_10g.onnx"),
                recognizer_path: PathBuf::from("/nonexistent/w600k_r50.onnx"),
            },
        };
        let cause = OnnxModelLoader::default().load(&spec).err();
        assert_eq!(
            cause,
            Some(LoadCause::FileNotFound(PathBuf::from("/nonexistent/det_10g.onnx")))
        );
    }
}
