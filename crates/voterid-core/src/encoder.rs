//! [`FaceEncoder`] backed by the SCRFD detector and ArcFace recognizer.

use crate::capability::{single_face, EncodedFace, FaceEncoder, FaceError, InferenceError};
use crate::detector::{DetectorError, FaceDetector};
use crate::preprocess::PreprocessedImage;
use crate::recognizer::{FaceRecognizer, RecognizerError};

/// Faces smaller than this (in working-image pixels) cannot be encoded reliably.
const MIN_FACE_SIDE: f32 = 16.0;

pub struct OnnxFaceEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceEncoder {
    pub fn new(detector: FaceDetector, recognizer: FaceRecognizer) -> Self {
        Self {
            detector,
            recognizer,
        }
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn detect_and_encode(&self, image: &PreprocessedImage) -> Result<EncodedFace, FaceError> {
        let faces = self.detector.detect(image.rgb()).map_err(FaceError::from)?;
        let face_count = faces.len();
        tracing::debug!(
            source = %image.source(),
            face_count,
            width = image.width(),
            height = image.height(),
            "faces detected"
        );

        let face = single_face(faces)?;
        if face.width() < MIN_FACE_SIDE || face.height() < MIN_FACE_SIDE {
            return Err(FaceError::EncodingFailed(format!(
                "face too small ({:.0}x{:.0} px)",
                face.width(),
                face.height()
            )));
        }

        let embedding = self.recognizer.extract(image.rgb(), &face)?;

        Ok(EncodedFace {
            embedding,
            face_count,
            location: image.to_original(&face),
        })
    }

    fn version(&self) -> &str {
        self.recognizer.version()
    }
}

impl From<DetectorError> for FaceError {
    fn from(err: DetectorError) -> Self {
        match err {
            DetectorError::Poisoned => FaceError::Inference(InferenceError::Poisoned),
            other => FaceError::Inference(InferenceError::Runtime(other.to_string())),
        }
    }
}

impl From<RecognizerError> for FaceError {
    fn from(err: RecognizerError) -> Self {
        match err {
            RecognizerError::NoLandmarks
            | RecognizerError::DegenerateLandmarks
            | RecognizerError::ZeroEmbedding => FaceError::EncodingFailed(err.to_string()),
            RecognizerError::Poisoned => FaceError::Inference(InferenceError::Poisoned),
            other => FaceError::Inference(InferenceError::Runtime(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_failures_are_encoding_failures() {
        for err in [
            RecognizerError::NoLandmarks,
            RecognizerError::DegenerateLandmarks,
            RecognizerError::ZeroEmbedding,
        ] {
            assert!(matches!(FaceError::from(err), FaceError::EncodingFailed(_)));
        }
    }

    #[test]
    fn test_runtime_failures_are_inference_errors() {
        let err = FaceError::from(RecognizerError::InferenceFailed("bad shape".into()));
        assert!(matches!(err, FaceError::Inference(InferenceError::Runtime(_))));
        let err = FaceError::from(DetectorError::Poisoned);
        assert_eq!(err, FaceError::Inference(InferenceError::Poisoned));
    }
}
