//! Swappable inference capabilities the pipeline depends on.
//!
//! Concrete adapters (ONNX, test stubs) are bound when the model registry
//! loads a model; the pipeline only ever sees these traits.

use crate::preprocess::PreprocessedImage;
use crate::types::{FaceEmbedding, FaceLocation, LivenessVerdict};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("incompatible tensor shape: {0}")]
    Shape(String),
    #[error("model runtime failed: {0}")]
    Runtime(String),
    #[error("model session poisoned by an earlier panic")]
    Poisoned,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FaceError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("{count} faces detected, exactly one is required")]
    MultipleFacesDetected { count: usize },
    #[error("face could not be encoded: {0}")]
    EncodingFailed(String),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// A single face found in an image, with its embedding.
#[derive(Debug, Clone)]
pub struct EncodedFace {
    pub embedding: FaceEmbedding,
    pub face_count: usize,
    /// Location in original-image coordinates.
    pub location: FaceLocation,
}

/// Anti-spoofing classifier.
pub trait LivenessDetector: Send + Sync {
    fn classify(&self, image: &PreprocessedImage) -> Result<LivenessVerdict, InferenceError>;
}

/// Face detector plus embedding extractor.
///
/// Must fail with [`FaceError::MultipleFacesDetected`] rather than pick one
/// face when more than one is present.
pub trait FaceEncoder: Send + Sync {
    fn detect_and_encode(&self, image: &PreprocessedImage) -> Result<EncodedFace, FaceError>;

    /// Identifier of the embedding space; embeddings are only comparable
    /// within one version.
    fn version(&self) -> &str;
}

/// Reduce a detection list to the single face a verification needs.
pub fn single_face(mut faces: Vec<FaceLocation>) -> Result<FaceLocation, FaceError> {
    match faces.len() {
        0 => Err(FaceError::NoFaceDetected),
        1 => Ok(faces.remove(0)),
        count => Err(FaceError::MultipleFacesDetected { count }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(left: f32) -> FaceLocation {
        FaceLocation {
            top: 0.0,
            right: left + 10.0,
            bottom: 10.0,
            left,
            confidence: 0.9,
            landmarks: None,
        }
    }

    #[test]
    fn test_single_face_none() {
        assert_eq!(single_face(vec![]), Err(FaceError::NoFaceDetected));
    }

    #[test]
    fn test_single_face_one() {
        assert_eq!(single_face(vec![loc(5.0)]).unwrap().left, 5.0);
    }

    #[test]
    fn test_single_face_many() {
        assert_eq!(
            single_face(vec![loc(0.0), loc(50.0), loc(100.0)]),
            Err(FaceError::MultipleFacesDetected { count: 3 })
        );
    }
}
