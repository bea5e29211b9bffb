use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Class label the liveness model emits for a spoofed (photo/screen) subject.
pub const SPOOF_LABEL: u8 = 0;
/// Class label the liveness model emits for a real subject.
pub const REAL_LABEL: u8 = 1;

/// Which side of a verification request an image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Document,
    Live,
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Document => f.write_str("document"),
            ImageSource::Live => f.write_str("live"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImageError {
    #[error("image has zero width or height")]
    Empty,
    #[error("unsupported channel count {0} (expected 1, 3 or 4)")]
    UnsupportedChannels(u8),
    #[error("pixel buffer holds {actual} bytes, {width}x{height}x{channels} needs {expected}")]
    LengthMismatch {
        width: u32,
        height: u32,
        channels: u8,
        expected: usize,
        actual: usize,
    },
}

/// An immutable, interleaved 8-bit pixel buffer as handed over by the caller.
#[derive(Debug, Clone)]
pub struct RawImage {
    width: u32,
    height: u32,
    channels: u8,
    data: Vec<u8>,
    source: ImageSource,
}

impl RawImage {
    /// Wrap a pixel buffer. Accepts grayscale (1), RGB (3) and RGBA (4) layouts.
    pub fn new(
        width: u32,
        height: u32,
        channels: u8,
        data: Vec<u8>,
        source: ImageSource,
    ) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::Empty);
        }
        if !matches!(channels, 1 | 3 | 4) {
            return Err(ImageError::UnsupportedChannels(channels));
        }
        let expected = width as usize * height as usize * channels as usize;
        if data.len() != expected {
            return Err(ImageError::LengthMismatch {
                width,
                height,
                channels,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
            source,
        })
    }

    /// Take the pixels of an already-decoded image as RGB.
    pub fn from_dynamic(
        image: &image::DynamicImage,
        source: ImageSource,
    ) -> Result<Self, ImageError> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::new(width, height, 3, rgb.into_raw(), source)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn source(&self) -> ImageSource {
        self.source
    }
}

/// A face region as (top, right, bottom, left) in the coordinates of the
/// image it refers to, with optional five-point landmarks
/// [left_eye, right_eye, nose, left_mouth, right_mouth].
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLocation {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
    pub confidence: f32,
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl FaceLocation {
    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Map this location through independent horizontal and vertical scale factors.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            top: self.top * sy,
            right: self.right * sx,
            bottom: self.bottom * sy,
            left: self.left * sx,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(x, y)| (x * sx, y * sy))),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("embeddings are not comparable: {left_version}/{left_dim} vs {right_version}/{right_dim}")]
pub struct EmbeddingMismatch {
    pub left_version: String,
    pub left_dim: usize,
    pub right_version: String,
    pub right_dim: usize,
}

/// Fixed-length face embedding tagged with the encoder that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEmbedding {
    values: Vec<f32>,
    encoder_version: String,
}

impl FaceEmbedding {
    pub fn new(values: Vec<f32>, encoder_version: impl Into<String>) -> Self {
        Self {
            values,
            encoder_version: encoder_version.into(),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn encoder_version(&self) -> &str {
        &self.encoder_version
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to another embedding from the same encoder.
    pub fn euclidean_distance(&self, other: &FaceEmbedding) -> Result<f32, EmbeddingMismatch> {
        if self.encoder_version != other.encoder_version || self.values.len() != other.values.len()
        {
            return Err(EmbeddingMismatch {
                left_version: self.encoder_version.clone(),
                left_dim: self.values.len(),
                right_version: other.encoder_version.clone(),
                right_dim: other.values.len(),
            });
        }

        Ok(self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt())
    }
}

/// Output of a liveness classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct LivenessVerdict {
    pub is_live: bool,
    /// Probability assigned to `label`, in [0, 1].
    pub confidence: f32,
    /// Class index the model emitted ([`SPOOF_LABEL`] or [`REAL_LABEL`]; other
    /// indices are treated as spoof).
    pub label: u8,
}

impl LivenessVerdict {
    pub fn from_label(label: u8, confidence: f32) -> Self {
        Self {
            is_live: label == REAL_LABEL,
            confidence,
            label,
        }
    }
}

/// One verification: the identity document photo and the live capture.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    pub document: RawImage,
    pub live: RawImage,
}

/// Why a request was rejected without a match decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    SpoofDetected,
    NoFaceDetected,
    MultipleFacesDetected { count: usize },
    EncodingFailed,
    Timeout,
}

impl RejectReason {
    /// Stable wire code for the rejection.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::SpoofDetected => "spoof_detected",
            RejectReason::NoFaceDetected => "no_face_detected",
            RejectReason::MultipleFacesDetected { .. } => "multiple_faces_detected",
            RejectReason::EncodingFailed => "encoding_failed",
            RejectReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Matched,
    NotMatched,
    Rejected(RejectReason),
}

/// The verdict for one [`VerificationRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "VerificationReport")]
pub struct VerificationResult {
    outcome: Outcome,
    face_count: usize,
    message: String,
    distance: Option<f32>,
}

impl VerificationResult {
    pub fn matched(distance: f32, threshold: f32) -> Self {
        Self {
            outcome: Outcome::Matched,
            face_count: 1,
            message: format!("faces match (distance {distance:.4} < {threshold})"),
            distance: Some(distance),
        }
    }

    pub fn not_matched(distance: f32, threshold: f32) -> Self {
        Self {
            outcome: Outcome::NotMatched,
            face_count: 1,
            message: format!("faces do not match (distance {distance:.4} >= {threshold})"),
            distance: Some(distance),
        }
    }

    pub fn rejected(reason: RejectReason, face_count: usize, message: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Rejected(reason),
            face_count,
            message: message.into(),
            distance: None,
        }
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn is_matched(&self) -> bool {
        self.outcome == Outcome::Matched
    }

    pub fn reject_reason(&self) -> Option<&RejectReason> {
        match &self.outcome {
            Outcome::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Number of faces found in the live image (0 if it was never analysed).
    pub fn face_count(&self) -> usize {
        self.face_count
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn distance(&self) -> Option<f32> {
        self.distance
    }
}

/// Flat wire form of a [`VerificationResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub matched: bool,
    pub rejected_reason: Option<String>,
    pub message: String,
    pub face_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f32>,
}

impl From<VerificationResult> for VerificationReport {
    fn from(result: VerificationResult) -> Self {
        Self {
            matched: result.is_matched(),
            rejected_reason: result.reject_reason().map(|r| r.code().to_string()),
            message: result.message,
            face_count: result.face_count,
            distance: result.distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> FaceEmbedding {
        FaceEmbedding::new(values.to_vec(), "test")
    }

    #[test]
    fn test_raw_image_rejects_short_buffer() {
        let err = RawImage::new(2, 2, 3, vec![0; 11], ImageSource::Live).unwrap_err();
        assert!(matches!(err, ImageError::LengthMismatch { expected: 12, actual: 11, .. }));
    }

    #[test]
    fn test_raw_image_rejects_bad_channels() {
        let err = RawImage::new(2, 2, 2, vec![0; 8], ImageSource::Live).unwrap_err();
        assert_eq!(err, ImageError::UnsupportedChannels(2));
    }

    #[test]
    fn test_raw_image_rejects_empty() {
        let err = RawImage::new(0, 4, 1, vec![], ImageSource::Document).unwrap_err();
        assert_eq!(err, ImageError::Empty);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = emb(&[0.0, 0.0]);
        let b = emb(&[3.0, 4.0]);
        assert!((a.euclidean_distance(&b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_symmetric() {
        let a = emb(&[0.1, 0.7, -0.3]);
        let b = emb(&[0.4, -0.2, 0.9]);
        assert_eq!(a.euclidean_distance(&b).unwrap(), b.euclidean_distance(&a).unwrap());
    }

    #[test]
    fn test_distance_rejects_other_encoder() {
        let a = FaceEmbedding::new(vec![1.0, 0.0], "w600k_r50");
        let b = FaceEmbedding::new(vec![1.0, 0.0], "dlib_128");
        assert!(a.euclidean_distance(&b).is_err());
    }

    #[test]
    fn test_distance_rejects_dimension_mismatch() {
        let a = emb(&[1.0, 0.0]);
        let b = emb(&[1.0, 0.0, 0.0]);
        let err = a.euclidean_distance(&b).unwrap_err();
        assert_eq!((err.left_dim, err.right_dim), (2, 3));
    }

    #[test]
    fn test_liveness_label_convention() {
        assert!(LivenessVerdict::from_label(REAL_LABEL, 0.9).is_live);
        assert!(!LivenessVerdict::from_label(SPOOF_LABEL, 0.9).is_live);
        // MiniFASNet-style third class is a spoof class
        assert!(!LivenessVerdict::from_label(2, 0.9).is_live);
    }

    #[test]
    fn test_face_location_scaled() {
        let loc = FaceLocation {
            top: 10.0,
            right: 40.0,
            bottom: 50.0,
            left: 20.0,
            confidence: 0.9,
            landmarks: Some([(25.0, 20.0); 5]),
        };
        let scaled = loc.scaled(2.0, 3.0);
        assert_eq!((scaled.left, scaled.right), (40.0, 80.0));
        assert_eq!((scaled.top, scaled.bottom), (30.0, 150.0));
        assert_eq!(scaled.landmarks.unwrap()[0], (50.0, 60.0));
    }

    #[test]
    fn test_result_json_shape_rejected() {
        let result = VerificationResult::rejected(
            RejectReason::MultipleFacesDetected { count: 2 },
            2,
            "2 faces in live image",
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["matched"], false);
        assert_eq!(json["rejected_reason"], "multiple_faces_detected");
        assert_eq!(json["face_count"], 2);
        assert!(json.get("distance").is_none());
    }

    #[test]
    fn test_result_json_shape_matched() {
        let json = serde_json::to_value(VerificationResult::matched(0.25, 0.6)).unwrap();
        assert_eq!(json["matched"], true);
        assert!(json["rejected_reason"].is_null());
        assert_eq!(json["face_count"], 1);
        assert!(json["message"].as_str().unwrap().contains("match"));
    }
}
