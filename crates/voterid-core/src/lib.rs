//! voterid-core: liveness checking and document-vs-live face matching.
//!
//! The [`VerificationPipeline`] pulls its models from a shared
//! [`ModelRegistry`]; the ONNX adapters (SCRFD detection, ArcFace
//! embeddings, an anti-spoofing classifier) plug in through
//! [`OnnxModelLoader`].

pub mod alignment;
pub mod capability;
pub mod detector;
pub mod encoder;
pub mod liveness;
pub mod loader;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod registry;
pub mod types;

pub use capability::{EncodedFace, FaceEncoder, FaceError, InferenceError, LivenessDetector};
pub use loader::OnnxModelLoader;
pub use pipeline::{PipelineConfig, Step, SystemFault, VerificationPipeline};
pub use preprocess::PreprocessedImage;
pub use registry::{
    LoadCause, Model, ModelHandle, ModelKind, ModelLoadError, ModelLoader, ModelRegistry,
    ModelSpec, RegistryStatus,
};
pub use types::{
    FaceEmbedding, FaceLocation, ImageError, ImageSource, LivenessVerdict, Outcome, RawImage,
    RejectReason, VerificationReport, VerificationRequest, VerificationResult,
};
