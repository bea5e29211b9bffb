//! Document-vs-live verification.
//!
//! Liveness of the live image and encoding of the document face run side by
//! side on the worker pool; the live face is only encoded after liveness has
//! passed, so no match decision can come from a spoofed capture.

use crate::capability::{EncodedFace, FaceEncoder, FaceError, LivenessDetector};
use crate::preprocess::{self, DEFAULT_ENCODING_MAX_DIMENSION, DEFAULT_LIVENESS_MAX_DIMENSION};
use crate::registry::{ModelHandle, ModelLoadError, ModelRegistry};
use crate::types::{
    EmbeddingMismatch, RejectReason, VerificationRequest, VerificationResult,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::Instrument;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WORKER_THREADS: usize = 4;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Registry name of the liveness model.
    pub liveness_model: String,
    /// Registry name of the face encoder.
    pub encoder_model: String,
    /// Embeddings closer than this (Euclidean) are the same person.
    pub match_threshold: f32,
    pub liveness_max_dimension: u32,
    pub encoding_max_dimension: u32,
    /// Upper bound on each inference step.
    pub step_timeout: Duration,
    /// Inference tasks allowed to run at once across all requests.
    pub worker_threads: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            liveness_model: "liveness".to_string(),
            encoder_model: "face_encoder".to_string(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            liveness_max_dimension: DEFAULT_LIVENESS_MAX_DIMENSION,
            encoding_max_dimension: DEFAULT_ENCODING_MAX_DIMENSION,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            worker_threads: DEFAULT_WORKER_THREADS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Liveness,
    DocumentEncoding,
    LiveEncoding,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Liveness => "liveness",
            Step::DocumentEncoding => "document encoding",
            Step::LiveEncoding => "live encoding",
        })
    }
}

/// Infrastructure failure; distinct from a rejection the voter can fix.
#[derive(Error, Debug)]
pub enum SystemFault {
    #[error("model unavailable: {0}")]
    ModelUnavailable(#[from] ModelLoadError),
    #[error("model '{name}' is a {actual} model, expected {expected}")]
    WrongModelKind {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{step} worker failed: {reason}")]
    WorkerFailed { step: Step, reason: String },
    #[error("worker pool closed")]
    WorkerPoolClosed,
    #[error(transparent)]
    IncomparableEmbeddings(#[from] EmbeddingMismatch),
}

/// Inference task on the worker pool, aborted if dropped before completion.
struct StepTask<T> {
    step: Step,
    handle: JoinHandle<Result<Option<T>, SystemFault>>,
}

impl<T> StepTask<T> {
    /// Wait for the step. `Ok(None)` if it timed out.
    async fn join(&mut self) -> Result<Option<T>, SystemFault> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(join_err) => Err(SystemFault::WorkerFailed {
                step: self.step,
                reason: join_err.to_string(),
            }),
        }
    }
}

impl<T> Drop for StepTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub struct VerificationPipeline {
    registry: ModelRegistry,
    config: PipelineConfig,
    workers: Arc<Semaphore>,
}

impl VerificationPipeline {
    pub fn new(registry: ModelRegistry, config: PipelineConfig) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_threads.max(1)));
        Self {
            registry,
            config,
            workers,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Verify that the live capture is a real person matching the document.
    ///
    /// Every per-image outcome (spoof, no face, several faces, timeout) is a
    /// [`VerificationResult`]; only infrastructure failures are `Err`.
    pub async fn verify(
        &self,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, SystemFault> {
        let span = tracing::info_span!("verify", request_id = %uuid::Uuid::new_v4());
        async {
            let started = std::time::Instant::now();
            let result = self.run(request).await;
            match &result {
                Ok(verdict) => tracing::info!(
                    matched = verdict.is_matched(),
                    rejected_reason = verdict.reject_reason().map(RejectReason::code),
                    face_count = verdict.face_count(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "verification finished"
                ),
                Err(fault) => tracing::error!(error = %fault, "verification aborted by system fault"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run(&self, request: &VerificationRequest) -> Result<VerificationResult, SystemFault> {
        let (liveness, encoder) = tokio::try_join!(
            self.registry.get(&self.config.liveness_model),
            self.registry.get(&self.config.encoder_model),
        )?;
        let liveness = liveness_capability(&liveness)?;
        let encoder = encoder_capability(&encoder)?;
        tracing::debug!(encoder_version = encoder.version(), "models resolved");

        let live_for_liveness =
            preprocess::for_liveness(&request.live, self.config.liveness_max_dimension);
        let live_for_encoding =
            preprocess::for_encoding(&request.live, self.config.encoding_max_dimension);
        let document = preprocess::for_encoding(&request.document, self.config.encoding_max_dimension);

        tracing::debug!(state = "liveness_pending");
        let mut liveness_task =
            self.spawn_step(Step::Liveness, move || liveness.classify(&live_for_liveness));
        let mut document_task = {
            let encoder = Arc::clone(&encoder);
            self.spawn_step(Step::DocumentEncoding, move || encoder.detect_and_encode(&document))
        };

        match liveness_task.join().await? {
            None => return Ok(timed_out(Step::Liveness)),
            Some(Err(err)) => {
                tracing::warn!(error = %err, "liveness inference failed, failing closed");
                return Ok(VerificationResult::rejected(
                    RejectReason::SpoofDetected,
                    0,
                    "liveness could not be confirmed",
                ));
            }
            Some(Ok(verdict)) if !verdict.is_live => {
                tracing::info!(
                    label = verdict.label,
                    confidence = verdict.confidence,
                    "spoof detected"
                );
                return Ok(VerificationResult::rejected(
                    RejectReason::SpoofDetected,
                    0,
                    "live image did not pass the liveness check",
                ));
            }
            Some(Ok(verdict)) => {
                tracing::debug!(state = "liveness_passed", confidence = verdict.confidence);
            }
        }

        tracing::debug!(state = "document_encoding_pending");
        let document_face = match document_task.join().await? {
            None => return Ok(timed_out(Step::DocumentEncoding)),
            Some(Err(err)) => return Ok(face_rejection("document", err, 0)),
            Some(Ok(face)) => face,
        };
        tracing::debug!(state = "document_encoded");

        tracing::debug!(state = "live_encoding_pending");
        let mut live_task = self.spawn_step(Step::LiveEncoding, move || {
            encoder.detect_and_encode(&live_for_encoding)
        });
        let live_face = match live_task.join().await? {
            None => return Ok(timed_out(Step::LiveEncoding)),
            Some(Err(err)) => {
                let count = match &err {
                    FaceError::MultipleFacesDetected { count } => *count,
                    FaceError::EncodingFailed(_) => 1,
                    _ => 0,
                };
                return Ok(face_rejection("live", err, count));
            }
            Some(Ok(face)) => face,
        };
        tracing::debug!(state = "both_encoded");

        Ok(self.compare(&document_face, &live_face)?)
    }

    fn compare(
        &self,
        document: &EncodedFace,
        live: &EncodedFace,
    ) -> Result<VerificationResult, EmbeddingMismatch> {
        let distance = document.embedding.euclidean_distance(&live.embedding)?;
        let threshold = self.config.match_threshold;
        tracing::debug!(state = "compared", distance, threshold);

        Ok(if distance < threshold {
            VerificationResult::matched(distance, threshold)
        } else {
            VerificationResult::not_matched(distance, threshold)
        })
    }

    /// Queue `job` on the bounded worker pool.
    ///
    /// The worker permit stays with the async side: when the step times out
    /// or is aborted the slot is freed even if the blocking call never
    /// returns. The step timeout starts once a permit is held.
    fn spawn_step<T, F>(&self, step: Step, job: F) -> StepTask<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let workers = Arc::clone(&self.workers);
        let step_timeout = self.config.step_timeout;
        let handle = tokio::spawn(
            async move {
                let Ok(permit) = workers.acquire_owned().await else {
                    return Err(SystemFault::WorkerPoolClosed);
                };
                let outcome =
                    tokio::time::timeout(step_timeout, tokio::task::spawn_blocking(job)).await;
                drop(permit);

                match outcome {
                    Ok(Ok(value)) => Ok(Some(value)),
                    Ok(Err(join_err)) => Err(SystemFault::WorkerFailed {
                        step,
                        reason: join_err.to_string(),
                    }),
                    Err(_) => {
                        tracing::warn!(
                            step = %step,
                            timeout_ms = step_timeout.as_millis() as u64,
                            "inference step timed out, detaching its blocking call"
                        );
                        Ok(None)
                    }
                }
            }
            .in_current_span(),
        );
        StepTask { step, handle }
    }
}

fn liveness_capability(handle: &ModelHandle) -> Result<Arc<dyn LivenessDetector>, SystemFault> {
    handle.liveness().ok_or_else(|| SystemFault::WrongModelKind {
        name: handle.name().to_string(),
        expected: "liveness",
        actual: handle.describe(),
    })
}

fn encoder_capability(handle: &ModelHandle) -> Result<Arc<dyn FaceEncoder>, SystemFault> {
    handle.encoder().ok_or_else(|| SystemFault::WrongModelKind {
        name: handle.name().to_string(),
        expected: "encoder",
        actual: handle.describe(),
    })
}

fn timed_out(step: Step) -> VerificationResult {
    VerificationResult::rejected(RejectReason::Timeout, 0, format!("{step} timed out"))
}

fn face_rejection(side: &str, err: FaceError, face_count: usize) -> VerificationResult {
    let reason = match &err {
        FaceError::NoFaceDetected => RejectReason::NoFaceDetected,
        FaceError::MultipleFacesDetected { count } => {
            RejectReason::MultipleFacesDetected { count: *count }
        }
        FaceError::EncodingFailed(_) | FaceError::Inference(_) => RejectReason::EncodingFailed,
    };
    if let FaceError::Inference(inner) = &err {
        tracing::warn!(side, error = %inner, "face inference failed");
    }

    let message = match &reason {
        RejectReason::NoFaceDetected => format!("no face found in the {side} image"),
        RejectReason::MultipleFacesDetected { count } => format!(
            "{count} faces found in the {side} image, make sure only one person is in frame"
        ),
        _ => format!("the face in the {side} image could not be encoded"),
    };
    tracing::info!(side, reason = reason.code(), "rejected");
    VerificationResult::rejected(reason, face_count, message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InferenceError;

    #[test]
    fn test_step_names() {
        assert_eq!(Step::Liveness.to_string(), "liveness");
        assert_eq!(Step::DocumentEncoding.to_string(), "document encoding");
        assert_eq!(timed_out(Step::LiveEncoding).message(), "live encoding timed out");
    }

    #[test]
    fn test_face_rejection_reasons() {
        let r = face_rejection("live", FaceError::MultipleFacesDetected { count: 3 }, 3);
        assert_eq!(
            r.reject_reason(),
            Some(&RejectReason::MultipleFacesDetected { count: 3 })
        );
        assert_eq!(r.face_count(), 3);

        let r = face_rejection("document", FaceError::NoFaceDetected, 0);
        assert_eq!(r.reject_reason(), Some(&RejectReason::NoFaceDetected));
        assert!(r.message().contains("document"));

        let r = face_rejection(
            "live",
            FaceError::Inference(InferenceError::Runtime("oom".into())),
            0,
        );
        assert_eq!(r.reject_reason(), Some(&RejectReason::EncodingFailed));
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.step_timeout, Duration::from_secs(10));
        assert_eq!(config.liveness_model, "liveness");
        assert_eq!(config.encoder_model, "face_encoder");
    }
}
