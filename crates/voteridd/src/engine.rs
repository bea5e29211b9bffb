use crate::config::Config;
use std::sync::Arc;
use thiserror::Error;
use voterid_core::{
    ImageSource, ModelHandle, ModelLoadError, ModelRegistry, OnnxModelLoader, RawImage,
    RegistryStatus, SystemFault, VerificationPipeline, VerificationRequest, VerificationResult,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{side} image could not be decoded: {reason}")]
    InvalidImage { side: ImageSource, reason: String },
    #[error(transparent)]
    Fault(#[from] SystemFault),
    #[error("image decoding task failed: {0}")]
    DecodeTask(#[from] tokio::task::JoinError),
}

/// Composition root: owns the model registry and the pipeline built on it.
pub struct Engine {
    pipeline: VerificationPipeline,
}

impl Engine {
    pub fn new(config: &Config) -> Self {
        let registry = ModelRegistry::new(config.catalog(), Arc::new(OnnxModelLoader::default()));
        let pipeline = VerificationPipeline::new(registry, config.pipeline_config());
        Self { pipeline }
    }

    fn registry(&self) -> &ModelRegistry {
        self.pipeline.registry()
    }

    /// Warm the models the pipeline needs. Failures are only logged; the
    /// first request retries the load.
    pub async fn preload(&self) {
        let config = self.pipeline.config();
        for name in [&config.liveness_model, &config.encoder_model] {
            match self.registry().get(name).await {
                Ok(handle) => tracing::info!(model = %name, kind = handle.describe(), "preloaded"),
                Err(e) => tracing::warn!(error = %e, "preload failed, will retry on first use"),
            }
        }
    }

    /// Decode two encoded images (PNG, JPEG, ...) and verify them.
    pub async fn verify_encoded(
        &self,
        document: Vec<u8>,
        live: Vec<u8>,
    ) -> Result<VerificationResult, EngineError> {
        let request = tokio::task::spawn_blocking(move || {
            Ok::<_, EngineError>(VerificationRequest {
                document: decode(&document, ImageSource::Document)?,
                live: decode(&live, ImageSource::Live)?,
            })
        })
        .await??;

        Ok(self.pipeline.verify(&request).await?)
    }

    pub async fn load(&self, name: &str) -> Result<ModelHandle, ModelLoadError> {
        self.registry().load(name).await
    }

    pub fn unload(&self, name: &str) -> bool {
        self.registry().unload(name)
    }

    pub async fn reload(&self, name: &str) -> Result<ModelHandle, ModelLoadError> {
        self.registry().reload(name).await
    }

    pub fn status(&self) -> RegistryStatus {
        self.registry().status()
    }
}

fn decode(bytes: &[u8], side: ImageSource) -> Result<RawImage, EngineError> {
    if bytes.is_empty() {
        return Err(EngineError::InvalidImage {
            side,
            reason: "empty buffer".into(),
        });
    }
    let image = image::load_from_memory(bytes).map_err(|e| EngineError::InvalidImage {
        side,
        reason: e.to_string(),
    })?;
    RawImage::from_dynamic(&image, side).map_err(|e| EngineError::InvalidImage {
        side,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(width, height, image::Rgb([90, 120, 150]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let raw = decode(&png(12, 7), ImageSource::Live).unwrap();
        assert_eq!((raw.width(), raw.height(), raw.channels()), (12, 7, 3));
        assert_eq!(raw.source(), ImageSource::Live);
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode(b"not an image", ImageSource::Document).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidImage { side: ImageSource::Document, .. }
        ));
        assert!(decode(&[], ImageSource::Live).is_err());
    }

    #[tokio::test]
    async fn test_verify_without_models_is_fault() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            model_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        let engine = Engine::new(&config);
        let err = engine.verify_encoded(png(16, 16), png(16, 16)).await.unwrap_err();
        assert!(matches!(err, EngineError::Fault(SystemFault::ModelUnavailable(_))));
        assert_eq!(engine.status().count, 0);
    }

    #[tokio::test]
    async fn test_bad_image_checked_before_models() {
        let engine = Engine::new(&Config::default());
        let err = engine.verify_encoded(png(8, 8), Vec::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidImage { side: ImageSource::Live, .. }));
    }
}
