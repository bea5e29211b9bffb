use crate::engine::{Engine, EngineError};
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.voterid.Verifier1";
pub const OBJECT_PATH: &str = "/org/voterid/Verifier1";

/// D-Bus interface for the verification daemon.
///
/// Bus name: org.voterid.Verifier1
/// Object path: /org/voterid/Verifier1
pub struct VerifierService {
    engine: Arc<Engine>,
}

impl VerifierService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[interface(name = "org.voterid.Verifier1")]
impl VerifierService {
    /// Verify that `live` shows a real person matching the face on `document`.
    /// Both are encoded image files. Returns the result as JSON.
    async fn verify(&self, document: Vec<u8>, live: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(
            document_bytes = document.len(),
            live_bytes = live.len(),
            "verify requested"
        );
        let result = self
            .engine
            .verify_encoded(document, live)
            .await
            .map_err(to_fdo)?;
        to_json(&result)
    }

    /// Load a model by catalog name (no-op if already resident).
    async fn load_model(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(model = name, "load_model requested");
        let handle = self
            .engine
            .load(name)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(format!("{} model '{}' loaded", handle.describe(), handle.name()))
    }

    /// Drop a resident model. Returns whether it was loaded.
    async fn unload_model(&self, name: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(model = name, "unload_model requested");
        Ok(self.engine.unload(name))
    }

    async fn reload_model(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(model = name, "reload_model requested");
        let handle = self
            .engine
            .reload(name)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(format!("{} model '{}' reloaded", handle.describe(), handle.name()))
    }

    /// Return daemon and registry status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "loaded_models": status.loaded_models,
            "count": status.count,
            "loading": status.loading,
            "available_models": status.available_models,
        })
        .to_string())
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::InvalidImage { .. } => zbus::fdo::Error::InvalidArgs(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}
