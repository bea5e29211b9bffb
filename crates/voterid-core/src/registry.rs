//! Process-wide cache of loaded models.
//!
//! Each named model is loaded at most once at a time: concurrent `get` calls on
//! a cold name join the single in-flight load and all observe its outcome.
//! Resolved handles are served from a read-mostly map; every mutation goes
//! through one writer lock that is never held across a load.

use crate::capability::{FaceEncoder, LivenessDetector};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio::sync::watch;

/// Where a model's weights live and which capability it provides.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelKind {
    Liveness {
        path: PathBuf,
    },
    Encoder {
        detector_path: PathBuf,
        recognizer_path: PathBuf,
    },
}

impl ModelKind {
    pub fn describe(&self) -> &'static str {
        match self {
            ModelKind::Liveness { .. } => "liveness",
            ModelKind::Encoder { .. } => "encoder",
        }
    }
}

/// A catalog entry: the name operators and the pipeline refer to a model by.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub kind: ModelKind,
}

/// A loaded model, bound to the capability it implements.
pub enum Model {
    Liveness(Arc<dyn LivenessDetector>),
    Encoder(Arc<dyn FaceEncoder>),
}

impl Model {
    pub fn describe(&self) -> &'static str {
        match self {
            Model::Liveness(_) => "liveness",
            Model::Encoder(_) => "encoder",
        }
    }
}

/// Shared, reference-counted handle to a resident model. Holders keep the
/// model alive even after it is unloaded from the registry.
#[derive(Clone)]
pub struct ModelHandle {
    name: Arc<str>,
    model: Arc<Model>,
}

impl ModelHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn describe(&self) -> &'static str {
        self.model.describe()
    }

    pub fn liveness(&self) -> Option<Arc<dyn LivenessDetector>> {
        match self.model.as_ref() {
            Model::Liveness(detector) => Some(Arc::clone(detector)),
            Model::Encoder(_) => None,
        }
    }

    pub fn encoder(&self) -> Option<Arc<dyn FaceEncoder>> {
        match self.model.as_ref() {
            Model::Encoder(encoder) => Some(Arc::clone(encoder)),
            Model::Liveness(_) => None,
        }
    }

    /// True if both handles came from the same load.
    pub fn ptr_eq(a: &ModelHandle, b: &ModelHandle) -> bool {
        Arc::ptr_eq(&a.model, &b.model)
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("kind", &self.describe())
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadCause {
    #[error("no model named '{0}' is configured")]
    UnknownModel(String),
    #[error("model file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("model rejected by loader: {0}")]
    Rejected(String),
    #[error("loader panicked: {0}")]
    Panicked(String),
    #[error("load was abandoned before completing")]
    Abandoned,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("failed to load model '{model_name}': {cause}")]
pub struct ModelLoadError {
    pub model_name: String,
    pub cause: LoadCause,
}

impl ModelLoadError {
    pub fn new(model_name: impl Into<String>, cause: LoadCause) -> Self {
        Self {
            model_name: model_name.into(),
            cause,
        }
    }
}

/// Turns a [`ModelSpec`] into a live model. Runs on the blocking pool.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self, spec: &ModelSpec) -> Result<Model, LoadCause>;
}

/// Snapshot of registry contents.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RegistryStatus {
    pub loaded_models: Vec<String>,
    pub count: usize,
    pub loading: Vec<String>,
    pub available_models: Vec<String>,
}

type LoadOutcome = Result<ModelHandle, ModelLoadError>;

struct InFlight {
    generation: u64,
    done: watch::Receiver<Option<LoadOutcome>>,
}

#[derive(Default)]
struct WriterState {
    next_generation: u64,
    loads: HashMap<String, InFlight>,
}

struct Inner {
    catalog: HashMap<String, ModelSpec>,
    loader: Arc<dyn ModelLoader>,
    resident: RwLock<HashMap<String, ModelHandle>>,
    writer: Mutex<WriterState>,
}

impl Inner {
    fn lookup(&self, name: &str) -> Option<ModelHandle> {
        self.resident
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    fn lock_writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_loader(&self, spec: &ModelSpec) -> LoadOutcome {
        let started = std::time::Instant::now();
        tracing::info!(model = %spec.name, kind = spec.kind.describe(), "loading model");

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.loader.load(spec)))
            .unwrap_or_else(|payload| Err(LoadCause::Panicked(panic_message(&*payload))));

        match result {
            Ok(model) => {
                tracing::info!(
                    model = %spec.name,
                    kind = model.describe(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "model loaded"
                );
                Ok(ModelHandle {
                    name: Arc::from(spec.name.as_str()),
                    model: Arc::new(model),
                })
            }
            Err(cause) => {
                tracing::error!(model = %spec.name, error = %cause, "model load failed");
                Err(ModelLoadError::new(&spec.name, cause))
            }
        }
    }

    /// Install the outcome unless the load was detached by an unload meanwhile.
    fn finish_load(&self, name: &str, generation: u64, outcome: &LoadOutcome) {
        let mut writer = self.lock_writer();
        let current = writer.loads.get(name).map(|f| f.generation) == Some(generation);
        if !current {
            tracing::info!(model = name, "load finished after unload, not installing");
            return;
        }
        writer.loads.remove(name);
        if let Ok(handle) = outcome {
            self.resident
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name.to_string(), handle.clone());
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Cache and single-flight loader for named models. Cloning shares the cache.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<Inner>,
}

impl ModelRegistry {
    pub fn new(catalog: impl IntoIterator<Item = ModelSpec>, loader: Arc<dyn ModelLoader>) -> Self {
        let catalog = catalog
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();
        Self {
            inner: Arc::new(Inner {
                catalog,
                loader,
                resident: RwLock::new(HashMap::new()),
                writer: Mutex::new(WriterState::default()),
            }),
        }
    }

    /// Return the resident handle for `name`, loading it first if needed.
    ///
    /// Concurrent callers on a cold name share one load and its outcome.
    /// Failures are not cached; the next call tries again.
    pub async fn get(&self, name: &str) -> Result<ModelHandle, ModelLoadError> {
        if let Some(handle) = self.inner.lookup(name) {
            return Ok(handle);
        }

        let spec = self.inner.catalog.get(name).cloned().ok_or_else(|| {
            ModelLoadError::new(name, LoadCause::UnknownModel(name.to_string()))
        })?;

        let mut done = {
            let mut writer = self.inner.lock_writer();
            // Re-check: a load may have completed since the fast path.
            if let Some(handle) = self.inner.lookup(name) {
                return Ok(handle);
            }
            match writer.loads.get(name) {
                Some(in_flight) => {
                    tracing::debug!(model = name, "joining in-flight load");
                    in_flight.done.clone()
                }
                None => self.start_load(&mut writer, spec),
            }
        };

        let outcome = done.wait_for(Option::is_some).await.map(|o| o.clone());
        match outcome {
            Ok(Some(result)) => result,
            _ => Err(ModelLoadError::new(name, LoadCause::Abandoned)),
        }
    }

    /// Operator alias for [`get`](Self::get).
    pub async fn load(&self, name: &str) -> Result<ModelHandle, ModelLoadError> {
        self.get(name).await
    }

    /// Drop the cached handle for `name`. In-flight holders keep theirs; the
    /// next `get` loads afresh. Returns whether a model was resident.
    pub fn unload(&self, name: &str) -> bool {
        let mut writer = self.inner.lock_writer();
        let detached = writer.loads.remove(name).is_some();
        let removed = self
            .inner
            .resident
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some();
        tracing::info!(model = name, removed, detached, "model unloaded");
        removed
    }

    /// Unload, then load again.
    pub async fn reload(&self, name: &str) -> Result<ModelHandle, ModelLoadError> {
        self.unload(name);
        self.get(name).await
    }

    /// Snapshot of resident and loading models.
    pub fn status(&self) -> RegistryStatus {
        let mut loaded_models: Vec<String> = self
            .inner
            .resident
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        loaded_models.sort();

        let mut loading: Vec<String> = self.inner.lock_writer().loads.keys().cloned().collect();
        loading.sort();

        let mut available_models: Vec<String> = self.inner.catalog.keys().cloned().collect();
        available_models.sort();

        RegistryStatus {
            count: loaded_models.len(),
            loaded_models,
            loading,
            available_models,
        }
    }

    /// Register an in-flight load and run it on the blocking pool. The task
    /// owns the bookkeeping, so a caller that stops waiting cannot strand
    /// the others.
    fn start_load(
        &self,
        writer: &mut WriterState,
        spec: ModelSpec,
    ) -> watch::Receiver<Option<LoadOutcome>> {
        let generation = writer.next_generation;
        writer.next_generation += 1;

        let (tx, rx) = watch::channel(None);
        writer.loads.insert(
            spec.name.clone(),
            InFlight {
                generation,
                done: rx.clone(),
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let outcome = inner.run_loader(&spec);
            inner.finish_load(&spec.name, generation, &outcome);
            let _ = tx.send(Some(outcome));
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::InferenceError;
    use crate::preprocess::PreprocessedImage;
    use crate::types::LivenessVerdict;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct AlwaysLive;

    impl LivenessDetector for AlwaysLive {
        fn classify(&self, _: &PreprocessedImage) -> Result<LivenessVerdict, InferenceError> {
            Ok(LivenessVerdict::from_label(1, 1.0))
        }
    }

    /// Counts loads; fails the first `fail_first` attempts; sleeps `delay`.
    struct CountingLoader {
        loads: AtomicUsize,
        fail_first: usize,
        delay: Duration,
    }

    impl CountingLoader {
        fn new(fail_first: usize, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                fail_first,
                delay,
            })
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl ModelLoader for CountingLoader {
        fn load(&self, spec: &ModelSpec) -> Result<Model, LoadCause> {
            let attempt = self.loads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if attempt < self.fail_first {
                return Err(LoadCause::Rejected(format!("{} is corrupt", spec.name)));
            }
            Ok(Model::Liveness(Arc::new(AlwaysLive)))
        }
    }

    struct PanickingLoader;

    impl ModelLoader for PanickingLoader {
        fn load(&self, _: &ModelSpec) -> Result<Model, LoadCause> {
            panic!("weights truncated");
        }
    }

    fn spec(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            kind: ModelKind::Liveness {
                path: PathBuf::from(format!("{name}.onnx")),
            },
        }
    }

    fn registry(loader: Arc<dyn ModelLoader>) -> ModelRegistry {
        ModelRegistry::new([spec("liveness"), spec("other")], loader)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_loads_once() {
        let loader = CountingLoader::new(0, Duration::from_millis(50));
        let reg = registry(loader.clone());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.get("liveness").await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(loader.loads(), 1);
        assert!(handles.iter().all(|h| ModelHandle::ptr_eq(h, &handles[0])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failure_shared_then_retried() {
        let loader = CountingLoader::new(1, Duration::from_millis(50));
        let reg = registry(loader.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                tokio::spawn(async move { reg.get("liveness").await })
            })
            .collect();
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err.model_name, "liveness");
            assert!(matches!(err.cause, LoadCause::Rejected(_)));
        }
        assert_eq!(loader.loads(), 1);
        assert!(reg.status().loaded_models.is_empty());

        // Failure is not cached.
        reg.get("liveness").await.unwrap();
        assert_eq!(loader.loads(), 2);
    }

    #[tokio::test]
    async fn test_resident_handle_reused() {
        let loader = CountingLoader::new(0, Duration::ZERO);
        let reg = registry(loader.clone());
        let a = reg.get("liveness").await.unwrap();
        let b = reg.get("liveness").await.unwrap();
        assert!(ModelHandle::ptr_eq(&a, &b));
        assert_eq!(loader.loads(), 1);
        assert_eq!(a.name(), "liveness");
        assert!(a.liveness().is_some());
        assert!(a.encoder().is_none());
    }

    #[tokio::test]
    async fn test_unload_then_get_loads_again() {
        let loader = CountingLoader::new(0, Duration::ZERO);
        let reg = registry(loader.clone());
        let before = reg.get("liveness").await.unwrap();

        assert!(!reg.unload("m"));
        assert!(reg.unload("liveness"));
        assert!(!reg.status().loaded_models.contains(&"liveness".to_string()));

        // The old handle stays usable for whoever holds it.
        assert!(before.liveness().is_some());

        let after = reg.get("liveness").await.unwrap();
        assert_eq!(loader.loads(), 2);
        assert!(!ModelHandle::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_reload_replaces_handle() {
        let loader = CountingLoader::new(0, Duration::ZERO);
        let reg = registry(loader.clone());
        let first = reg.get("liveness").await.unwrap();
        let second = reg.reload("liveness").await.unwrap();
        assert!(!ModelHandle::ptr_eq(&first, &second));
        assert_eq!(loader.loads(), 2);
        assert_eq!(reg.status().count, 1);
    }

    #[tokio::test]
    async fn test_unknown_model_leaves_status_unchanged() {
        let loader = CountingLoader::new(0, Duration::ZERO);
        let reg = registry(loader.clone());
        reg.get("liveness").await.unwrap();
        let before = reg.status();

        let err = reg.get("face_encoder_v9").await.unwrap_err();
        assert_eq!(err.model_name, "face_encoder_v9");
        assert!(matches!(err.cause, LoadCause::UnknownModel(_)));
        assert_eq!(reg.status(), before);
        assert_eq!(loader.loads(), 1);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let reg = registry(CountingLoader::new(0, Duration::ZERO));
        reg.get("other").await.unwrap();
        reg.get("liveness").await.unwrap();
        let status = reg.status();
        assert_eq!(status.loaded_models, vec!["liveness", "other"]);
        assert_eq!(status.count, 2);
        assert!(status.loading.is_empty());
        assert_eq!(status.available_models, vec!["liveness", "other"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unload_during_load_is_not_installed() {
        let loader = CountingLoader::new(0, Duration::from_millis(100));
        let reg = registry(loader.clone());

        let pending = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.get("liveness").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reg.status().loading, vec!["liveness"]);

        reg.unload("liveness");
        // The waiter still receives the result of the load it joined.
        pending.await.unwrap().unwrap();
        assert!(reg.status().loaded_models.is_empty());
    }

    #[tokio::test]
    async fn test_loader_panic_becomes_error() {
        let reg = registry(Arc::new(PanickingLoader));
        let err = reg.get("liveness").await.unwrap_err();
        assert_eq!(err.cause, LoadCause::Panicked("weights truncated".into()));
        assert!(reg.status().loading.is_empty());
    }
}
