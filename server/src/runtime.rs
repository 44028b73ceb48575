//! Process-wide ML runtime: session cache, device selection and fallback,
//! TTL-based unloading.
//!
//! The runtime owns one session per kind (embedding, reranker,
//! sparse-learned, query-understand). If the requested device cannot be
//! obtained — runtime library missing, CUDA init failure — the runtime
//! transitions to a `stub` device that still accepts session loads but whose
//! `run` returns `MlUnavailable`; callers can detect the silent fallback via
//! `requested_gpu() && !is_gpu()`. Mock mode swaps in deterministic
//! in-process sessions for tests.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{Config, DeviceKind};
use crate::error::{Error, Result};
use crate::metrics::MetricSet;
use crate::registry::{MapperConfig, ModelRegistry};
use crate::tokenizer::{TextEncoder, WhitespaceEncoder};

// ---------------------------------------------------------------------------
// Sessions & tensors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Embedding,
    Reranker,
    SparseLearned,
    QueryUnderstand,
}

pub const ALL_SESSIONS: [SessionKind; 4] = [
    SessionKind::Embedding,
    SessionKind::Reranker,
    SessionKind::SparseLearned,
    SessionKind::QueryUnderstand,
];

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Embedding => "embedding",
            SessionKind::Reranker => "reranker",
            SessionKind::SparseLearned => "sparse-learned",
            SessionKind::QueryUnderstand => "query-understand",
        }
    }
}

/// Tagged tensor moved across the session boundary.
#[derive(Debug, Clone)]
pub enum Tensor {
    F32 { shape: Vec<usize>, data: Vec<f32> },
    I64 { shape: Vec<usize>, data: Vec<i64> },
    I32 { shape: Vec<usize>, data: Vec<i32> },
}

impl Tensor {
    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32 { shape, .. } | Tensor::I64 { shape, .. } | Tensor::I32 { shape, .. } => {
                shape
            }
        }
    }

    pub fn f32_data(&self) -> Result<&[f32]> {
        match self {
            Tensor::F32 { data, .. } => Ok(data),
            _ => Err(Error::Internal("expected f32 tensor".into())),
        }
    }
}

/// Capability interface over one loaded model.
pub trait Session: Send + Sync {
    fn run(&self, inputs: Vec<(String, Tensor)>) -> Result<Vec<(String, Tensor)>>;
}

/// Requested vs. obtained device.
#[derive(Debug, Clone, Copy)]
pub struct DeviceState {
    pub requested: DeviceKind,
    pub actual: DeviceKind,
}

impl DeviceState {
    pub fn requested_gpu(&self) -> bool {
        matches!(self.requested, DeviceKind::Cuda | DeviceKind::TensorRt)
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.actual, DeviceKind::Cuda | DeviceKind::TensorRt)
    }
}

// ---------------------------------------------------------------------------
// Stub & mock sessions
// ---------------------------------------------------------------------------

/// Accepts loads, refuses runs. The runtime lands here when the requested
/// device is unavailable.
pub struct StubSession;

impl Session for StubSession {
    fn run(&self, _inputs: Vec<(String, Tensor)>) -> Result<Vec<(String, Tensor)>> {
        Err(Error::MlUnavailable("runtime is on the stub device".into()))
    }
}

/// Fixed vocabulary indices the mock sparse session activates.
pub const MOCK_SPARSE_INDICES: [usize; 4] = [17, 523, 1999, 4242];
const MOCK_VOCAB: usize = 8192;

/// Deterministic in-process session: all-ones dense output of the configured
/// dimension, a fixed small set of sparse indices, unit rerank logits.
pub struct MockSession {
    kind: SessionKind,
    dim: usize,
}

impl MockSession {
    pub fn new(kind: SessionKind, dim: usize) -> Self {
        MockSession { kind, dim }
    }

    fn batch_seq(inputs: &[(String, Tensor)]) -> (usize, usize) {
        inputs
            .iter()
            .find(|(name, _)| name == "input_ids")
            .map(|(_, t)| {
                let s = t.shape();
                (s.first().copied().unwrap_or(1), s.get(1).copied().unwrap_or(1))
            })
            .unwrap_or((1, 1))
    }
}

impl Session for MockSession {
    fn run(&self, inputs: Vec<(String, Tensor)>) -> Result<Vec<(String, Tensor)>> {
        let (batch, seq) = Self::batch_seq(&inputs);
        let out = match self.kind {
            SessionKind::Embedding => Tensor::F32 {
                shape: vec![batch, seq, self.dim],
                data: vec![1.0; batch * seq * self.dim],
            },
            SessionKind::SparseLearned => {
                let mut data = vec![-1.0f32; batch * seq * MOCK_VOCAB];
                for b in 0..batch {
                    for s in 0..seq {
                        for &idx in &MOCK_SPARSE_INDICES {
                            data[(b * seq + s) * MOCK_VOCAB + idx] = 1.0;
                        }
                    }
                }
                Tensor::F32 { shape: vec![batch, seq, MOCK_VOCAB], data }
            }
            SessionKind::Reranker => {
                Tensor::F32 { shape: vec![batch, 1], data: vec![1.0; batch] }
            }
            SessionKind::QueryUnderstand => {
                Tensor::F32 { shape: vec![batch, 7], data: vec![0.0; batch * 7] }
            }
        };
        let name = match self.kind {
            SessionKind::Embedding => "last_hidden_state",
            _ => "logits",
        };
        Ok(vec![(name.to_string(), out)])
    }
}

// ---------------------------------------------------------------------------
// ONNX session (feature `ml`)
// ---------------------------------------------------------------------------

#[cfg(feature = "ml")]
mod onnx {
    use super::*;
    use std::path::Path;

    /// An `ort` session. `run` is serialized because the native session
    /// serializes device access anyway; callers run inside `spawn_blocking`.
    pub struct OrtSession {
        inner: std::sync::Mutex<ort::session::Session>,
    }

    impl OrtSession {
        pub fn load(path: &Path, device: DeviceKind) -> Result<Self> {
            let mut builder = ort::session::Session::builder()
                .map_err(|e| Error::MlUnavailable(format!("ort init failed: {e}")))?;

            builder = match device {
                DeviceKind::Cuda => builder
                    .with_execution_providers([
                        ort::execution_providers::CUDAExecutionProvider::default().build(),
                    ])
                    .map_err(|e| Error::MlUnavailable(format!("CUDA provider failed: {e}")))?,
                DeviceKind::TensorRt => builder
                    .with_execution_providers([
                        ort::execution_providers::TensorRTExecutionProvider::default().build(),
                    ])
                    .map_err(|e| Error::MlUnavailable(format!("TensorRT provider failed: {e}")))?,
                _ => builder,
            };

            let session = builder
                .commit_from_file(path)
                .map_err(|e| Error::MlUnavailable(format!("failed to load {}: {e}", path.display())))?;
            Ok(OrtSession { inner: std::sync::Mutex::new(session) })
        }
    }

    impl Session for OrtSession {
        fn run(&self, inputs: Vec<(String, Tensor)>) -> Result<Vec<(String, Tensor)>> {
            use std::borrow::Cow;
            let mut session = self.inner.lock().unwrap();

            let mut ort_inputs: Vec<(Cow<'static, str>, ort::session::SessionInputValue<'static>)> =
                Vec::with_capacity(inputs.len());
            for (name, tensor) in inputs {
                let value = match tensor {
                    Tensor::F32 { shape, data } => {
                        let shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
                        ort::value::Tensor::from_array((shape, data))
                            .map_err(|e| Error::Internal(format!("tensor build failed: {e}")))?
                            .into_dyn()
                    }
                    Tensor::I64 { shape, data } => {
                        let shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
                        ort::value::Tensor::from_array((shape, data))
                            .map_err(|e| Error::Internal(format!("tensor build failed: {e}")))?
                            .into_dyn()
                    }
                    Tensor::I32 { shape, data } => {
                        let shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
                        ort::value::Tensor::from_array((shape, data))
                            .map_err(|e| Error::Internal(format!("tensor build failed: {e}")))?
                            .into_dyn()
                    }
                };
                ort_inputs.push((Cow::Owned(name), value.into()));
            }

            let outputs = session
                .run(ort_inputs)
                .map_err(|e| Error::Internal(format!("session run failed: {e}")))?;

            let mut result = Vec::new();
            for (name, value) in outputs.iter() {
                if let Ok((shape, data)) = value.try_extract_raw_tensor::<f32>() {
                    result.push((
                        name.to_string(),
                        Tensor::F32 {
                            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                            data: data.to_vec(),
                        },
                    ));
                } else if let Ok((shape, data)) = value.try_extract_raw_tensor::<i64>() {
                    result.push((
                        name.to_string(),
                        Tensor::I64 {
                            shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                            data: data.to_vec(),
                        },
                    ));
                }
            }
            Ok(result)
        }
    }

    pub fn provider_available(device: DeviceKind) -> bool {
        use ort::execution_providers::ExecutionProvider;
        match device {
            DeviceKind::Cpu => true,
            DeviceKind::Cuda => ort::execution_providers::CUDAExecutionProvider::default()
                .is_available()
                .unwrap_or(false),
            DeviceKind::TensorRt => ort::execution_providers::TensorRTExecutionProvider::default()
                .is_available()
                .unwrap_or(false),
            DeviceKind::Stub => false,
        }
    }
}

#[cfg(feature = "ml")]
pub use onnx::OrtSession;

// ---------------------------------------------------------------------------
// Session cache
// ---------------------------------------------------------------------------

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One cached session with its tokenizer, mapper, and usage bookkeeping.
pub struct SessionEntry {
    pub kind: SessionKind,
    pub session: Arc<dyn Session>,
    pub encoder: Arc<dyn TextEncoder>,
    pub mapper: MapperConfig,
    pub max_length: usize,
    pub batch_size: usize,
    /// Embedding dimension; 0 when not applicable to the kind.
    pub dim: usize,
    last_used: AtomicU64,
    in_flight: AtomicUsize,
}

impl SessionEntry {
    pub fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_used.load(Ordering::Relaxed))
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// RAII guard around a run: holds the in-flight count so the TTL sweeper
/// yields to active work, and refreshes `last_used` on release.
pub struct ActiveSession {
    entry: Arc<SessionEntry>,
}

impl ActiveSession {
    pub fn entry(&self) -> &SessionEntry {
        &self.entry
    }

    /// Resolve logical tensor names through the mapper and run the session.
    pub fn run(&self, inputs: Vec<(String, Tensor)>) -> Result<Vec<(String, Tensor)>> {
        let mapped: Vec<(String, Tensor)> = inputs
            .into_iter()
            .map(|(logical, t)| (self.entry.mapper.input_name(&logical), t))
            .collect();
        let outputs = self.entry.session.run(mapped)?;
        Ok(outputs
            .into_iter()
            .map(|(concrete, t)| (self.entry.mapper.logical_output(&concrete), t))
            .collect())
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.entry.last_used.store(now_ms(), Ordering::Relaxed);
        self.entry.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns every loaded session. Load and unload are serialized per kind; reads
/// go through the lock-free map.
pub struct ModelRuntime {
    device: DeviceState,
    mock: bool,
    default_dim: usize,
    ttl: Duration,
    registry: Arc<ModelRegistry>,
    metrics: Arc<MetricSet>,
    sessions: DashMap<SessionKind, Arc<SessionEntry>>,
    load_locks: DashMap<SessionKind, Arc<tokio::sync::Mutex<()>>>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ModelRuntime {
    pub fn new(config: &Config, registry: Arc<ModelRegistry>, metrics: Arc<MetricSet>) -> Self {
        let actual = Self::resolve_device(config.ml_device, config.mock_ml);
        if actual != config.ml_device {
            warn!(
                requested = config.ml_device.as_str(),
                actual = actual.as_str(),
                "requested ML device unavailable, running on stub"
            );
        } else {
            info!(device = actual.as_str(), mock = config.mock_ml, "ML runtime ready");
        }
        ModelRuntime {
            device: DeviceState { requested: config.ml_device, actual },
            mock: config.mock_ml,
            default_dim: config.embedding_dim,
            ttl: config.model_ttl,
            registry,
            metrics,
            sessions: DashMap::new(),
            load_locks: DashMap::new(),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    fn resolve_device(requested: DeviceKind, mock: bool) -> DeviceKind {
        if mock {
            // Mock sessions are in-process; device is irrelevant but must not
            // read as a GPU.
            return DeviceKind::Cpu;
        }
        #[cfg(feature = "ml")]
        {
            if requested == DeviceKind::Stub || onnx::provider_available(requested) {
                requested
            } else {
                DeviceKind::Stub
            }
        }
        #[cfg(not(feature = "ml"))]
        {
            let _ = requested;
            DeviceKind::Stub
        }
    }

    pub fn device(&self) -> DeviceState {
        self.device
    }

    pub fn is_mock(&self) -> bool {
        self.mock
    }

    fn load_lock(&self, kind: SessionKind) -> Arc<tokio::sync::Mutex<()>> {
        self.load_locks
            .entry(kind)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Get or transparently (re)load the session for `kind` and mark it
    /// in-flight. The returned guard keeps the session pinned against TTL
    /// eviction until dropped.
    pub async fn acquire(&self, kind: SessionKind) -> Result<ActiveSession> {
        let entry = match self.sessions.get(&kind) {
            Some(e) => Arc::clone(&e),
            None => {
                let lock = self.load_lock(kind);
                let _guard = lock.lock().await;
                if let Some(e) = self.sessions.get(&kind) {
                    Arc::clone(&e)
                } else {
                    let entry = self.load_session(kind).await?;
                    self.metrics.model_loads.with(&[kind.as_str()]).inc();
                    self.sessions.insert(kind, Arc::clone(&entry));
                    entry
                }
            }
        };
        entry.in_flight.fetch_add(1, Ordering::SeqCst);
        entry.last_used.store(now_ms(), Ordering::Relaxed);
        Ok(ActiveSession { entry })
    }

    async fn load_session(&self, kind: SessionKind) -> Result<Arc<SessionEntry>> {
        let sc = self.registry.session_config(kind).await;
        let dim = match kind {
            SessionKind::Embedding => sc.dim.unwrap_or(self.default_dim),
            _ => 0,
        };
        let mapper = self.registry.mapper(&sc.model_id).await;

        let (session, encoder): (Arc<dyn Session>, Arc<dyn TextEncoder>) = if self.mock {
            (
                Arc::new(MockSession::new(kind, dim.max(1))),
                Arc::new(WhitespaceEncoder::new(sc.max_length)),
            )
        } else if self.device.actual == DeviceKind::Stub {
            (Arc::new(StubSession), Arc::new(WhitespaceEncoder::new(sc.max_length)))
        } else {
            #[cfg(feature = "ml")]
            {
                let model_dir = self.registry.model_dir(&sc.model_id);
                let model_path = model_dir.join("model.onnx");
                let device = self.device.actual;
                let session = tokio::task::spawn_blocking(move || {
                    OrtSession::load(&model_path, device)
                })
                .await
                .map_err(|e| Error::Internal(format!("load task failed: {e}")))??;

                let tok_path = model_dir.join("tokenizer.json");
                let encoder: Arc<dyn TextEncoder> = if tok_path.exists() {
                    Arc::new(crate::tokenizer::HfTokenizer::from_file(&tok_path, sc.max_length)?)
                } else {
                    Arc::new(WhitespaceEncoder::new(sc.max_length))
                };
                (Arc::new(session) as Arc<dyn Session>, encoder)
            }
            #[cfg(not(feature = "ml"))]
            {
                unreachable!("non-ml builds always resolve to the stub device")
            }
        };

        debug!(session = kind.as_str(), model = sc.model_id.as_str(), "session loaded");
        Ok(Arc::new(SessionEntry {
            kind,
            session,
            encoder,
            mapper,
            max_length: sc.max_length,
            batch_size: sc.batch_size,
            dim,
            last_used: AtomicU64::new(now_ms()),
            in_flight: AtomicUsize::new(0),
        }))
    }

    /// Evict sessions idle past the TTL. An unload racing an incoming run
    /// yields to the run via the in-flight count.
    pub async fn sweep(&self) {
        let now = now_ms();
        let ttl_ms = self.ttl.as_millis() as u64;
        let kinds: Vec<SessionKind> = self.sessions.iter().map(|e| *e.key()).collect();
        for kind in kinds {
            let lock = self.load_lock(kind);
            let _guard = lock.lock().await;
            let evict = self
                .sessions
                .get(&kind)
                .map(|e| e.in_flight() == 0 && e.idle_for(now) > ttl_ms)
                .unwrap_or(false);
            if evict {
                self.sessions.remove(&kind);
                self.metrics.model_evictions.with(&[kind.as_str()]).inc();
                info!(session = kind.as_str(), "evicted idle session");
            }
        }
    }

    /// Start the background TTL sweeper.
    pub fn start_sweeper(self: Arc<Self>) {
        let interval = (self.ttl / 4).max(Duration::from_secs(1));
        let rt = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                rt.sweep().await;
            }
        });
        *self.sweeper.lock().unwrap() = Some(handle);
    }

    /// Drop every session and stop the sweeper.
    pub async fn shutdown(&self) {
        if let Some(h) = self.sweeper.lock().unwrap().take() {
            h.abort();
        }
        self.sessions.clear();
    }

    /// Number of currently loaded sessions.
    pub fn loaded(&self) -> usize {
        self.sessions.len()
    }
}
