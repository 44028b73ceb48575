//! Environment configuration.
//!
//! Every knob is an env var with a default so a bare `rice` starts against
//! local backends; CLI flags in `main.rs` override individual fields.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Device the ML runtime should try to obtain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
    Cuda,
    TensorRt,
    Stub,
}

impl DeviceKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(DeviceKind::Cpu),
            "cuda" => Ok(DeviceKind::Cuda),
            "tensorrt" => Ok(DeviceKind::TensorRt),
            "stub" => Ok(DeviceKind::Stub),
            other => Err(Error::Validation(format!(
                "unknown ML device '{other}' (expected cpu|cuda|tensorrt|stub)"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::TensorRt => "tensorrt",
            DeviceKind::Stub => "stub",
        }
    }
}

/// Runtime configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address, e.g. "127.0.0.1:7700".
    pub addr: String,
    /// Vector backend base URL (Qdrant-compatible REST).
    pub qdrant_url: String,
    /// Lexical backend base URL.
    pub lexical_url: String,
    /// Optional Redis URL for metrics history retention.
    pub redis_url: Option<String>,
    /// Requested ML device.
    pub ml_device: DeviceKind,
    /// Default embedding dimension for new stores.
    pub embedding_dim: usize,
    /// Idle TTL before a model session is evicted.
    pub model_ttl: Duration,
    /// Time-series history bucket width.
    pub history_bucket: Duration,
    /// Number of history buckets retained.
    pub history_retention: usize,
    /// Deterministic in-process ML sessions (tests, CI).
    pub mock_ml: bool,
    /// Directory holding downloaded models and registry YAML.
    pub models_dir: PathBuf,
    /// Optional external ONNX exporter binary.
    pub exporter_bin: Option<PathBuf>,
    /// Files larger than this are skipped at indexing time.
    pub max_file_bytes: u64,
    /// Concurrent file workers inside one Index call.
    pub index_workers: usize,
    /// Embedding batch size.
    pub embed_batch_size: usize,
    /// Overall search deadline.
    pub search_timeout: Duration,
    /// Budget for a single rerank pass within the search deadline.
    pub rerank_timeout: Duration,
    /// Top-K for the lexical retriever.
    pub sparse_topk: usize,
    /// Top-K for the dense retriever.
    pub dense_topk: usize,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str) -> bool {
    matches!(std::env::var(key).ok().as_deref(), Some("1") | Some("true") | Some("yes"))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let ml_device = match std::env::var("RICE_ML_DEVICE") {
            Ok(v) => DeviceKind::parse(&v)?,
            Err(_) => DeviceKind::Cpu,
        };

        let models_dir = std::env::var("RICE_MODELS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("models"));

        Ok(Config {
            addr: std::env::var("RICE_ADDR").unwrap_or_else(|_| "127.0.0.1:7700".to_string()),
            qdrant_url: std::env::var("RICE_QDRANT_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6333".to_string()),
            lexical_url: std::env::var("RICE_LEXICAL_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7280".to_string()),
            redis_url: std::env::var("RICE_REDIS_URL").ok().filter(|s| !s.is_empty()),
            ml_device,
            embedding_dim: env_or("RICE_EMBEDDING_DIM", 384),
            model_ttl: Duration::from_secs(env_or("RICE_MODEL_TTL_SECS", 900)),
            history_bucket: Duration::from_secs(env_or("RICE_HISTORY_BUCKET_SECS", 300)),
            history_retention: env_or("RICE_HISTORY_RETENTION", 12),
            mock_ml: env_bool("RICE_MOCK_ML"),
            models_dir,
            exporter_bin: std::env::var("RICE_EXPORTER_BIN").ok().map(PathBuf::from),
            max_file_bytes: env_or("RICE_MAX_FILE_BYTES", 1024 * 1024),
            index_workers: env_or("RICE_INDEX_WORKERS", 4),
            embed_batch_size: env_or("RICE_EMBED_BATCH", 16),
            search_timeout: Duration::from_millis(env_or("RICE_SEARCH_TIMEOUT_MS", 10_000)),
            rerank_timeout: Duration::from_millis(env_or("RICE_RERANK_TIMEOUT_MS", 3_000)),
            sparse_topk: env_or("RICE_SPARSE_TOPK", 200),
            dense_topk: env_or("RICE_DENSE_TOPK", 80),
        })
    }
}

impl Default for Config {
    /// In-process defaults used by tests: mock ML, no Redis, tiny timeouts.
    fn default() -> Self {
        Config {
            addr: "127.0.0.1:0".to_string(),
            qdrant_url: "http://127.0.0.1:6333".to_string(),
            lexical_url: "http://127.0.0.1:7280".to_string(),
            redis_url: None,
            ml_device: DeviceKind::Cpu,
            embedding_dim: 384,
            model_ttl: Duration::from_secs(900),
            history_bucket: Duration::from_secs(300),
            history_retention: 12,
            mock_ml: true,
            models_dir: PathBuf::from("models"),
            exporter_bin: None,
            max_file_bytes: 1024 * 1024,
            index_workers: 4,
            embed_batch_size: 16,
            search_timeout: Duration::from_secs(10),
            rerank_timeout: Duration::from_secs(3),
            sparse_topk: 200,
            dense_topk: 80,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parse() {
        assert_eq!(DeviceKind::parse("cpu").unwrap(), DeviceKind::Cpu);
        assert_eq!(DeviceKind::parse("cuda").unwrap(), DeviceKind::Cuda);
        assert_eq!(DeviceKind::parse("tensorrt").unwrap(), DeviceKind::TensorRt);
        assert_eq!(DeviceKind::parse("stub").unwrap(), DeviceKind::Stub);
        assert!(DeviceKind::parse("gpu").is_err());
    }

    #[test]
    fn test_default_config_is_mocked() {
        let cfg = Config::default();
        assert!(cfg.mock_ml);
        assert_eq!(cfg.embedding_dim, 384);
        assert_eq!(cfg.history_retention, 12);
    }
}
