//! Model registry: catalog, per-type defaults, and the
//! download / export / validate / offload lifecycle.
//!
//! Persistence is three YAML surfaces under the models directory —
//! `models.yaml`, `type_configs.yaml`, and one file per mapper under
//! `mappers/` — each written atomically (temp file + rename).

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::runtime::SessionKind;

const MODELS_FILE: &str = "models.yaml";
const TYPE_CONFIGS_FILE: &str = "type_configs.yaml";
const REQUIRED_FILE: &str = "model.onnx";
const OPTIONAL_FILES: [&str; 2] = ["tokenizer.json", "config.json"];

/// Fall-through URL path candidates tried per file.
const PATH_CANDIDATES: [&str; 3] = ["/resolve/main/{file}", "/resolve/main/onnx/{file}", "/resolve/main/model/{file}"];

// ---------------------------------------------------------------------------
// Catalog types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Embed,
    Rerank,
    QueryUnderstand,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Embed => "embed",
            ModelType::Rerank => "rerank",
            ModelType::QueryUnderstand => "query_understand",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub model_type: ModelType,
    /// HuggingFace repo id, or a full base URL for self-hosted mirrors.
    pub repo: String,
    #[serde(default)]
    pub dim: Option<usize>,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub validated: Option<bool>,
    #[serde(default)]
    pub default: bool,
}

fn default_max_length() -> usize {
    512
}

/// Per-session runtime configuration persisted in `type_configs.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfigEntry {
    pub model: String,
    #[serde(default = "default_batch")]
    pub batch_size: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

fn default_batch() -> usize {
    16
}

/// Resolved configuration handed to the runtime for one session kind.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub model_id: String,
    pub batch_size: usize,
    pub max_length: usize,
    pub dim: Option<usize>,
}

/// Logical↔concrete tensor-name mapping consulted at `run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapperConfig {
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub output_mapping: BTreeMap<String, String>,
}

impl MapperConfig {
    /// Concrete input tensor name for a logical name.
    pub fn input_name(&self, logical: &str) -> String {
        self.input_mapping.get(logical).cloned().unwrap_or_else(|| logical.to_string())
    }

    /// Whether the model declares this logical input at all. An absent entry
    /// with a non-empty mapping means the model has no such tensor.
    pub fn wants_input(&self, logical: &str) -> bool {
        self.input_mapping.is_empty() || self.input_mapping.contains_key(logical)
    }

    /// Whether the mapping explicitly declares an extra input (e.g.
    /// `token_type_ids`); absent means the pipeline must not send it.
    pub fn declares(&self, logical: &str) -> bool {
        self.input_mapping.contains_key(logical)
    }

    /// Logical name for a concrete output tensor name.
    pub fn logical_output(&self, concrete: &str) -> String {
        self.output_mapping
            .iter()
            .find(|(_, v)| v.as_str() == concrete)
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| concrete.to_string())
    }
}

// ---------------------------------------------------------------------------
// Download progress stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Started,
    Progress,
    Skipped,
    Warned,
    Complete,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadProgress {
    pub model: String,
    pub file: String,
    pub status: DownloadStatus,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ModelRegistry {
    dir: PathBuf,
    models: RwLock<BTreeMap<String, ModelInfo>>,
    type_configs: RwLock<BTreeMap<String, SessionConfigEntry>>,
    mappers: RwLock<BTreeMap<String, MapperConfig>>,
    http: reqwest::Client,
    exporter: Option<PathBuf>,
}

impl ModelRegistry {
    /// Load the registry from `dir`, seeding the built-in catalog on first
    /// boot so every type has a default before any download.
    pub async fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir.join("mappers"))
            .map_err(|e| Error::Internal(format!("cannot create models dir: {e}")))?;

        let models_path = dir.join(MODELS_FILE);
        let models: BTreeMap<String, ModelInfo> = if models_path.exists() {
            read_yaml(&models_path)?
        } else {
            let seeded = seed_catalog();
            write_yaml(&models_path, &seeded)?;
            seeded
        };

        let tc_path = dir.join(TYPE_CONFIGS_FILE);
        let type_configs: BTreeMap<String, SessionConfigEntry> = if tc_path.exists() {
            read_yaml(&tc_path)?
        } else {
            let seeded = seed_type_configs();
            write_yaml(&tc_path, &seeded)?;
            seeded
        };

        let mut mappers = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(dir.join("mappers")) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("yaml") {
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        match read_yaml::<MapperConfig>(&path) {
                            Ok(m) => {
                                mappers.insert(stem.to_string(), m);
                            }
                            Err(e) => warn!(mapper = stem, error = %e, "skipping bad mapper file"),
                        }
                    }
                }
            }
        }

        Ok(ModelRegistry {
            dir: dir.to_path_buf(),
            models: RwLock::new(models),
            type_configs: RwLock::new(type_configs),
            mappers: RwLock::new(mappers),
            http: reqwest::Client::new(),
            exporter: None,
        })
    }

    pub fn with_exporter(mut self, exporter: Option<PathBuf>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn model_dir(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    // -- catalog ------------------------------------------------------------

    pub async fn list(&self, type_filter: Option<ModelType>) -> Vec<ModelInfo> {
        self.models
            .read()
            .await
            .values()
            .filter(|m| type_filter.map(|t| m.model_type == t).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Result<ModelInfo> {
        self.models
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("model '{id}'")))
    }

    pub async fn get_default(&self, model_type: ModelType) -> Result<ModelInfo> {
        self.models
            .read()
            .await
            .values()
            .find(|m| m.model_type == model_type && m.default)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("default {} model", model_type.as_str())))
    }

    /// Atomically move the default flag of `model_type` to `id`, then point
    /// the matching session at it. Both files are persisted before returning.
    pub async fn set_default(&self, model_type: ModelType, id: &str) -> Result<()> {
        let mut models = self.models.write().await;
        let target = models
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("model '{id}'")))?;
        if target.model_type != model_type {
            return Err(Error::Validation(format!(
                "model '{id}' has type {}, not {}",
                target.model_type.as_str(),
                model_type.as_str()
            )));
        }
        for m in models.values_mut() {
            if m.model_type == model_type {
                m.default = m.id == id;
            }
        }
        write_yaml(&self.dir.join(MODELS_FILE), &*models)?;
        drop(models);

        let session_key = match model_type {
            ModelType::Embed => "embedding",
            ModelType::Rerank => "reranker",
            ModelType::QueryUnderstand => "query_understand",
        };
        let mut tcs = self.type_configs.write().await;
        if let Some(entry) = tcs.get_mut(session_key) {
            entry.model = id.to_string();
        }
        write_yaml(&self.dir.join(TYPE_CONFIGS_FILE), &*tcs)?;
        Ok(())
    }

    // -- session resolution -------------------------------------------------

    /// Runtime configuration for one session kind. Unknown sessions fall back
    /// to the type default.
    pub async fn session_config(&self, kind: SessionKind) -> SessionConfig {
        let key = match kind {
            SessionKind::Embedding => "embedding",
            SessionKind::Reranker => "reranker",
            SessionKind::SparseLearned => "sparse",
            SessionKind::QueryUnderstand => "query_understand",
        };
        let entry = self.type_configs.read().await.get(key).cloned();
        let entry = entry.unwrap_or_else(|| seed_type_configs().remove(key).unwrap_or(SessionConfigEntry {
            model: String::new(),
            batch_size: default_batch(),
            max_length: default_max_length(),
        }));
        let dim = self.models.read().await.get(&entry.model).and_then(|m| m.dim);
        SessionConfig {
            model_id: entry.model,
            batch_size: entry.batch_size,
            max_length: entry.max_length,
            dim,
        }
    }

    pub async fn mapper(&self, model_id: &str) -> MapperConfig {
        self.mappers.read().await.get(model_id).cloned().unwrap_or_default()
    }

    pub async fn put_mapper(&self, model_id: &str, mapper: MapperConfig) -> Result<()> {
        write_yaml(&self.dir.join("mappers").join(format!("{model_id}.yaml")), &mapper)?;
        self.mappers.write().await.insert(model_id.to_string(), mapper);
        Ok(())
    }

    // -- download -----------------------------------------------------------

    /// Download a model's files, streaming progress. The channel carries one
    /// terminal event (`Complete` or `Error`) and then closes.
    pub async fn download(self: Arc<Self>, id: &str) -> Result<mpsc::Receiver<DownloadProgress>> {
        let info = self.get(id).await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            self.download_task(info, tx).await;
        });
        Ok(rx)
    }

    async fn download_task(&self, info: ModelInfo, tx: mpsc::Sender<DownloadProgress>) {
        let dir = self.model_dir(&info.id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            let _ = tx
                .send(progress(&info.id, REQUIRED_FILE, DownloadStatus::Error, 0, None, Some(e.to_string())))
                .await;
            return;
        }

        let mut files = vec![REQUIRED_FILE];
        files.extend(OPTIONAL_FILES);

        for file in files {
            let target = dir.join(file);
            if target.exists() {
                let _ = tx.send(progress(&info.id, file, DownloadStatus::Skipped, 0, None, None)).await;
                continue;
            }
            match self.fetch_file(&info, file, &target, &tx).await {
                Ok(bytes) => {
                    debug!(model = info.id.as_str(), file, bytes, "downloaded");
                }
                Err(e) if file == REQUIRED_FILE => {
                    let _ = tx
                        .send(progress(&info.id, file, DownloadStatus::Error, 0, None, Some(e.to_string())))
                        .await;
                    return;
                }
                Err(e) => {
                    warn!(model = info.id.as_str(), file, error = %e, "optional file unavailable");
                    let _ = tx
                        .send(progress(&info.id, file, DownloadStatus::Warned, 0, None, Some(e.to_string())))
                        .await;
                }
            }
        }

        {
            let mut models = self.models.write().await;
            if let Some(m) = models.get_mut(&info.id) {
                m.downloaded = true;
            }
            let _ = write_yaml(&self.dir.join(MODELS_FILE), &*models);
        }
        info!(model = info.id.as_str(), "model downloaded");
        let _ = tx.send(progress(&info.id, "", DownloadStatus::Complete, 0, None, None)).await;
    }

    /// Try each path candidate in order; partial files never overwrite the
    /// target (temp file + rename), so a failed attempt is retryable.
    async fn fetch_file(
        &self,
        info: &ModelInfo,
        file: &str,
        target: &Path,
        tx: &mpsc::Sender<DownloadProgress>,
    ) -> Result<u64> {
        let base = if info.repo.starts_with("http://") || info.repo.starts_with("https://") {
            info.repo.trim_end_matches('/').to_string()
        } else {
            format!("https://huggingface.co/{}", info.repo)
        };

        let mut last_err = Error::NotFound(format!("{file} for model '{}'", info.id));
        for candidate in PATH_CANDIDATES {
            let url = format!("{base}{}", candidate.replace("{file}", file));
            match self.fetch_url(info, file, &url, target, tx).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn fetch_url(
        &self,
        info: &ModelInfo,
        file: &str,
        url: &str,
        target: &Path,
        tx: &mpsc::Sender<DownloadProgress>,
    ) -> Result<u64> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::NotFound(format!("{url} → {}", resp.status())));
        }
        let total = resp.content_length();
        let _ = tx.send(progress(&info.id, file, DownloadStatus::Started, 0, total, None)).await;

        let tmp = target.with_extension("part");
        let mut out = std::fs::File::create(&tmp)
            .map_err(|e| Error::Internal(format!("cannot create {}: {e}", tmp.display())))?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        let mut last_report: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::BackendUnavailable(format!("stream: {e}")))?;
            std::io::Write::write_all(&mut out, &chunk)
                .map_err(|e| Error::Internal(format!("write: {e}")))?;
            written += chunk.len() as u64;
            if written - last_report >= 4 * 1024 * 1024 {
                last_report = written;
                let _ = tx
                    .send(progress(&info.id, file, DownloadStatus::Progress, written, total, None))
                    .await;
            }
        }
        drop(out);
        std::fs::rename(&tmp, target).map_err(|e| Error::Internal(format!("rename: {e}")))?;
        let _ = tx.send(progress(&info.id, file, DownloadStatus::Progress, written, total, None)).await;
        Ok(written)
    }

    // -- export -------------------------------------------------------------

    /// Produce `model.onnx` via the external exporter. Without the exporter
    /// and without a native ONNX artifact this fails with `ExporterMissing`.
    pub async fn export(&self, id: &str) -> Result<()> {
        let info = self.get(id).await?;
        let target = self.model_dir(id).join(REQUIRED_FILE);
        if target.exists() {
            return Ok(());
        }
        let Some(exporter) = self.exporter.clone() else {
            return Err(Error::ExporterMissing);
        };
        let dir = self.model_dir(id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Internal(format!("cannot create model dir: {e}")))?;
        let repo = info.repo.clone();
        let status = tokio::task::spawn_blocking(move || {
            std::process::Command::new(&exporter)
                .arg("--repo")
                .arg(&repo)
                .arg("--out")
                .arg(&dir)
                .status()
        })
        .await
        .map_err(|e| Error::Internal(format!("exporter task failed: {e}")))?
        .map_err(|e| Error::Internal(format!("exporter spawn failed: {e}")))?;

        if !status.success() {
            return Err(Error::Internal(format!("exporter exited with {status}")));
        }
        if !target.exists() {
            return Err(Error::Internal("exporter produced no model.onnx".into()));
        }
        Ok(())
    }

    // -- validate -----------------------------------------------------------

    /// Load the model on CPU, run a one-token forward pass, and persist
    /// whether the output was usable (non-empty, no NaN/Inf).
    pub async fn validate(&self, id: &str) -> Result<bool> {
        let info = self.get(id).await?;
        if !info.downloaded {
            return Err(Error::Validation(format!("model '{id}' is not downloaded")));
        }

        #[cfg(not(feature = "ml"))]
        {
            return Err(Error::MlUnavailable("built without the ml feature".into()));
        }
        #[cfg(feature = "ml")]
        {
            let path = self.model_dir(id).join(REQUIRED_FILE);
            let session = tokio::task::spawn_blocking(move || {
                crate::runtime::OrtSession::load(&path, crate::config::DeviceKind::Cpu)
            })
            .await
            .map_err(|e| Error::Internal(format!("validate task failed: {e}")))??;
            let ok = check_forward(&session)?;

            let mut models = self.models.write().await;
            if let Some(m) = models.get_mut(id) {
                m.validated = Some(ok);
            }
            write_yaml(&self.dir.join(MODELS_FILE), &*models)?;
            Ok(ok)
        }
    }

    // -- offload / delete ---------------------------------------------------

    /// Remove files from disk, keep the catalog entry. The default model of a
    /// type may be offloaded.
    pub async fn offload(&self, id: &str) -> Result<()> {
        let _ = self.get(id).await?;
        let dir = self.model_dir(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| Error::Internal(format!("cannot remove {}: {e}", dir.display())))?;
        }
        let mut models = self.models.write().await;
        if let Some(m) = models.get_mut(id) {
            m.downloaded = false;
            m.validated = None;
        }
        write_yaml(&self.dir.join(MODELS_FILE), &*models)?;
        Ok(())
    }

    /// Offload plus catalog removal. The current default of a type cannot be
    /// deleted.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let info = self.get(id).await?;
        if info.default {
            return Err(Error::Validation(format!(
                "model '{id}' is the current {} default and cannot be deleted",
                info.model_type.as_str()
            )));
        }
        self.offload(id).await?;
        let mut models = self.models.write().await;
        models.remove(id);
        write_yaml(&self.dir.join(MODELS_FILE), &*models)?;
        let _ = std::fs::remove_file(self.dir.join("mappers").join(format!("{id}.yaml")));
        self.mappers.write().await.remove(id);
        Ok(())
    }
}

/// Dummy forward pass used by validation: one token in, any finite
/// non-empty tensor out.
pub(crate) fn check_forward(session: &dyn crate::runtime::Session) -> Result<bool> {
    use crate::runtime::Tensor;
    let outputs = session.run(vec![
        ("input_ids".into(), Tensor::I64 { shape: vec![1, 1], data: vec![101] }),
        ("attention_mask".into(), Tensor::I64 { shape: vec![1, 1], data: vec![1] }),
    ])?;
    let Some((_, first)) = outputs.first() else {
        return Ok(false);
    };
    match first {
        Tensor::F32 { data, .. } => Ok(!data.is_empty() && data.iter().all(|v| v.is_finite())),
        Tensor::I64 { data, .. } => Ok(!data.is_empty()),
        Tensor::I32 { data, .. } => Ok(!data.is_empty()),
    }
}

fn progress(
    model: &str,
    file: &str,
    status: DownloadStatus,
    bytes: u64,
    total: Option<u64>,
    message: Option<String>,
) -> DownloadProgress {
    DownloadProgress { model: model.to_string(), file: file.to_string(), status, bytes, total, message }
}

// ---------------------------------------------------------------------------
// YAML persistence
// ---------------------------------------------------------------------------

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Internal(format!("cannot read {}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| Error::Internal(format!("cannot parse {}: {e}", path.display())))
}

/// Atomic per-file write: temp file in the same directory, then rename.
fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_yaml::to_string(value)
        .map_err(|e| Error::Internal(format!("cannot serialize {}: {e}", path.display())))?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, raw)
        .map_err(|e| Error::Internal(format!("cannot write {}: {e}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(|e| Error::Internal(format!("cannot rename {}: {e}", tmp.display())))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Built-in catalog
// ---------------------------------------------------------------------------

fn seed_catalog() -> BTreeMap<String, ModelInfo> {
    let entries = [
        ModelInfo {
            id: "bge-small-en-v1.5".into(),
            name: "BGE Small EN v1.5".into(),
            model_type: ModelType::Embed,
            repo: "BAAI/bge-small-en-v1.5".into(),
            dim: Some(384),
            max_length: 512,
            downloaded: false,
            validated: None,
            default: true,
        },
        ModelInfo {
            id: "splade-pp-en-v1".into(),
            name: "SPLADE++ EN v1 (learned sparse)".into(),
            model_type: ModelType::Embed,
            repo: "prithivida/Splade_PP_en_v1".into(),
            dim: None,
            max_length: 256,
            downloaded: false,
            validated: None,
            default: false,
        },
        ModelInfo {
            id: "bge-reranker-base".into(),
            name: "BGE Reranker Base".into(),
            model_type: ModelType::Rerank,
            repo: "BAAI/bge-reranker-base".into(),
            dim: None,
            max_length: 512,
            downloaded: false,
            validated: None,
            default: true,
        },
        ModelInfo {
            id: "query-intent-small".into(),
            name: "Query intent classifier".into(),
            model_type: ModelType::QueryUnderstand,
            repo: "moabualruz/rice-query-intent".into(),
            dim: None,
            max_length: 64,
            downloaded: false,
            validated: None,
            default: true,
        },
    ];
    entries.into_iter().map(|m| (m.id.clone(), m)).collect()
}

fn seed_type_configs() -> BTreeMap<String, SessionConfigEntry> {
    let mut out = BTreeMap::new();
    out.insert(
        "embedding".to_string(),
        SessionConfigEntry { model: "bge-small-en-v1.5".into(), batch_size: 16, max_length: 512 },
    );
    out.insert(
        "reranker".to_string(),
        SessionConfigEntry { model: "bge-reranker-base".into(), batch_size: 8, max_length: 512 },
    );
    out.insert(
        "sparse".to_string(),
        SessionConfigEntry { model: "splade-pp-en-v1".into(), batch_size: 8, max_length: 256 },
    );
    out.insert(
        "query_understand".to_string(),
        SessionConfigEntry { model: "query-intent-small".into(), batch_size: 1, max_length: 64 },
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MockSession, SessionKind, Tensor};

    async fn open_temp() -> (tempfile::TempDir, ModelRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = ModelRegistry::open(dir.path()).await.unwrap();
        (dir, reg)
    }

    #[tokio::test]
    async fn test_seed_has_one_default_per_type() {
        let (_dir, reg) = open_temp().await;
        for t in [ModelType::Embed, ModelType::Rerank, ModelType::QueryUnderstand] {
            let defaults: Vec<_> =
                reg.list(Some(t)).await.into_iter().filter(|m| m.default).collect();
            assert_eq!(defaults.len(), 1, "type {} should have one default", t.as_str());
        }
    }

    #[tokio::test]
    async fn test_set_default_moves_flag_and_persists() {
        let (dir, reg) = open_temp().await;
        reg.set_default(ModelType::Embed, "splade-pp-en-v1").await.unwrap();
        let def = reg.get_default(ModelType::Embed).await.unwrap();
        assert_eq!(def.id, "splade-pp-en-v1");
        assert!(!reg.get("bge-small-en-v1.5").await.unwrap().default);

        // Reload from disk — both files were persisted
        let reg2 = ModelRegistry::open(dir.path()).await.unwrap();
        assert_eq!(reg2.get_default(ModelType::Embed).await.unwrap().id, "splade-pp-en-v1");
        assert_eq!(
            reg2.session_config(SessionKind::Embedding).await.model_id,
            "splade-pp-en-v1"
        );
    }

    #[tokio::test]
    async fn test_set_default_rejects_type_mismatch() {
        let (_dir, reg) = open_temp().await;
        let err = reg.set_default(ModelType::Rerank, "bge-small-en-v1.5").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_rejects_default_allows_offload() {
        let (_dir, reg) = open_temp().await;
        let err = reg.delete("bge-small-en-v1.5").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        // Offloading the default is allowed
        reg.offload("bge-small-en-v1.5").await.unwrap();
        let m = reg.get("bge-small-en-v1.5").await.unwrap();
        assert!(!m.downloaded);
        assert!(m.validated.is_none());
        // Non-default deletes fine
        reg.delete("splade-pp-en-v1").await.unwrap();
        assert!(reg.get("splade-pp-en-v1").await.is_err());
    }

    #[tokio::test]
    async fn test_mapper_roundtrip_and_default_identity() {
        let (_dir, reg) = open_temp().await;
        let identity = reg.mapper("bge-small-en-v1.5").await;
        assert_eq!(identity.input_name("input_ids"), "input_ids");
        assert!(identity.wants_input("token_type_ids"));

        let mut m = MapperConfig::default();
        m.input_mapping.insert("input_ids".into(), "ids".into());
        m.output_mapping.insert("last_hidden_state".into(), "output_0".into());
        reg.put_mapper("bge-small-en-v1.5", m).await.unwrap();

        let loaded = reg.mapper("bge-small-en-v1.5").await;
        assert_eq!(loaded.input_name("input_ids"), "ids");
        assert_eq!(loaded.logical_output("output_0"), "last_hidden_state");
        assert!(!loaded.wants_input("token_type_ids"));
    }

    #[tokio::test]
    async fn test_export_without_exporter_fails() {
        let (_dir, reg) = open_temp().await;
        let err = reg.export("bge-small-en-v1.5").await.unwrap_err();
        assert!(matches!(err, Error::ExporterMissing));
    }

    #[tokio::test]
    async fn test_session_config_resolution() {
        let (_dir, reg) = open_temp().await;
        let sc = reg.session_config(SessionKind::Embedding).await;
        assert_eq!(sc.model_id, "bge-small-en-v1.5");
        assert_eq!(sc.dim, Some(384));
        let sc = reg.session_config(SessionKind::SparseLearned).await;
        assert_eq!(sc.model_id, "splade-pp-en-v1");
        assert_eq!(sc.max_length, 256);
    }

    #[test]
    fn test_check_forward_accepts_finite_rejects_empty() {
        let ok = check_forward(&MockSession::new(SessionKind::Embedding, 8)).unwrap();
        assert!(ok);

        struct NanSession;
        impl crate::runtime::Session for NanSession {
            fn run(
                &self,
                _inputs: Vec<(String, Tensor)>,
            ) -> crate::error::Result<Vec<(String, Tensor)>> {
                Ok(vec![(
                    "logits".into(),
                    Tensor::F32 { shape: vec![1, 2], data: vec![f32::NAN, 1.0] },
                )])
            }
        }
        assert!(!check_forward(&NanSession).unwrap());
    }
}
