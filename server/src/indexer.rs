//! Incremental indexing: fingerprint-based change detection, batched
//! embedding, and parallel upsert/delete fan-out to the retrieval backends.
//!
//! Within one `index` call files run concurrently up to the worker bound, but
//! one path is never in flight twice in the same store: a per-path lock is
//! held from chunking through metadata commit. Backend fan-out is
//! at-least-once — a failed backend marks the file failed without rolling
//! back its peers; the next reindex reconciles because chunk ids are
//! idempotent upserts.

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::backends::{
    ChunkPayload, DeletePredicate, LexicalBackend, LexicalDoc, VectorBackend, VectorPoint,
};
use crate::bus::{EventBus, Topic};
use crate::chunker::{self, ChunkerConfig};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::metrics::MetricSet;
use crate::sparse::SparseEncoder;
use crate::stores::{StoreRegistry, StoreState};
use crate::types::{
    content_hash, DeleteRequest, DeleteResponse, Document, FileInput, IndexResponse, SparseVector,
};

enum FileOutcome {
    Indexed { chunks: usize },
    Skipped { reason: &'static str },
    Failed { error: String },
}

pub struct Indexer {
    stores: Arc<StoreRegistry>,
    vector: Arc<dyn VectorBackend>,
    lexical: Arc<dyn LexicalBackend>,
    embedder: Arc<Embedder>,
    sparse: Arc<SparseEncoder>,
    bus: Arc<EventBus>,
    metrics: Arc<MetricSet>,
    chunker: ChunkerConfig,
    path_locks: DashMap<(String, String), Arc<tokio::sync::Mutex<()>>>,
    workers: usize,
    max_file_bytes: u64,
}

impl Indexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Arc<StoreRegistry>,
        vector: Arc<dyn VectorBackend>,
        lexical: Arc<dyn LexicalBackend>,
        embedder: Arc<Embedder>,
        sparse: Arc<SparseEncoder>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricSet>,
        workers: usize,
        max_file_bytes: u64,
    ) -> Self {
        Indexer {
            stores,
            vector,
            lexical,
            embedder,
            sparse,
            bus,
            metrics,
            chunker: ChunkerConfig::default(),
            path_locks: DashMap::new(),
            workers: workers.max(1),
            max_file_bytes,
        }
    }

    fn path_lock(&self, store: &str, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.path_locks
            .entry((store.to_string(), path.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Index a batch of files. Unchanged files (same fingerprint, `force`
    /// off) are skipped without touching any backend.
    pub async fn index(
        &self,
        store: &str,
        files: Vec<FileInput>,
        force: bool,
    ) -> Result<IndexResponse> {
        let state = self.stores.get(store)?;
        let started = Instant::now();
        self.bus
            .emit(
                Topic::IndexRequest,
                "indexer",
                serde_json::json!({ "store": store, "files": files.len() }),
            )
            .await;

        let outcomes: Vec<FileOutcome> = stream::iter(files)
            .map(|file| self.index_file(&state, store, file, force))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut resp = IndexResponse::default();
        let mut first_error: Option<String> = None;
        for outcome in outcomes {
            match outcome {
                FileOutcome::Indexed { chunks } => {
                    resp.indexed += 1;
                    resp.chunks_total += chunks;
                    self.metrics.index_files.with(&["indexed"]).inc();
                }
                FileOutcome::Skipped { reason } => {
                    resp.skipped += 1;
                    self.metrics.index_files.with(&["skipped"]).inc();
                    debug!(reason, "file skipped");
                }
                FileOutcome::Failed { error } => {
                    resp.failed += 1;
                    self.metrics.index_files.with(&["failed"]).inc();
                    first_error.get_or_insert(error);
                }
            }
        }
        resp.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.index_chunks.add(resp.chunks_total as f64);
        self.metrics.index_latency.observe(resp.duration_ms as f64);
        state.touch();

        self.bus
            .emit(
                Topic::IndexResponse,
                "indexer",
                serde_json::json!({
                    "store": store,
                    "doc_count": resp.indexed,
                    "chunk_count": resp.chunks_total,
                    "latency_ms": resp.duration_ms,
                    "error": first_error,
                }),
            )
            .await;
        Ok(resp)
    }

    async fn index_file(
        &self,
        state: &Arc<StoreState>,
        store: &str,
        file: FileInput,
        force: bool,
    ) -> FileOutcome {
        if file.content.len() as u64 > self.max_file_bytes {
            return FileOutcome::Skipped { reason: "exceeds maximum file size" };
        }
        if chunker::is_probably_binary(file.content.as_bytes()) {
            return FileOutcome::Skipped { reason: "binary content" };
        }

        let hash = content_hash(file.content.as_bytes());
        if !force {
            if let Some(doc) = state.documents.get(&file.path) {
                if doc.content_hash == hash {
                    return FileOutcome::Skipped { reason: "unchanged fingerprint" };
                }
            }
        }

        // Serialize the chunk-set transition for this path; other paths
        // proceed in parallel.
        let lock = self.path_lock(store, &file.path);
        let _guard = lock.lock().await;

        // Re-check under the lock: a concurrent worker may have landed the
        // same bytes while we waited.
        if !force {
            if let Some(doc) = state.documents.get(&file.path) {
                if doc.content_hash == hash {
                    return FileOutcome::Skipped { reason: "unchanged fingerprint" };
                }
            }
        }

        match self.reindex_path(state, store, &file, &hash).await {
            Ok(chunks) => FileOutcome::Indexed { chunks },
            Err(e) => {
                warn!(store, path = file.path.as_str(), error = %e, "file indexing failed");
                FileOutcome::Failed { error: e.to_string() }
            }
        }
    }

    /// Steps 2–5 for one path, under its lock: chunk, embed, delete stale
    /// chunks, fan out upserts, commit document metadata.
    async fn reindex_path(
        &self,
        state: &Arc<StoreState>,
        store: &str,
        file: &FileInput,
        hash: &str,
    ) -> Result<usize> {
        let config = state.config();
        let chunks = chunker::chunk_file(store, &file.path, &file.content, hash, &self.chunker);

        let dense: Vec<Vec<f32>> = if config.enable_dense && !chunks.is_empty() {
            let inputs: Vec<String> = chunks.iter().map(|c| c.embedding_input()).collect();
            let vectors = self.embedder.encode(&inputs).await?;
            for v in &vectors {
                if v.len() != config.embedding_dimension {
                    return Err(Error::Validation(format!(
                        "embedding dimension {} does not match store dimension {}",
                        v.len(),
                        config.embedding_dimension
                    )));
                }
            }
            vectors
        } else {
            chunks.iter().map(|_| vec![0.0; config.embedding_dimension]).collect()
        };

        let learned: Vec<SparseVector> = if config.enable_learned_sparse && !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            self.sparse.encode(&texts).await?
        } else {
            chunks.iter().map(|_| SparseVector::default()).collect()
        };

        // The old chunk set for this path goes before the new one lands.
        // Overlapping ids are rewritten identically (idempotent upserts), and
        // running the delete even when no document is on record reconciles
        // orphans left by an earlier partial failure.
        {
            let predicate = DeletePredicate::Paths(vec![file.path.clone()]);
            let (v, l) =
                tokio::join!(self.vector.delete(store, &predicate), self.lexical.delete(store, &predicate));
            v?;
            l?;
        }

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(dense.iter())
            .zip(learned.iter())
            .map(|((c, d), s)| VectorPoint {
                id: c.id.clone(),
                dense: d.clone(),
                sparse: s.clone(),
                payload: ChunkPayload::from(c),
            })
            .collect();
        let docs: Vec<LexicalDoc> = chunks
            .iter()
            .map(|c| LexicalDoc { id: c.id.clone(), payload: ChunkPayload::from(c) })
            .collect();

        let vector_needed = config.enable_dense || config.enable_learned_sparse;
        let (v, l) = tokio::join!(
            async {
                if vector_needed && !points.is_empty() {
                    self.vector.upsert(store, points).await
                } else {
                    Ok(())
                }
            },
            async {
                if config.enable_sparse && !docs.is_empty() {
                    self.lexical.upsert(store, docs).await
                } else {
                    Ok(())
                }
            }
        );
        if let Err(e) = v {
            self.metrics.backend_errors.with(&["vector"]).inc();
            return Err(e);
        }
        if let Err(e) = l {
            self.metrics.backend_errors.with(&["lexical"]).inc();
            return Err(e);
        }

        // All backends accepted the new chunk set; commit the document.
        let chunk_count = chunks.len();
        state.documents.insert(
            file.path.clone(),
            Document {
                path: file.path.clone(),
                content_hash: hash.to_string(),
                size: file.content.len() as u64,
                indexed_at: chrono::Utc::now(),
                language: chunker::language_for_path(&file.path).to_string(),
                chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
            },
        );

        self.bus
            .emit(
                Topic::ChunkCreated,
                "indexer",
                serde_json::json!({ "store": store, "path": file.path, "chunks": chunk_count }),
            )
            .await;
        Ok(chunk_count)
    }

    /// Delete by explicit paths or by prefix: one predicate fanned out to
    /// every backend, then the document metadata goes. Mixed backend results
    /// surface as `Partial` and the caller may retry safely.
    pub async fn delete(&self, store: &str, request: &DeleteRequest) -> Result<DeleteResponse> {
        let state = self.stores.get(store)?;
        let predicate = match (&request.paths, &request.path_prefix) {
            (Some(paths), None) if !paths.is_empty() => DeletePredicate::Paths(paths.clone()),
            (None, Some(prefix)) if !prefix.is_empty() => {
                DeletePredicate::PathPrefix(prefix.clone())
            }
            _ => {
                return Err(Error::Validation(
                    "deletion needs exactly one of paths[] or path_prefix".into(),
                ))
            }
        };

        let (v, l) =
            tokio::join!(self.vector.delete(store, &predicate), self.lexical.delete(store, &predicate));
        let failed = [&v, &l].iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            if let Err(e) = &v {
                warn!(store, error = %e, "vector delete failed");
                self.metrics.backend_errors.with(&["vector"]).inc();
            }
            if let Err(e) = &l {
                warn!(store, error = %e, "lexical delete failed");
                self.metrics.backend_errors.with(&["lexical"]).inc();
            }
            if failed == 2 {
                return Err(Error::RetrievalFailed("every backend rejected the delete".into()));
            }
            return Err(Error::Partial {
                succeeded: 2 - failed,
                failed,
                detail: format!("delete in store '{store}' incomplete; retry is safe"),
            });
        }

        let deleted = match &predicate {
            DeletePredicate::Paths(paths) => {
                let mut n = 0;
                for p in paths {
                    if state.documents.remove(p).is_some() {
                        n += 1;
                    }
                }
                n
            }
            DeletePredicate::PathPrefix(prefix) => {
                let before = state.documents.len();
                state.documents.retain(|path, _| !path.starts_with(prefix.as_str()));
                before - state.documents.len()
            }
            DeletePredicate::Ids(_) => 0,
        };
        state.touch();
        Ok(DeleteResponse { deleted, partial: false })
    }

    /// Reconcile after out-of-band removals: any document whose path is not
    /// in `current_paths` is deleted.
    pub async fn sync(&self, store: &str, current_paths: &[String]) -> Result<DeleteResponse> {
        let state = self.stores.get(store)?;
        let keep: std::collections::HashSet<&str> =
            current_paths.iter().map(String::as_str).collect();
        let stale: Vec<String> = state
            .documents
            .iter()
            .map(|d| d.key().clone())
            .filter(|p| !keep.contains(p.as_str()))
            .collect();
        if stale.is_empty() {
            return Ok(DeleteResponse { deleted: 0, partial: false });
        }
        self.delete(store, &DeleteRequest { paths: Some(stale), path_prefix: None }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendFilter, MemoryLexicalBackend, MemoryVectorBackend};
    use crate::config::Config;
    use crate::registry::ModelRegistry;
    use crate::runtime::ModelRuntime;

    struct Fixture {
        _models: tempfile::TempDir,
        vector: Arc<MemoryVectorBackend>,
        lexical: Arc<MemoryLexicalBackend>,
        stores: Arc<StoreRegistry>,
        indexer: Indexer,
    }

    async fn fixture() -> Fixture {
        let models = tempfile::tempdir().unwrap();
        let config = Config { models_dir: models.path().to_path_buf(), ..Config::default() };
        let metrics = Arc::new(MetricSet::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        let registry = Arc::new(ModelRegistry::open(&config.models_dir).await.unwrap());
        let runtime = Arc::new(ModelRuntime::new(&config, registry, Arc::clone(&metrics)));
        let embedder = Arc::new(Embedder::new(
            Arc::clone(&runtime),
            Arc::clone(&bus),
            Arc::clone(&metrics),
            config.embed_batch_size,
        ));
        let sparse = Arc::new(SparseEncoder::new(Arc::clone(&runtime), Arc::clone(&bus)));
        let vector = Arc::new(MemoryVectorBackend::new());
        let lexical = Arc::new(MemoryLexicalBackend::new());
        let stores = Arc::new(StoreRegistry::new(
            vector.clone() as Arc<dyn VectorBackend>,
            lexical.clone() as Arc<dyn LexicalBackend>,
            Arc::clone(&bus),
            384,
        ));
        stores.create("s1", "", None).await.unwrap();
        let indexer = Indexer::new(
            Arc::clone(&stores),
            vector.clone(),
            lexical.clone(),
            embedder,
            sparse,
            bus,
            metrics,
            4,
            1024 * 1024,
        );
        Fixture { _models: models, vector, lexical, stores, indexer }
    }

    fn files() -> Vec<FileInput> {
        vec![
            FileInput {
                path: "src/auth.ts".into(),
                content: "export function authenticate(token) { return token.length > 0; }".into(),
            },
            FileInput {
                path: "src/util.ts".into(),
                content: "export function noop() {}".into(),
            },
        ]
    }

    #[tokio::test]
    async fn test_fresh_index() {
        let f = fixture().await;
        let resp = f.indexer.index("s1", files(), false).await.unwrap();
        assert_eq!(resp.indexed, 2);
        assert_eq!(resp.skipped, 0);
        assert_eq!(resp.failed, 0);
        assert!(resp.chunks_total >= 2);
        assert_eq!(f.vector.info("s1").await.unwrap().points, resp.chunks_total);
        assert_eq!(f.lexical.info("s1").await.unwrap().points, resp.chunks_total);
        let stats = f.stores.stats("s1").unwrap();
        assert_eq!(stats.document_count, 2);
    }

    #[tokio::test]
    async fn test_reindex_is_idempotent() {
        let f = fixture().await;
        f.indexer.index("s1", files(), false).await.unwrap();
        let before = f.vector.info("s1").await.unwrap().points;

        let resp = f.indexer.index("s1", files(), false).await.unwrap();
        assert_eq!(resp.indexed, 0);
        assert_eq!(resp.skipped, 2);
        assert_eq!(f.vector.info("s1").await.unwrap().points, before);
        assert_eq!(f.lexical.info("s1").await.unwrap().points, before);
    }

    #[tokio::test]
    async fn test_force_reindex_reaches_identical_state() {
        let f = fixture().await;
        f.indexer.index("s1", files(), false).await.unwrap();
        let hits_before =
            f.lexical.search("s1", "authenticate", 10, &BackendFilter::default()).await.unwrap();

        let resp = f.indexer.index("s1", files(), true).await.unwrap();
        assert_eq!(resp.indexed, 2);
        let hits_after =
            f.lexical.search("s1", "authenticate", 10, &BackendFilter::default()).await.unwrap();
        assert_eq!(
            hits_before.iter().map(|h| h.id.clone()).collect::<Vec<_>>(),
            hits_after.iter().map(|h| h.id.clone()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_content_change_replaces_chunks() {
        let f = fixture().await;
        f.indexer.index("s1", files(), false).await.unwrap();

        let changed = vec![FileInput {
            path: "src/auth.ts".into(),
            content: "export function authorize(token) { return true; }".into(),
        }];
        let resp = f.indexer.index("s1", changed, false).await.unwrap();
        assert_eq!(resp.indexed, 1);

        let old = f.lexical.search("s1", "authenticate", 10, &BackendFilter::default()).await.unwrap();
        assert!(old.is_empty(), "stale chunks must be gone");
        let new = f.lexical.search("s1", "authorize", 10, &BackendFilter::default()).await.unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].payload.path, "src/auth.ts");
    }

    #[tokio::test]
    async fn test_delete_and_double_delete() {
        let f = fixture().await;
        f.indexer.index("s1", files(), false).await.unwrap();

        let req = DeleteRequest { paths: Some(vec!["src/auth.ts".into()]), path_prefix: None };
        let resp = f.indexer.delete("s1", &req).await.unwrap();
        assert_eq!(resp.deleted, 1);
        assert!(f
            .lexical
            .search("s1", "authenticate", 10, &BackendFilter::default())
            .await
            .unwrap()
            .is_empty());

        // Second delete of the same path is a no-op, not an error
        let resp = f.indexer.delete("s1", &req).await.unwrap();
        assert_eq!(resp.deleted, 0);
    }

    #[tokio::test]
    async fn test_delete_validation() {
        let f = fixture().await;
        let err = f
            .indexer
            .delete("s1", &DeleteRequest { paths: None, path_prefix: None })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_by_prefix() {
        let f = fixture().await;
        f.indexer.index("s1", files(), false).await.unwrap();
        f.indexer
            .index(
                "s1",
                vec![FileInput { path: "docs/readme.md".into(), content: "# Hello docs".into() }],
                false,
            )
            .await
            .unwrap();

        let resp = f
            .indexer
            .delete("s1", &DeleteRequest { paths: None, path_prefix: Some("src/".into()) })
            .await
            .unwrap();
        assert_eq!(resp.deleted, 2);
        assert_eq!(f.stores.stats("s1").unwrap().document_count, 1);
    }

    #[tokio::test]
    async fn test_sync_removes_out_of_band_deletions() {
        let f = fixture().await;
        f.indexer.index("s1", files(), false).await.unwrap();

        let resp = f.indexer.sync("s1", &["src/auth.ts".to_string()]).await.unwrap();
        assert_eq!(resp.deleted, 1);
        let stats = f.stores.stats("s1").unwrap();
        assert_eq!(stats.document_count, 1);
        assert!(f
            .lexical
            .search("s1", "noop", 10, &BackendFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_oversize_and_binary_files_skipped() {
        let models = tempfile::tempdir().unwrap();
        let config = Config {
            models_dir: models.path().to_path_buf(),
            max_file_bytes: 64,
            ..Config::default()
        };
        let metrics = Arc::new(MetricSet::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        let registry = Arc::new(ModelRegistry::open(&config.models_dir).await.unwrap());
        let runtime = Arc::new(ModelRuntime::new(&config, registry, Arc::clone(&metrics)));
        let embedder =
            Arc::new(Embedder::new(Arc::clone(&runtime), Arc::clone(&bus), Arc::clone(&metrics), 16));
        let sparse = Arc::new(SparseEncoder::new(Arc::clone(&runtime), Arc::clone(&bus)));
        let vector = Arc::new(MemoryVectorBackend::new());
        let lexical = Arc::new(MemoryLexicalBackend::new());
        let stores = Arc::new(StoreRegistry::new(
            vector.clone() as Arc<dyn VectorBackend>,
            lexical.clone() as Arc<dyn LexicalBackend>,
            Arc::clone(&bus),
            384,
        ));
        stores.create("s1", "", None).await.unwrap();
        let indexer = Indexer::new(
            stores, vector, lexical, embedder, sparse, bus, metrics, 2, config.max_file_bytes,
        );

        let resp = indexer
            .index(
                "s1",
                vec![
                    FileInput { path: "big.txt".into(), content: "x".repeat(1000) },
                    FileInput { path: "bin.dat".into(), content: "ab\0cd".into() },
                    FileInput { path: "ok.txt".into(), content: "short enough".into() },
                ],
                false,
            )
            .await
            .unwrap();
        assert_eq!(resp.indexed, 1);
        assert_eq!(resp.skipped, 2);
    }

    #[tokio::test]
    async fn test_empty_after_trim_not_indexed() {
        let f = fixture().await;
        let resp = f
            .indexer
            .index(
                "s1",
                vec![FileInput { path: "blank.txt".into(), content: "\n\n   \n".into() }],
                false,
            )
            .await
            .unwrap();
        assert_eq!(resp.indexed, 1);
        assert_eq!(resp.chunks_total, 0);
        assert_eq!(f.vector.info("s1").await.unwrap().points, 0);
    }
}
