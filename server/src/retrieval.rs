//! Parallel retrieval fan-out: sparse (lexical), dense (vector), and
//! learned-sparse retrievers race under one request deadline.
//!
//! The fan-out completes when every configured retriever returns or the
//! deadline fires; late retrievers are cancelled and their partial state
//! discarded. At least one retriever must succeed or the query fails with
//! `RetrievalFailed`.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::analyzer::Strategy;
use crate::backends::{BackendFilter, LexicalBackend, SearchHit, VectorBackend};
use crate::bus::{EventBus, Topic};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::metrics::MetricSet;
use crate::sparse::SparseEncoder;
use crate::types::StoreConfig;

pub const STAGE_SPARSE: &str = "sparse";
pub const STAGE_DENSE: &str = "dense";
pub const STAGE_LEARNED: &str = "sparse-learned";

const QUERY_CACHE_SIZE: usize = 256;

/// One retriever's results with its timing.
#[derive(Debug, Clone)]
pub struct RetrievedStage {
    pub stage: &'static str,
    pub hits: Vec<SearchHit>,
    pub latency_ms: u64,
}

pub struct RetrieverSet {
    vector: Arc<dyn VectorBackend>,
    lexical: Arc<dyn LexicalBackend>,
    embedder: Arc<Embedder>,
    sparse_encoder: Arc<SparseEncoder>,
    bus: Arc<EventBus>,
    metrics: Arc<MetricSet>,
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    sparse_topk: usize,
    dense_topk: usize,
}

impl RetrieverSet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vector: Arc<dyn VectorBackend>,
        lexical: Arc<dyn LexicalBackend>,
        embedder: Arc<Embedder>,
        sparse_encoder: Arc<SparseEncoder>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricSet>,
        sparse_topk: usize,
        dense_topk: usize,
    ) -> Self {
        RetrieverSet {
            vector,
            lexical,
            embedder,
            sparse_encoder,
            bus,
            metrics,
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(QUERY_CACHE_SIZE).expect("nonzero cache size"),
            )),
            sparse_topk,
            dense_topk,
        }
    }

    /// Embed the query, consulting the LRU cache first.
    async fn query_vector(&self, query: &str) -> Result<Vec<f32>> {
        if let Some(v) = self.query_cache.lock().unwrap().get(query) {
            return Ok(v.clone());
        }
        let mut vectors = self.embedder.encode(&[query.to_string()]).await?;
        let v = vectors
            .pop()
            .ok_or_else(|| Error::EmbedFailed("no query embedding produced".into()))?;
        self.query_cache.lock().unwrap().put(query.to_string(), v.clone());
        Ok(v)
    }

    async fn timed<F>(&self, stage: &'static str, deadline: Instant, work: F) -> Result<RetrievedStage>
    where
        F: std::future::Future<Output = Result<Vec<SearchHit>>>,
    {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::DeadlineExceeded);
        }
        let started = Instant::now();
        let hits = match tokio::time::timeout(remaining, work).await {
            Ok(Ok(hits)) => hits,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::DeadlineExceeded),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        self.metrics.search_stage_latency.with(&[stage]).observe(latency_ms as f64);
        self.bus
            .emit(
                Topic::SearchStage,
                "retrieval",
                serde_json::json!({ "stage": stage, "latency_ms": latency_ms, "hits": hits.len() }),
            )
            .await;
        Ok(RetrievedStage { stage, hits, latency_ms })
    }

    /// Run every retriever the strategy and store configuration enable.
    pub async fn fan_out(
        &self,
        store: &str,
        config: &StoreConfig,
        query: &str,
        strategy: Strategy,
        filter: &BackendFilter,
        deadline: Instant,
    ) -> Result<Vec<RetrievedStage>> {
        let run_sparse = config.enable_sparse;
        let run_dense = config.enable_dense && strategy != Strategy::SparseOnly;
        let run_learned = config.enable_learned_sparse && strategy != Strategy::SparseOnly;

        let sparse_fut = async {
            if !run_sparse {
                return None;
            }
            Some(
                self.timed(STAGE_SPARSE, deadline, async {
                    self.lexical.search(store, query, self.sparse_topk, filter).await
                })
                .await,
            )
        };

        let dense_fut = async {
            if !run_dense {
                return None;
            }
            Some(
                self.timed(STAGE_DENSE, deadline, async {
                    let vector = self.query_vector(query).await?;
                    self.vector.search_dense(store, &vector, self.dense_topk, filter).await
                })
                .await,
            )
        };

        let learned_fut = async {
            if !run_learned {
                return None;
            }
            Some(
                self.timed(STAGE_LEARNED, deadline, async {
                    let mut vectors = self.sparse_encoder.encode(&[query.to_string()]).await?;
                    let sparse = vectors
                        .pop()
                        .ok_or_else(|| Error::EmbedFailed("no sparse query vector".into()))?;
                    self.vector.search_sparse(store, &sparse, self.dense_topk, filter).await
                })
                .await,
            )
        };

        let (sparse, dense, learned) = tokio::join!(sparse_fut, dense_fut, learned_fut);

        let mut stages = Vec::new();
        let mut errors = Vec::new();
        let mut attempted = 0;
        for outcome in [sparse, dense, learned].into_iter().flatten() {
            attempted += 1;
            match outcome {
                Ok(stage) => stages.push(stage),
                Err(e) => errors.push(e.to_string()),
            }
        }

        if attempted == 0 {
            return Err(Error::Validation(format!(
                "store '{store}' has no retriever enabled for this strategy"
            )));
        }
        if stages.is_empty() {
            return Err(Error::RetrievalFailed(errors.join("; ")));
        }
        Ok(stages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{
        ChunkPayload, LexicalDoc, MemoryLexicalBackend, MemoryVectorBackend, VectorPoint,
    };
    use crate::config::Config;
    use crate::registry::ModelRegistry;
    use crate::runtime::ModelRuntime;
    use crate::types::SparseVector;
    use std::time::Duration;

    fn payload(path: &str, text: &str) -> ChunkPayload {
        ChunkPayload {
            path: path.to_string(),
            language: "rust".to_string(),
            start_line: 1,
            end_line: 1,
            text: text.to_string(),
            symbols: vec![],
            full_path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or(path).to_string(),
            content_hash: "h".to_string(),
        }
    }

    async fn retrievers() -> (tempfile::TempDir, Arc<MemoryVectorBackend>, Arc<MemoryLexicalBackend>, RetrieverSet)
    {
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
            16,
        ));
        let sparse_encoder = Arc::new(SparseEncoder::new(Arc::clone(&runtime), Arc::clone(&bus)));
        let vector = Arc::new(MemoryVectorBackend::new());
        let lexical = Arc::new(MemoryLexicalBackend::new());
        let set = RetrieverSet::new(
            vector.clone(),
            lexical.clone(),
            embedder,
            sparse_encoder,
            bus,
            metrics,
            200,
            80,
        );
        (models, vector, lexical, set)
    }

    async fn seed(vector: &MemoryVectorBackend, lexical: &MemoryLexicalBackend) {
        vector.create_collection("s1", 384).await.unwrap();
        lexical.create_index("s1").await.unwrap();
        let unit = {
            let mut v = vec![1.0f32; 384];
            let norm = (384f32).sqrt();
            v.iter_mut().for_each(|x| *x /= norm);
            v
        };
        vector
            .upsert(
                "s1",
                vec![VectorPoint {
                    id: "a".into(),
                    dense: unit,
                    sparse: SparseVector { indices: vec![17], values: vec![1.0] },
                    payload: payload("src/a.rs", "fn alpha() {}"),
                }],
            )
            .await
            .unwrap();
        lexical
            .upsert(
                "s1",
                vec![LexicalDoc { id: "a".into(), payload: payload("src/a.rs", "fn alpha() {}") }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_balanced_fan_out_runs_all_stages() {
        let (_m, vector, lexical, set) = retrievers().await;
        seed(&vector, &lexical).await;
        let stages = set
            .fan_out(
                "s1",
                &StoreConfig::default(),
                "alpha",
                Strategy::Balanced,
                &BackendFilter::default(),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        let names: Vec<&str> = stages.iter().map(|s| s.stage).collect();
        assert!(names.contains(&STAGE_SPARSE));
        assert!(names.contains(&STAGE_DENSE));
        assert!(names.contains(&STAGE_LEARNED));
    }

    #[tokio::test]
    async fn test_sparse_only_skips_dense() {
        let (_m, vector, lexical, set) = retrievers().await;
        seed(&vector, &lexical).await;
        let stages = set
            .fan_out(
                "s1",
                &StoreConfig::default(),
                "alpha",
                Strategy::SparseOnly,
                &BackendFilter::default(),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, STAGE_SPARSE);
    }

    #[tokio::test]
    async fn test_partial_backend_failure_tolerated() {
        // Vector collection missing: dense + learned fail, sparse survives.
        let (_m, _vector, lexical, set) = retrievers().await;
        lexical.create_index("s1").await.unwrap();
        lexical
            .upsert(
                "s1",
                vec![LexicalDoc { id: "a".into(), payload: payload("src/a.rs", "fn alpha() {}") }],
            )
            .await
            .unwrap();

        let stages = set
            .fan_out(
                "s1",
                &StoreConfig::default(),
                "alpha",
                Strategy::Balanced,
                &BackendFilter::default(),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].stage, STAGE_SPARSE);
    }

    #[tokio::test]
    async fn test_all_failed_is_retrieval_failed() {
        let (_m, _vector, _lexical, set) = retrievers().await;
        // No collections exist at all.
        let err = set
            .fan_out(
                "missing",
                &StoreConfig::default(),
                "alpha",
                Strategy::Balanced,
                &BackendFilter::default(),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetrievalFailed(_)));
    }

    #[tokio::test]
    async fn test_expired_deadline_fails_fast() {
        let (_m, vector, lexical, set) = retrievers().await;
        seed(&vector, &lexical).await;
        let err = set
            .fan_out(
                "s1",
                &StoreConfig::default(),
                "alpha",
                Strategy::Balanced,
                &BackendFilter::default(),
                Instant::now() - Duration::from_millis(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetrievalFailed(_)));
    }
}
