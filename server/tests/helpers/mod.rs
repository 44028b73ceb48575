//! Test harness for the end-to-end search pipeline.
//!
//! Wires the full stack — store registry, indexer, searcher, bus, metrics,
//! history — over in-memory backends and the deterministic mock ML runtime.
//! No network service, no model files, no wall-clock dependence.

use std::sync::Arc;

use tempfile::TempDir;

use rice_server::analyzer::QueryAnalyzer;
use rice_server::backends::{
    BackendFilter, LexicalBackend, MemoryLexicalBackend, MemoryVectorBackend, SearchHit,
    VectorBackend,
};
use rice_server::bus::EventBus;
use rice_server::config::{Config, DeviceKind};
use rice_server::embed::Embedder;
use rice_server::error::Result;
use rice_server::history::{wire_history, HistorySet};
use rice_server::indexer::Indexer;
use rice_server::metrics::MetricSet;
use rice_server::registry::ModelRegistry;
use rice_server::rerank::CrossEncoder;
use rice_server::retrieval::RetrieverSet;
use rice_server::runtime::ModelRuntime;
use rice_server::search::Searcher;
use rice_server::sparse::SparseEncoder;
use rice_server::stores::StoreRegistry;
use rice_server::types::{
    FileInput, IndexResponse, SearchRequest, SearchResponse, StoreConfig,
};

pub struct TestHarness {
    pub config: Config,
    pub metrics: Arc<MetricSet>,
    pub bus: Arc<EventBus>,
    pub history: Arc<HistorySet>,
    pub vector: Arc<MemoryVectorBackend>,
    pub lexical: Arc<MemoryLexicalBackend>,
    pub stores: Arc<StoreRegistry>,
    pub indexer: Arc<Indexer>,
    pub searcher: Arc<Searcher>,
    pub registry: Arc<ModelRegistry>,
    _models_dir: TempDir,
}

impl TestHarness {
    /// Full stack on the mock runtime.
    pub async fn new() -> Self {
        Self::build(Config::default()).await
    }

    async fn build(mut config: Config) -> Self {
        let models_dir = TempDir::new().expect("temp models dir");
        config.models_dir = models_dir.path().to_path_buf();

        let metrics = Arc::new(MetricSet::new());
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        let history =
            Arc::new(HistorySet::new(config.history_bucket, config.history_retention));
        wire_history(&bus, &history).await;

        let registry =
            Arc::new(ModelRegistry::open(&config.models_dir).await.expect("open registry"));
        let runtime =
            Arc::new(ModelRuntime::new(&config, Arc::clone(&registry), Arc::clone(&metrics)));
        let embedder = Arc::new(Embedder::new(
            Arc::clone(&runtime),
            Arc::clone(&bus),
            Arc::clone(&metrics),
            config.embed_batch_size,
        ));
        let sparse_encoder = Arc::new(SparseEncoder::new(Arc::clone(&runtime), Arc::clone(&bus)));
        let reranker = Arc::new(CrossEncoder::new(Arc::clone(&runtime), Arc::clone(&bus)));

        let vector = Arc::new(MemoryVectorBackend::new());
        let lexical = Arc::new(MemoryLexicalBackend::new());
        let stores = Arc::new(StoreRegistry::new(
            vector.clone() as Arc<dyn VectorBackend>,
            lexical.clone() as Arc<dyn LexicalBackend>,
            Arc::clone(&bus),
            config.embedding_dim,
        ));
        let indexer = Arc::new(Indexer::new(
            Arc::clone(&stores),
            vector.clone(),
            lexical.clone(),
            Arc::clone(&embedder),
            Arc::clone(&sparse_encoder),
            Arc::clone(&bus),
            Arc::clone(&metrics),
            config.index_workers,
            config.max_file_bytes,
        ));
        let retrievers = Arc::new(RetrieverSet::new(
            vector.clone(),
            lexical.clone(),
            Arc::clone(&embedder),
            Arc::clone(&sparse_encoder),
            Arc::clone(&bus),
            Arc::clone(&metrics),
            config.sparse_topk,
            config.dense_topk,
        ));
        let searcher = Arc::new(Searcher::new(
            Arc::clone(&stores),
            retrievers,
            reranker,
            Arc::clone(&embedder),
            QueryAnalyzer::heuristic(),
            Arc::clone(&bus),
            Arc::clone(&metrics),
            config.search_timeout,
            config.rerank_timeout,
        ));

        TestHarness {
            config,
            metrics,
            bus,
            history,
            vector,
            lexical,
            stores,
            indexer,
            searcher,
            registry,
            _models_dir: models_dir,
        }
    }

    /// A second searcher over the same corpus whose ML runtime sits on the
    /// stub device: embedding, learned-sparse, and rerank all return
    /// `MlUnavailable` while lexical retrieval keeps working.
    pub async fn stub_searcher(&self) -> Arc<Searcher> {
        let config = Config {
            mock_ml: false,
            ml_device: DeviceKind::Stub,
            models_dir: self.config.models_dir.clone(),
            ..Config::default()
        };
        let runtime = Arc::new(ModelRuntime::new(
            &config,
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
        ));
        let embedder = Arc::new(Embedder::new(
            Arc::clone(&runtime),
            Arc::clone(&self.bus),
            Arc::clone(&self.metrics),
            config.embed_batch_size,
        ));
        let sparse_encoder =
            Arc::new(SparseEncoder::new(Arc::clone(&runtime), Arc::clone(&self.bus)));
        let reranker = Arc::new(CrossEncoder::new(Arc::clone(&runtime), Arc::clone(&self.bus)));
        let retrievers = Arc::new(RetrieverSet::new(
            self.vector.clone(),
            self.lexical.clone(),
            Arc::clone(&embedder),
            Arc::clone(&sparse_encoder),
            Arc::clone(&self.bus),
            Arc::clone(&self.metrics),
            config.sparse_topk,
            config.dense_topk,
        ));
        Arc::new(Searcher::new(
            Arc::clone(&self.stores),
            retrievers,
            reranker,
            embedder,
            QueryAnalyzer::heuristic(),
            Arc::clone(&self.bus),
            Arc::clone(&self.metrics),
            config.search_timeout,
            config.rerank_timeout,
        ))
    }

    pub async fn create_store(&self, name: &str) {
        self.stores.create(name, "", None).await.expect("create store");
    }

    pub async fn create_sparse_only_store(&self, name: &str) {
        let config = StoreConfig {
            enable_dense: false,
            enable_learned_sparse: false,
            ..StoreConfig::default()
        };
        self.stores.create(name, "", Some(config)).await.expect("create store");
    }

    pub async fn index(
        &self,
        store: &str,
        files: &[(&str, &str)],
        force: bool,
    ) -> IndexResponse {
        let inputs: Vec<FileInput> = files
            .iter()
            .map(|(path, content)| FileInput {
                path: path.to_string(),
                content: content.to_string(),
            })
            .collect();
        self.indexer.index(store, inputs, force).await.expect("index")
    }

    pub async fn search(&self, store: &str, query: &str) -> SearchResponse {
        self.searcher.search(store, SearchRequest::new(query)).await.expect("search")
    }

    pub async fn try_search(&self, store: &str, req: SearchRequest) -> Result<SearchResponse> {
        self.searcher.search(store, req).await
    }

    /// All lexical hits for a query, bypassing the pipeline.
    pub async fn lexical_hits(&self, store: &str, query: &str) -> Vec<SearchHit> {
        self.lexical.search(store, query, 100, &BackendFilter::default()).await.expect("lexical")
    }

    pub async fn chunk_count(&self, store: &str) -> usize {
        self.vector.info(store).await.expect("info").points
    }
}

/// The two-file corpus from the end-to-end scenarios.
pub fn scenario_files() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "src/auth.ts",
            "export function authenticate(token) {\n  return token.length > 0;\n}\n",
        ),
        ("src/util.ts", "export function noop() {}\n"),
    ]
}
