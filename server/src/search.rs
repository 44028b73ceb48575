//! Search orchestrator: analyzer → retrieval fan-out → fusion → two-stage
//! rerank → post-rank → response assembly.
//!
//! Degradation ladder per subsystem: a failed reranker falls back to fusion
//! order with `1 - i/n` scores, a failed dense retriever leaves sparse
//! results standing, and only all retrievers failing fails the query.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::analyzer::{QueryAnalyzer, QueryPlan, Strategy};
use crate::backends::BackendFilter;
use crate::bus::{EventBus, Topic};
use crate::embed::Embedder;
use crate::error::{Error, Result};
use crate::fusion::{self, Candidate, RRF_K};
use crate::metrics::MetricSet;
use crate::postrank;
use crate::rerank::CrossEncoder;
use crate::retrieval::RetrieverSet;
use crate::stores::StoreRegistry;
use crate::types::{
    AggregationInfo, Intelligence, PostrankMeta, RerankingMeta, SearchRequest, SearchResponse,
    SearchResult,
};

/// Raw-logit gap between the top two pass-1 scores that makes pass-2
/// unnecessary.
const EARLY_EXIT_GAP: f32 = 2.0;
/// Candidates forwarded from pass-1 to pass-2.
const PASS2_CANDIDATES: usize = 10;

pub struct Searcher {
    stores: Arc<StoreRegistry>,
    retrievers: Arc<RetrieverSet>,
    reranker: Arc<CrossEncoder>,
    embedder: Arc<Embedder>,
    analyzer: QueryAnalyzer,
    bus: Arc<EventBus>,
    metrics: Arc<MetricSet>,
    search_timeout: Duration,
    rerank_timeout: Duration,
}

impl Searcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stores: Arc<StoreRegistry>,
        retrievers: Arc<RetrieverSet>,
        reranker: Arc<CrossEncoder>,
        embedder: Arc<Embedder>,
        analyzer: QueryAnalyzer,
        bus: Arc<EventBus>,
        metrics: Arc<MetricSet>,
        search_timeout: Duration,
        rerank_timeout: Duration,
    ) -> Self {
        Searcher {
            stores,
            retrievers,
            reranker,
            embedder,
            analyzer,
            bus,
            metrics,
            search_timeout,
            rerank_timeout,
        }
    }

    pub async fn search(&self, store: &str, req: SearchRequest) -> Result<SearchResponse> {
        let result = self.search_inner(store, req).await;
        if let Err(e) = &result {
            self.metrics.search_errors.with(&[e.kind()]).inc();
        }
        result
    }

    async fn search_inner(&self, store: &str, req: SearchRequest) -> Result<SearchResponse> {
        if req.query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".into()));
        }
        for w in [req.sparse_weight, req.dense_weight].into_iter().flatten() {
            if !(0.0..=1.0).contains(&w) {
                return Err(Error::Validation("weights must be within [0, 1]".into()));
            }
        }
        let state = self.stores.get(store)?;
        let config = state.config();

        let started = Instant::now();
        let deadline = started + self.search_timeout;
        self.bus
            .emit(
                Topic::SearchRequest,
                "searcher",
                serde_json::json!({ "store": store, "query": req.query, "top_k": req.top_k }),
            )
            .await;

        let plan = self.analyzer.analyze(&req.query, req.enable_expansion).await;
        let (sparse_w, dense_w, strategy) = resolve_weights(&req, &plan);
        let intelligence = Intelligence {
            intent: plan.intent.as_str().to_string(),
            difficulty: plan.difficulty.as_str().to_string(),
            strategy: strategy.as_str().to_string(),
            confidence: plan.confidence,
        };
        debug!(
            store,
            intent = intelligence.intent.as_str(),
            strategy = intelligence.strategy.as_str(),
            "query analyzed"
        );

        // top_k = 0 is a valid request for metadata only.
        if req.top_k == 0 {
            let resp = self.assemble(
                store,
                &req,
                Vec::new(),
                intelligence,
                RerankingMeta::default(),
                PostrankMeta::default(),
                HashMapInfo::new(),
                started,
            );
            return Ok(resp);
        }

        let filter = BackendFilter {
            path_prefix: req.filters.path_prefix.clone(),
            languages: req.filters.languages.clone().unwrap_or_default(),
        };
        let stages = self
            .retrievers
            .fan_out(store, &config, &plan.expanded_query, strategy, &filter, deadline)
            .await?;

        let mut candidates = fusion::fuse(&stages, sparse_w, dense_w, RRF_K);
        fusion::apply_boosts(&mut candidates, &req.query);

        let rerank_meta = self
            .rerank_stages(&req, &plan, strategy, &mut candidates, deadline)
            .await;
        fusion::finalize(&mut candidates);

        let (postrank_meta, aggregation) = self.postrank_stages(&req, &mut candidates).await;
        candidates.truncate(req.top_k);

        let resp = self.assemble(
            store,
            &req,
            candidates,
            intelligence,
            rerank_meta,
            postrank_meta,
            aggregation,
            started,
        );

        self.metrics.search_requests.inc();
        self.metrics.search_latency.observe(resp.search_time_ms as f64);
        self.bus
            .emit(
                Topic::SearchResponse,
                "searcher",
                serde_json::json!({
                    "store": store,
                    "total": resp.total,
                    "latency_ms": resp.search_time_ms,
                }),
            )
            .await;
        Ok(resp)
    }

    /// Pass-1 (and for deep-rerank, pass-2) of the cross-encoder, with the
    /// fallback ladder when the reranker is disabled, times out, or fails.
    async fn rerank_stages(
        &self,
        req: &SearchRequest,
        plan: &QueryPlan,
        strategy: Strategy,
        candidates: &mut Vec<Candidate>,
        deadline: Instant,
    ) -> RerankingMeta {
        let mut meta = RerankingMeta::default();
        if candidates.is_empty() {
            return meta;
        }
        let n = req.rerank_candidates.min(candidates.len()).max(1);
        meta.candidates = n;

        if !req.enable_reranking || !plan.enable_rerank {
            return meta;
        }

        let budget = self
            .rerank_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let docs: Vec<String> = candidates[..n].iter().map(|c| c.payload.text.clone()).collect();

        let pass1_started = Instant::now();
        let scores = match tokio::time::timeout(budget, self.reranker.score(&req.query, &docs)).await
        {
            Ok(Ok(scores)) => scores,
            Ok(Err(e)) => {
                warn!(error = %e, "rerank pass 1 failed, keeping fusion order");
                apply_fallback(candidates, n);
                return meta;
            }
            Err(_) => {
                warn!("rerank pass 1 exceeded its deadline, keeping fusion order");
                apply_fallback(candidates, n);
                meta.early_exit = true;
                meta.early_exit_reason = Some("timeout".to_string());
                return meta;
            }
        };
        meta.enabled = true;
        meta.pass1_applied = true;
        meta.pass1_latency_ms = pass1_started.elapsed().as_millis() as u64;
        for (c, s) in candidates[..n].iter_mut().zip(scores.iter()) {
            c.rerank1 = Some(*s);
        }

        // Early exit when pass-1 is already certain about the winner.
        let mut sorted = scores.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        if sorted.len() >= 2 && sorted[0] - sorted[1] > EARLY_EXIT_GAP {
            meta.early_exit = true;
            meta.early_exit_reason = Some("high_confidence".to_string());
            return meta;
        }

        if !strategy.deep() {
            return meta;
        }

        // Pass-2 rescoring of the pass-1 head. A dedicated second model can
        // take over via type_configs; until then the session is shared.
        let mut by_pass1: Vec<usize> = (0..n).collect();
        by_pass1.sort_by(|&a, &b| {
            candidates[b]
                .rerank1
                .partial_cmp(&candidates[a].rerank1)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let head: Vec<usize> = by_pass1.into_iter().take(PASS2_CANDIDATES).collect();
        let docs2: Vec<String> = head.iter().map(|&i| candidates[i].payload.text.clone()).collect();

        let budget2 = self
            .rerank_timeout
            .min(deadline.saturating_duration_since(Instant::now()));
        let pass2_started = Instant::now();
        match tokio::time::timeout(budget2, self.reranker.score(&req.query, &docs2)).await {
            Ok(Ok(scores2)) => {
                meta.pass2_applied = true;
                meta.pass2_latency_ms = pass2_started.elapsed().as_millis() as u64;
                for (&i, s) in head.iter().zip(scores2.iter()) {
                    candidates[i].rerank2 = Some(*s);
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "rerank pass 2 failed, keeping pass 1 order");
            }
            Err(_) => {
                warn!("rerank pass 2 exceeded its deadline, keeping pass 1 order");
            }
        }
        meta
    }

    /// Dedup → MMR → group-by-file, each gated by its request flag.
    async fn postrank_stages(
        &self,
        req: &SearchRequest,
        candidates: &mut Vec<Candidate>,
    ) -> (PostrankMeta, HashMapInfo) {
        let started = Instant::now();
        let mut meta = PostrankMeta::default();
        let mut aggregation = HashMapInfo::new();

        if (req.enable_dedup || req.enable_diversity) && !candidates.is_empty() {
            self.hydrate_vectors(candidates).await;
        }

        if req.enable_dedup {
            meta.dedup = postrank::dedup(candidates, req.dedup_threshold);
        } else {
            meta.dedup.input_count = candidates.len();
            meta.dedup.output_count = candidates.len();
        }

        if req.enable_diversity {
            meta.diversity = postrank::mmr(candidates, req.diversity_lambda, req.top_k);
        }

        if req.group_by_file {
            let (agg_meta, info) = postrank::group_by_file(candidates, req.max_chunks_per_file);
            meta.aggregation = agg_meta;
            aggregation = info;
        }

        meta.total_latency_ms = started.elapsed().as_millis() as u64;
        (meta, aggregation)
    }

    /// Fill missing dense vectors (lexical-only hits) for the similarity
    /// stages. Failure here degrades silently — dedup and MMR simply see
    /// fewer vectors.
    async fn hydrate_vectors(&self, candidates: &mut [Candidate]) {
        let window = candidates.len().min(postrank::DEDUP_WINDOW);
        let missing: Vec<usize> =
            (0..window).filter(|&i| candidates[i].dense.is_none()).collect();
        if missing.is_empty() {
            return;
        }
        let texts: Vec<String> =
            missing.iter().map(|&i| candidates[i].payload.text.clone()).collect();
        match self.embedder.encode(&texts).await {
            Ok(vectors) => {
                for (&i, v) in missing.iter().zip(vectors.into_iter()) {
                    candidates[i].dense = Some(v);
                }
            }
            Err(e) => debug!(error = %e, "vector hydration skipped"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        store: &str,
        req: &SearchRequest,
        candidates: Vec<Candidate>,
        intelligence: Intelligence,
        reranking: RerankingMeta,
        postrank: PostrankMeta,
        aggregation: HashMapInfo,
        started: Instant,
    ) -> SearchResponse {
        let results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|c| {
                let ranks: BTreeMap<String, usize> =
                    c.stage_ranks.iter().map(|(k, v)| (k.clone(), *v)).collect();
                SearchResult {
                    doc_id: c.id.clone(),
                    path: c.payload.path.clone(),
                    language: c.payload.language.clone(),
                    start_line: c.payload.start_line,
                    end_line: c.payload.end_line,
                    content: req.include_content.then(|| c.payload.text.clone()),
                    symbols: c.payload.symbols.clone(),
                    final_score: c.final_score,
                    sparse_score: c.sparse_score(),
                    dense_score: c.dense_score(),
                    rerank_score: c.rerank2.or(c.rerank1),
                    ranks,
                    aggregation: aggregation.get(&c.id).cloned(),
                }
            })
            .collect();

        SearchResponse {
            query: req.query.clone(),
            store: store.to_string(),
            total: results.len(),
            search_time_ms: started.elapsed().as_millis() as u64,
            results,
            intelligence,
            reranking,
            postrank,
        }
    }
}

type HashMapInfo = std::collections::HashMap<String, AggregationInfo>;

/// Explicit request weights beat the analyzer; a sparse-only plan widens to
/// balanced when the caller insists on dense weight.
fn resolve_weights(req: &SearchRequest, plan: &QueryPlan) -> (f32, f32, Strategy) {
    let sparse_w = req.sparse_weight.unwrap_or(plan.sparse_weight);
    let dense_w = req.dense_weight.unwrap_or(plan.dense_weight);
    let mut strategy = plan.strategy;
    if strategy == Strategy::SparseOnly && dense_w > 0.0 && req.dense_weight.is_some() {
        strategy = Strategy::Balanced;
    }
    (sparse_w, dense_w, strategy)
}

fn apply_fallback(candidates: &mut [Candidate], n: usize) {
    let scores = fusion::fallback_scores(n);
    for (c, s) in candidates[..n].iter_mut().zip(scores.into_iter()) {
        c.rerank1 = Some(s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::heuristic_classify;

    #[test]
    fn test_resolve_weights_explicit_override() {
        let mut req = SearchRequest::new("getUserName");
        let plan = heuristic_classify("getUserName", true);
        assert_eq!(plan.strategy, Strategy::SparseOnly);

        // No override: analyzer wins
        let (sw, dw, strategy) = resolve_weights(&req, &plan);
        assert_eq!((sw, dw), (1.0, 0.0));
        assert_eq!(strategy, Strategy::SparseOnly);

        // Caller insists on dense: strategy widens
        req.dense_weight = Some(0.7);
        req.sparse_weight = Some(0.3);
        let (sw, dw, strategy) = resolve_weights(&req, &plan);
        assert_eq!((sw, dw), (0.3, 0.7));
        assert_eq!(strategy, Strategy::Balanced);
    }

    #[test]
    fn test_fallback_scores_fill_head_only() {
        use crate::backends::ChunkPayload;
        use std::collections::BTreeMap;
        let mk = |id: &str| Candidate {
            id: id.to_string(),
            payload: ChunkPayload {
                path: "p".into(),
                language: "text".into(),
                start_line: 1,
                end_line: 1,
                text: "t".into(),
                symbols: vec![],
                full_path: "p".into(),
                filename: "p".into(),
                content_hash: "h".into(),
            },
            dense: None,
            snippet: None,
            stage_scores: BTreeMap::new(),
            stage_ranks: BTreeMap::new(),
            fused: 0.0,
            rerank1: None,
            rerank2: None,
            final_score: 0.0,
        };
        let mut cands = vec![mk("a"), mk("b"), mk("c")];
        apply_fallback(&mut cands, 2);
        assert_eq!(cands[0].rerank1, Some(1.0));
        assert_eq!(cands[1].rerank1, Some(0.5));
        assert_eq!(cands[2].rerank1, None);
    }
}
