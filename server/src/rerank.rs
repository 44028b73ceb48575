//! Cross-encoder reranking pipeline.
//!
//! Each `(query, doc)` pair is encoded as `[CLS] query [SEP] doc [SEP]` with
//! document-first truncation and scored in one batched forward pass. Scores
//! are raw logits; ordering downstream is by score descending and any
//! normalization belongs to the presentation layer.

use std::sync::Arc;
use std::time::Instant;

use crate::bus::{EventBus, Topic};
use crate::error::{Error, Result};
use crate::runtime::{ActiveSession, ModelRuntime, SessionKind, Tensor};
use crate::tokenizer::PAD_ID;

pub struct CrossEncoder {
    runtime: Arc<ModelRuntime>,
    bus: Arc<EventBus>,
}

impl CrossEncoder {
    pub fn new(runtime: Arc<ModelRuntime>, bus: Arc<EventBus>) -> Self {
        CrossEncoder { runtime, bus }
    }

    /// Score every doc against the query. Returns one raw logit per doc, in
    /// input order.
    pub async fn score(&self, query: &str, docs: &[String]) -> Result<Vec<f32>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        self.bus
            .emit(Topic::RerankRequest, "reranker", serde_json::json!({ "docs": docs.len() }))
            .await;

        let mut scores = Vec::with_capacity(docs.len());
        let batch_size = {
            let active = self.runtime.acquire(SessionKind::Reranker).await?;
            active.entry().batch_size.max(1)
        };
        for batch in docs.chunks(batch_size) {
            let active = self.runtime.acquire(SessionKind::Reranker).await?;
            let query = query.to_string();
            let owned: Vec<String> = batch.to_vec();
            let batch_scores =
                tokio::task::spawn_blocking(move || score_batch(&active, &query, &owned))
                    .await
                    .map_err(|e| Error::Internal(format!("rerank task failed: {e}")))?
                    .map_err(|e| match e {
                        Error::MlUnavailable(_) => e,
                        other => Error::RerankFailed(other.to_string()),
                    })?;
            scores.extend(batch_scores);
        }

        self.bus
            .emit(
                Topic::RerankResponse,
                "reranker",
                serde_json::json!({
                    "docs": docs.len(),
                    "latency_ms": started.elapsed().as_millis() as u64,
                }),
            )
            .await;
        Ok(scores)
    }
}

fn score_batch(active: &ActiveSession, query: &str, docs: &[String]) -> Result<Vec<f32>> {
    let entry = active.entry();
    let encodings: Vec<_> = docs
        .iter()
        .map(|d| entry.encoder.encode_pair(query, d))
        .collect::<Result<_>>()?;

    let batch = encodings.len();
    let seq = encodings.iter().map(|e| e.ids.len()).max().unwrap_or(1);

    let mut input_ids = Vec::with_capacity(batch * seq);
    let mut attention_mask = Vec::with_capacity(batch * seq);
    for enc in &encodings {
        input_ids.extend_from_slice(&enc.ids);
        attention_mask.extend_from_slice(&enc.attention_mask);
        input_ids.extend(std::iter::repeat(PAD_ID).take(seq - enc.ids.len()));
        attention_mask.extend(std::iter::repeat(0).take(seq - enc.ids.len()));
    }

    let outputs = active.run(vec![
        ("input_ids".to_string(), Tensor::I64 { shape: vec![batch, seq], data: input_ids }),
        (
            "attention_mask".to_string(),
            Tensor::I64 { shape: vec![batch, seq], data: attention_mask },
        ),
    ])?;

    let logits = outputs
        .iter()
        .find(|(n, _)| n == "logits")
        .map(|(_, t)| t)
        .or_else(|| outputs.first().map(|(_, t)| t))
        .ok_or_else(|| Error::RerankFailed("session produced no outputs".into()))?;
    let data = logits.f32_data()?;
    if data.len() % batch != 0 || data.is_empty() {
        return Err(Error::RerankFailed("logit shape mismatch".into()));
    }
    // [batch] or [batch, 1]: one logit per pair either way.
    let stride = data.len() / batch;
    Ok((0..batch).map(|b| data[b * stride]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::MetricSet;
    use crate::registry::ModelRegistry;

    async fn reranker() -> (tempfile::TempDir, CrossEncoder) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { models_dir: dir.path().to_path_buf(), ..Config::default() };
        let metrics = Arc::new(MetricSet::new());
        let registry = Arc::new(ModelRegistry::open(&config.models_dir).await.unwrap());
        let runtime = Arc::new(ModelRuntime::new(&config, registry, Arc::clone(&metrics)));
        let bus = Arc::new(EventBus::new(metrics));
        (dir, CrossEncoder::new(runtime, bus))
    }

    #[tokio::test]
    async fn test_one_score_per_doc_in_order() {
        let (_d, r) = reranker().await;
        let docs: Vec<String> = (0..5).map(|i| format!("document {i}")).collect();
        let scores = r.score("the query", &docs).await.unwrap();
        assert_eq!(scores.len(), 5);
        assert!(scores.iter().all(|s| s.is_finite()));
    }

    #[tokio::test]
    async fn test_empty_docs_empty_scores() {
        let (_d, r) = reranker().await;
        assert!(r.score("q", &[]).await.unwrap().is_empty());
    }
}
