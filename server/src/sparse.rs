//! Learned-sparse (SPLADE-style) encoding pipeline.
//!
//! The session emits per-token logits over the vocabulary; each term weight
//! is `max over positions(ReLU(logit) · mask)` scaled by `log1p`, truncated
//! to the top-K terms and canonicalized to strictly ascending indices.

use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

use crate::bus::{EventBus, Topic};
use crate::error::{Error, Result};
use crate::runtime::{ActiveSession, ModelRuntime, SessionKind, Tensor};
use crate::types::SparseVector;

/// Terms kept per vector.
pub const SPARSE_TOP_K: usize = 256;

pub struct SparseEncoder {
    runtime: Arc<ModelRuntime>,
    bus: Arc<EventBus>,
    top_k: usize,
}

impl SparseEncoder {
    pub fn new(runtime: Arc<ModelRuntime>, bus: Arc<EventBus>) -> Self {
        SparseEncoder { runtime, bus, top_k: SPARSE_TOP_K }
    }

    pub async fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        self.bus
            .emit(Topic::SparseRequest, "sparse", serde_json::json!({ "count": texts.len() }))
            .await;

        let mut out = Vec::with_capacity(texts.len());
        let batch_size = {
            let active = self.runtime.acquire(SessionKind::SparseLearned).await?;
            active.entry().batch_size.max(1)
        };
        for batch in texts.chunks(batch_size) {
            let active = self.runtime.acquire(SessionKind::SparseLearned).await?;
            let owned: Vec<String> = batch.to_vec();
            let top_k = self.top_k;
            let vectors =
                tokio::task::spawn_blocking(move || encode_batch(&active, &owned, top_k))
                    .await
                    .map_err(|e| Error::Internal(format!("sparse task failed: {e}")))??;
            out.extend(vectors);
        }

        self.bus
            .emit(
                Topic::SparseResponse,
                "sparse",
                serde_json::json!({
                    "count": texts.len(),
                    "latency_ms": started.elapsed().as_millis() as u64,
                }),
            )
            .await;
        Ok(out)
    }
}

fn encode_batch(active: &ActiveSession, texts: &[String], top_k: usize) -> Result<Vec<SparseVector>> {
    let entry = active.entry();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let padded = entry.encoder.encode_padded(&refs, true)?;
    let (batch, seq) = (padded.batch, padded.seq_len);

    let outputs = active.run(vec![
        (
            "input_ids".to_string(),
            Tensor::I64 { shape: vec![batch, seq], data: padded.input_ids },
        ),
        (
            "attention_mask".to_string(),
            Tensor::I64 { shape: vec![batch, seq], data: padded.attention_mask.clone() },
        ),
    ])?;

    let logits = outputs
        .iter()
        .find(|(n, _)| n == "logits")
        .map(|(_, t)| t)
        .or_else(|| outputs.first().map(|(_, t)| t))
        .ok_or_else(|| Error::Internal("sparse session produced no outputs".into()))?;
    let data = logits.f32_data()?;
    if batch * seq == 0 || data.len() % (batch * seq) != 0 {
        return Err(Error::Internal("sparse logits shape mismatch".into()));
    }
    let vocab = data.len() / (batch * seq);
    let mask = &padded.attention_mask;

    // Per-item max-pool over positions, then log1p; independent across the
    // batch, so fan out across cores.
    let vectors: Vec<SparseVector> = (0..batch)
        .into_par_iter()
        .map(|b| {
            let mut weights = vec![0f32; vocab];
            for s in 0..seq {
                if mask[b * seq + s] == 0 {
                    continue;
                }
                let offset = (b * seq + s) * vocab;
                for (j, w) in weights.iter_mut().enumerate() {
                    let v = data[offset + j].max(0.0);
                    if v > *w {
                        *w = v;
                    }
                }
            }
            let pairs: Vec<(u32, f32)> = weights
                .iter()
                .enumerate()
                .filter(|(_, &w)| w > 0.0)
                .map(|(j, &w)| (j as u32, w.ln_1p()))
                .collect();
            SparseVector::from_pairs(pairs, top_k)
        })
        .collect();

    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metrics::MetricSet;
    use crate::registry::ModelRegistry;
    use crate::runtime::MOCK_SPARSE_INDICES;

    async fn encoder() -> (tempfile::TempDir, SparseEncoder) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { models_dir: dir.path().to_path_buf(), ..Config::default() };
        let metrics = Arc::new(MetricSet::new());
        let registry = Arc::new(ModelRegistry::open(&config.models_dir).await.unwrap());
        let runtime = Arc::new(ModelRuntime::new(&config, registry, Arc::clone(&metrics)));
        let bus = Arc::new(EventBus::new(metrics));
        (dir, SparseEncoder::new(runtime, bus))
    }

    #[tokio::test]
    async fn test_mock_sparse_fixed_indices() {
        let (_d, enc) = encoder().await;
        let vs = enc.encode(&["some query text".into()]).await.unwrap();
        assert_eq!(vs.len(), 1);
        let expected: Vec<u32> = MOCK_SPARSE_INDICES.iter().map(|&i| i as u32).collect();
        assert_eq!(vs[0].indices, expected);
        assert!(vs[0].is_canonical());
        // log1p of the mock unit logit
        for v in &vs[0].values {
            assert!((v - 1f32.ln_1p()).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn test_sparse_invariants_hold() {
        let (_d, enc) = encoder().await;
        let vs = enc
            .encode(&["alpha".into(), "beta gamma".into(), "delta epsilon zeta".into()])
            .await
            .unwrap();
        for v in vs {
            assert_eq!(v.indices.len(), v.values.len());
            assert!(v.indices.windows(2).all(|w| w[0] < w[1]));
            assert!(v.indices.len() <= SPARSE_TOP_K);
        }
    }
}
