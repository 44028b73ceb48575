//! Dense embedding pipeline.
//!
//! Texts are batched, tokenized with padding, run through the embedding
//! session, pooled, and L2-normalized. Pooling is mean-over-attention-mask
//! unless the model's mapper declares a dedicated `sentence_embedding`
//! output, which is preferred. A failing batch fails the whole call: partial
//! results are never returned.

use std::sync::Arc;
use std::time::Instant;

use crate::bus::{EventBus, Topic};
use crate::error::{Error, Result};
use crate::metrics::MetricSet;
use crate::runtime::{ActiveSession, ModelRuntime, SessionKind, Tensor};

pub struct Embedder {
    runtime: Arc<ModelRuntime>,
    bus: Arc<EventBus>,
    metrics: Arc<MetricSet>,
    batch_size: usize,
}

impl Embedder {
    pub fn new(
        runtime: Arc<ModelRuntime>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricSet>,
        batch_size: usize,
    ) -> Self {
        Embedder { runtime, bus, metrics, batch_size: batch_size.max(1) }
    }

    /// Embedding dimension of the active session.
    pub async fn dim(&self) -> Result<usize> {
        let active = self.runtime.acquire(SessionKind::Embedding).await?;
        Ok(active.entry().dim)
    }

    /// Encode every text, in configured-size batches. Deterministic for a
    /// fixed model and session.
    pub async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        self.bus
            .emit(Topic::EmbedRequest, "embedder", serde_json::json!({ "count": texts.len() }))
            .await;

        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let active = self.runtime.acquire(SessionKind::Embedding).await?;
            let owned: Vec<String> = batch.to_vec();
            let vectors = tokio::task::spawn_blocking(move || encode_batch(&active, &owned))
                .await
                .map_err(|e| Error::Internal(format!("embed task failed: {e}")))?
                .map_err(|e| match e {
                    Error::MlUnavailable(_) => e,
                    other => Error::EmbedFailed(other.to_string()),
                })?;
            self.metrics.embed_batches.inc();
            out.extend(vectors);
        }

        self.bus
            .emit(
                Topic::EmbedResponse,
                "embedder",
                serde_json::json!({
                    "count": texts.len(),
                    "latency_ms": started.elapsed().as_millis() as u64,
                }),
            )
            .await;
        Ok(out)
    }
}

fn encode_batch(active: &ActiveSession, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let entry = active.entry();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    let padded = entry.encoder.encode_padded(&refs, true)?;
    let (batch, seq) = (padded.batch, padded.seq_len);

    let mut inputs = vec![
        (
            "input_ids".to_string(),
            Tensor::I64 { shape: vec![batch, seq], data: padded.input_ids },
        ),
        (
            "attention_mask".to_string(),
            Tensor::I64 { shape: vec![batch, seq], data: padded.attention_mask.clone() },
        ),
    ];
    if entry.mapper.declares("token_type_ids") {
        inputs.push((
            "token_type_ids".to_string(),
            Tensor::I64 { shape: vec![batch, seq], data: vec![0; batch * seq] },
        ));
    }

    let outputs = active.run(inputs)?;

    // Prefer a model-declared sentence embedding; fall back to mean pooling.
    let pooled = if let Some(t) = find_output(&outputs, "sentence_embedding") {
        rows_from_2d(t, batch)?
    } else {
        let hidden = find_output(&outputs, "last_hidden_state")
            .or_else(|| outputs.first().map(|(_, t)| t))
            .ok_or_else(|| Error::EmbedFailed("session produced no outputs".into()))?;
        mean_pool(hidden, &padded.attention_mask, batch, seq)?
    };

    Ok(pooled.into_iter().map(l2_normalize).collect())
}

fn find_output<'a>(outputs: &'a [(String, Tensor)], name: &str) -> Option<&'a Tensor> {
    outputs.iter().find(|(n, _)| n == name).map(|(_, t)| t)
}

fn rows_from_2d(t: &Tensor, batch: usize) -> Result<Vec<Vec<f32>>> {
    let data = t.f32_data()?;
    if batch == 0 || data.len() % batch != 0 {
        return Err(Error::EmbedFailed("sentence_embedding shape mismatch".into()));
    }
    let dim = data.len() / batch;
    Ok(data.chunks(dim).map(|row| row.to_vec()).collect())
}

/// Mean over attention-masked token positions of a `[batch, seq, dim]`
/// hidden-state tensor.
fn mean_pool(t: &Tensor, mask: &[i64], batch: usize, seq: usize) -> Result<Vec<Vec<f32>>> {
    let data = t.f32_data()?;
    if batch * seq == 0 || data.len() % (batch * seq) != 0 {
        return Err(Error::EmbedFailed("hidden state shape mismatch".into()));
    }
    let dim = data.len() / (batch * seq);

    let mut rows = Vec::with_capacity(batch);
    for b in 0..batch {
        let mut acc = vec![0f32; dim];
        let mut n = 0u32;
        for s in 0..seq {
            if mask[b * seq + s] == 0 {
                continue;
            }
            n += 1;
            let offset = (b * seq + s) * dim;
            for (d, slot) in acc.iter_mut().enumerate() {
                *slot += data[offset + d];
            }
        }
        let n = n.max(1) as f32;
        for slot in acc.iter_mut() {
            *slot /= n;
        }
        rows.push(acc);
    }
    Ok(rows)
}

fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    v
}

/// Cosine similarity of two L2-normalized vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::ModelRegistry;

    async fn embedder() -> (tempfile::TempDir, Embedder) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { models_dir: dir.path().to_path_buf(), ..Config::default() };
        let metrics = Arc::new(MetricSet::new());
        let registry = Arc::new(ModelRegistry::open(&config.models_dir).await.unwrap());
        let runtime = Arc::new(ModelRuntime::new(&config, registry, Arc::clone(&metrics)));
        let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));
        (dir, Embedder::new(runtime, bus, metrics, 2))
    }

    #[tokio::test]
    async fn test_mock_embeddings_are_unit_norm() {
        let (_d, e) = embedder().await;
        let vecs = e.encode(&["hello world".into(), "other text".into()]).await.unwrap();
        assert_eq!(vecs.len(), 2);
        assert_eq!(vecs[0].len(), 384);
        let norm: f32 = vecs[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_encode_deterministic_and_batched() {
        let (_d, e) = embedder().await;
        let texts: Vec<String> = (0..5).map(|i| format!("text number {i}")).collect();
        let a = e.encode(&texts).await.unwrap();
        let b = e.encode(&texts).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }

    #[tokio::test]
    async fn test_empty_input_short_circuits() {
        let (_d, e) = embedder().await;
        assert!(e.encode(&[]).await.unwrap().is_empty());
    }

    #[test]
    fn test_mean_pool_respects_mask() {
        // batch=1, seq=2, dim=2; second position masked out
        let t = Tensor::F32 { shape: vec![1, 2, 2], data: vec![1.0, 3.0, 100.0, 100.0] };
        let rows = mean_pool(&t, &[1, 0], 1, 2).unwrap();
        assert_eq!(rows[0], vec![1.0, 3.0]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        // Zero vector survives untouched
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }
}
