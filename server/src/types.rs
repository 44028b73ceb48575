//! Core data model: documents, chunks, stores, and the search/index wire types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Fingerprints & ids
// ---------------------------------------------------------------------------

/// Stable fingerprint of a document's bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Stable chunk id: hex of the first 16 bytes of
/// sha256(store · path · ordinal · content_hash). Identical bytes at the same
/// position produce the same id across reindex runs.
pub fn chunk_id(store: &str, path: &str, ordinal: usize, content_hash: &str) -> String {
    let mut h = Sha256::new();
    h.update(store.as_bytes());
    h.update([0]);
    h.update(path.as_bytes());
    h.update([0]);
    h.update(ordinal.to_le_bytes());
    h.update([0]);
    h.update(content_hash.as_bytes());
    hex::encode(&h.finalize()[..16])
}

// ---------------------------------------------------------------------------
// Sparse vectors
// ---------------------------------------------------------------------------

/// Learned-sparse vector stored as parallel `indices`/`values`, top-K
/// truncated and canonicalized (indices strictly ascending).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    /// Build a canonical sparse vector from arbitrary (index, weight) pairs:
    /// keep the top-K by weight, then sort by index ascending.
    pub fn from_pairs(mut pairs: Vec<(u32, f32)>, top_k: usize) -> Self {
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        pairs.truncate(top_k);
        pairs.sort_by_key(|(i, _)| *i);
        pairs.dedup_by_key(|(i, _)| *i);
        SparseVector {
            indices: pairs.iter().map(|(i, _)| *i).collect(),
            values: pairs.iter().map(|(_, v)| *v).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Invariant check: parallel lengths, strictly ascending indices.
    pub fn is_canonical(&self) -> bool {
        self.indices.len() == self.values.len()
            && self.indices.windows(2).all(|w| w[0] < w[1])
    }

    /// Sparse dot product against another canonical vector.
    pub fn dot(&self, other: &SparseVector) -> f32 {
        let (mut i, mut j, mut acc) = (0usize, 0usize, 0f32);
        while i < self.indices.len() && j < other.indices.len() {
            match self.indices[i].cmp(&other.indices[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    acc += self.values[i] * other.values[j];
                    i += 1;
                    j += 1;
                }
            }
        }
        acc
    }
}

// ---------------------------------------------------------------------------
// Chunks & documents
// ---------------------------------------------------------------------------

/// Unit of retrieval: a contiguous span of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub path: String,
    pub language: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    /// Verbatim bytes of the span — never includes the embedding prefix.
    pub text: String,
    pub symbols: Vec<String>,
    pub ordinal: usize,
    pub content_hash: String,
}

impl Chunk {
    /// Text handed to the dense encoder. Prepending file name and path is what
    /// makes file-name queries retrievable through semantic matching; the
    /// prefix is not part of `text`.
    pub fn embedding_input(&self) -> String {
        let basename = self.path.rsplit('/').next().unwrap_or(&self.path);
        format!("File: {basename}\nPath: {}\n\n{}", self.path, self.text)
    }
}

/// Per-path metadata owned by the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub content_hash: String,
    pub size: u64,
    pub indexed_at: DateTime<Utc>,
    pub language: String,
    pub chunk_ids: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Store-level retrieval configuration. The embedding dimension is frozen at
/// store creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_dim")]
    pub embedding_dimension: usize,
    #[serde(default = "default_true")]
    pub enable_dense: bool,
    #[serde(default = "default_true")]
    pub enable_sparse: bool,
    #[serde(default = "default_true")]
    pub enable_learned_sparse: bool,
    #[serde(default = "default_half")]
    pub sparse_weight: f32,
    #[serde(default = "default_half")]
    pub dense_weight: f32,
}

fn default_dim() -> usize {
    384
}
fn default_true() -> bool {
    true
}
fn default_half() -> f32 {
    0.5
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            embedding_dimension: default_dim(),
            enable_dense: true,
            enable_sparse: true,
            enable_learned_sparse: true,
            sparse_weight: 0.5,
            dense_weight: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub config: StoreConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub name: String,
    pub document_count: usize,
    pub chunk_count: usize,
    pub last_indexed: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Index API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FileInput {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct IndexRequest {
    pub files: Vec<FileInput>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexResponse {
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub chunks_total: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    #[serde(default)]
    pub paths: Option<Vec<String>>,
    #[serde(default)]
    pub path_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub current_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub deleted: usize,
    pub partial: bool,
}

// ---------------------------------------------------------------------------
// Search API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_rerank_candidates")]
    pub rerank_candidates: usize,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub sparse_weight: Option<f32>,
    #[serde(default)]
    pub dense_weight: Option<f32>,
    #[serde(default = "default_true")]
    pub enable_reranking: bool,
    #[serde(default = "default_true")]
    pub enable_dedup: bool,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f32,
    #[serde(default = "default_true")]
    pub enable_diversity: bool,
    #[serde(default = "default_diversity_lambda")]
    pub diversity_lambda: f32,
    #[serde(default)]
    pub group_by_file: bool,
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: usize,
    #[serde(default = "default_true")]
    pub enable_expansion: bool,
    #[serde(default = "default_true")]
    pub include_content: bool,
}

fn default_top_k() -> usize {
    20
}
fn default_rerank_candidates() -> usize {
    30
}
fn default_dedup_threshold() -> f32 {
    0.85
}
fn default_diversity_lambda() -> f32 {
    0.7
}
fn default_max_chunks_per_file() -> usize {
    3
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        SearchRequest {
            query: query.into(),
            top_k: default_top_k(),
            rerank_candidates: default_rerank_candidates(),
            filters: SearchFilters::default(),
            sparse_weight: None,
            dense_weight: None,
            enable_reranking: true,
            enable_dedup: true,
            dedup_threshold: default_dedup_threshold(),
            enable_diversity: true,
            diversity_lambda: default_diversity_lambda(),
            group_by_file: false,
            max_chunks_per_file: default_max_chunks_per_file(),
            enable_expansion: true,
            include_content: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationInfo {
    pub is_representative: bool,
    pub related_chunks: usize,
    pub file_score: f32,
    pub chunk_rank_in_file: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub path: String,
    pub language: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub symbols: Vec<String>,
    pub final_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dense_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    /// Per-retriever 1-based rank, keyed by stage name.
    pub ranks: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Intelligence {
    pub intent: String,
    pub difficulty: String,
    pub strategy: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct RerankingMeta {
    pub enabled: bool,
    pub candidates: usize,
    pub pass1_applied: bool,
    pub pass1_latency_ms: u64,
    pub pass2_applied: bool,
    pub pass2_latency_ms: u64,
    pub early_exit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_exit_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DedupMeta {
    pub input_count: usize,
    pub output_count: usize,
    pub removed: usize,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DiversityMeta {
    pub enabled: bool,
    pub avg_diversity: f32,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct AggregationMeta {
    pub unique_files: usize,
    pub chunks_dropped: usize,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PostrankMeta {
    pub dedup: DedupMeta,
    pub diversity: DiversityMeta,
    pub aggregation: AggregationMeta,
    pub total_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub store: String,
    pub total: usize,
    pub search_time_ms: u64,
    pub results: Vec<SearchResult>,
    pub intelligence: Intelligence,
    pub reranking: RerankingMeta,
    pub postrank: PostrankMeta,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_stability() {
        let a = chunk_id("s1", "src/auth.ts", 0, "abc");
        let b = chunk_id("s1", "src/auth.ts", 0, "abc");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        // Any component changing produces a different id
        assert_ne!(a, chunk_id("s2", "src/auth.ts", 0, "abc"));
        assert_ne!(a, chunk_id("s1", "src/util.ts", 0, "abc"));
        assert_ne!(a, chunk_id("s1", "src/auth.ts", 1, "abc"));
        assert_ne!(a, chunk_id("s1", "src/auth.ts", 0, "abd"));
    }

    #[test]
    fn test_sparse_vector_canonicalization() {
        let v = SparseVector::from_pairs(vec![(9, 0.1), (3, 0.9), (7, 0.5), (3, 0.8)], 3);
        assert!(v.is_canonical());
        assert!(v.indices.len() <= 3);
        assert_eq!(v.indices, vec![3, 7, 9]);
    }

    #[test]
    fn test_sparse_dot() {
        let a = SparseVector { indices: vec![1, 5, 9], values: vec![1.0, 2.0, 3.0] };
        let b = SparseVector { indices: vec![5, 9, 12], values: vec![4.0, 5.0, 6.0] };
        assert_eq!(a.dot(&b), 2.0 * 4.0 + 3.0 * 5.0);
    }

    #[test]
    fn test_embedding_input_prefix() {
        let c = Chunk {
            id: "x".into(),
            path: "src/auth.ts".into(),
            language: "typescript".into(),
            start_line: 1,
            end_line: 2,
            text: "export function authenticate() {}".into(),
            symbols: vec!["authenticate".into()],
            ordinal: 0,
            content_hash: "h".into(),
        };
        let input = c.embedding_input();
        assert!(input.starts_with("File: auth.ts\nPath: src/auth.ts\n\n"));
        assert!(!c.text.contains("File:"));
    }

    #[test]
    fn test_search_request_defaults() {
        let req: SearchRequest = serde_json::from_str(r#"{"query":"hello"}"#).unwrap();
        assert_eq!(req.top_k, 20);
        assert_eq!(req.rerank_candidates, 30);
        assert!(req.enable_reranking);
        assert!(req.enable_dedup);
        assert!((req.dedup_threshold - 0.85).abs() < 1e-6);
        assert!(!req.group_by_file);
        assert_eq!(req.max_chunks_per_file, 3);
    }
}
