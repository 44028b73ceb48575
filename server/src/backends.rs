//! Retrieval backend seams: the vector store and the lexical store are
//! external services behind narrow async traits.
//!
//! `qdrant.rs` and `lexical.rs` provide the HTTP clients used in production;
//! the in-memory implementations here back tests and self-contained runs and
//! double as the reference semantics for the wire contracts.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::types::{Chunk, SparseVector};

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// Chunk metadata stored alongside every point/document in both backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPayload {
    pub path: String,
    pub language: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub symbols: Vec<String>,
    pub full_path: String,
    pub filename: String,
    pub content_hash: String,
}

impl From<&Chunk> for ChunkPayload {
    fn from(c: &Chunk) -> Self {
        let filename = c.path.rsplit('/').next().unwrap_or(&c.path).to_string();
        ChunkPayload {
            path: c.path.clone(),
            language: c.language.clone(),
            start_line: c.start_line,
            end_line: c.end_line,
            text: c.text.clone(),
            symbols: c.symbols.clone(),
            full_path: c.path.clone(),
            filename,
            content_hash: c.content_hash.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub dense: Vec<f32>,
    pub sparse: SparseVector,
    pub payload: ChunkPayload,
}

#[derive(Debug, Clone)]
pub struct LexicalDoc {
    pub id: String,
    pub payload: ChunkPayload,
}

/// Filters threaded through every retrieval call.
#[derive(Debug, Clone, Default)]
pub struct BackendFilter {
    pub path_prefix: Option<String>,
    pub languages: Vec<String>,
}

impl BackendFilter {
    pub fn matches(&self, payload: &ChunkPayload) -> bool {
        if let Some(prefix) = &self.path_prefix {
            if !payload.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if !self.languages.is_empty() && !self.languages.iter().any(|l| l == &payload.language) {
            return false;
        }
        true
    }
}

/// Deletion scopes shared by both backends. Deletes are idempotent.
#[derive(Debug, Clone)]
pub enum DeletePredicate {
    Ids(Vec<String>),
    Paths(Vec<String>),
    PathPrefix(String),
}

impl DeletePredicate {
    fn hits(&self, id: &str, payload: &ChunkPayload) -> bool {
        match self {
            DeletePredicate::Ids(ids) => ids.iter().any(|i| i == id),
            DeletePredicate::Paths(paths) => paths.iter().any(|p| p == &payload.path),
            DeletePredicate::PathPrefix(prefix) => payload.path.starts_with(prefix.as_str()),
        }
    }
}

/// One scored hit from any retriever.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: ChunkPayload,
    /// Dense vector when the backend can return it (used by post-rank).
    pub dense: Option<Vec<f32>>,
    /// Lexical snippet, when the backend produces one.
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub points: usize,
    pub dim: usize,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn create_collection(&self, store: &str, dim: usize) -> Result<()>;
    async fn drop_collection(&self, store: &str) -> Result<()>;
    async fn upsert(&self, store: &str, points: Vec<VectorPoint>) -> Result<()>;
    async fn delete(&self, store: &str, predicate: &DeletePredicate) -> Result<()>;
    async fn search_dense(
        &self,
        store: &str,
        vector: &[f32],
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>>;
    async fn search_sparse(
        &self,
        store: &str,
        sparse: &SparseVector,
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>>;
    async fn info(&self, store: &str) -> Result<CollectionInfo>;
}

#[async_trait]
pub trait LexicalBackend: Send + Sync {
    async fn create_index(&self, store: &str) -> Result<()>;
    async fn drop_index(&self, store: &str) -> Result<()>;
    async fn upsert(&self, store: &str, docs: Vec<LexicalDoc>) -> Result<()>;
    async fn delete(&self, store: &str, predicate: &DeletePredicate) -> Result<()>;
    async fn search(
        &self,
        store: &str,
        query: &str,
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>>;
    async fn info(&self, store: &str) -> Result<CollectionInfo>;
}

// ---------------------------------------------------------------------------
// In-memory vector backend
// ---------------------------------------------------------------------------

struct StoredPoint {
    dense: Vec<f32>,
    sparse: SparseVector,
    payload: ChunkPayload,
}

struct VectorCollection {
    dim: usize,
    points: HashMap<String, StoredPoint>,
}

#[derive(Default)]
pub struct MemoryVectorBackend {
    collections: DashMap<String, VectorCollection>,
}

impl MemoryVectorBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorBackend for MemoryVectorBackend {
    async fn create_collection(&self, store: &str, dim: usize) -> Result<()> {
        self.collections
            .entry(store.to_string())
            .or_insert_with(|| VectorCollection { dim, points: HashMap::new() });
        Ok(())
    }

    async fn drop_collection(&self, store: &str) -> Result<()> {
        self.collections.remove(store);
        Ok(())
    }

    async fn upsert(&self, store: &str, points: Vec<VectorPoint>) -> Result<()> {
        let mut col = self
            .collections
            .get_mut(store)
            .ok_or_else(|| Error::NotFound(format!("collection '{store}'")))?;
        for p in points {
            if p.dense.len() != col.dim {
                return Err(Error::Validation(format!(
                    "vector dimension {} does not match collection dimension {}",
                    p.dense.len(),
                    col.dim
                )));
            }
            col.points
                .insert(p.id, StoredPoint { dense: p.dense, sparse: p.sparse, payload: p.payload });
        }
        Ok(())
    }

    async fn delete(&self, store: &str, predicate: &DeletePredicate) -> Result<()> {
        if let Some(mut col) = self.collections.get_mut(store) {
            col.points.retain(|id, p| !predicate.hits(id, &p.payload));
        }
        Ok(())
    }

    async fn search_dense(
        &self,
        store: &str,
        vector: &[f32],
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>> {
        let col = self
            .collections
            .get(store)
            .ok_or_else(|| Error::NotFound(format!("collection '{store}'")))?;
        let mut hits: Vec<SearchHit> = col
            .points
            .iter()
            .filter(|(_, p)| filter.matches(&p.payload))
            .map(|(id, p)| SearchHit {
                id: id.clone(),
                score: dot(vector, &p.dense),
                payload: p.payload.clone(),
                dense: Some(p.dense.clone()),
                snippet: None,
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn search_sparse(
        &self,
        store: &str,
        sparse: &SparseVector,
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>> {
        let col = self
            .collections
            .get(store)
            .ok_or_else(|| Error::NotFound(format!("collection '{store}'")))?;
        let mut hits: Vec<SearchHit> = col
            .points
            .iter()
            .filter(|(_, p)| filter.matches(&p.payload))
            .map(|(id, p)| SearchHit {
                id: id.clone(),
                score: sparse.dot(&p.sparse),
                payload: p.payload.clone(),
                dense: Some(p.dense.clone()),
                snippet: None,
            })
            .filter(|h| h.score > 0.0)
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn info(&self, store: &str) -> Result<CollectionInfo> {
        let col = self
            .collections
            .get(store)
            .ok_or_else(|| Error::NotFound(format!("collection '{store}'")))?;
        Ok(CollectionInfo { points: col.points.len(), dim: col.dim })
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ---------------------------------------------------------------------------
// In-memory lexical backend
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLexicalBackend {
    indexes: DashMap<String, HashMap<String, LexicalDoc>>,
}

impl MemoryLexicalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lex_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cur = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            cur.push(ch.to_ascii_lowercase());
        } else if !cur.is_empty() {
            tokens.push(std::mem::take(&mut cur));
        }
    }
    if !cur.is_empty() {
        tokens.push(cur);
    }
    tokens
}

#[async_trait]
impl LexicalBackend for MemoryLexicalBackend {
    async fn create_index(&self, store: &str) -> Result<()> {
        self.indexes.entry(store.to_string()).or_default();
        Ok(())
    }

    async fn drop_index(&self, store: &str) -> Result<()> {
        self.indexes.remove(store);
        Ok(())
    }

    async fn upsert(&self, store: &str, docs: Vec<LexicalDoc>) -> Result<()> {
        let mut index = self
            .indexes
            .get_mut(store)
            .ok_or_else(|| Error::NotFound(format!("index '{store}'")))?;
        for doc in docs {
            index.insert(doc.id.clone(), doc);
        }
        Ok(())
    }

    async fn delete(&self, store: &str, predicate: &DeletePredicate) -> Result<()> {
        if let Some(mut index) = self.indexes.get_mut(store) {
            index.retain(|id, d| !predicate.hits(id, &d.payload));
        }
        Ok(())
    }

    /// BM25-lite: term frequency damped by document length, weighted by an
    /// idf estimate over the index, with a filename-match bonus. Quoted
    /// phrases must appear verbatim.
    async fn search(
        &self,
        store: &str,
        query: &str,
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>> {
        let index = self
            .indexes
            .get(store)
            .ok_or_else(|| Error::NotFound(format!("index '{store}'")))?;

        let phrase: Option<String> = query
            .split('"')
            .nth(1)
            .map(|p| p.to_lowercase())
            .filter(|p| !p.is_empty());
        let terms = lex_tokens(query);
        if terms.is_empty() && phrase.is_none() {
            return Ok(Vec::new());
        }

        let n_docs = index.len().max(1) as f32;
        let mut doc_freq: HashMap<&str, usize> = HashMap::new();
        for term in &terms {
            let df = index
                .values()
                .filter(|d| {
                    filter.matches(&d.payload)
                        && (d.payload.text.to_lowercase().contains(term.as_str())
                            || d.payload.filename.to_lowercase().contains(term.as_str()))
                })
                .count();
            doc_freq.insert(term.as_str(), df);
        }

        let mut hits = Vec::new();
        for doc in index.values() {
            if !filter.matches(&doc.payload) {
                continue;
            }
            let text_lower = doc.payload.text.to_lowercase();
            if let Some(p) = &phrase {
                if !text_lower.contains(p.as_str()) {
                    continue;
                }
            }
            let doc_tokens = lex_tokens(&doc.payload.text);
            let doc_len = doc_tokens.len().max(1) as f32;
            let mut score = 0f32;
            let mut matched = false;
            for term in &terms {
                let tf = doc_tokens.iter().filter(|t| t.as_str() == term.as_str()).count() as f32;
                let fname_hit = doc.payload.filename.to_lowercase().contains(term.as_str());
                let sym_hit = doc.payload.symbols.iter().any(|s| s.to_lowercase() == *term);
                if tf == 0.0 && !fname_hit && !sym_hit {
                    continue;
                }
                matched = true;
                let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f32;
                let idf = (1.0 + n_docs / (df + 1.0)).ln();
                score += (tf / (tf + 1.2 * doc_len / 50.0)) * idf;
                if fname_hit {
                    score += 2.0 * idf;
                }
                if sym_hit {
                    score += idf;
                }
            }
            if phrase.is_some() {
                matched = true;
                score += 3.0;
            }
            if !matched || score <= 0.0 {
                continue;
            }

            let snippet = doc
                .payload
                .text
                .lines()
                .find(|line| {
                    let l = line.to_lowercase();
                    terms.iter().any(|t| l.contains(t.as_str()))
                })
                .unwrap_or_else(|| doc.payload.text.lines().next().unwrap_or(""))
                .chars()
                .take(200)
                .collect::<String>();

            hits.push(SearchHit {
                id: doc.id.clone(),
                score,
                payload: doc.payload.clone(),
                dense: None,
                snippet: Some(snippet),
            });
        }
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn info(&self, store: &str) -> Result<CollectionInfo> {
        let index = self
            .indexes
            .get(store)
            .ok_or_else(|| Error::NotFound(format!("index '{store}'")))?;
        Ok(CollectionInfo { points: index.len(), dim: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(path: &str, text: &str, symbols: &[&str]) -> ChunkPayload {
        ChunkPayload {
            path: path.to_string(),
            language: crate::chunker::language_for_path(path).to_string(),
            start_line: 1,
            end_line: text.lines().count().max(1),
            text: text.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            full_path: path.to_string(),
            filename: path.rsplit('/').next().unwrap_or(path).to_string(),
            content_hash: "h".to_string(),
        }
    }

    #[tokio::test]
    async fn test_vector_upsert_search_delete() {
        let be = MemoryVectorBackend::new();
        be.create_collection("s1", 2).await.unwrap();
        be.upsert(
            "s1",
            vec![
                VectorPoint {
                    id: "a".into(),
                    dense: vec![1.0, 0.0],
                    sparse: SparseVector::default(),
                    payload: payload("src/a.rs", "alpha", &[]),
                },
                VectorPoint {
                    id: "b".into(),
                    dense: vec![0.0, 1.0],
                    sparse: SparseVector::default(),
                    payload: payload("src/b.rs", "beta", &[]),
                },
            ],
        )
        .await
        .unwrap();

        let hits = be.search_dense("s1", &[1.0, 0.0], 10, &BackendFilter::default()).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > hits[1].score);

        be.delete("s1", &DeletePredicate::Paths(vec!["src/a.rs".into()])).await.unwrap();
        assert_eq!(be.info("s1").await.unwrap().points, 1);
        // Idempotent
        be.delete("s1", &DeletePredicate::Paths(vec!["src/a.rs".into()])).await.unwrap();
        assert_eq!(be.info("s1").await.unwrap().points, 1);
    }

    #[tokio::test]
    async fn test_vector_dimension_enforced() {
        let be = MemoryVectorBackend::new();
        be.create_collection("s1", 4).await.unwrap();
        let err = be
            .upsert(
                "s1",
                vec![VectorPoint {
                    id: "x".into(),
                    dense: vec![1.0, 2.0],
                    sparse: SparseVector::default(),
                    payload: payload("p", "t", &[]),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_sparse_search_requires_overlap() {
        let be = MemoryVectorBackend::new();
        be.create_collection("s1", 1).await.unwrap();
        be.upsert(
            "s1",
            vec![VectorPoint {
                id: "a".into(),
                dense: vec![0.5],
                sparse: SparseVector { indices: vec![3, 9], values: vec![1.0, 2.0] },
                payload: payload("p", "t", &[]),
            }],
        )
        .await
        .unwrap();

        let q = SparseVector { indices: vec![9], values: vec![1.0] };
        let hits = be.search_sparse("s1", &q, 10, &BackendFilter::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 2.0);

        let none = SparseVector { indices: vec![7], values: vec![1.0] };
        assert!(be.search_sparse("s1", &none, 10, &BackendFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lexical_search_and_filters() {
        let be = MemoryLexicalBackend::new();
        be.create_index("s1").await.unwrap();
        be.upsert(
            "s1",
            vec![
                LexicalDoc {
                    id: "a".into(),
                    payload: payload(
                        "src/auth.ts",
                        "export function authenticate(token) { return token; }",
                        &["authenticate"],
                    ),
                },
                LexicalDoc {
                    id: "b".into(),
                    payload: payload("src/util.ts", "export function noop() {}", &["noop"]),
                },
                LexicalDoc {
                    id: "c".into(),
                    payload: payload("lib/auth.py", "def authenticate(): pass", &["authenticate"]),
                },
            ],
        )
        .await
        .unwrap();

        let hits =
            be.search("s1", "authenticate", 10, &BackendFilter::default()).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.score > 0.0));
        assert!(hits[0].snippet.as_deref().unwrap().contains("authenticate"));

        // Path-prefix filter
        let filtered = be
            .search(
                "s1",
                "authenticate",
                10,
                &BackendFilter { path_prefix: Some("src/".into()), languages: vec![] },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].payload.path, "src/auth.ts");

        // Language filter
        let filtered = be
            .search(
                "s1",
                "authenticate",
                10,
                &BackendFilter { path_prefix: None, languages: vec!["python".into()] },
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].payload.path, "lib/auth.py");
    }

    #[tokio::test]
    async fn test_lexical_phrase_search() {
        let be = MemoryLexicalBackend::new();
        be.create_index("s1").await.unwrap();
        be.upsert(
            "s1",
            vec![
                LexicalDoc { id: "a".into(), payload: payload("a.txt", "the quick brown fox", &[]) },
                LexicalDoc { id: "b".into(), payload: payload("b.txt", "the brown quick fox", &[]) },
            ],
        )
        .await
        .unwrap();

        let hits = be
            .search("s1", "\"quick brown\"", 10, &BackendFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }
}
