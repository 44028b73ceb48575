//! Store registry: named namespaces bundling documents, chunks, and the
//! retrieval configuration used to process them.
//!
//! The embedding dimension is frozen at store creation. Document metadata is
//! single-writer (the indexer, under its per-path lock) and many-reader (the
//! search path and the stats endpoint).

use chrono::Utc;
use dashmap::DashMap;
use regex::Regex;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::info;

use crate::backends::{LexicalBackend, VectorBackend};
use crate::bus::{EventBus, Topic};
use crate::error::{Error, Result};
use crate::types::{Document, StoreConfig, StoreMeta, StoreStats};

/// Live state for one store.
pub struct StoreState {
    pub meta: RwLock<StoreMeta>,
    pub documents: DashMap<String, Document>,
}

impl StoreState {
    pub fn meta(&self) -> StoreMeta {
        self.meta.read().unwrap().clone()
    }

    pub fn config(&self) -> StoreConfig {
        self.meta.read().unwrap().config.clone()
    }

    pub fn touch(&self) {
        self.meta.write().unwrap().updated_at = Utc::now();
    }
}

fn valid_name(name: &str) -> bool {
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    NAME_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("static regex"))
        .is_match(name)
}

pub struct StoreRegistry {
    stores: DashMap<String, Arc<StoreState>>,
    vector: Arc<dyn VectorBackend>,
    lexical: Arc<dyn LexicalBackend>,
    bus: Arc<EventBus>,
    default_dim: usize,
}

impl StoreRegistry {
    pub fn new(
        vector: Arc<dyn VectorBackend>,
        lexical: Arc<dyn LexicalBackend>,
        bus: Arc<EventBus>,
        default_dim: usize,
    ) -> Self {
        StoreRegistry { stores: DashMap::new(), vector, lexical, bus, default_dim }
    }

    /// Create a store and its backing collections. The embedding dimension is
    /// validated here and never changes afterwards.
    pub async fn create(
        &self,
        name: &str,
        description: &str,
        config: Option<StoreConfig>,
    ) -> Result<StoreMeta> {
        if !valid_name(name) {
            return Err(Error::Validation(format!(
                "invalid store name '{name}' (alphanumeric, dash, underscore; max 64 chars)"
            )));
        }
        if self.stores.contains_key(name) {
            return Err(Error::AlreadyExists(format!("store '{name}'")));
        }
        let mut config = config.unwrap_or_else(|| StoreConfig {
            embedding_dimension: self.default_dim,
            ..StoreConfig::default()
        });
        if config.embedding_dimension == 0 {
            config.embedding_dimension = self.default_dim;
        }

        self.vector.create_collection(name, config.embedding_dimension).await?;
        self.lexical.create_index(name).await?;

        let now = Utc::now();
        let meta = StoreMeta {
            name: name.to_string(),
            description: description.to_string(),
            config,
            created_at: now,
            updated_at: now,
        };
        let state =
            Arc::new(StoreState { meta: RwLock::new(meta.clone()), documents: DashMap::new() });
        if self.stores.insert(name.to_string(), state).is_some() {
            // Raced with a concurrent create of the same name.
            return Err(Error::AlreadyExists(format!("store '{name}'")));
        }

        info!(store = name, dim = meta.config.embedding_dimension, "store created");
        self.bus.emit(Topic::StoreCreated, "stores", serde_json::json!({ "store": name })).await;
        Ok(meta)
    }

    pub fn get(&self, name: &str) -> Result<Arc<StoreState>> {
        self.stores
            .get(name)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| Error::NotFound(format!("store '{name}'")))
    }

    pub fn list(&self) -> Vec<StoreMeta> {
        let mut out: Vec<StoreMeta> = self.stores.iter().map(|s| s.meta()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Destroy the store and cascade the drop to every backend. Requires the
    /// explicit confirmation flag at the API boundary. A backend failure
    /// leaves the store registered so the caller can retry the cascade.
    pub async fn delete(&self, name: &str, confirm: bool) -> Result<()> {
        if !confirm {
            return Err(Error::Validation(
                "store deletion is destructive; pass confirm=true".into(),
            ));
        }
        let _ = self.get(name)?;

        let (v, l) = tokio::join!(self.vector.drop_collection(name), self.lexical.drop_index(name));
        let results = [v, l];
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            return Err(Error::Partial {
                succeeded: results.len() - failed,
                failed,
                detail: format!("store '{name}' drop incomplete; retry the delete"),
            });
        }

        self.stores.remove(name);
        info!(store = name, "store deleted");
        self.bus.emit(Topic::StoreDeleted, "stores", serde_json::json!({ "store": name })).await;
        Ok(())
    }

    /// Document/chunk counts from the metadata map — no backend round-trip.
    pub fn stats(&self, name: &str) -> Result<StoreStats> {
        let state = self.get(name)?;
        let document_count = state.documents.len();
        let chunk_count = state.documents.iter().map(|d| d.chunk_ids.len()).sum();
        let last_indexed = state.documents.iter().map(|d| d.indexed_at).max();
        Ok(StoreStats { name: name.to_string(), document_count, chunk_count, last_indexed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryLexicalBackend, MemoryVectorBackend};
    use crate::metrics::MetricSet;

    fn registry() -> StoreRegistry {
        let metrics = Arc::new(MetricSet::new());
        StoreRegistry::new(
            Arc::new(MemoryVectorBackend::new()),
            Arc::new(MemoryLexicalBackend::new()),
            Arc::new(EventBus::new(metrics)),
            384,
        )
    }

    #[tokio::test]
    async fn test_create_get_list() {
        let reg = registry();
        let meta = reg.create("s1", "first", None).await.unwrap();
        assert_eq!(meta.config.embedding_dimension, 384);
        assert!(reg.get("s1").is_ok());
        assert_eq!(reg.list().len(), 1);
        assert!(reg.get("missing").is_err());
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let reg = registry();
        reg.create("s1", "", None).await.unwrap();
        let err = reg.create("s1", "", None).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let reg = registry();
        for bad in ["", "has space", "semi;colon", "-leading"] {
            assert!(
                matches!(reg.create(bad, "", None).await, Err(Error::Validation(_))),
                "name '{bad}' should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_delete_requires_confirmation() {
        let reg = registry();
        reg.create("s1", "", None).await.unwrap();
        assert!(matches!(reg.delete("s1", false).await, Err(Error::Validation(_))));
        reg.delete("s1", true).await.unwrap();
        assert!(reg.get("s1").is_err());
    }

    #[tokio::test]
    async fn test_stats_from_documents() {
        let reg = registry();
        reg.create("s1", "", None).await.unwrap();
        let state = reg.get("s1").unwrap();
        state.documents.insert(
            "a.rs".into(),
            Document {
                path: "a.rs".into(),
                content_hash: "h1".into(),
                size: 10,
                indexed_at: Utc::now(),
                language: "rust".into(),
                chunk_ids: ["c1".to_string(), "c2".to_string()].into_iter().collect(),
            },
        );
        let stats = reg.stats("s1").unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.chunk_count, 2);
        assert!(stats.last_indexed.is_some());
    }
}
