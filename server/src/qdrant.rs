//! Vector backend client: Qdrant-compatible REST API over reqwest.
//!
//! Dense vectors live under the named vector `dense`, learned-sparse vectors
//! under the named sparse vector `learned`, so both retrievers query the same
//! collection. Chunk ids (32 hex chars) translate losslessly to the UUID
//! point ids Qdrant requires.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::backends::{
    BackendFilter, ChunkPayload, CollectionInfo, DeletePredicate, SearchHit, VectorBackend,
    VectorPoint,
};
use crate::error::{Error, Result};
use crate::types::SparseVector;

pub struct QdrantClient {
    base: String,
    http: reqwest::Client,
}

impl QdrantClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(QdrantClient { base: base_url.trim_end_matches('/').to_string(), http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn call(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("vector backend: {e}")))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("vector backend body: {e}")))?;
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound("collection".into()));
        }
        if !status.is_success() {
            return Err(Error::BackendUnavailable(format!(
                "vector backend returned {status}: {body}"
            )));
        }
        Ok(body)
    }
}

/// 32-hex chunk id → dashed UUID form.
pub fn chunk_id_to_point_id(id: &str) -> String {
    if id.len() == 32 {
        format!("{}-{}-{}-{}-{}", &id[0..8], &id[8..12], &id[12..16], &id[16..20], &id[20..32])
    } else {
        id.to_string()
    }
}

/// Dashed UUID point id → 32-hex chunk id.
pub fn point_id_to_chunk_id(id: &str) -> String {
    id.replace('-', "")
}

pub fn filter_json(filter: &BackendFilter) -> Option<Value> {
    let mut must = Vec::new();
    if let Some(prefix) = &filter.path_prefix {
        must.push(json!({ "key": "full_path", "match": { "text": prefix } }));
    }
    if !filter.languages.is_empty() {
        must.push(json!({ "key": "language", "match": { "any": filter.languages } }));
    }
    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

fn predicate_json(predicate: &DeletePredicate) -> Value {
    match predicate {
        DeletePredicate::Ids(ids) => {
            let points: Vec<String> = ids.iter().map(|i| chunk_id_to_point_id(i)).collect();
            json!({ "points": points })
        }
        DeletePredicate::Paths(paths) => json!({
            "filter": { "must": [{ "key": "path", "match": { "any": paths } }] }
        }),
        DeletePredicate::PathPrefix(prefix) => json!({
            "filter": { "must": [{ "key": "path", "match": { "text": prefix } }] }
        }),
    }
}

fn parse_hits(body: &Value) -> Vec<SearchHit> {
    body["result"]
        .as_array()
        .map(|rows| {
            rows.iter()
                .filter_map(|row| {
                    let payload: ChunkPayload =
                        serde_json::from_value(row["payload"].clone()).ok()?;
                    let dense = row["vector"]["dense"]
                        .as_array()
                        .map(|v| v.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect());
                    Some(SearchHit {
                        id: point_id_to_chunk_id(row["id"].as_str().unwrap_or_default()),
                        score: row["score"].as_f64().unwrap_or(0.0) as f32,
                        payload,
                        dense,
                        snippet: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl VectorBackend for QdrantClient {
    async fn create_collection(&self, store: &str, dim: usize) -> Result<()> {
        let body = json!({
            "vectors": { "dense": { "size": dim, "distance": "Cosine" } },
            "sparse_vectors": { "learned": {} },
        });
        self.call(self.http.put(self.url(&format!("/collections/{store}"))).json(&body)).await?;
        Ok(())
    }

    async fn drop_collection(&self, store: &str) -> Result<()> {
        self.call(self.http.delete(self.url(&format!("/collections/{store}")))).await?;
        Ok(())
    }

    async fn upsert(&self, store: &str, points: Vec<VectorPoint>) -> Result<()> {
        let rows: Vec<Value> = points
            .iter()
            .map(|p| {
                json!({
                    "id": chunk_id_to_point_id(&p.id),
                    "vector": {
                        "dense": p.dense,
                        "learned": { "indices": p.sparse.indices, "values": p.sparse.values },
                    },
                    "payload": p.payload,
                })
            })
            .collect();
        let body = json!({ "points": rows });
        self.call(
            self.http
                .put(self.url(&format!("/collections/{store}/points?wait=true")))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, store: &str, predicate: &DeletePredicate) -> Result<()> {
        self.call(
            self.http
                .post(self.url(&format!("/collections/{store}/points/delete?wait=true")))
                .json(&predicate_json(predicate)),
        )
        .await?;
        Ok(())
    }

    async fn search_dense(
        &self,
        store: &str,
        vector: &[f32],
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>> {
        let mut body = json!({
            "vector": { "name": "dense", "vector": vector },
            "limit": top_k,
            "with_payload": true,
            "with_vector": ["dense"],
        });
        if let Some(f) = filter_json(filter) {
            body["filter"] = f;
        }
        let resp = self
            .call(self.http.post(self.url(&format!("/collections/{store}/points/search"))).json(&body))
            .await?;
        Ok(parse_hits(&resp))
    }

    async fn search_sparse(
        &self,
        store: &str,
        sparse: &SparseVector,
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>> {
        let mut body = json!({
            "vector": {
                "name": "learned",
                "vector": { "indices": sparse.indices, "values": sparse.values },
            },
            "limit": top_k,
            "with_payload": true,
            "with_vector": ["dense"],
        });
        if let Some(f) = filter_json(filter) {
            body["filter"] = f;
        }
        let resp = self
            .call(self.http.post(self.url(&format!("/collections/{store}/points/search"))).json(&body))
            .await?;
        Ok(parse_hits(&resp))
    }

    async fn info(&self, store: &str) -> Result<CollectionInfo> {
        let resp = self.call(self.http.get(self.url(&format!("/collections/{store}")))).await?;
        let points = resp["result"]["points_count"].as_u64().unwrap_or(0) as usize;
        let dim = resp["result"]["config"]["params"]["vectors"]["dense"]["size"]
            .as_u64()
            .unwrap_or(0) as usize;
        Ok(CollectionInfo { points, dim })
    }
}
