//! Lexical (BM25) backend client.
//!
//! The lexical service is an external collaborator with a small REST surface;
//! filters ride inside the query string as `path:` and `lang:` predicates,
//! which is the minimum syntax the service contract guarantees.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

use crate::backends::{
    BackendFilter, ChunkPayload, CollectionInfo, DeletePredicate, LexicalBackend, LexicalDoc,
    SearchHit,
};
use crate::error::{Error, Result};

pub struct LexicalClient {
    base: String,
    http: reqwest::Client,
}

impl LexicalClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(LexicalClient { base: base_url.trim_end_matches('/').to_string(), http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn call(&self, req: reqwest::RequestBuilder) -> Result<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("lexical backend: {e}")))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound("index".into()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("lexical backend body: {e}")))?;
        if !status.is_success() {
            return Err(Error::BackendUnavailable(format!(
                "lexical backend returned {status}: {body}"
            )));
        }
        Ok(body)
    }
}

/// Append `path:` and `lang:` predicates to the user query.
pub fn query_with_predicates(query: &str, filter: &BackendFilter) -> String {
    let mut q = query.trim().to_string();
    if let Some(prefix) = &filter.path_prefix {
        q.push_str(&format!(" path:{prefix}"));
    }
    for lang in &filter.languages {
        q.push_str(&format!(" lang:{lang}"));
    }
    q
}

#[async_trait]
impl LexicalBackend for LexicalClient {
    async fn create_index(&self, store: &str) -> Result<()> {
        self.call(self.http.put(self.url(&format!("/indexes/{store}")))).await?;
        Ok(())
    }

    async fn drop_index(&self, store: &str) -> Result<()> {
        self.call(self.http.delete(self.url(&format!("/indexes/{store}")))).await?;
        Ok(())
    }

    async fn upsert(&self, store: &str, docs: Vec<LexicalDoc>) -> Result<()> {
        let rows: Vec<Value> = docs
            .iter()
            .map(|d| json!({ "id": d.id, "payload": d.payload }))
            .collect();
        self.call(
            self.http
                .put(self.url(&format!("/indexes/{store}/docs")))
                .json(&json!({ "docs": rows })),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, store: &str, predicate: &DeletePredicate) -> Result<()> {
        let body = match predicate {
            DeletePredicate::Ids(ids) => json!({ "ids": ids }),
            DeletePredicate::Paths(paths) => json!({ "paths": paths }),
            DeletePredicate::PathPrefix(prefix) => json!({ "path_prefix": prefix }),
        };
        self.call(self.http.post(self.url(&format!("/indexes/{store}/docs/delete"))).json(&body))
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        store: &str,
        query: &str,
        top_k: usize,
        filter: &BackendFilter,
    ) -> Result<Vec<SearchHit>> {
        let body = json!({
            "query": query_with_predicates(query, filter),
            "top_k": top_k,
        });
        let resp = self
            .call(self.http.post(self.url(&format!("/indexes/{store}/search"))).json(&body))
            .await?;
        let hits = resp["hits"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        let payload: ChunkPayload =
                            serde_json::from_value(row["payload"].clone()).ok()?;
                        Some(SearchHit {
                            id: row["id"].as_str().unwrap_or_default().to_string(),
                            score: row["score"].as_f64().unwrap_or(0.0) as f32,
                            payload,
                            dense: None,
                            snippet: row["snippet"].as_str().map(|s| s.to_string()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }

    async fn info(&self, store: &str) -> Result<CollectionInfo> {
        let resp = self.call(self.http.get(self.url(&format!("/indexes/{store}")))).await?;
        Ok(CollectionInfo { points: resp["docs"].as_u64().unwrap_or(0) as usize, dim: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_predicates() {
        let f = BackendFilter {
            path_prefix: Some("src/".into()),
            languages: vec!["rust".into(), "go".into()],
        };
        assert_eq!(
            query_with_predicates("authenticate token", &f),
            "authenticate token path:src/ lang:rust lang:go"
        );
        assert_eq!(query_with_predicates("plain", &BackendFilter::default()), "plain");
    }
}
