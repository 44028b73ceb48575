//! HTTP API: store lifecycle, indexing, search, metrics, and the model read
//! surface, mounted by `main.rs` under one axum router.
//!
//! The middleware stack normalizes paths and buckets status codes before
//! they reach the `rice_http_requests_total` labels, tracks in-flight
//! requests, and assigns an `X-Connection-ID` when the client sent none.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::bus::{EventBus, Topic};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::history::HistorySet;
use crate::indexer::Indexer;
use crate::metrics::MetricSet;
use crate::registry::{ModelRegistry, ModelType};
use crate::runtime::ModelRuntime;
use crate::search::Searcher;
use crate::stores::StoreRegistry;
use crate::types::{
    DeleteRequest, IndexRequest, SearchRequest, StoreConfig, SyncRequest,
};

pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// Shared application context handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub stores: Arc<StoreRegistry>,
    pub indexer: Arc<Indexer>,
    pub searcher: Arc<Searcher>,
    pub registry: Arc<ModelRegistry>,
    pub runtime: Arc<ModelRuntime>,
    pub metrics: Arc<MetricSet>,
    pub history: Arc<HistorySet>,
    pub bus: Arc<EventBus>,
    pub start_time: Instant,
}

/// Assemble the full router with the metrics/connection middleware applied.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/v1/metrics/history", get(metrics_history))
        .route("/v1/stores", get(list_stores).post(create_store))
        .route("/v1/stores/{store}", get(get_store).delete(delete_store))
        .route("/v1/stores/{store}/stats", get(store_stats))
        .route("/v1/stores/{store}/index", post(index_files).delete(delete_index))
        .route("/v1/stores/{store}/index/sync", post(sync_index))
        .route("/v1/stores/{store}/search", post(search))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
        .route("/v1/models/{id}/download", post(download_model))
        .route("/v1/models/defaults/{type}", put(set_default_model))
        .layer(axum::middleware::from_fn_with_state(ctx.clone(), track_http))
        .with_state(ctx)
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Collapse path parameters so label cardinality stays bounded.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["v1", "stores", _name] => "/v1/stores/{store}".to_string(),
        ["v1", "stores", _name, "stats"] => "/v1/stores/{store}/stats".to_string(),
        ["v1", "stores", _name, "index"] => "/v1/stores/{store}/index".to_string(),
        ["v1", "stores", _name, "index", "sync"] => "/v1/stores/{store}/index/sync".to_string(),
        ["v1", "stores", _name, "search"] => "/v1/stores/{store}/search".to_string(),
        ["v1", "models", _id] => "/v1/models/{id}".to_string(),
        ["v1", "models", _id, "download"] => "/v1/models/{id}/download".to_string(),
        ["v1", "models", "defaults", _t] => "/v1/models/defaults/{name}".to_string(),
        _ => path.to_string(),
    }
}

/// Exact codes for the common cases, class buckets for the rest.
pub fn status_bucket(status: StatusCode) -> String {
    match status.as_u16() {
        200 | 201 | 204 | 400 | 404 | 409 | 500 => status.as_u16().to_string(),
        s if (200..300).contains(&s) => "2xx".to_string(),
        s if (400..500).contains(&s) => "4xx".to_string(),
        s if (500..600).contains(&s) => "5xx".to_string(),
        s => s.to_string(),
    }
}

fn derive_connection_id(addr: Option<&SocketAddr>) -> String {
    use sha2::Digest;
    match addr {
        Some(a) => {
            let mut h = sha2::Sha256::new();
            h.update(a.ip().to_string().as_bytes());
            format!("conn-{}", &hex::encode(h.finalize())[..12])
        }
        None => format!("conn-{}", uuid::Uuid::new_v4().simple()),
    }
}

async fn track_http(
    State(ctx): State<AppContext>,
    mut req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let connection_id = match req.headers().get(CONNECTION_ID_HEADER) {
        Some(v) => v.to_str().unwrap_or_default().to_string(),
        None => {
            let addr = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| &c.0);
            let id = derive_connection_id(addr);
            if let Ok(value) = HeaderValue::from_str(&id) {
                req.headers_mut().insert(CONNECTION_ID_HEADER, value);
            }
            id
        }
    };

    ctx.metrics.http_in_flight.inc();
    let mut resp = next.run(req).await;
    ctx.metrics.http_in_flight.dec();

    ctx.metrics
        .http_requests
        .with(&[&method, &path, &status_bucket(resp.status())])
        .inc();
    if let Ok(value) = HeaderValue::from_str(&connection_id) {
        resp.headers_mut().insert(CONNECTION_ID_HEADER, value);
    }
    resp
}

// ---------------------------------------------------------------------------
// Health & metrics
// ---------------------------------------------------------------------------

async fn healthz(State(ctx): State<AppContext>) -> impl IntoResponse {
    let device = ctx.runtime.device();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": ctx.start_time.elapsed().as_secs(),
        "ml_device": device.actual.as_str(),
        "ml_device_requested": device.requested.as_str(),
    }))
}

async fn metrics_text(State(ctx): State<AppContext>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        ctx.metrics.registry.render(),
    )
}

#[derive(Deserialize)]
struct HistoryQuery {
    metric: Option<String>,
}

async fn metrics_history(
    State(ctx): State<AppContext>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>> {
    match q.metric {
        Some(metric) => {
            let buckets = ctx
                .history
                .snapshot(&metric)
                .ok_or_else(|| Error::NotFound(format!("history series '{metric}'")))?;
            Ok(Json(serde_json::json!({ "metric": metric, "buckets": buckets })))
        }
        None => Ok(Json(serde_json::json!({ "metrics": ctx.history.metric_names() }))),
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateStoreRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    config: Option<StoreConfig>,
}

async fn list_stores(State(ctx): State<AppContext>) -> impl IntoResponse {
    Json(ctx.stores.list())
}

async fn create_store(
    State(ctx): State<AppContext>,
    Json(body): Json<CreateStoreRequest>,
) -> Result<impl IntoResponse> {
    let meta = ctx.stores.create(&body.name, &body.description, body.config).await?;
    Ok((StatusCode::CREATED, Json(meta)))
}

async fn get_store(
    State(ctx): State<AppContext>,
    Path(store): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(ctx.stores.get(&store)?.meta()))
}

#[derive(Deserialize)]
struct ConfirmQuery {
    #[serde(default)]
    confirm: bool,
}

async fn delete_store(
    State(ctx): State<AppContext>,
    Path(store): Path<String>,
    Query(q): Query<ConfirmQuery>,
) -> Result<impl IntoResponse> {
    ctx.stores.delete(&store, q.confirm).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn store_stats(
    State(ctx): State<AppContext>,
    Path(store): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(ctx.stores.stats(&store)?))
}

// ---------------------------------------------------------------------------
// Indexing
// ---------------------------------------------------------------------------

async fn index_files(
    State(ctx): State<AppContext>,
    Path(store): Path<String>,
    Json(body): Json<IndexRequest>,
) -> Result<impl IntoResponse> {
    if body.files.is_empty() {
        return Err(Error::Validation("files must not be empty".into()));
    }
    let resp = ctx.indexer.index(&store, body.files, body.force).await?;
    Ok(Json(resp))
}

async fn delete_index(
    State(ctx): State<AppContext>,
    Path(store): Path<String>,
    Json(body): Json<DeleteRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(ctx.indexer.delete(&store, &body).await?))
}

async fn sync_index(
    State(ctx): State<AppContext>,
    Path(store): Path<String>,
    Json(body): Json<SyncRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(ctx.indexer.sync(&store, &body.current_paths).await?))
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

async fn search(
    State(ctx): State<AppContext>,
    Path(store): Path<String>,
    Json(body): Json<SearchRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(ctx.searcher.search(&store, body).await?))
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ModelListQuery {
    #[serde(rename = "type")]
    model_type: Option<String>,
}

fn parse_model_type(s: &str) -> Result<ModelType> {
    match s {
        "embed" => Ok(ModelType::Embed),
        "rerank" => Ok(ModelType::Rerank),
        "query_understand" => Ok(ModelType::QueryUnderstand),
        other => Err(Error::Validation(format!("unknown model type '{other}'"))),
    }
}

async fn list_models(
    State(ctx): State<AppContext>,
    Query(q): Query<ModelListQuery>,
) -> Result<impl IntoResponse> {
    let filter = q.model_type.as_deref().map(parse_model_type).transpose()?;
    Ok(Json(ctx.registry.list(filter).await))
}

async fn get_model(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(ctx.registry.get(&id).await?))
}

/// Kick off a download; progress is observable on the bus as
/// `model.progress` events.
async fn download_model(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let mut rx = Arc::clone(&ctx.registry).download(&id).await?;
    let bus = Arc::clone(&ctx.bus);
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            let payload = serde_json::to_value(&progress).unwrap_or_default();
            bus.emit(Topic::ModelProgress, "registry", payload).await;
        }
    });
    info!(model = id.as_str(), "model download started");
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "downloading", "model": id }))))
}

#[derive(Deserialize)]
struct SetDefaultRequest {
    id: String,
}

async fn set_default_model(
    State(ctx): State<AppContext>,
    Path(model_type): Path<String>,
    Json(body): Json<SetDefaultRequest>,
) -> Result<impl IntoResponse> {
    let t = parse_model_type(&model_type)?;
    ctx.registry.set_default(t, &body.id).await?;
    Ok(Json(serde_json::json!({ "type": model_type, "default": body.id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_collapses_params() {
        assert_eq!(normalize_path("/v1/stores/my-store"), "/v1/stores/{store}");
        assert_eq!(normalize_path("/v1/stores/abc/search"), "/v1/stores/{store}/search");
        assert_eq!(normalize_path("/v1/stores/abc/index/sync"), "/v1/stores/{store}/index/sync");
        assert_eq!(normalize_path("/v1/models/bge-small"), "/v1/models/{id}");
        assert_eq!(normalize_path("/v1/models/defaults/embed"), "/v1/models/defaults/{name}");
        assert_eq!(normalize_path("/healthz"), "/healthz");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_status_buckets() {
        assert_eq!(status_bucket(StatusCode::OK), "200");
        assert_eq!(status_bucket(StatusCode::NOT_FOUND), "404");
        assert_eq!(status_bucket(StatusCode::ACCEPTED), "2xx");
        assert_eq!(status_bucket(StatusCode::TOO_MANY_REQUESTS), "4xx");
        assert_eq!(status_bucket(StatusCode::BAD_GATEWAY), "5xx");
    }

    #[test]
    fn test_connection_id_is_stable_per_ip() {
        let a: SocketAddr = "10.1.2.3:1111".parse().unwrap();
        let b: SocketAddr = "10.1.2.3:9999".parse().unwrap();
        let c: SocketAddr = "10.9.9.9:1111".parse().unwrap();
        assert_eq!(derive_connection_id(Some(&a)), derive_connection_id(Some(&b)));
        assert_ne!(derive_connection_id(Some(&a)), derive_connection_id(Some(&c)));
        assert!(derive_connection_id(Some(&a)).starts_with("conn-"));
    }
}
