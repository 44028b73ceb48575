//! Rice Search binary — thin CLI shell over the [`rice_server`] library.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use rice_server::analyzer::QueryAnalyzer;
use rice_server::api::{router, AppContext};
use rice_server::bus::EventBus;
use rice_server::config::{Config, DeviceKind};
use rice_server::embed::Embedder;
use rice_server::history::{wire_history, Aggregation, HistorySet};
use rice_server::indexer::Indexer;
use rice_server::lexical::LexicalClient;
use rice_server::metrics::MetricSet;
use rice_server::qdrant::QdrantClient;
use rice_server::registry::ModelRegistry;
use rice_server::rerank::CrossEncoder;
use rice_server::retrieval::RetrieverSet;
use rice_server::runtime::ModelRuntime;
use rice_server::search::Searcher;
use rice_server::sparse::SparseEncoder;
use rice_server::stores::StoreRegistry;

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Self-hosted hybrid document and code search engine.
#[derive(Parser)]
#[command(name = "rice", version, about, long_about = None)]
struct Cli {
    /// Bind address (overrides RICE_ADDR)
    #[arg(long)]
    addr: Option<String>,

    /// Vector backend base URL (overrides RICE_QDRANT_URL)
    #[arg(long)]
    qdrant_url: Option<String>,

    /// Lexical backend base URL (overrides RICE_LEXICAL_URL)
    #[arg(long)]
    lexical_url: Option<String>,

    /// Redis URL for metrics history retention (overrides RICE_REDIS_URL)
    #[arg(long)]
    redis_url: Option<String>,

    /// ML device: cpu, cuda, tensorrt, or stub
    #[arg(long)]
    ml_device: Option<String>,

    /// Models directory (overrides RICE_MODELS_DIR)
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Deterministic in-process ML sessions (CI / tests)
    #[arg(long)]
    mock_ml: bool,

    /// Enable the model-based query analyzer (heuristics otherwise)
    #[arg(long)]
    model_analyzer: bool,
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rice=info".parse().unwrap())
                .add_directive("rice_server=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };
    if let Some(addr) = cli.addr {
        config.addr = addr;
    }
    if let Some(url) = cli.qdrant_url {
        config.qdrant_url = url;
    }
    if let Some(url) = cli.lexical_url {
        config.lexical_url = url;
    }
    if let Some(url) = cli.redis_url {
        config.redis_url = Some(url);
    }
    if let Some(device) = cli.ml_device {
        config.ml_device = match DeviceKind::parse(&device) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "invalid --ml-device");
                std::process::exit(2);
            }
        };
    }
    if let Some(dir) = cli.models_dir {
        config.models_dir = dir;
    }
    if cli.mock_ml {
        config.mock_ml = true;
    }

    // -----------------------------------------------------------------------
    // Explicit construction — no ambient globals. Everything below is wired
    // once and passed by reference.
    // -----------------------------------------------------------------------

    let metrics = Arc::new(MetricSet::new());
    let bus = Arc::new(EventBus::new(Arc::clone(&metrics)));

    let mut history = HistorySet::new(config.history_bucket, config.history_retention);
    if let Some(url) = &config.redis_url {
        history.connect_redis(url).await;
    }
    let history = Arc::new(history);
    for (name, mode) in [
        ("search_latency_ms", Aggregation::Mean),
        ("search_requests", Aggregation::Sum),
        ("index_latency_ms", Aggregation::Mean),
        ("index_documents", Aggregation::Sum),
    ] {
        history.preload(name, mode).await;
    }
    wire_history(&bus, &history).await;

    let registry = match ModelRegistry::open(&config.models_dir).await {
        Ok(r) => Arc::new(r.with_exporter(config.exporter_bin.clone())),
        Err(e) => {
            error!(error = %e, dir = %config.models_dir.display(), "cannot open model registry");
            std::process::exit(1);
        }
    };

    let runtime = Arc::new(ModelRuntime::new(&config, Arc::clone(&registry), Arc::clone(&metrics)));
    Arc::clone(&runtime).start_sweeper();

    let embedder = Arc::new(Embedder::new(
        Arc::clone(&runtime),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        config.embed_batch_size,
    ));
    let sparse_encoder = Arc::new(SparseEncoder::new(Arc::clone(&runtime), Arc::clone(&bus)));
    let reranker = Arc::new(CrossEncoder::new(Arc::clone(&runtime), Arc::clone(&bus)));

    let vector = match QdrantClient::new(&config.qdrant_url, config.search_timeout) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "cannot build vector backend client");
            std::process::exit(1);
        }
    };
    let lexical = match LexicalClient::new(&config.lexical_url, config.search_timeout) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "cannot build lexical backend client");
            std::process::exit(1);
        }
    };

    let stores = Arc::new(StoreRegistry::new(
        vector.clone(),
        lexical.clone(),
        Arc::clone(&bus),
        config.embedding_dim,
    ));
    let indexer = Arc::new(Indexer::new(
        Arc::clone(&stores),
        vector.clone(),
        lexical.clone(),
        Arc::clone(&embedder),
        Arc::clone(&sparse_encoder),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        config.index_workers,
        config.max_file_bytes,
    ));
    let retrievers = Arc::new(RetrieverSet::new(
        vector,
        lexical,
        Arc::clone(&embedder),
        Arc::clone(&sparse_encoder),
        Arc::clone(&bus),
        Arc::clone(&metrics),
        config.sparse_topk,
        config.dense_topk,
    ));
    let analyzer = if cli.model_analyzer {
        QueryAnalyzer::with_model(Arc::clone(&runtime))
    } else {
        QueryAnalyzer::heuristic()
    };
    let searcher = Arc::new(Searcher::new(
        Arc::clone(&stores),
        retrievers,
        reranker,
        Arc::clone(&embedder),
        analyzer,
        Arc::clone(&bus),
        Arc::clone(&metrics),
        config.search_timeout,
        config.rerank_timeout,
    ));

    let ctx = AppContext {
        config: Arc::new(config.clone()),
        stores,
        indexer,
        searcher,
        registry,
        runtime: Arc::clone(&runtime),
        metrics,
        history,
        bus: Arc::clone(&bus),
        start_time: Instant::now(),
    };

    let app = router(ctx).layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive());

    // Bind: exact address from config; when it carries the default port and
    // that port is busy, scan a small range like any polite local daemon.
    let listener = bind_listener(&config.addr).await.unwrap_or_else(|| {
        error!(addr = config.addr.as_str(), "could not bind");
        std::process::exit(1);
    });
    let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
    info!(port, device = runtime.device().actual.as_str(), "rice-search listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "server error");
        });

    // Drain telemetry and release sessions before exiting.
    bus.close(Duration::from_secs(5)).await;
    runtime.shutdown().await;
    info!("shutdown complete");
}

async fn bind_listener(addr: &str) -> Option<tokio::net::TcpListener> {
    if let Ok(l) = tokio::net::TcpListener::bind(addr).await {
        return Some(l);
    }
    let (host, port) = addr.rsplit_once(':')?;
    let base: u16 = port.parse().ok()?;
    for candidate in base + 1..base + 10 {
        if let Ok(l) = tokio::net::TcpListener::bind(format!("{host}:{candidate}")).await {
            info!(port = candidate, "default port busy, using fallback");
            return Some(l);
        }
    }
    None
}
