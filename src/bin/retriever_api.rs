use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use lru::LruCache;
use secretrag::{QueryOptions, RagCoordinator, RagError, RetrievedChunk};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[path = "shared/mod.rs"]
mod shared;

use shared::{init_tracing, ConnectionArgs, EmbedderArgs};

#[derive(Parser, Debug)]
#[command(
    name = "secretrag-api",
    about = "HTTP API answering retrieval queries over secret-shared storage nodes"
)]
struct ApiCli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "SECRETRAG_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Default chunk count when the client does not override it.
    #[arg(long, default_value_t = 2)]
    default_num_chunks: usize,

    /// Maximum chunk count allowed per request.
    #[arg(long, default_value_t = 10)]
    max_num_chunks: usize,

    /// Default nearest clusters searched when clustering is configured.
    #[arg(long, default_value_t = 1)]
    default_num_clusters: usize,

    /// Answer from responsive nodes instead of failing when one is unavailable.
    #[arg(long, default_value_t = false)]
    allow_degraded: bool,

    /// Max cached query embeddings kept in-memory (0 disables caching).
    #[arg(long, default_value_t = 1024)]
    embedding_cache_size: usize,

    /// Max requests per minute allowed (0 disables rate limiting).
    #[arg(long, default_value_t = 120)]
    max_requests_per_minute: u32,

    /// Rate-limit burst size (tokens available instantly).
    #[arg(long, default_value_t = 12)]
    rate_limit_burst: u32,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

#[derive(Clone)]
struct AppState {
    coordinator: Arc<RagCoordinator>,
    defaults: QueryOptions,
    max_num_chunks: usize,
    embedding_cache: Option<Arc<Mutex<LruCache<String, Vec<f32>>>>>,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Deserialize)]
struct QueryRequest {
    query: String,
    #[serde(default)]
    num_chunks: Option<usize>,
    #[serde(default)]
    num_clusters: Option<usize>,
}

#[derive(Debug, Serialize)]
struct QueryResponse {
    chunks: Vec<RetrievedChunk>,
    meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
struct ResponseMeta {
    num_chunks: usize,
    num_clusters: usize,
    nodes: usize,
    latency_ms: f64,
    embedding_cached: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = ApiCli::parse();
    let config = cli.connection.load_config()?;
    let defaults = QueryOptions {
        num_chunks: cli.default_num_chunks.max(1),
        num_clusters: cli.default_num_clusters,
        allow_degraded: cli.allow_degraded,
    };
    let coordinator = RagCoordinator::new(
        &config,
        &cli.connection.session_options(),
        cli.embedder.build()?,
        defaults,
    )
    .context("failed to build coordinator")?;

    let state = AppState {
        coordinator: Arc::new(coordinator),
        defaults,
        max_num_chunks: cli.max_num_chunks.max(1),
        embedding_cache: build_cache(cli.embedding_cache_size),
        rate_limiter: RateLimiter::new(cli.max_requests_per_minute, cli.rate_limit_burst),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/query", post(query_handler))
        .with_state(state);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    info!(%addr, nodes = config.nodes.len(), "secretrag-api listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .await
        .context("server shutdown")?;
    Ok(())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, (StatusCode, Json<ErrorBody>)> {
    if request.query.trim().is_empty() {
        return Err(bad_request("query text must not be empty"));
    }
    if let Some(limiter) = &state.rate_limiter {
        if !limiter.acquire().await {
            return Err(too_many_requests("rate limit exceeded"));
        }
    }
    let options = QueryOptions {
        num_chunks: request
            .num_chunks
            .unwrap_or(state.defaults.num_chunks)
            .clamp(1, state.max_num_chunks),
        num_clusters: request.num_clusters.unwrap_or(state.defaults.num_clusters),
        allow_degraded: state.defaults.allow_degraded,
    };
    let start = Instant::now();
    let (embedding, embedding_cached) = embed_query(&state, request.query.trim().to_string())
        .await
        .map_err(rag_error)?;
    let chunks = state
        .coordinator
        .query()
        .search(state.coordinator.session(), &embedding, options)
        .await
        .map_err(rag_error)?;
    Ok(Json(QueryResponse {
        chunks,
        meta: ResponseMeta {
            num_chunks: options.num_chunks,
            num_clusters: options.num_clusters,
            nodes: state.coordinator.registry().len(),
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
            embedding_cached,
        },
    }))
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    error_response(StatusCode::BAD_REQUEST, message)
}

fn too_many_requests(message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    error_response(StatusCode::TOO_MANY_REQUESTS, message)
}

fn rag_error(err: RagError) -> (StatusCode, Json<ErrorBody>) {
    let status = match &err {
        RagError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        RagError::NoResults => StatusCode::NOT_FOUND,
        RagError::NodeUnavailable { .. } | RagError::Transport { .. } | RagError::Protocol { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %err, "query failed");
    }
    error_response(status, err.to_string())
}

fn error_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            message: message.into(),
        }),
    )
}

async fn embed_query(state: &AppState, query: String) -> Result<(Vec<f32>, bool), RagError> {
    if let Some(cache) = &state.embedding_cache {
        if let Some(hit) = {
            let mut guard = cache.lock().await;
            guard.get(&query).cloned()
        } {
            return Ok((hit, true));
        }
    }
    let embedding = state.coordinator.query().embed_query(&query).await?;
    if let Some(cache) = &state.embedding_cache {
        let mut guard = cache.lock().await;
        guard.put(query, embedding.clone());
    }
    Ok((embedding, false))
}

fn build_cache(capacity: usize) -> Option<Arc<Mutex<LruCache<String, Vec<f32>>>>> {
    NonZeroUsize::new(capacity).map(|cap| Arc::new(Mutex::new(LruCache::new(cap))))
}

#[derive(Clone)]
struct RateLimiter {
    state: Arc<Mutex<RateState>>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(max_per_minute: u32, burst: u32) -> Option<Self> {
        if max_per_minute == 0 || burst == 0 {
            return None;
        }
        let capacity = burst as f64;
        Some(Self {
            state: Arc::new(Mutex::new(RateState {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
            capacity,
            refill_per_sec: max_per_minute as f64 / 60.0,
        })
    }

    async fn acquire(&self) -> bool {
        let mut guard = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
        guard.last_refill = now;
        guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if guard.tokens >= 1.0 {
            guard.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
