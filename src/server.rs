//! HTTP server.
//!
//! Exposes retrieval, prompt rendering, context assembly and streamed chat
//! as a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version, never rate limited) |
//! | `GET`  | `/search?q=&top_k=` | Fused lexical + vector search (cached) |
//! | `GET`  | `/prompts` | Every registered prompt version (cached) |
//! | `GET`  | `/prompts/{name}?version=` | One prompt version, latest by default (cached) |
//! | `POST` | `/prompts/{name}/render` | Render a prompt with placeholder values |
//! | `POST` | `/context` | Token-budgeted context for a profile, history and results |
//! | `POST` | `/chat` | Streamed answer: SSE by default, `text/plain` when `stream: false` |
//!
//! # Request pipeline
//!
//! ```text
//! request ─▶ CORS ─▶ body limit ─▶ rate limit ─▶ cache (GET routes) ─▶ handler
//! ```
//!
//! # Error Contract
//!
//! ```json
//! { "success": false, "error": { "code": "rate_limited", "message": "...", "details": { "retryAfter": 12 } } }
//! ```
//!
//! Error codes: `validation_error` (400), `unauthorized` (401), `forbidden`
//! (403), `not_found` (404), `rate_limited` (429), `internal_error` (500).
//! Once a chat stream has started, failures arrive in-band as a final
//! `{"error": ...}` event instead.

use axum::{
    body::Body,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, Path, Query, Request, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

use context_relay_core::audit::{self, AuditEvent, AuditOutcome};
use context_relay_core::budget::BudgetedContext;
use context_relay_core::cache::{cache_key, is_cacheable, CachedResponse, ResponseCache};
use context_relay_core::clock::{Clock, SystemClock};
use context_relay_core::fusion::FusionWeights;
use context_relay_core::models::SearchResult;
use context_relay_core::prompt::{PromptContext, PromptVersion, RenderedPrompt};
use context_relay_core::rate_limit::{FixedWindowLimiter, RateLimitDecision};
use context_relay_core::store::memory::InMemoryKvStore;
use context_relay_core::store::KeyValueStore;
use context_relay_core::RelayError;

use crate::config::Config;
use crate::generator::{DisabledGenerator, Generator};
use crate::relay::{ChatRequest, ContextRequest, Relay};
use crate::streaming::{plain_text_response, sse_response};

/// Client key used when no identity header is present.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Derives the rate-limit / audit key from request headers.
pub type ClientKeyFn = Arc<dyn Fn(&HeaderMap) -> String + Send + Sync>;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    relay: Arc<Relay>,
    store: Arc<dyn KeyValueStore>,
    limiter: Option<Arc<FixedWindowLimiter>>,
    cache: Option<Arc<ResponseCache>>,
    client_key: ClientKeyFn,
    max_body_bytes: usize,
}

impl AppState {
    /// State backed by one in-memory store shared by the limiter and cache.
    pub fn new(config: &Config, relay: Arc<Relay>, clock: Arc<dyn Clock>) -> Self {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let limiter = config.rate_limit.enabled.then(|| {
            Arc::new(FixedWindowLimiter::new(
                store.clone(),
                clock.clone(),
                config.rate_limit.limiter_config(),
            ))
        });
        let cache = config.cache.enabled.then(|| {
            Arc::new(ResponseCache::new(
                store.clone(),
                Duration::from_secs(config.cache.ttl_secs),
            ))
        });

        Self {
            relay,
            store,
            limiter,
            cache,
            client_key: header_client_key(&config.rate_limit.key_header),
            max_body_bytes: config.server.max_body_bytes,
        }
    }

    /// Replace how client keys are derived.
    pub fn with_client_key(mut self, client_key: ClientKeyFn) -> Self {
        self.client_key = client_key;
        self
    }

    /// Drop expired rate-limit and cache entries.
    pub async fn sweep(&self) -> usize {
        match &self.limiter {
            Some(limiter) => limiter.sweep().await,
            None => self.store.purge_expired().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "store sweep failed");
                0
            }),
        }
    }
}

/// Key from `header`, then the first `x-forwarded-for` entry, then
/// [`ANONYMOUS_CLIENT`].
pub fn header_client_key(header: &str) -> ClientKeyFn {
    let header = header.to_ascii_lowercase();
    Arc::new(move |headers: &HeaderMap| {
        let from = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        from(header.as_str())
            .or_else(|| from("x-forwarded-for"))
            .unwrap_or_else(|| ANONYMOUS_CLIENT.to_string())
    })
}

/// Starts the HTTP server with no generation provider.
///
/// `/chat` answers with `internal_error` until a provider is wired in via
/// [`run_server_with_generator`]; every other route works.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_with_generator(config, Arc::new(DisabledGenerator)).await
}

/// Starts the HTTP server with a custom [`Generator`].
///
/// # Example
///
/// ```rust,no_run
/// use context_relay::server::run_server_with_generator;
/// use context_relay::generator::DisabledGenerator;
/// use std::sync::Arc;
///
/// # async fn example(config: &context_relay::config::Config) -> anyhow::Result<()> {
/// // Replace DisabledGenerator with a provider client.
/// run_server_with_generator(config, Arc::new(DisabledGenerator)).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_server_with_generator(
    config: &Config,
    generator: Arc<dyn Generator>,
) -> anyhow::Result<()> {
    let relay = Arc::new(Relay::from_config(config, generator).await?);
    let state = AppState::new(config, relay, Arc::new(SystemClock));

    spawn_sweeper(
        state.clone(),
        Duration::from_secs(config.rate_limit.sweep_interval_secs.max(1)),
    );

    let app = build_router(state);

    tracing::info!(bind = %config.server.bind, "relay server listening");

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_sweeper(state: AppState, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.sweep().await;
        }
    })
}

/// Assemble the router with all middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let cached = Router::new()
        .route("/search", get(handle_search))
        .route("/prompts", get(handle_list_prompts))
        .route("/prompts/{name}", get(handle_get_prompt))
        .route_layer(middleware::from_fn_with_state(state.clone(), cache_middleware));

    Router::new()
        .route("/health", get(handle_health))
        .route("/prompts/{name}/render", post(handle_render))
        .route("/context", post(handle_context))
        .route("/chat", post(handle_chat))
        .merge(cached)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

/// A [`RelayError`] rendered as the uniform JSON error envelope.
pub struct AppError(pub RelayError);

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }

        let details = match &err {
            RelayError::Validation { fields, .. } if !fields.is_empty() => {
                Some(json!({ "fields": fields }))
            }
            RelayError::RateLimited { retry_after } => Some(json!({ "retryAfter": retry_after })),
            _ => None,
        };

        let body = ErrorBody {
            success: false,
            error: ErrorDetail {
                code: err.code(),
                message: err.to_string(),
                details,
            },
        };
        let mut response = (status, Json(body)).into_response();
        if let RelayError::RateLimited { retry_after } = err {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
        }
        response
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| RelayError::invalid_field("body", rejection.body_text()).into())
}

fn query_params<T>(params: Result<Query<T>, QueryRejection>) -> Result<T, AppError> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| RelayError::invalid_field("query", rejection.body_text()).into())
}

// ============ Middleware ============

async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(limiter) = state.limiter.clone() else {
        return next.run(request).await;
    };
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let key = (state.client_key)(request.headers());
    let decision = limiter.admit(&key).await;

    if !decision.allowed {
        let retry_after = decision.retry_after_secs.unwrap_or(0);
        let path = request.uri().path().to_string();
        audit::record(
            state.relay.audit_sink(),
            AuditEvent::new("rate_limit", &key, path, AuditOutcome::Denied)
                .with_detail(format!("retry after {retry_after}s")),
        )
        .await;
        let mut response = AppError(RelayError::RateLimited { retry_after }).into_response();
        set_rate_limit_headers(&mut response, &decision);
        return response;
    }

    let mut response = next.run(request).await;
    set_rate_limit_headers(&mut response, &decision);
    response
}

fn set_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
}

async fn cache_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(cache) = state.cache.clone() else {
        return next.run(request).await;
    };
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let key = cache_key(
        request.method().as_str(),
        request.uri().path(),
        request.uri().query(),
    );
    if let Some(hit) = cache.get(&key).await {
        return cached_response(hit);
    }

    let response = next.run(request).await;
    if !is_cacheable(Method::GET.as_str(), response.status().as_u16()) {
        return with_cache_status(response, "MISS");
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return AppError(RelayError::Internal(format!("failed to buffer response: {e}")))
                .into_response();
        }
    };

    let stored = CachedResponse {
        status: parts.status.as_u16(),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body: bytes.to_vec(),
    };
    cache.set(&key, &stored).await;

    if let Ok(max_age) = HeaderValue::from_str(&format!("max-age={}", cache.ttl().as_secs())) {
        parts.headers.insert(header::CACHE_CONTROL, max_age);
    }
    with_cache_status(Response::from_parts(parts, Body::from(bytes)), "MISS")
}

fn cached_response(hit: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(hit.body));
    *response.status_mut() = StatusCode::from_u16(hit.status).unwrap_or(StatusCode::OK);
    let headers = response.headers_mut();
    for (name, value) in &hit.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    with_cache_status(response, "HIT")
}

fn with_cache_status(mut response: Response, status: &'static str) -> Response {
    response
        .headers_mut()
        .insert("x-cache", HeaderValue::from_static(status));
    response
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /search ============

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    query: String,
    weights: FusionWeights,
    results: Vec<SearchResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let params = query_params(params)?;
    let results = state.relay.search(&params.q, params.top_k).await?;
    Ok(Json(SearchResponse {
        query: params.q,
        weights: state.relay.weights(),
        results,
    }))
}

// ============ GET /prompts ============

#[derive(Serialize)]
struct PromptListResponse {
    prompts: Vec<PromptVersion>,
}

async fn handle_list_prompts(State(state): State<AppState>) -> Json<PromptListResponse> {
    Json(PromptListResponse {
        prompts: state.relay.prompts().list(),
    })
}

// ============ GET /prompts/{name} ============

#[derive(Deserialize)]
struct VersionParams {
    #[serde(default)]
    version: Option<String>,
}

async fn handle_get_prompt(
    State(state): State<AppState>,
    Path(name): Path<String>,
    params: Result<Query<VersionParams>, QueryRejection>,
) -> Result<Json<PromptVersion>, AppError> {
    let params = query_params(params)?;
    Ok(Json(
        state.relay.get_prompt(&name, params.version.as_deref())?,
    ))
}

// ============ POST /prompts/{name}/render ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderRequest {
    input: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default, flatten)]
    context: PromptContext,
}

async fn handle_render(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<RenderRequest>, JsonRejection>,
) -> Result<Json<RenderedPrompt>, AppError> {
    let request = json_body(payload)?;
    if request.input.trim().is_empty() {
        return Err(RelayError::invalid_field("input", "must not be empty").into());
    }
    Ok(Json(state.relay.render(
        &name,
        &request.input,
        &request.context,
        request.version.as_deref(),
    )?))
}

// ============ POST /context ============

async fn handle_context(
    State(state): State<AppState>,
    payload: Result<Json<ContextRequest>, JsonRejection>,
) -> Result<Json<BudgetedContext>, AppError> {
    let request = json_body(payload)?;
    Ok(Json(state.relay.build_context(&request).await?))
}

// ============ POST /chat ============

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let request = json_body(payload)?;
    let client_key = (state.client_key)(&headers);
    let stream = state.relay.answer(&request, &client_key).await?;

    Ok(if request.wants_events() {
        sse_response(stream)
    } else {
        plain_text_response(stream)
    })
}
