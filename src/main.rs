mod config;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod registry;
mod review;
mod security;
mod services;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Extension, Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{delete, get, patch, post},
};
use idempotency::IdempotencyCache;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    AddPhotosRequest, ApiError, CoverRequest, CreateRunRequest, DraftPatch, JumpRequest,
    RunSnapshot,
};
use pipeline::run::{DraftError, IngestOptions, PipelineRun, ProductDraft, RunStage};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use registry::{RunHandle, RunRegistry};
use review::{CursorState, ReviewError, ReviewOutcome};
use security::{OperatorAuth, OperatorContext, require_operator};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "hermes.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let pipeline = Pipeline::from_env();
    let (queue, _worker) = jobs::IngestQueue::spawn(pipeline.clone());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre::eyre!("prometheus recorder: {err}"))?;

    let registry = RunRegistry::new();
    let _sweeper = registry.spawn_sweeper(
        Duration::from_secs(config::env_u64("RUN_IDLE_TTL_SECS", 3600)),
        Duration::from_secs(config::env_u64("RUN_SWEEP_INTERVAL_SECS", 60).max(1)),
    );

    let state = AppState {
        pipeline,
        queue,
        registry,
        idempotency: IdempotencyCache::from_env(),
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
    };
    let app = build_router(state, OperatorAuth::from_env());

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "hermes.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::IngestQueue,
    registry: RunRegistry,
    idempotency: IdempotencyCache,
    openapi: Arc<Value>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth: OperatorAuth) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/runs", post(create_run))
        .route("/runs/{id}", get(get_run).delete(delete_run))
        .route("/runs/{id}/photos", post(add_photos))
        .route("/runs/{id}/photos/{index}", delete(remove_photo))
        .route("/runs/{id}/ingest", post(enqueue_ingest))
        .route("/runs/{id}/drafts/{index}", patch(patch_draft))
        .route("/runs/{id}/drafts/{index}/cover", post(set_cover))
        .nest(
            "/runs/{id}/review",
            Router::new()
                .route("/save", post(review_save))
                .route("/skip", post(review_skip))
                .route("/jump", post(review_jump)),
        )
        .route_layer(middleware::from_fn_with_state(auth, require_operator));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(config::env_usize(
            "REQUEST_MAX_BYTES",
            32 * 1024 * 1024,
        )))
}

fn load_openapi() -> Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({ "openapi": "3.0.3" }))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "hermes-bulk-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(PipelineError::invalid_input("docs", "unauthorized").into());
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Hermes Bulk Ingest Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#,
    )
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn decode_photos(
    request: &AddPhotosRequest,
    already: usize,
    max_photos: usize,
) -> Result<Vec<(Vec<u8>, Option<String>)>, AppError> {
    if already + request.photos.len() > max_photos {
        return Err(PipelineError::invalid_input(
            "photos",
            format!("a run holds at most {max_photos} photos"),
        )
        .into());
    }
    request
        .photos
        .iter()
        .enumerate()
        .map(|(i, photo)| -> Result<(Vec<u8>, Option<String>), AppError> {
            let bytes = photo.decode().map_err(|err| {
                PipelineError::invalid_input("photos", format!("photo {i}: {err}"))
            })?;
            if bytes.is_empty() {
                return Err(PipelineError::invalid_input("photos", format!("photo {i} is empty")).into());
            }
            Ok((bytes, photo.filename.clone()))
        })
        .collect()
}

/// Open a run, optionally with its first photos.
///
/// - Method: `POST`
/// - Path: `/runs`
/// - Auth: `Authorization: Bearer <key>` or `X-Hermes-Key: <key>`
/// - Body: `{ photos: [{ data_base64, filename? }] }`
/// - Response: `RunSnapshot`; replayed for a repeated `Idempotency-Key`
async fn create_run(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    headers: HeaderMap,
    Json(payload): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    metrics::inc_requests("/runs");
    let cache_key = idempotency_key(&headers).map(|key| format!("runs:{}:{key}", operator.operator_id));
    if let Some(key) = &cache_key
        && let Some(existing) = state.idempotency.get::<Value>(key).await
    {
        return Ok((StatusCode::OK, Json(existing)));
    }

    let photos = decode_photos(&payload, 0, state.pipeline.config.max_photos)?;
    let mut run = PipelineRun::new(operator.operator_id.clone());
    for (bytes, filename) in photos {
        run.add_photo(bytes, filename);
    }
    let snapshot = run.snapshot();
    info!(
        target = "hermes.api",
        operator = %operator.operator_id,
        api_key = %operator.api_key_id,
        run_id = %run.id(),
        photos = run.photos().len(),
        "run_created"
    );
    state.registry.insert(run).await;

    let body = serde_json::to_value(&snapshot)
        .map_err(|err| PipelineError::internal("runs", err.to_string()))?;
    if let Some(key) = &cache_key {
        state.idempotency.put(key, &body).await;
    }
    Ok((StatusCode::CREATED, Json(body)))
}

async fn owned_run(
    state: &AppState,
    id: &str,
    operator: &OperatorContext,
) -> Result<RunHandle, AppError> {
    let Ok(uuid) = Uuid::parse_str(id) else {
        return Err(PipelineError::invalid_input("runs", "invalid_run_id").into());
    };
    match state.registry.get(uuid).await {
        Some(handle) if handle.owner == operator.operator_id => Ok(handle),
        _ => Err(PipelineError::not_found("runs", "run not found").into()),
    }
}

fn busy(handle: &RunHandle) -> AppError {
    PipelineError::conflict(
        "runs",
        format!("run is busy ({:?})", handle.current_stage()),
    )
    .into()
}

/// Run snapshot. While the ingest worker holds the run only the stage is
/// reported (`busy: true`).
async fn get_run(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> Result<Json<RunSnapshot>, AppError> {
    metrics::inc_requests("/runs/{id}");
    let handle = owned_run(&state, &id, &operator).await?;
    let snapshot = match handle.run.try_lock() {
        Ok(run) => run.snapshot(),
        Err(_) => RunSnapshot::busy(handle.id.to_string(), handle.current_stage()),
    };
    Ok(Json(snapshot))
}

async fn add_photos(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
    Json(payload): Json<AddPhotosRequest>,
) -> Result<Json<RunSnapshot>, AppError> {
    metrics::inc_requests("/runs/{id}/photos");
    let handle = owned_run(&state, &id, &operator).await?;
    let mut run = handle.run.try_lock().map_err(|_| busy(&handle))?;
    if run.stage() != RunStage::Selecting {
        return Err(PipelineError::conflict("photos", "photos can only change during selection").into());
    }
    let photos = decode_photos(&payload, run.photos().len(), state.pipeline.config.max_photos)?;
    for (bytes, filename) in photos {
        run.add_photo(bytes, filename);
    }
    Ok(Json(run.snapshot()))
}

async fn remove_photo(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path((id, index)): Path<(String, usize)>,
) -> Result<Json<RunSnapshot>, AppError> {
    metrics::inc_requests("/runs/{id}/photos/{index}");
    let handle = owned_run(&state, &id, &operator).await?;
    let mut run = handle.run.try_lock().map_err(|_| busy(&handle))?;
    if run.stage() != RunStage::Selecting {
        return Err(PipelineError::conflict("photos", "photos can only change during selection").into());
    }
    run.remove_photo(index)
        .ok_or_else(|| PipelineError::not_found("photos", format!("no photo at index {index}")))?;
    Ok(Json(run.snapshot()))
}

/// Queue the ingestion of the selected photos. The work happens on the
/// background worker; poll `GET /runs/{id}` for progress.
async fn enqueue_ingest(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
    Json(options): Json<IngestOptions>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    metrics::inc_requests("/runs/{id}/ingest");
    let handle = owned_run(&state, &id, &operator).await?;
    let mut run = handle.run.try_lock().map_err(|_| busy(&handle))?;
    state.queue.enqueue(&handle.run, &mut run, options)?;
    info!(target = "hermes.api", run_id = %handle.id, photos = run.photos().len(), "ingest_enqueued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": handle.id.to_string(), "stage": run.stage() })),
    ))
}

fn reviewing_draft<'a>(
    run: &'a mut PipelineRun,
    index: usize,
) -> Result<&'a mut ProductDraft, AppError> {
    if run.stage() != RunStage::Reviewing {
        return Err(PipelineError::conflict("drafts", "run is not under review").into());
    }
    let len = run.drafts().len();
    let draft = run
        .draft_mut(index)
        .ok_or_else(|| PipelineError::not_found("drafts", format!("draft {index} of {len}")))?;
    if draft.status.is_final() {
        return Err(ReviewError::AlreadyFinal(index).into());
    }
    Ok(draft)
}

/// Edit a draft under review: fields, category, recipient and schedule.
async fn patch_draft(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path((id, index)): Path<(String, usize)>,
    Json(patch): Json<DraftPatch>,
) -> Result<Json<ProductDraft>, AppError> {
    metrics::inc_requests("/runs/{id}/drafts/{index}");
    if patch.condition_rating.is_some_and(|rating| !(1..=10).contains(&rating)) {
        return Err(PipelineError::validation("drafts", "condition_rating must be 1-10").into());
    }
    let handle = owned_run(&state, &id, &operator).await?;
    let mut run = handle.run.try_lock().map_err(|_| busy(&handle))?;
    let draft = reviewing_draft(&mut run, index)?;
    draft.apply_patch(&patch);
    Ok(Json(draft.clone()))
}

async fn set_cover(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path((id, index)): Path<(String, usize)>,
    Json(request): Json<CoverRequest>,
) -> Result<Json<ProductDraft>, AppError> {
    metrics::inc_requests("/runs/{id}/drafts/{index}/cover");
    let handle = owned_run(&state, &id, &operator).await?;
    let mut run = handle.run.try_lock().map_err(|_| busy(&handle))?;
    let draft = reviewing_draft(&mut run, index)?;
    draft.set_cover(request.image_index)?;
    Ok(Json(draft.clone()))
}

async fn review_save(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> Result<Json<ReviewOutcome>, AppError> {
    metrics::inc_requests("/runs/{id}/review/save");
    let handle = owned_run(&state, &id, &operator).await?;
    let mut run = handle.run.try_lock().map_err(|_| busy(&handle))?;
    let ctx = state.pipeline.call_context(&mut run).await?;
    let outcome = review::save_current(&mut run, state.pipeline.listings(), &ctx).await?;
    metrics::review_action("save");
    Ok(Json(outcome))
}

async fn review_skip(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> Result<Json<ReviewOutcome>, AppError> {
    metrics::inc_requests("/runs/{id}/review/skip");
    let handle = owned_run(&state, &id, &operator).await?;
    let mut run = handle.run.try_lock().map_err(|_| busy(&handle))?;
    let outcome = review::skip_current(&mut run)?;
    metrics::review_action("skip");
    Ok(Json(outcome))
}

async fn review_jump(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
    Json(request): Json<JumpRequest>,
) -> Result<Json<CursorState>, AppError> {
    metrics::inc_requests("/runs/{id}/review/jump");
    let handle = owned_run(&state, &id, &operator).await?;
    let mut run = handle.run.try_lock().map_err(|_| busy(&handle))?;
    let cursor = review::jump_to(&mut run, request.index)?;
    metrics::review_action("jump");
    Ok(Json(cursor))
}

/// Cancel whatever the run is doing and drop it. In-flight service calls are
/// aborted through the run's cancellation token.
async fn delete_run(
    State(state): State<AppState>,
    Extension(operator): Extension<OperatorContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/runs/{id}");
    let handle = owned_run(&state, &id, &operator).await?;
    state.registry.remove(handle.id).await;
    if let Ok(mut run) = handle.run.try_lock() {
        run.reset();
    }
    info!(target = "hermes.api", run_id = %handle.id, "run_deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    Review(ReviewError),
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl From<ReviewError> for AppError {
    fn from(value: ReviewError) -> Self {
        Self::Review(value)
    }
}

impl From<DraftError> for AppError {
    fn from(value: DraftError) -> Self {
        Self::Pipeline(PipelineError::invalid_input("cover", value.to_string()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::Conflict | PipelineErrorKind::Cancelled => {
                        StatusCode::CONFLICT
                    }
                    PipelineErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, payload)
            }
            AppError::Review(err) => {
                let status = match &err {
                    e if e.is_validation() => StatusCode::UNPROCESSABLE_ENTITY,
                    ReviewError::OutOfRange { .. } => StatusCode::BAD_REQUEST,
                    ReviewError::Persist(_) => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::CONFLICT,
                };
                let payload = ApiError {
                    error: err.code().to_string(),
                    detail: Some(err.to_string()),
                };
                (status, payload)
            }
        };
        (status, Json(payload)).into_response()
    }
}
