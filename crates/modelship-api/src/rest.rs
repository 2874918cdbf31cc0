//! REST API handlers

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use modelship_core::{
    Alias, FeatureRow, ModelRef, ModelshipError, NewVersion, Registered, RegisterOutcome, Version,
};
use modelship_registry::{AliasSnapshot, EventRecord, PromoteRequest, Promotion, Registry};
use modelship_store::{CacheEntryInfo, CacheStats, PredictorCache};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::facade::{HealthStatus, PredictOutput, ServingFacade};

/// Application state shared across handlers
pub struct AppState {
    pub registry: Arc<Registry>,
    pub cache: Arc<PredictorCache>,
    pub facade: Arc<ServingFacade>,
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/api/v1/models", get(list_models))
        .route(
            "/api/v1/models/:name/versions",
            post(register_version).get(list_versions),
        )
        .route("/api/v1/models/:name/versions/:version", get(get_version))
        .route("/api/v1/models/:name/versions/:version/tags", put(set_version_tag))
        .route("/api/v1/models/:name/aliases", get(list_aliases))
        .route(
            "/api/v1/models/:name/aliases/:alias",
            get(get_alias).put(set_alias),
        )
        .route("/api/v1/models/:name/promote", post(promote))
        .route("/api/v1/models/:name/history", get(history))
        .route("/api/v1/cache", get(cache_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error response rendered as `{"detail": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

impl From<ModelshipError> for ApiError {
    fn from(e: ModelshipError) -> Self {
        match e {
            ModelshipError::ModelNotFound(_)
            | ModelshipError::VersionNotFound { .. }
            | ModelshipError::AliasNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, e.to_string())
            }
            ModelshipError::Validation(msg) => Self::new(StatusCode::UNPROCESSABLE_ENTITY, msg),
            ModelshipError::Inference(msg) => {
                warn!(error = %msg, "Inference failed");
                Self::new(StatusCode::BAD_REQUEST, "Inference failed")
            }
            ModelshipError::ConcurrencyConflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            ModelshipError::Load(load) => {
                error!(error = %load, "Predictor unavailable");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Model could not be loaded")
            }
            other => {
                error!(error = %other, "Request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

fn parse_version(raw: &str) -> ApiResult<u64> {
    match raw.parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("version must be a positive integer, got '{}'", raw),
        )),
    }
}

/// Report serving health without forcing a load
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(state.facade.health().await)
}

#[derive(Debug, Deserialize)]
pub struct PredictQuery {
    /// Overrides the configured model reference
    pub model_ref: Option<String>,
}

/// Prediction request body
#[derive(Debug, Serialize, Deserialize)]
pub struct PredictRequest {
    pub inputs: Vec<FeatureRow>,
}

/// Run inference on a batch of rows
async fn predict(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PredictQuery>,
    payload: Result<Json<PredictRequest>, JsonRejection>,
) -> ApiResult<Json<PredictOutput>> {
    let Json(req) = payload?;
    let reference = match query.model_ref {
        Some(raw) => raw.parse::<ModelRef>()?,
        None => state.facade.default_ref().clone(),
    };

    let output = state.facade.predict(&reference, &req.inputs).await?;
    Ok(Json(output))
}

/// Summary of one registered model
#[derive(Debug, Serialize, Deserialize)]
pub struct ModelSummary {
    pub name: String,
    pub latest_version: u64,
    pub aliases: BTreeMap<String, u64>,
}

/// List registered models
async fn list_models(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<ModelSummary>>> {
    let mut models = Vec::new();
    for name in state.registry.list_models().await {
        let latest = state.registry.latest_version(&name).await?;
        let aliases = state.registry.list_aliases(&name).await;
        models.push(ModelSummary {
            name,
            latest_version: latest.number,
            aliases,
        });
    }
    Ok(Json(models))
}

/// Register a version of a model
async fn register_version(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Result<Json<NewVersion>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Registered>)> {
    let Json(req) = payload?;
    info!(
        model = %name,
        run = %req.source_run_ref,
        "Registering version"
    );

    let registered = state.registry.register_version(&name, req).await?;
    let status = match registered.outcome {
        RegisterOutcome::Created => StatusCode::CREATED,
        RegisterOutcome::AlreadyExists => StatusCode::OK,
    };
    Ok((status, Json(registered)))
}

/// List versions of a model in ascending order
async fn list_versions(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<Version>>> {
    Ok(Json(state.registry.list_versions(&name).await?))
}

/// A version with the aliases that currently designate it
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionDetail {
    #[serde(flatten)]
    pub version: Version,
    pub aliases: Vec<String>,
}

/// Get a specific version
async fn get_version(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<Json<VersionDetail>> {
    let number = parse_version(&version)?;
    let version = state.registry.get_version(&name, number).await?;
    let aliases = state.registry.aliases_for_version(&name, number).await;
    Ok(Json(VersionDetail { version, aliases }))
}

/// Request to set one tag on a version
#[derive(Debug, Serialize, Deserialize)]
pub struct SetTagRequest {
    pub key: String,
    pub value: String,
}

/// Set a tag on a version
async fn set_version_tag(
    State(state): State<Arc<AppState>>,
    Path((name, version)): Path<(String, String)>,
    payload: Result<Json<SetTagRequest>, JsonRejection>,
) -> ApiResult<Json<Version>> {
    let number = parse_version(&version)?;
    let Json(req) = payload?;
    let version = state
        .registry
        .set_version_tag(&name, number, &req.key, &req.value)
        .await?;
    Ok(Json(version))
}

/// List aliases of a model
async fn list_aliases(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<AliasSnapshot> {
    Json(state.registry.alias_snapshot(&name).await)
}

/// Get the version an alias designates
async fn get_alias(
    State(state): State<Arc<AppState>>,
    Path((name, alias)): Path<(String, String)>,
) -> ApiResult<Json<Alias>> {
    let version = state.registry.get_alias(&name, &alias).await?;
    Ok(Json(Alias {
        name: alias,
        model: name,
        version,
    }))
}

/// Request to repoint an alias; the latest version is used when omitted
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SetAliasRequest {
    #[serde(default)]
    pub version: Option<u64>,
}

/// Result of an alias write
#[derive(Debug, Serialize, Deserialize)]
pub struct AliasUpdate {
    #[serde(flatten)]
    pub alias: Alias,
    pub previous: Option<u64>,
}

/// Point an alias at a version
async fn set_alias(
    State(state): State<Arc<AppState>>,
    Path((name, alias)): Path<(String, String)>,
    payload: Result<Json<SetAliasRequest>, JsonRejection>,
) -> ApiResult<Json<AliasUpdate>> {
    let Json(req) = payload?;
    let version = match req.version {
        Some(v) => v,
        None => state.registry.latest_version(&name).await?.number,
    };

    info!(model = %name, alias = %alias, version = version, "Setting alias");
    let previous = state.registry.set_alias(&name, &alias, version).await?;
    Ok(Json(AliasUpdate {
        alias: Alias {
            name: alias,
            model: name,
            version,
        },
        previous,
    }))
}

/// Register a version and point an alias at it
async fn promote(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    payload: Result<Json<PromoteRequest>, JsonRejection>,
) -> ApiResult<Json<Promotion>> {
    let Json(req) = payload?;
    info!(
        model = %name,
        run = %req.version.source_run_ref,
        alias = %req.alias,
        "Promoting run"
    );
    Ok(Json(state.registry.promote(&name, req).await?))
}

/// Audit trail of a model
async fn history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Json<Vec<EventRecord>> {
    Json(state.registry.history(&name).await)
}

/// Cache statistics and entries
#[derive(Debug, Serialize)]
pub struct CacheStatus {
    pub stats: CacheStats,
    pub entries: Vec<CacheEntryInfo>,
}

/// Get predictor cache status
async fn cache_status(State(state): State<Arc<AppState>>) -> Json<CacheStatus> {
    Json(CacheStatus {
        stats: state.cache.stats().await,
        entries: state.cache.entries().await,
    })
}
