//! HTTP surface: internal commands, the review dashboard API and health.

pub mod dashboard;
pub mod internal;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::{ChannelError, DatabaseError, PipelineError};
use crate::pipeline::{IngestService, MessageProcessor};
use crate::store::Database;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub processor: Arc<MessageProcessor>,
    pub ingest: Arc<IngestService>,
    /// Bearer secret for `/internal/*`; the surface refuses every call without it.
    pub internal_secret: Option<SecretString>,
    /// Bearer secret for `/api/*`; the surface is open without it.
    pub dashboard_secret: Option<SecretString>,
}

/// Build the full router.
pub fn router(state: AppState) -> Router {
    let internal = internal::routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_internal_secret,
    ));
    let dashboard = dashboard::routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        require_dashboard_secret,
    ));

    Router::new()
        .route("/health", get(health))
        .merge(internal)
        .merge(dashboard)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "smartmail"
    }))
}

// ── Auth ────────────────────────────────────────────────────────────

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn token_matches(headers: &HeaderMap, secret: &SecretString) -> bool {
    bearer_token(headers).is_some_and(|token| token == secret.expose_secret())
}

async fn require_internal_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(secret) = &state.internal_secret else {
        warn!(path = %request.uri().path(), "Internal API called without a configured secret");
        return ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "internal api disabled")
            .into_response();
    };
    if !token_matches(request.headers(), secret) {
        return ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    next.run(request).await
}

async fn require_dashboard_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(secret) = &state.dashboard_secret {
        if !token_matches(request.headers(), secret) {
            return ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    next.run(request).await
}

// ── Errors ──────────────────────────────────────────────────────────

/// Error body shared by every endpoint: `{error, status}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(what: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{what} not found"))
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16(),
        }));
        (self.status, body).into_response()
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { entity, .. } => ApiError::not_found(&entity),
            DatabaseError::Constraint(msg) => ApiError::new(StatusCode::CONFLICT, msg),
            other => {
                error!(error = %other, "Store failure in API handler");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Database(db) => db.into(),
            PipelineError::EmailNotFound(_) => ApiError::not_found("email"),
            PipelineError::MissingArtifact { .. } => ApiError::new(StatusCode::CONFLICT, e.to_string()),
            PipelineError::InvalidPayload(msg) => ApiError::bad_request(msg),
            PipelineError::Channel(ChannelError::NotConfigured { .. }) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
            PipelineError::Channel(_) => ApiError::new(StatusCode::BAD_GATEWAY, e.to_string()),
            PipelineError::Storage(_) | PipelineError::Queue(_) => {
                error!(error = %e, "Pipeline failure in API handler");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
