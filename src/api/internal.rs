//! Internal command endpoints for the admin and mail collaborators.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{ApiError, ApiResult, AppState};
use crate::pipeline::{InboundEmail, IngestOutcome};

const COMMAND_SOURCE: &str = "internal_api";

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/internal/reprocess/{email_id}", post(reprocess))
        .route("/internal/replay-action/{email_id}", post(replay_action))
        .route("/internal/send-reply/{email_id}", post(send_reply))
        .route("/internal/ingest", post(ingest))
}

async fn reprocess(
    State(state): State<AppState>,
    Path(email_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let status = state.processor.reprocess(&email_id, COMMAND_SOURCE).await?;
    Ok(Json(json!({
        "ok": true,
        "emailId": email_id,
        "status": status,
    })))
}

async fn replay_action(
    State(state): State<AppState>,
    Path(email_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.processor.replay_action(&email_id).await?;
    Ok(Json(json!({
        "ok": true,
        "emailId": email_id,
        "manualReviewCreated": outcome.manual_review_created,
        "dropped": outcome.dropped,
    })))
}

async fn send_reply(
    State(state): State<AppState>,
    Path(email_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !state.processor.replies().is_configured() {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "missing resend config",
        ));
    }
    let provider_id = state.processor.send_reply(&email_id).await?;
    info!(email_id = %email_id, "Reply sent on operator request");
    Ok(Json(json!({
        "ok": true,
        "emailId": email_id,
        "providerId": provider_id,
    })))
}

#[derive(Deserialize)]
struct IngestParams {
    from: String,
    to: String,
}

/// Accept a raw RFC 5322 message with its envelope addresses.
async fn ingest(
    State(state): State<AppState>,
    Query(params): Query<IngestParams>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let email = InboundEmail::from_raw(body.to_vec(), &params.from, &params.to)
        .ok_or_else(|| ApiError::bad_request("body is not a parseable message"))?;

    let response = match state.ingest.ingest(email).await? {
        IngestOutcome::Rejected { reason } => {
            return Err(ApiError::new(StatusCode::FORBIDDEN, reason));
        }
        IngestOutcome::Duplicate { email_id } => {
            return Ok((
                StatusCode::OK,
                Json(json!({
                    "ok": true,
                    "emailId": email_id,
                    "duplicate": true,
                })),
            ));
        }
        IngestOutcome::Queued {
            email_id,
            blob_failures,
        } => json!({
            "ok": true,
            "emailId": email_id,
            "queued": true,
            "blobFailures": blob_failures,
        }),
        IngestOutcome::Parked {
            email_id,
            reason,
            blob_failures,
        } => json!({
            "ok": true,
            "emailId": email_id,
            "queued": false,
            "reason": reason,
            "blobFailures": blob_failures,
        }),
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}
