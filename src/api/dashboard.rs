//! Review dashboard API: manual reviews, prompt templates, email detail.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{ApiError, ApiResult, AppState};
use crate::safety::mask_for_display;
use crate::store::model::{EventStatus, NewPromptTemplate, RawProviderTrace, ReviewStatus, Stage};

const DEFAULT_REVIEW_LIMIT: usize = 200;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/manual-reviews", get(list_reviews))
        .route("/api/manual-reviews/{id}", patch(update_review))
        .route("/api/prompts", get(list_prompts).post(create_prompt))
        .route("/api/prompts/activate", post(activate_prompt))
        .route("/api/emails/{id}", get(email_detail))
        .route("/api/emails/{id}/events", get(email_events))
        .route("/api/emails/{id}/legal-hold", put(set_legal_hold))
}

// ── Manual reviews ──────────────────────────────────────────────────

#[derive(Deserialize)]
struct ReviewQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_reviews(
    State(state): State<AppState>,
    Query(query): Query<ReviewQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query.status.as_deref().map(parse_status).transpose()?;
    let limit = query
        .limit
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_REVIEW_LIMIT);
    let tasks = state.db.list_manual_reviews(status, limit).await?;
    Ok(Json(tasks))
}

#[derive(Deserialize)]
struct ReviewUpdate {
    status: String,
    #[serde(default)]
    assignee: Option<String>,
}

async fn update_review(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReviewUpdate>,
) -> ApiResult<impl IntoResponse> {
    let next = parse_status(&body.status)?;
    let mut task = state
        .db
        .get_manual_review(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("manual review"))?;

    let previous = task.status;
    task.transition(next, body.assignee, Utc::now())
        .map_err(|e| ApiError::new(StatusCode::CONFLICT, e.to_string()))?;
    state.db.save_manual_review(&task).await?;
    state
        .db
        .insert_event(
            &task.email_id,
            Stage::ManualReview,
            EventStatus::Ok,
            Some(&json!({
                "source": "dashboard_api",
                "taskId": task.id,
                "from": previous.as_str(),
                "to": next.as_str(),
                "assignee": task.assignee,
            })),
        )
        .await?;

    info!(task_id = %task.id, from = previous.as_str(), to = next.as_str(), "Manual review updated");
    Ok(Json(task))
}

fn parse_status(raw: &str) -> Result<ReviewStatus, ApiError> {
    ReviewStatus::parse(raw).ok_or_else(|| ApiError::bad_request(format!("unknown status '{raw}'")))
}

// ── Prompt templates ────────────────────────────────────────────────

#[derive(Deserialize)]
struct PromptQuery {
    name: Option<String>,
}

async fn list_prompts(
    State(state): State<AppState>,
    Query(query): Query<PromptQuery>,
) -> ApiResult<impl IntoResponse> {
    let templates = state.db.list_prompt_templates(query.name.as_deref()).await?;
    Ok(Json(templates))
}

async fn create_prompt(
    State(state): State<AppState>,
    Json(body): Json<NewPromptTemplate>,
) -> ApiResult<impl IntoResponse> {
    if body.name.trim().is_empty() || body.content.trim().is_empty() {
        return Err(ApiError::bad_request("name and content are required"));
    }
    let template = state.db.create_prompt_template(&body).await?;
    info!(name = %template.name, version = template.version, "Prompt template created");
    Ok((StatusCode::CREATED, Json(template)))
}

#[derive(Deserialize)]
struct ActivateRequest {
    name: String,
    version: i64,
}

async fn activate_prompt(
    State(state): State<AppState>,
    Json(body): Json<ActivateRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .db
        .activate_prompt_template(&body.name, body.version)
        .await?;
    info!(name = %body.name, version = body.version, "Prompt template activated");
    Ok(Json(json!({
        "ok": true,
        "name": body.name,
        "version": body.version,
    })))
}

// ── Emails ──────────────────────────────────────────────────────────

fn masked_trace(trace: RawProviderTrace) -> RawProviderTrace {
    RawProviderTrace {
        response_text: mask_for_display(trace.response_text.as_deref()),
        response_json: mask_for_display(trace.response_json.as_deref()),
        ..trace
    }
}

async fn email_detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let db = &state.db;
    let (email, attachments, stored, trace, actions, reviews) = futures::try_join!(
        db.get_email(&id),
        db.list_attachments(&id),
        db.get_classification(&id),
        db.latest_raw_trace(&id),
        db.list_action_logs(&id),
        db.list_manual_reviews_for_email(&id),
    )?;
    let email = email.ok_or_else(|| ApiError::not_found("email"))?;

    let (classification, reply_draft, ai) = match stored {
        Some(stored) => (
            Some(stored.classification),
            stored.reply_draft,
            Some(json!({
                "provider": stored.provider,
                "model": stored.model,
                "processingMs": stored.processing_ms,
                "updatedAt": stored.updated_at,
            })),
        ),
        None => (None, None, None),
    };

    Ok(Json(json!({
        "email": email,
        "attachments": attachments,
        "classification": classification,
        "replyDraft": reply_draft,
        "ai": ai,
        "rawTrace": trace.map(masked_trace),
        "actionLogs": actions,
        "manualReviews": reviews,
    })))
}

async fn email_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (email, events) = futures::try_join!(state.db.get_email(&id), state.db.list_events(&id))?;
    if email.is_none() {
        return Err(ApiError::not_found("email"));
    }
    Ok(Json(events))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegalHoldRequest {
    legal_hold: bool,
}

async fn set_legal_hold(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LegalHoldRequest>,
) -> ApiResult<impl IntoResponse> {
    if !state.db.set_legal_hold(&id, body.legal_hold).await? {
        return Err(ApiError::not_found("email"));
    }
    info!(email_id = %id, legal_hold = body.legal_hold, "Legal hold updated");
    Ok(Json(json!({
        "ok": true,
        "emailId": id,
        "legalHold": body.legal_hold,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_responses_are_masked() {
        let trace = RawProviderTrace {
            provider: "workers-ai".into(),
            model: "@cf/meta/llama-3.1-8b-instruct".into(),
            request_redacted: "[redacted-email]".into(),
            response_text: Some("reply to bob@example.com".into()),
            response_json: None,
            created_at: Utc::now(),
        };
        let masked = masked_trace(trace);
        assert_eq!(masked.response_text.as_deref(), Some("reply to [redacted-email]"));
        assert_eq!(masked.response_json, None);
        assert_eq!(masked.provider, "workers-ai");
    }

    #[test]
    fn unknown_status_is_bad_request() {
        assert!(parse_status("resolved").is_ok());
        assert!(parse_status("archived").is_err());
    }
}
