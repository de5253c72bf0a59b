//! Route handlers for the admin HTTP surface.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::commands::{self, CommandRequest, HISTORY_LIMIT};
use crate::context::WatchContext;
use crate::platform::http::normalize_member;
use crate::profile::MemberId;
use crate::scanner::{IngestOutcome, Observation};

/// Build a standard JSON error response.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({ "error": message.into() });
    (status, Json(body)).into_response()
}

pub async fn health_handler(State(ctx): State<WatchContext>) -> impl IntoResponse {
    let queued = ctx.notifier.queued().await;
    let body = json!({
        "status": "ok",
        "state": ctx.scheduler.state(),
        "last_scan_time": ctx.scheduler.last_scan_time(),
        "queued_notifications": queued,
    });
    (StatusCode::OK, Json(body))
}

pub async fn status_handler(State(ctx): State<WatchContext>) -> Response {
    match ctx.get_status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => {
            warn!(error = %e, "admin: status failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn command_handler(
    State(ctx): State<WatchContext>,
    Json(request): Json<CommandRequest>,
) -> impl IntoResponse {
    let reply = commands::dispatch(&ctx, &request).await;
    Json(json!({ "reply": reply }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn history_handler(
    State(ctx): State<WatchContext>,
    Path(member_id): Path<MemberId>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(HISTORY_LIMIT).clamp(1, 500);
    match ctx.recent_history(member_id, limit).await {
        Ok(records) => Json(json!({ "member_id": member_id, "changes": records })).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Accepts `{"type": "seen", "group_id": .., "member": {<user object>}}` or
/// `{"type": "left", "group_id": .., "member_id": ..}`. The user object is
/// normalised the same way the platform client normalises member lists.
pub async fn events_handler(State(ctx): State<WatchContext>, Json(body): Json<Value>) -> Response {
    let observation = match parse_observation(&body) {
        Ok(observation) => observation,
        Err(message) => return api_error(StatusCode::BAD_REQUEST, message),
    };
    match ctx.ingest(observation).await {
        Ok(outcome) => Json(outcome_json(&outcome)).into_response(),
        Err(e) => {
            warn!(error = %e, "admin: ingest failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn parse_observation(body: &Value) -> Result<Observation, String> {
    let group_id = body
        .get("group_id")
        .and_then(Value::as_i64)
        .ok_or("group_id is required")?;
    match body.get("type").and_then(Value::as_str) {
        Some("seen") => {
            let member = body
                .get("member")
                .and_then(normalize_member)
                .ok_or("member must be a user object with an id")?;
            Ok(Observation::Seen { group_id, member })
        }
        Some("left") => {
            let member_id = body
                .get("member_id")
                .and_then(Value::as_i64)
                .ok_or("member_id is required")?;
            Ok(Observation::Left {
                group_id,
                member_id,
            })
        }
        other => Err(format!("unknown event type {other:?}")),
    }
}

fn outcome_json(outcome: &IngestOutcome) -> Value {
    match outcome {
        IngestOutcome::Ignored => json!({ "outcome": "ignored" }),
        IngestOutcome::Registered => json!({ "outcome": "registered" }),
        IngestOutcome::Unchanged => json!({ "outcome": "unchanged" }),
        IngestOutcome::Changed(event) => json!({
            "outcome": "changed",
            "member_id": event.member_id,
            "changes": event.changes,
        }),
        IngestOutcome::Left { remaining } => json!({
            "outcome": "left",
            "remaining": remaining,
        }),
        IngestOutcome::NotAMember => json!({ "outcome": "not_a_member" }),
    }
}
