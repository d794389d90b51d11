//! Ingress Handlers
//!
//! Unauthenticated entry points that turn external calls into trigger events:
//! inbound platform messages and per-automation webhook calls.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use autoflow_shared::{ContactId, Platform};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::json_body;
use crate::automations::DispatchedRun;
use crate::{ApiResult, AppError, AppState};

/// Callback forwarded by a platform connector. Only `message` callbacks carry
/// a sender; status and delivery callbacks are acknowledged and ignored.
#[derive(Debug, Deserialize)]
pub struct InboundWebhook {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub text: Option<InboundText>,
}

#[derive(Debug, Deserialize)]
pub struct InboundText {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct InboundAck {
    pub status: &'static str,
    pub matched: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct HookCall {
    pub contact_id: ContactId,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct HookAck {
    pub matched: Vec<Uuid>,
}

pub fn platform_webhook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:platform", post(receive_platform_message))
}

pub fn automation_hook_routes() -> Router<Arc<AppState>> {
    Router::new().route("/:token", post(receive_hook_call))
}

fn matched_ids(runs: &[DispatchedRun]) -> Vec<Uuid> {
    runs.iter().map(|run| run.automation_id).collect()
}

async fn receive_platform_message(
    State(state): State<Arc<AppState>>,
    Path(platform): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<InboundAck>> {
    let platform: Platform = platform.parse().map_err(AppError::BadRequest)?;
    let message: InboundWebhook = json_body(payload)?;

    if message.kind != "message" {
        debug!("Ignoring {} webhook of type '{}'", platform.as_str(), message.kind);
        return Ok(Json(InboundAck {
            status: "ignored",
            matched: Vec::new(),
        }));
    }

    let owner_id = message
        .user_id
        .ok_or_else(|| AppError::BadRequest("'user_id' is required".to_string()))?;
    let from = message
        .from
        .as_deref()
        .map(str::trim)
        .filter(|from| !from.is_empty())
        .ok_or_else(|| AppError::BadRequest("'from' is required".to_string()))?;

    let text = message.text.map(|t| t.body).unwrap_or_default();
    let runs = state
        .engine
        .handle_inbound_message(owner_id, platform, from, &text)
        .await?;

    Ok(Json(InboundAck {
        status: "ok",
        matched: matched_ids(&runs),
    }))
}

async fn receive_hook_call(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<HookAck>)> {
    let call: HookCall = json_body(payload)?;

    let runs = state
        .engine
        .handle_webhook(&token, call.contact_id, call.platform.unwrap_or_default(), call.payload)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(HookAck {
            matched: matched_ids(&runs),
        }),
    ))
}
