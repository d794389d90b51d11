//! Automation Handlers
//!
//! Owner-scoped CRUD, analytics and run history for automations.

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use autoflow_shared::{Automation, AutomationAnalytics, AutomationList, RunList};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use super::json_body;
use crate::auth::AuthUser;
use crate::validation::{AutomationDraft, AutomationPatch};
use crate::{ApiResult, AppError, AppState};

const DEFAULT_RUN_LIMIT: i64 = 50;
const MAX_RUN_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct AnalyticsQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct ConversionRateRequest {
    pub date: Option<NaiveDate>,
    pub conversion_rate: f64,
}

#[derive(Debug, Deserialize)]
pub struct RunHistoryQuery {
    pub limit: Option<i64>,
}

pub fn automation_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_automations).post(create_automation))
        .route(
            "/:id",
            get(get_automation).put(update_automation).delete(deactivate_automation),
        )
        .route("/:id/analytics", get(get_analytics))
        .route("/:id/analytics/conversion-rate", post(record_conversion_rate))
        .route("/:id/runs", get(list_runs))
}

fn automation_id(path: Result<Path<Uuid>, PathRejection>) -> ApiResult<Uuid> {
    path.map(|Path(id)| id)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

fn query_params<T>(query: Result<Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|Query(params)| params)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

async fn list_automations(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
) -> ApiResult<Json<AutomationList>> {
    let automations = state.engine.registry().list(owner_id).await?;
    Ok(Json(AutomationList { automations }))
}

async fn create_automation(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Automation>)> {
    let draft: AutomationDraft = json_body(payload)?;
    let automation = state.engine.registry().create(owner_id, draft).await?;
    Ok((StatusCode::CREATED, Json(automation)))
}

async fn get_automation(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Automation>> {
    let id = automation_id(path)?;
    let automation = state.engine.registry().get(owner_id, id).await?;
    Ok(Json(automation))
}

async fn update_automation(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<Json<Automation>> {
    let id = automation_id(path)?;
    let patch: AutomationPatch = json_body(payload)?;
    let automation = state.engine.registry().update(owner_id, id, patch).await?;
    Ok(Json(automation))
}

/// Automations are never deleted, only switched off.
async fn deactivate_automation(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
) -> ApiResult<Json<Automation>> {
    let id = automation_id(path)?;
    let automation = state.engine.registry().set_active(owner_id, id, false).await?;
    Ok(Json(automation))
}

async fn get_analytics(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<AnalyticsQuery>, QueryRejection>,
) -> ApiResult<Json<AutomationAnalytics>> {
    let id = automation_id(path)?;
    let range = query_params(query)?;
    state.engine.registry().get(owner_id, id).await?;

    let summary = state
        .engine
        .analytics()
        .summarize(id, range.start_date, range.end_date)
        .await?;
    Ok(Json(summary))
}

async fn record_conversion_rate(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    payload: Result<Json<Value>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let id = automation_id(path)?;
    let request: ConversionRateRequest = json_body(payload)?;
    state.engine.registry().get(owner_id, id).await?;

    let analytics = state.engine.analytics();
    let date = request.date.unwrap_or_else(|| analytics.today());
    analytics
        .record_conversion_rate(id, date, request.conversion_rate)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    AuthUser(owner_id): AuthUser,
    path: Result<Path<Uuid>, PathRejection>,
    query: Result<Query<RunHistoryQuery>, QueryRejection>,
) -> ApiResult<Json<RunList>> {
    let id = automation_id(path)?;
    let params = query_params(query)?;
    let limit = params.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);

    let runs = state.engine.run_history(owner_id, id, limit).await?;
    Ok(Json(RunList { runs }))
}
