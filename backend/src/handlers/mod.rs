use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::database;
use crate::{ApiResult, AppError, AppState};

pub mod automations;
pub mod events;

pub use automations::automation_routes;
pub use events::{automation_hook_routes, platform_webhook_routes};

/// Request bodies must be JSON objects; serde would otherwise accept an array
/// and fill struct fields by position.
pub(crate) fn json_body<T: DeserializeOwned>(payload: Result<Json<Value>, JsonRejection>) -> ApiResult<T> {
    let Json(body) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    if !body.is_object() {
        return Err(AppError::BadRequest("Request body must be a JSON object".to_string()));
    }
    serde_json::from_value(body).map_err(|e| AppError::BadRequest(format!("Invalid request body: {}", e)))
}

pub async fn health_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({"status": "healthy", "service": "autoflow-api"})))
}

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub storage: String,
    pub services: HashMap<String, ServiceStatus>,
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub status: String,
    pub response_time_ms: Option<u128>,
}

pub async fn detailed_health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthCheckResponse>) {
    let mut services = HashMap::new();

    if let Some(pool) = &state.db_pool {
        let started = Instant::now();
        let healthy = database::health_check(pool).await;
        services.insert(
            "database".to_string(),
            ServiceStatus {
                status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
                response_time_ms: Some(started.elapsed().as_millis()),
            },
        );
    }

    let healthy = services.values().all(|s| s.status == "healthy");
    let response = HealthCheckResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: format!("{:?}", state.config.storage).to_lowercase(),
        services,
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
