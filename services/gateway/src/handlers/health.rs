use axum::Json;

use crate::models::HealthResponse;
use crate::state::SERVICE_NAME;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}
