use axum::{Json, extract::State};

use crate::models::ConfigResponse;
use crate::state::{AppState, SERVICE_NAME};

/// Configured instruments with their timeframes as tokens.
pub async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(ConfigResponse {
        status: "ok".to_string(),
        service: SERVICE_NAME.to_string(),
        instruments: state.instruments.iter().map(|i| i.info()).collect(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}
