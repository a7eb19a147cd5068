use axum::{Json, extract::State, response::IntoResponse};
use std::sync::Arc;

use crate::state::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let registry = state.predictor.registry();
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "model_version": registry.version(),
        "loaded_models": registry.loaded(),
        "breaker_open": state.predictor.store_bypassed(),
    }))
}
