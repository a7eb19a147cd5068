use axum::{Json, extract::State};

use super::AppJson;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::models::{PredictRequest, PredictResponse, parse_features};
use crate::state::AppState;

pub async fn predict_handler(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<PredictRequest>,
) -> Result<Json<PredictResponse>> {
    REQUEST_TOTAL.inc();
    let start_time = Instant::now();

    let features = parse_features(&payload.customer_features)?;
    let model_name = payload
        .model_name
        .as_deref()
        .unwrap_or(&state.default_model);

    let prediction = state.predictor.predict(&features, model_name).await?;

    let latency = start_time.elapsed();
    REQUEST_LATENCY.observe(latency.as_secs_f64());
    let latency_ms = latency.as_secs_f64() * 1000.0;
    tracing::info!(
        model = model_name,
        cached = prediction.cached,
        latency_ms,
        "prediction completed"
    );

    Ok(Json(PredictResponse {
        prediction: prediction.value,
        label: prediction.label,
        model_name: prediction.model_name,
        model_version: prediction.model_version,
        cached: prediction.cached,
        latency_ms,
    }))
}
