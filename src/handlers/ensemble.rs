use axum::{Json, extract::State};

use super::AppJson;
use std::sync::Arc;
use std::time::Instant;

use crate::ensemble::{default_weights, score};
use crate::error::Result;
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::models::{EnsembleRequest, EnsembleResponse, parse_features};
use crate::state::AppState;

pub async fn ensemble_handler(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<EnsembleRequest>,
) -> Result<Json<EnsembleResponse>> {
    REQUEST_TOTAL.inc();
    let start_time = Instant::now();

    let features = parse_features(&payload.customer_features)?;
    let weights = payload.weights.unwrap_or_else(default_weights);
    let scored = score(&state.predictor, &features, &weights).await?;

    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());

    Ok(Json(EnsembleResponse {
        ensemble_score: scored.score,
        individual_predictions: scored.predictions,
        weights,
        model_version: state.predictor.registry().version().to_string(),
        latency_ms: start_time.elapsed().as_secs_f64() * 1000.0,
    }))
}
