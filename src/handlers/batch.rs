use axum::{Json, extract::State};

use super::AppJson;
use std::sync::Arc;
use std::time::Instant;

use crate::batch::score_query;
use crate::error::{Error, Result};
use crate::metrics::{REQUEST_LATENCY, REQUEST_TOTAL};
use crate::models::{BatchRequest, BatchResponse};
use crate::state::AppState;

pub async fn batch_handler(
    State(state): State<Arc<AppState>>,
    AppJson(payload): AppJson<BatchRequest>,
) -> Result<Json<BatchResponse>> {
    REQUEST_TOTAL.inc();
    let start_time = Instant::now();

    let executor = state.query_executor.as_ref().ok_or(Error::BatchDisabled)?;
    let models = if payload.models.is_empty() {
        vec![state.default_model.clone()]
    } else {
        payload.models
    };

    let results = score_query(
        &state.predictor,
        &**executor,
        &payload.query,
        &models,
        &state.batch,
    )
    .await?;

    REQUEST_LATENCY.observe(start_time.elapsed().as_secs_f64());

    Ok(Json(BatchResponse {
        rows: results.len(),
        results,
        model_version: state.predictor.registry().version().to_string(),
        prediction_timestamp: chrono::Utc::now().to_rfc3339(),
        latency_ms: start_time.elapsed().as_secs_f64() * 1000.0,
    }))
}
