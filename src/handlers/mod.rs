mod batch;
mod ensemble;
mod health;
mod metrics;
mod predict;

use axum::Router;
use axum::extract::FromRequest;
use axum::routing::{get, post};
use std::sync::Arc;

use crate::error::Error;
use crate::state::AppState;

pub use batch::batch_handler;
pub use ensemble::ensemble_handler;
pub use health::health_handler;
pub use metrics::metrics_handler;
pub use predict::predict_handler;

// JSON body extractor whose rejections use the `{"error": ..}` shape
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(Error))]
pub struct AppJson<T>(pub T);

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/predict", post(predict_handler))
        .route("/api/ensemble", post(ensemble_handler))
        .route("/api/batch", post(batch_handler))
        .with_state(state)
}
