use std::sync::Arc;

use crate::batch::{BatchConfig, QueryExecutor};
use crate::predictor::Predictor;

// app's shared state
pub struct AppState {
    pub predictor: Predictor,
    pub default_model: String,
    pub query_executor: Option<Arc<dyn QueryExecutor>>, // absent = batch scoring disabled
    pub batch: BatchConfig,
}
