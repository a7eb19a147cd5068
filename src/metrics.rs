use lazy_static::lazy_static;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, TextEncoder, register_counter, register_gauge,
    register_histogram,
};


lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("predict_requests_total", "Total number of prediction requests").unwrap();
    pub static ref CACHE_HITS: Counter =
        register_counter!("predict_cache_hits_total", "Total cache hits").unwrap();
    pub static ref CACHE_MISSES: Counter =
        register_counter!("predict_cache_misses_total", "Total cache misses").unwrap();
    pub static ref CACHE_EVICTIONS: Counter =
        register_counter!("predict_cache_evictions_total", "Expired entries swept").unwrap();
    pub static ref STORE_ERRORS: Counter =
        register_counter!("predict_store_errors_total", "Prediction store failures").unwrap();
    pub static ref STORE_BYPASSED: Counter =
        register_counter!("predict_store_bypassed_total", "Store calls skipped by the breaker").unwrap();
    pub static ref MODEL_LOADS: Counter =
        register_counter!("predict_model_loads_total", "Model artifacts loaded").unwrap();
    pub static ref MODEL_LOAD_FAILURES: Counter =
        register_counter!("predict_model_load_failures_total", "Model artifact load failures").unwrap();
    pub static ref BATCH_ROWS: Counter =
        register_counter!("predict_batch_rows_total", "Rows scored by batch requests").unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "predict_request_latency_seconds",
        "Request latency in seconds"
    )
    .unwrap();
    pub static ref MODEL_LOAD_LATENCY: Histogram = register_histogram!(
        "predict_model_load_latency_seconds",
        "Model artifact fetch and parse latency in seconds"
    )
    .unwrap();
    pub static ref CACHE_SIZE: Gauge =
        register_gauge!("predict_cache_size", "Current number of items in cache").unwrap();
}

// Text exposition of the default registry
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
