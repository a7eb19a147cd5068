use clap::Parser;
use std::time::Duration;

use crate::batch::BatchConfig;

// CLI argument structure, every flag can also come from the environment
#[derive(Parser, Debug, Clone)]
#[command(name = "predict-gateway")]
#[command(about = "Real-time prediction API with a feature-hash cache")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    // Where model artifacts live: an http(s) base url or a local directory
    // Example: "http://models.internal:9000/ml-models" or "./artifacts"
    #[arg(short, long, env = "MODELS_SOURCE", default_value = "./artifacts")]
    pub model_source: String,

    // Artifact version, resolved as models/{version}/{name}_latest.json
    #[arg(long, env = "MODEL_VERSION", default_value = "v1.0")]
    pub model_version: String,

    // Model used when a request does not name one
    #[arg(long, env = "DEFAULT_MODEL", default_value = "engagement")]
    pub default_model: String,

    // Cache TTL in seconds
    #[arg(short, long, env = "CACHE_TTL_SECONDS", default_value_t = 3600)]
    pub cache_ttl: u64,

    // How often expired cache entries are swept, in seconds
    #[arg(long, env = "SWEEP_INTERVAL_SECONDS", default_value_t = 60)]
    pub sweep_interval: u64,

    // Consecutive store failures before the store is bypassed
    #[arg(long, env = "BREAKER_THRESHOLD", default_value_t = 5)]
    pub breaker_threshold: u32,

    // Seconds the store stays bypassed once the breaker opens
    #[arg(long, env = "BREAKER_COOLDOWN_SECONDS", default_value_t = 30)]
    pub breaker_cooldown: u64,

    // Bulk query endpoint, batch scoring is disabled without it
    #[arg(long, env = "QUERY_ENDPOINT")]
    pub query_endpoint: Option<String>,

    // Upper bound on a bulk query, in seconds
    #[arg(long, env = "QUERY_TIMEOUT_SECONDS", default_value_t = 30)]
    pub query_timeout: u64,

    // Bulk query columns that are never model inputs (labels, raw categoricals)
    #[arg(
        long,
        env = "EXCLUDED_COLUMNS",
        value_delimiter = ',',
        default_values_t = crate::batch::default_excluded_columns()
    )]
    pub excluded_columns: Vec<String>,

    // Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Args {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown)
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            timeout: Duration::from_secs(self.query_timeout),
            excluded_columns: self.excluded_columns.clone(),
        }
    }
}
