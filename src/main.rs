mod batch;
mod breaker;
mod cache;
mod config;
mod ensemble;
mod error;
mod fairness;
mod handlers;
mod logging;
mod metrics;
mod model;
mod models;
mod predictor;
mod registry;
mod state;

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;

use crate::batch::{HttpQueryExecutor, QueryExecutor};
use crate::breaker::StoreBreaker;
use crate::cache::{MemoryStore, expiry_sweeper};
use crate::config::Args;
use crate::predictor::Predictor;
use crate::registry::{ModelRegistry, artifact_source};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging(args.log_json)?;

    let client = reqwest::Client::new();

    let registry = ModelRegistry::new(
        artifact_source(&args.model_source, client.clone()),
        &args.model_version,
    );
    let predictor = Predictor::new(
        Arc::new(MemoryStore::new()),
        StoreBreaker::new(args.breaker_threshold, args.breaker_cooldown()),
        registry,
        args.cache_ttl(),
    );

    let query_executor = args.query_endpoint.as_deref().map(|endpoint| {
        Arc::new(HttpQueryExecutor::new(client.clone(), endpoint)) as Arc<dyn QueryExecutor>
    });

    let state = Arc::new(AppState {
        predictor,
        default_model: args.default_model.clone(),
        query_executor,
        batch: args.batch_config(),
    });

    // spawn the expiry sweeper
    tokio::spawn(expiry_sweeper(state.predictor.store(), args.sweep_interval()));

    let app = handlers::router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(
        port = args.port,
        model_source = %args.model_source,
        model_version = %args.model_version,
        default_model = %args.default_model,
        cache_ttl_secs = args.cache_ttl,
        batch_enabled = args.query_endpoint.is_some(),
        "predict gateway listening"
    );

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
