//! Process-local model memoization.
//!
//! Artifacts live at `models/{version}/{name}_latest.json` under either an
//! HTTP base url or a local directory. Each model name is fetched at most once
//! per registry; concurrent first requests wait on the same load.

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};
use crate::metrics::{MODEL_LOAD_FAILURES, MODEL_LOADS, MODEL_LOAD_LATENCY};
use crate::model::Model;

pub fn artifact_key(model_name: &str, version: &str) -> String {
    format!("models/{version}/{model_name}_latest.json")
}

/// Durable storage holding serialized model artifacts.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn fetch(&self, model_name: &str, version: &str) -> Result<Vec<u8>>;

    fn describe(&self) -> String;
}

pub struct HttpArtifactSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactSource {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn fetch(&self, model_name: &str, version: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url, artifact_key(model_name, version));

        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::model_unavailable(model_name, format!("request to {url} failed: {e}")))?;

        if !res.status().is_success() {
            return Err(Error::model_unavailable(
                model_name,
                format!("{url} returned {}", res.status()),
            ));
        }

        let body = res
            .bytes()
            .await
            .map_err(|e| Error::model_unavailable(model_name, e))?;
        Ok(body.to_vec())
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}

pub struct FsArtifactSource {
    root: PathBuf,
}

impl FsArtifactSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactSource for FsArtifactSource {
    async fn fetch(&self, model_name: &str, version: &str) -> Result<Vec<u8>> {
        let path = self.root.join(artifact_key(model_name, version));
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::model_unavailable(model_name, format!("{}: {e}", path.display())))
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

// Pick the source from the configured location
pub fn artifact_source(location: &str, client: reqwest::Client) -> Arc<dyn ArtifactSource> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Arc::new(HttpArtifactSource::new(client, location))
    } else {
        Arc::new(FsArtifactSource::new(location))
    }
}

pub struct ModelRegistry {
    source: Arc<dyn ArtifactSource>,
    version: String,
    models: DashMap<String, Arc<OnceCell<Arc<Model>>>>,
}

impl ModelRegistry {
    pub fn new(source: Arc<dyn ArtifactSource>, version: &str) -> Self {
        Self {
            source,
            version: version.to_string(),
            models: DashMap::new(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Memoized load. A failed load is not remembered; the next call retries.
    pub async fn load(&self, model_name: &str) -> Result<Arc<Model>> {
        if model_name.is_empty() {
            return Err(Error::InvalidInput("model_name must not be empty".to_string()));
        }

        // clone the cell out so the shard lock is released before awaiting
        let cell = self
            .models
            .entry(model_name.to_string())
            .or_default()
            .value()
            .clone();

        let model = cell
            .get_or_try_init(|| self.fetch_and_parse(model_name))
            .await?;
        Ok(Arc::clone(model))
    }

    async fn fetch_and_parse(&self, model_name: &str) -> Result<Arc<Model>> {
        let start = Instant::now();
        let loaded = async {
            let bytes = self.source.fetch(model_name, &self.version).await?;
            Model::from_slice(model_name, &self.version, &bytes)
        }
        .await;

        match loaded {
            Ok(model) => {
                MODEL_LOADS.inc();
                MODEL_LOAD_LATENCY.observe(start.elapsed().as_secs_f64());
                tracing::info!(
                    model = model_name,
                    version = %self.version,
                    source = %self.source.describe(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "model loaded"
                );
                Ok(Arc::new(model))
            }
            Err(e) => {
                MODEL_LOAD_FAILURES.inc();
                tracing::error!(model = model_name, error = %e, "model load failed");
                Err(e)
            }
        }
    }

    // Names of the models currently held in memory
    pub fn loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .models
            .iter()
            .filter(|e| e.value().initialized())
            .map(|e| e.key().clone())
            .collect();
        names.sort();
        names
    }
}
