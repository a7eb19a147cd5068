use std::sync::Arc;
use std::time::Duration;

use crate::breaker::StoreBreaker;
use crate::cache::{CacheEntry, FeatureDigest, FeatureMap, PredictionStore, make_cache_key};
use crate::error::{Error, Result};
use crate::metrics::{CACHE_HITS, CACHE_MISSES, STORE_BYPASSED, STORE_ERRORS};
use crate::registry::ModelRegistry;

#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub value: f64,
    // positive-class flag for classifiers (churner, anomaly)
    pub label: Option<bool>,
    pub model_name: String,
    pub model_version: String,
    pub cached: bool,
}

// Digest -> store lookup -> (load, infer, write-through)
pub struct Predictor {
    store: Arc<dyn PredictionStore>,
    breaker: StoreBreaker,
    registry: ModelRegistry,
    ttl: Duration,
}

impl Predictor {
    pub fn new(
        store: Arc<dyn PredictionStore>,
        breaker: StoreBreaker,
        registry: ModelRegistry,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            breaker,
            registry,
            ttl,
        }
    }

    pub fn store(&self) -> Arc<dyn PredictionStore> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn store_bypassed(&self) -> bool {
        self.breaker.is_open()
    }

    pub async fn predict(&self, features: &FeatureMap, model_name: &str) -> Result<Prediction> {
        let digest = make_cache_key(features);

        if let Some(hit) = self.lookup(&digest, model_name).await {
            CACHE_HITS.inc();
            tracing::debug!(
                %digest,
                model = model_name,
                age = ?hit.created_at.elapsed(),
                "cache hit"
            );
            return Ok(Prediction {
                value: hit.prediction,
                label: hit.label,
                model_name: model_name.to_string(),
                model_version: hit.model_version,
                cached: true,
            });
        }
        CACHE_MISSES.inc();
        tracing::debug!(%digest, model = model_name, "cache miss");

        let model = self.registry.load(model_name).await?;
        let vector = model.feature_vector(features)?;
        let value = model.predict(&vector)?;
        if !value.is_finite() {
            return Err(Error::inference(model_name, "model produced a non-finite value"));
        }

        let label = model.label(value);
        self.write_through(
            CacheEntry::new(digest, model_name, value, model.version(), self.ttl).with_label(label),
        )
        .await;

        Ok(Prediction {
            value,
            label,
            model_name: model_name.to_string(),
            model_version: model.version().to_string(),
            cached: false,
        })
    }

    // Store failures and entries from another model version read as misses
    async fn lookup(&self, digest: &FeatureDigest, model_name: &str) -> Option<CacheEntry> {
        if !self.breaker.allow_request() {
            STORE_BYPASSED.inc();
            return None;
        }

        match self.store.get(digest, model_name).await {
            Ok(found) => {
                self.breaker.record_success();
                found.filter(|e| e.model_version == self.registry.version())
            }
            Err(e) => {
                STORE_ERRORS.inc();
                self.breaker.record_failure();
                tracing::warn!(error = %e, %digest, model = model_name, "cache read failed, recomputing");
                None
            }
        }
    }

    async fn write_through(&self, entry: CacheEntry) {
        if !self.breaker.allow_request() {
            STORE_BYPASSED.inc();
            return;
        }

        let digest = entry.digest.clone();
        match self.store.put(entry).await {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                STORE_ERRORS.inc();
                self.breaker.record_failure();
                tracing::warn!(error = %e, %digest, "failed to cache prediction");
            }
        }
    }
}
