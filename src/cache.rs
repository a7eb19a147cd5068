use async_trait::async_trait;
use dashmap::DashMap;
use prometheus::Gauge;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::interval;

use crate::error::Result;
use crate::metrics::{CACHE_EVICTIONS, CACHE_SIZE};

// Raw numeric features as supplied by the caller
pub type FeatureMap = HashMap<String, f64>;

// Hex characters kept from the sha256 of the canonical feature map
pub const DIGEST_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FeatureDigest(String);

impl FeatureDigest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// Canonical form: keys sorted bytewise, values rendered through serde_json
// floats, -0.0 folded into 0.0
pub fn canonical_features(features: &FeatureMap) -> String {
    let sorted: BTreeMap<&str, f64> = features
        .iter()
        .map(|(k, v)| (k.as_str(), *v + 0.0))
        .collect();

    let mut out = String::from("{");
    for (i, (key, value)) in sorted.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::from(key).to_string());
        out.push(':');
        out.push_str(&Value::from(value).to_string());
    }
    out.push('}');
    out
}

// Create a cache key (truncated sha256 of the canonical feature map)
pub fn make_cache_key(features: &FeatureMap) -> FeatureDigest {
    let mut hasher = Sha256::new();
    hasher.update(canonical_features(features).as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(DIGEST_LEN);
    FeatureDigest(hex)
}

// Cache entry with creation and expiry
#[derive(Clone, Debug)]
pub struct CacheEntry {
    pub digest: FeatureDigest,
    pub model_name: String,
    pub prediction: f64,
    pub label: Option<bool>,
    pub model_version: String,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn new(
        digest: FeatureDigest,
        model_name: &str,
        prediction: f64,
        model_version: &str,
        ttl: Duration,
    ) -> Self {
        let now = Instant::now();
        Self {
            digest,
            model_name: model_name.to_string(),
            prediction,
            label: None,
            model_version: model_version.to_string(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn with_label(mut self, label: Option<bool>) -> Self {
        self.label = label;
        self
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Durable side-cache keyed by (digest, model name).
///
/// Implementations report expired entries as absent. Errors are soft: the
/// caller logs them and carries on as if the lookup missed.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    async fn get(&self, digest: &FeatureDigest, model_name: &str) -> Result<Option<CacheEntry>>;

    /// Overwrites any entry already held for the same key.
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    /// Drops expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }

    fn len(&self) -> usize;
}

type StoreKey = (FeatureDigest, String);

// In-process store, the default when no external table is configured
pub struct MemoryStore {
    entries: DashMap<StoreKey, CacheEntry>,
    size: Gauge,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            size: CACHE_SIZE.clone(),
        }
    }

    #[cfg(test)]
    fn with_size_gauge(size: Gauge) -> Self {
        Self {
            entries: DashMap::new(),
            size,
        }
    }

    fn refresh_size(&self) {
        self.size.set(self.entries.len() as f64);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PredictionStore for MemoryStore {
    async fn get(&self, digest: &FeatureDigest, model_name: &str) -> Result<Option<CacheEntry>> {
        let key = (digest.clone(), model_name.to_string());
        // clone out so no shard lock is held across the remove below
        let found = self.entries.get(&key).map(|e| e.value().clone());

        match found {
            Some(entry) if !entry.is_expired() => Ok(Some(entry)),
            Some(_) => {
                if self.entries.remove_if(&key, |_, e| e.is_expired()).is_some() {
                    CACHE_EVICTIONS.inc();
                    self.refresh_size();
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let key = (entry.digest.clone(), entry.model_name.clone());
        self.entries.insert(key, entry);
        self.refresh_size();
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired());
        self.refresh_size();
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

// Sweeper - drops expired entries on a fixed interval
pub async fn expiry_sweeper(store: Arc<dyn PredictionStore>, every: Duration) {
    let mut interval = interval(every);

    tracing::info!(interval = ?every, "cache sweeper started");

    loop {
        interval.tick().await;

        let removed = store.purge_expired();
        CACHE_SIZE.set(store.len() as f64);
        if removed > 0 {
            CACHE_EVICTIONS.inc_by(removed as f64);
            tracing::debug!(removed, remaining = store.len(), "expired predictions swept");
        }
    }
}
