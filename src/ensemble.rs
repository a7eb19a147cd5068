use std::collections::BTreeMap;

use crate::cache::FeatureMap;
use crate::error::{Error, Result};
use crate::predictor::Predictor;

// Engagement, churn and lifetime value blended into one customer score
pub fn default_weights() -> BTreeMap<String, f64> {
    [("engagement", 0.4), ("churn", 0.3), ("ltv", 0.3)]
        .into_iter()
        .map(|(name, w)| (name.to_string(), w))
        .collect()
}

pub struct EnsembleScore {
    pub score: f64,
    pub predictions: BTreeMap<String, f64>,
}

pub fn weighted_sum(predictions: &BTreeMap<String, f64>, weights: &BTreeMap<String, f64>) -> f64 {
    weights
        .iter()
        .map(|(name, w)| predictions.get(name).copied().unwrap_or(0.0) * w)
        .sum()
}

// Score every weighted model through the cached path, then blend
pub async fn score(
    predictor: &Predictor,
    features: &FeatureMap,
    weights: &BTreeMap<String, f64>,
) -> Result<EnsembleScore> {
    if weights.is_empty() {
        return Err(Error::InvalidInput("weights must name at least one model".to_string()));
    }
    if let Some((name, _)) = weights.iter().find(|(_, w)| !w.is_finite()) {
        return Err(Error::InvalidInput(format!("weight for '{name}' is not finite")));
    }

    let mut predictions = BTreeMap::new();
    for name in weights.keys() {
        let prediction = predictor.predict(features, name).await?;
        predictions.insert(name.clone(), prediction.value);
    }

    let score = weighted_sum(&predictions, weights);
    tracing::info!(score, models = weights.len(), "ensemble scored");
    Ok(EnsembleScore { score, predictions })
}
