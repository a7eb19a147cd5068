use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::cache::FeatureMap;
use crate::error::{Error, Result};
use crate::fairness;

// Real-time prediction request
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PredictRequest {
    #[serde(default)]
    pub customer_features: Value,
    #[serde(default)]
    pub model_name: Option<String>,
}

// Real-time prediction response
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PredictResponse {
    pub prediction: f64,
    // true for a predicted churner or an anomaly; absent for regressors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<bool>,
    pub model_name: String,
    pub model_version: String,
    pub cached: bool,
    pub latency_ms: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct EnsembleRequest {
    #[serde(default)]
    pub customer_features: Value,
    #[serde(default)]
    pub weights: Option<BTreeMap<String, f64>>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct EnsembleResponse {
    pub ensemble_score: f64,
    pub individual_predictions: BTreeMap<String, f64>,
    pub weights: BTreeMap<String, f64>,
    pub model_version: String,
    pub latency_ms: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct BatchRequest {
    pub query: String,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct CustomerPredictions {
    pub customer_id: String,
    pub predictions: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct BatchResponse {
    pub results: Vec<CustomerPredictions>,
    pub model_version: String,
    pub prediction_timestamp: String,
    pub rows: usize,
    pub latency_ms: f64,
}

// A request body must carry a JSON object of finite numbers, none of them a
// protected attribute
pub fn parse_features(value: &Value) -> Result<FeatureMap> {
    let object = match value {
        Value::Object(map) => map,
        Value::Null => return Ok(FeatureMap::new()),
        other => {
            return Err(Error::InvalidInput(format!(
                "customer_features must be an object, got {}",
                json_type(other)
            )));
        }
    };
    fairness::check_columns(object.keys().map(String::as_str))?;
    numeric_fields(object, |key, v| {
        Err(Error::InvalidInput(format!(
            "feature '{key}' must be a number, got {}",
            json_type(v)
        )))
    })
}

// Collect numeric fields, handing anything else to `on_other`
pub fn numeric_fields(
    object: &Map<String, Value>,
    mut on_other: impl FnMut(&str, &Value) -> Result<()>,
) -> Result<FeatureMap> {
    let mut features = FeatureMap::with_capacity(object.len());
    for (key, value) in object {
        match value.as_f64() {
            Some(n) if n.is_finite() => {
                features.insert(key.clone(), n);
            }
            _ => on_other(key, value)?,
        }
    }
    Ok(features)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
