//! Model artifacts and the inference invoker.
//!
//! Artifacts are JSON documents tagged by `kind`. A loaded [`Model`] is never
//! mutated, so one handle is shared by every request that scores with it.

use serde::Deserialize;

use crate::cache::FeatureMap;
use crate::error::{Error, Result};
use crate::fairness;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

// Probability cut-off used when a logistic or isolation model declares none
const DEFAULT_DECISION_THRESHOLD: f64 = 0.5;

#[derive(Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    #[default]
    Identity,
    Logistic,
}

impl Link {
    fn apply(self, margin: f64) -> f64 {
        match self {
            Self::Identity => margin,
            Self::Logistic => 1.0 / (1.0 + (-margin).exp()),
        }
    }
}

/// One node of a flattened binary tree. Children always sit after their parent.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(try_from = "RawNode")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
        // training samples that reached the leaf, used by isolation trees
        size: usize,
    },
}

// Wire form of a node; a split must carry all four split fields and nothing else
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNode {
    feature: Option<usize>,
    threshold: Option<f64>,
    left: Option<usize>,
    right: Option<usize>,
    value: Option<f64>,
    size: Option<usize>,
}

impl TryFrom<RawNode> for Node {
    type Error = String;

    fn try_from(raw: RawNode) -> std::result::Result<Self, Self::Error> {
        match (raw.feature, raw.threshold, raw.left, raw.right) {
            (None, None, None, None) => Ok(Node::Leaf {
                value: raw.value.unwrap_or(0.0),
                size: raw.size.unwrap_or(0),
            }),
            (Some(feature), Some(threshold), Some(left), Some(right))
                if raw.value.is_none() && raw.size.is_none() =>
            {
                Ok(Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                })
            }
            (Some(_), Some(_), Some(_), Some(_)) => {
                Err("split node must not carry leaf fields".to_string())
            }
            _ => Err("split node needs feature, threshold, left and right".to_string()),
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    // Returns the leaf reached by `x` and its depth
    fn descend(&self, x: &[f64]) -> (&Node, usize) {
        let mut idx = 0;
        let mut depth = 0;
        loop {
            match &self.nodes[idx] {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if x[*feature] < *threshold { *left } else { *right };
                    depth += 1;
                }
                leaf @ Node::Leaf { .. } => return (leaf, depth),
            }
        }
    }

    fn validate(&self) -> std::result::Result<Option<usize>, String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        let mut max_feature = None;
        for (idx, node) in self.nodes.iter().enumerate() {
            if let Node::Split {
                feature,
                threshold,
                left,
                right,
            } = node
            {
                if !threshold.is_finite() {
                    return Err(format!("node {idx} has a non-finite threshold"));
                }
                for child in [*left, *right] {
                    if child <= idx || child >= self.nodes.len() {
                        return Err(format!("node {idx} points at invalid child {child}"));
                    }
                }
                max_feature = max_feature.max(Some(*feature));
            }
        }
        Ok(max_feature)
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Estimator {
    Linear {
        weights: Vec<f64>,
        #[serde(default)]
        bias: f64,
        #[serde(default)]
        link: Link,
    },
    TreeEnsemble {
        #[serde(default)]
        base_score: f64,
        trees: Vec<Tree>,
        #[serde(default)]
        link: Link,
    },
    IsolationForest {
        sample_size: usize,
        trees: Vec<Tree>,
    },
}

/// Standardization fitted at training time: `(x - mean) / scale`.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Scaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl Scaler {
    fn len(&self) -> usize {
        self.mean.len()
    }

    fn transform(&self, x: &mut [f64]) {
        for ((v, mean), scale) in x.iter_mut().zip(&self.mean).zip(&self.scale) {
            // constant columns were fitted with scale 0
            let scale = if *scale == 0.0 { 1.0 } else { *scale };
            *v = (*v - mean) / scale;
        }
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct ModelArtifact {
    /// Column order the model was trained on.
    #[serde(default)]
    pub feature_names: Option<Vec<String>>,
    #[serde(default)]
    pub scaler: Option<Scaler>,
    /// Scores above this are labelled positive (churner, anomaly).
    #[serde(default)]
    pub decision_threshold: Option<f64>,
    #[serde(flatten)]
    pub estimator: Estimator,
}

/// Loaded model handle.
#[derive(Debug)]
pub struct Model {
    name: String,
    version: String,
    artifact: ModelArtifact,
    // smallest feature vector length the estimator can score
    min_features: usize,
}

impl Model {
    /// Parse and validate a serialized artifact.
    pub fn from_slice(name: &str, version: &str, bytes: &[u8]) -> Result<Self> {
        let artifact: ModelArtifact =
            serde_json::from_slice(bytes).map_err(|e| Error::model_unavailable(name, e))?;
        Self::new(name, version, artifact)
    }

    pub fn new(name: &str, version: &str, artifact: ModelArtifact) -> Result<Self> {
        let min_features = validate(&artifact).map_err(|e| Error::model_unavailable(name, e))?;
        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            artifact,
            min_features,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Order raw features the way the model expects them: by the artifact's
    /// declared columns, or by sorted feature name when none are declared.
    /// The artifact's scaler, if any, is applied to the ordered vector.
    pub fn feature_vector(&self, features: &FeatureMap) -> Result<Vec<f64>> {
        let mut vector = match &self.artifact.feature_names {
            Some(names) => names
                .iter()
                .map(|n| {
                    features
                        .get(n)
                        .copied()
                        .ok_or_else(|| Error::inference(&self.name, format!("missing feature '{n}'")))
                })
                .collect::<Result<Vec<f64>>>()?,
            None => {
                let mut pairs: Vec<_> = features.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                pairs.into_iter().map(|(_, v)| *v).collect()
            }
        };

        if let Some(scaler) = &self.artifact.scaler {
            if vector.len() != scaler.len() {
                return Err(Error::inference(
                    &self.name,
                    format!("scaler fitted on {} features, got {}", scaler.len(), vector.len()),
                ));
            }
            scaler.transform(&mut vector);
        }
        Ok(vector)
    }

    pub fn decision_threshold(&self) -> Option<f64> {
        self.artifact.decision_threshold.or(match &self.artifact.estimator {
            Estimator::Linear {
                link: Link::Logistic,
                ..
            }
            | Estimator::TreeEnsemble {
                link: Link::Logistic,
                ..
            }
            | Estimator::IsolationForest { .. } => Some(DEFAULT_DECISION_THRESHOLD),
            _ => None,
        })
    }

    /// Positive-class label for a score, for models that classify.
    pub fn label(&self, score: f64) -> Option<bool> {
        self.decision_threshold().map(|t| score > t)
    }

    /// Score one feature vector. Deterministic, no side effects.
    pub fn predict(&self, x: &[f64]) -> Result<f64> {
        if x.len() < self.min_features {
            return Err(Error::inference(
                &self.name,
                format!("expected {} features, got {}", self.min_features, x.len()),
            ));
        }

        match &self.artifact.estimator {
            Estimator::Linear {
                weights,
                bias,
                link,
            } => {
                if x.len() != weights.len() {
                    return Err(Error::inference(
                        &self.name,
                        format!("expected {} features, got {}", weights.len(), x.len()),
                    ));
                }
                let margin = weights.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + bias;
                Ok(link.apply(margin))
            }
            Estimator::TreeEnsemble {
                base_score,
                trees,
                link,
            } => {
                let margin = trees
                    .iter()
                    .map(|t| match t.descend(x).0 {
                        Node::Leaf { value, .. } => *value,
                        Node::Split { .. } => 0.0,
                    })
                    .sum::<f64>()
                    + base_score;
                Ok(link.apply(margin))
            }
            Estimator::IsolationForest { sample_size, trees } => {
                let mean_path = trees
                    .iter()
                    .map(|t| match t.descend(x) {
                        (Node::Leaf { size, .. }, depth) => depth as f64 + average_path(*size),
                        (Node::Split { .. }, depth) => depth as f64,
                    })
                    .sum::<f64>()
                    / trees.len() as f64;
                Ok(2f64.powf(-mean_path / average_path(*sample_size)))
            }
        }
    }
}

// Average path length of an unsuccessful BST search over n points
fn average_path(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

fn validate(artifact: &ModelArtifact) -> std::result::Result<usize, String> {
    let declared = artifact.feature_names.as_ref().map(Vec::len);

    let needed = match &artifact.estimator {
        Estimator::Linear { weights, bias, .. } => {
            if weights.is_empty() {
                return Err("linear model has no weights".to_string());
            }
            if !bias.is_finite() || weights.iter().any(|w| !w.is_finite()) {
                return Err("linear model has non-finite coefficients".to_string());
            }
            if let Some(n) = declared.filter(|n| *n != weights.len()) {
                return Err(format!("{n} feature names for {} weights", weights.len()));
            }
            weights.len()
        }
        Estimator::TreeEnsemble { trees, .. } | Estimator::IsolationForest { trees, .. } => {
            if trees.is_empty() {
                return Err("ensemble has no trees".to_string());
            }
            let mut max_feature = None;
            for (i, tree) in trees.iter().enumerate() {
                let m = tree.validate().map_err(|e| format!("tree {i}: {e}"))?;
                max_feature = max_feature.max(m);
            }
            max_feature.map_or(0, |m| m + 1)
        }
    };

    if let Estimator::IsolationForest { sample_size, .. } = &artifact.estimator {
        if *sample_size < 2 {
            return Err("isolation forest needs a sample size of at least 2".to_string());
        }
    }
    if let Some(n) = declared.filter(|n| *n < needed) {
        return Err(format!("{n} feature names but splits reference {needed}"));
    }
    if let Some(scaler) = &artifact.scaler {
        let expected = declared.unwrap_or(needed);
        if scaler.mean.len() != scaler.scale.len() || scaler.len() != expected {
            return Err(format!(
                "scaler has {} means and {} scales for {expected} features",
                scaler.mean.len(),
                scaler.scale.len()
            ));
        }
        if scaler.mean.iter().chain(&scaler.scale).any(|v| !v.is_finite()) {
            return Err("scaler has non-finite values".to_string());
        }
    }
    if let Some(names) = &artifact.feature_names {
        let found = fairness::prohibited(names.iter().map(String::as_str));
        if !found.is_empty() {
            return Err(format!("trained on prohibited features: {}", found.join(", ")));
        }
    }
    if artifact.decision_threshold.is_some_and(|t| !t.is_finite()) {
        return Err("decision threshold is not finite".to_string());
    }
    Ok(needed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn load(value: serde_json::Value) -> Result<Model> {
        Model::from_slice("test", "v1.0", value.to_string().as_bytes())
    }

    fn stump(feature: usize, threshold: f64, left: f64, right: f64) -> serde_json::Value {
        json!({ "nodes": [
            { "feature": feature, "threshold": threshold, "left": 1, "right": 2 },
            { "value": left },
            { "value": right }
        ]})
    }

    #[test]
    fn linear_identity_and_logistic() {
        let reg = load(json!({ "kind": "linear", "weights": [2.0, 0.5], "bias": 1.0 })).unwrap();
        assert_eq!(reg.predict(&[3.0, 4.0]).unwrap(), 9.0);

        let clf = load(json!({
            "kind": "linear", "weights": [1.0], "bias": 0.0, "link": "logistic"
        }))
        .unwrap();
        assert!((clf.predict(&[0.0]).unwrap() - 0.5).abs() < 1e-12);
        assert!(clf.predict(&[10.0]).unwrap() > 0.99);
    }

    #[test]
    fn tree_ensemble_sums_leaves() {
        let model = load(json!({
            "kind": "tree_ensemble",
            "base_score": 0.5,
            "trees": [stump(0, 10.0, 1.0, 2.0), stump(1, 0.0, -0.25, 0.25)]
        }))
        .unwrap();
        assert_eq!(model.predict(&[5.0, 1.0]).unwrap(), 1.75);
        assert_eq!(model.predict(&[10.0, -1.0]).unwrap(), 2.25);
    }

    #[test]
    fn isolation_forest_scores_short_paths_higher() {
        let tree = json!({ "nodes": [
            { "feature": 0, "threshold": 100.0, "left": 1, "right": 2 },
            { "feature": 0, "threshold": 50.0, "left": 3, "right": 4 },
            { "size": 1 },
            { "size": 40 },
            { "size": 40 }
        ]});
        let model = load(json!({
            "kind": "isolation_forest", "sample_size": 81, "trees": [tree]
        }))
        .unwrap();

        let outlier = model.predict(&[500.0]).unwrap();
        let inlier = model.predict(&[20.0]).unwrap();
        assert!(outlier > inlier);
        assert!(outlier <= 1.0 && inlier > 0.0);
    }

    #[test]
    fn predict_is_deterministic() {
        let model = load(json!({
            "kind": "tree_ensemble", "trees": [stump(0, 1.0, 3.0, 4.0)], "link": "logistic"
        }))
        .unwrap();
        let first = model.predict(&[0.5]).unwrap();
        for _ in 0..10 {
            assert_eq!(model.predict(&[0.5]).unwrap(), first);
        }
    }

    #[test]
    fn dimension_mismatch_is_an_inference_error() {
        let model = load(json!({ "kind": "linear", "weights": [1.0, 1.0] })).unwrap();
        assert!(matches!(model.predict(&[1.0]), Err(Error::Inference { .. })));

        let trees = load(json!({ "kind": "tree_ensemble", "trees": [stump(3, 0.0, 0.0, 1.0)] })).unwrap();
        assert!(matches!(trees.predict(&[1.0, 2.0]), Err(Error::Inference { .. })));
    }

    #[test]
    fn invalid_artifacts_are_rejected() {
        let cyclic = json!({ "kind": "tree_ensemble", "trees": [{ "nodes": [
            { "feature": 0, "threshold": 0.0, "left": 0, "right": 1 },
            { "value": 1.0 }
        ]}]});
        assert!(matches!(load(cyclic), Err(Error::ModelUnavailable { .. })));
        assert!(load(json!({ "kind": "linear", "weights": [] })).is_err());

        // split missing `right` must not be read as a leaf
        let truncated = json!({ "kind": "tree_ensemble", "base_score": 5.0, "trees": [{ "nodes": [
            { "feature": 0, "threshold": 1.0, "left": 1 },
            { "value": 1.0 }
        ]}]});
        assert!(matches!(load(truncated), Err(Error::ModelUnavailable { .. })));

        let misspelt = json!({ "kind": "tree_ensemble", "trees": [{ "nodes": [
            { "feature": 0, "threshold": 1.0, "left": 1, "rihgt": 2 },
            { "value": 1.0 },
            { "value": 2.0 }
        ]}]});
        assert!(matches!(load(misspelt), Err(Error::ModelUnavailable { .. })));

        let mixed = json!({ "kind": "tree_ensemble", "trees": [{ "nodes": [
            { "feature": 0, "threshold": 1.0, "left": 1, "right": 2, "value": 3.0 },
            { "value": 1.0 },
            { "value": 2.0 }
        ]}]});
        assert!(matches!(load(mixed), Err(Error::ModelUnavailable { .. })));
        assert!(load(json!({ "kind": "tree_ensemble", "trees": [] })).is_err());
        assert!(load(json!({ "kind": "gradient_magic" })).is_err());
        assert!(matches!(
            Model::from_slice("x", "v1", b"not json"),
            Err(Error::ModelUnavailable { .. })
        ));
    }

    #[test]
    fn feature_vector_follows_declared_names() {
        let model = load(json!({
            "kind": "linear",
            "feature_names": ["tenure_months", "age"],
            "weights": [1.0, 0.0]
        }))
        .unwrap();
        let features: FeatureMap =
            [("age".to_string(), 30.0), ("tenure_months".to_string(), 12.0)].into();
        assert_eq!(model.feature_vector(&features).unwrap(), vec![12.0, 30.0]);

        let partial: FeatureMap = [("age".to_string(), 30.0)].into();
        assert!(matches!(model.feature_vector(&partial), Err(Error::Inference { .. })));
    }

    #[test]
    fn feature_vector_falls_back_to_sorted_names() {
        let model = load(json!({ "kind": "linear", "weights": [1.0, 1.0, 1.0] })).unwrap();
        let features: FeatureMap = [
            ("c".to_string(), 3.0),
            ("a".to_string(), 1.0),
            ("b".to_string(), 2.0),
        ]
        .into();
        assert_eq!(model.feature_vector(&features).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn scaler_standardizes_before_scoring() {
        let model = load(json!({
            "kind": "linear",
            "feature_names": ["age", "tenure_months"],
            "scaler": { "mean": [40.0, 10.0], "scale": [10.0, 0.0] },
            "weights": [1.0, 1.0]
        }))
        .unwrap();
        let features: FeatureMap =
            [("age".to_string(), 30.0), ("tenure_months".to_string(), 12.0)].into();

        // zero scale leaves the column centred but unscaled
        let vector = model.feature_vector(&features).unwrap();
        assert_eq!(vector, vec![-1.0, 2.0]);
        assert_eq!(model.predict(&vector).unwrap(), 1.0);
    }

    #[test]
    fn scaler_must_match_the_feature_count() {
        let bad = json!({
            "kind": "linear",
            "scaler": { "mean": [0.0], "scale": [1.0] },
            "weights": [1.0, 1.0]
        });
        assert!(matches!(load(bad), Err(Error::ModelUnavailable { .. })));
    }

    #[test]
    fn models_trained_on_protected_attributes_are_refused() {
        let err = load(json!({
            "kind": "linear",
            "feature_names": ["age", "marital_status"],
            "weights": [1.0, 1.0]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("marital_status"));
    }

    #[test]
    fn classifiers_label_above_threshold() {
        let churn = load(json!({ "kind": "linear", "weights": [1.0], "link": "logistic" })).unwrap();
        assert_eq!(churn.label(0.51), Some(true));
        assert_eq!(churn.label(0.5), Some(false));

        let regression = load(json!({ "kind": "linear", "weights": [1.0] })).unwrap();
        assert_eq!(regression.label(100.0), None);

        let custom = load(json!({
            "kind": "linear", "weights": [1.0], "decision_threshold": 10.0
        }))
        .unwrap();
        assert_eq!(custom.label(11.0), Some(true));

        let forest = load(json!({
            "kind": "isolation_forest", "sample_size": 8, "trees": [{ "nodes": [{ "size": 8 }] }]
        }))
        .unwrap();
        assert_eq!(forest.decision_threshold(), Some(0.5));
    }
}
