//! Bulk scoring of customer rows pulled from the query engine.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fairness;
use crate::metrics::BATCH_ROWS;
use crate::models::{CustomerPredictions, numeric_fields};
use crate::predictor::Predictor;

pub type Row = Map<String, Value>;

// Training labels and raw categoricals that sit next to the features in the
// customer table
pub fn default_excluded_columns() -> Vec<String> {
    [
        "engagement_score",
        "churn_30_day",
        "lifetime_value_usd",
        "gender",
        "location",
        "content_category_primary",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    pub timeout: Duration,
    /// Columns never used as features, on top of `customer_id`.
    pub excluded_columns: Vec<String>,
}

impl BatchConfig {
    fn is_excluded(&self, column: &str) -> bool {
        column == "customer_id" || self.excluded_columns.iter().any(|c| c == column)
    }
}

/// SQL-on-storage engine returning rows as JSON objects.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: &str) -> Result<Vec<Row>>;
}

#[derive(Deserialize)]
struct QueryResult {
    rows: Vec<Row>,
}

// Posts {"query": ..} and expects {"rows": [..]} back
pub struct HttpQueryExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpQueryExecutor {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
        }
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn execute(&self, query: &str) -> Result<Vec<Row>> {
        let res = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "query": query }))
            .send()
            .await
            .map_err(|e| Error::Query(format!("request failed: {e}")))?;

        if !res.status().is_success() {
            return Err(Error::Query(format!("engine returned {}", res.status())));
        }

        let body: QueryResult = res
            .json()
            .await
            .map_err(|e| Error::Query(format!("unreadable result: {e}")))?;
        Ok(body.rows)
    }
}

// Run the query with a bounded wait; a timeout is never retried
pub async fn fetch_rows(
    executor: &dyn QueryExecutor,
    query: &str,
    timeout: Duration,
) -> Result<Vec<Row>> {
    match tokio::time::timeout(timeout, executor.execute(query)).await {
        Ok(rows) => rows,
        Err(_) => {
            tracing::error!(?timeout, "bulk query timed out");
            Err(Error::QueryTimeout(timeout))
        }
    }
}

fn customer_id(index: usize, row: &Row) -> Result<String> {
    match row.get("customer_id") {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(Error::Query(format!("row {index} has no customer_id"))),
    }
}

pub async fn score_rows(
    predictor: &Predictor,
    rows: &[Row],
    models: &[String],
    config: &BatchConfig,
) -> Result<Vec<CustomerPredictions>> {
    let mut results = Vec::with_capacity(rows.len());

    for (index, row) in rows.iter().enumerate() {
        let id = customer_id(index, row)?;
        let columns = row.keys().map(String::as_str).filter(|c| !config.is_excluded(c));
        fairness::check_columns(columns)
            .map_err(|e| Error::InvalidInput(format!("row {index}: {e}")))?;

        // remaining categorical columns are not model inputs
        let mut features = numeric_fields(row, |_, _| Ok(()))?;
        features.retain(|column, _| !config.is_excluded(column));

        let mut predictions = BTreeMap::new();
        let mut labels = BTreeMap::new();
        for model in models {
            let prediction = predictor.predict(&features, model).await?;
            predictions.insert(model.clone(), prediction.value);
            if let Some(label) = prediction.label {
                labels.insert(model.clone(), label);
            }
        }
        results.push(CustomerPredictions {
            customer_id: id,
            predictions,
            labels,
        });
    }

    BATCH_ROWS.inc_by(results.len() as f64);
    Ok(results)
}

pub async fn score_query(
    predictor: &Predictor,
    executor: &dyn QueryExecutor,
    query: &str,
    models: &[String],
    config: &BatchConfig,
) -> Result<Vec<CustomerPredictions>> {
    if query.trim().is_empty() {
        return Err(Error::InvalidInput("query must not be empty".to_string()));
    }
    if models.is_empty() {
        return Err(Error::InvalidInput("models must not be empty".to_string()));
    }

    let rows = fetch_rows(executor, query, config.timeout).await?;
    tracing::info!(rows = rows.len(), models = models.len(), "scoring batch");
    score_rows(predictor, &rows, models, config).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::predictor::tests::{artifacts, predictor_with};
    use crate::registry::tests::CountingSource;
    use serde_json::json;
    use std::sync::Arc;

    // Canned rows, optionally answered late
    pub(crate) struct FakeEngine {
        pub rows: Vec<Row>,
        pub delay: Duration,
    }

    #[async_trait]
    impl QueryExecutor for FakeEngine {
        async fn execute(&self, _query: &str) -> Result<Vec<Row>> {
            tokio::time::sleep(self.delay).await;
            Ok(self.rows.clone())
        }
    }

    pub(crate) fn rows() -> Vec<Row> {
        [
            json!({ "customer_id": "c-1", "age": 30, "tenure_months": 12, "gender": "f" }),
            json!({ "customer_id": 2, "age": 45, "tenure_months": 3, "location": "NL" }),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect()
    }

    fn models() -> Vec<String> {
        vec!["engagement".to_string(), "ltv".to_string()]
    }

    pub(crate) fn config(timeout: Duration) -> BatchConfig {
        BatchConfig {
            timeout,
            excluded_columns: default_excluded_columns(),
        }
    }

    #[tokio::test]
    async fn scores_every_row_for_every_model() {
        let source = Arc::new(CountingSource::new(&artifacts()));
        let predictor = predictor_with(Arc::new(MemoryStore::new()), source);
        let engine = FakeEngine { rows: rows(), delay: Duration::ZERO };

        let results = score_query(&predictor, &engine, "SELECT *", &models(), &config(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].customer_id, "c-1");
        assert_eq!(results[1].customer_id, "2");
        assert_eq!(results[0].predictions["ltv"], 150.0);
        assert_eq!(results[1].predictions["ltv"], 110.0);
    }

    #[tokio::test]
    async fn slow_queries_time_out() {
        let source = Arc::new(CountingSource::new(&artifacts()));
        let predictor = predictor_with(Arc::new(MemoryStore::new()), source);
        let engine = FakeEngine { rows: rows(), delay: Duration::from_millis(200) };

        let err = score_query(&predictor, &engine, "SELECT *", &models(), &config(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueryTimeout(_)));
    }

    #[tokio::test]
    async fn rows_need_a_customer_id() {
        let source = Arc::new(CountingSource::new(&artifacts()));
        let predictor = predictor_with(Arc::new(MemoryStore::new()), source);
        let row = json!({ "age": 30, "tenure_months": 12 }).as_object().cloned().unwrap();

        let err = score_rows(&predictor, &[row], &models(), &config(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let source = Arc::new(CountingSource::new(&artifacts()));
        let predictor = predictor_with(Arc::new(MemoryStore::new()), source);
        let engine = FakeEngine { rows: vec![], delay: Duration::ZERO };

        let err = score_query(&predictor, &engine, "  ", &models(), &config(Duration::from_secs(1))).await;
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn label_columns_are_not_features() {
        // no declared names, so every remaining numeric column is an input
        let mut artifacts = artifacts();
        artifacts.push(("plain", json!({ "kind": "linear", "weights": [1.0, 1.0] })));
        let source = Arc::new(CountingSource::new(&artifacts));
        let predictor = predictor_with(Arc::new(MemoryStore::new()), source);
        let row = json!({
            "customer_id": "c-9", "age": 30, "tenure_months": 12,
            "engagement_score": 7.5, "churn_30_day": 1, "lifetime_value_usd": 420.0
        })
        .as_object()
        .cloned()
        .unwrap();

        let plain = vec!["plain".to_string()];
        let results = score_rows(&predictor, &[row], &plain, &config(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(results[0].predictions["plain"], 42.0);

        // same digest as a real-time request with only the features
        let features: crate::cache::FeatureMap =
            [("age".to_string(), 30.0), ("tenure_months".to_string(), 12.0)].into();
        assert!(predictor.predict(&features, "plain").await.unwrap().cached);
    }

    #[tokio::test]
    async fn classifier_rows_carry_labels() {
        let source = Arc::new(CountingSource::new(&artifacts()));
        let predictor = predictor_with(Arc::new(MemoryStore::new()), source);
        let models = vec!["churn".to_string(), "ltv".to_string()];

        let results = score_rows(&predictor, &rows(), &models, &config(Duration::from_secs(1)))
            .await
            .unwrap();
        // sigmoid(1 - 0.2 * 3) > 0.5 for the short-tenure customer
        assert_eq!(results[0].labels.get("churn"), Some(&false));
        assert_eq!(results[1].labels.get("churn"), Some(&true));
        assert!(!results[0].labels.contains_key("ltv"));
    }

    #[tokio::test]
    async fn rows_with_protected_columns_are_rejected() {
        let source = Arc::new(CountingSource::new(&artifacts()));
        let predictor = predictor_with(Arc::new(MemoryStore::new()), source);
        let row = json!({ "customer_id": "c-1", "age": 30, "tenure_months": 12, "ethnicity": 3 })
            .as_object()
            .cloned()
            .unwrap();

        let err = score_rows(&predictor, &[row.clone()], &models(), &config(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        // unless the operator drops the column before scoring
        let mut dropping = config(Duration::from_secs(1));
        dropping.excluded_columns.push("ethnicity".to_string());
        assert!(score_rows(&predictor, &[row], &models(), &dropping).await.is_ok());
    }

    #[tokio::test]
    async fn http_executor_posts_the_query_and_reads_rows() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/query")
            .match_body(mockito::Matcher::PartialJson(json!({ "query": "SELECT 1" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"rows": [{"customer_id": "c-1", "age": 30}]}"#)
            .create_async()
            .await;

        let executor = HttpQueryExecutor::new(reqwest::Client::new(), &format!("{}/query", server.url()));
        let rows = executor.execute("SELECT 1").await.unwrap();

        mock.assert_async().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["customer_id"], "c-1");
    }

    #[tokio::test]
    async fn http_executor_maps_engine_failures() {
        let mut server = mockito::Server::new_async().await;
        // mocks are removed from the server when dropped
        let _down = server
            .mock("POST", "/query")
            .with_status(500)
            .with_body("engine down")
            .create_async()
            .await;
        let _garbled = server
            .mock("POST", "/garbled")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let failing = HttpQueryExecutor::new(client.clone(), &format!("{}/query", server.url()));
        let err = failing.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
        assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);

        let garbled = HttpQueryExecutor::new(client, &format!("{}/garbled", server.url()));
        assert!(matches!(garbled.execute("SELECT 1").await, Err(Error::Query(_))));
    }
}
