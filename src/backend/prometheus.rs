use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

use super::MetricsBackend;
use crate::models::{LabeledSample, QueryResult};
use crate::{GatewayError, Result};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse {
    status: String,
    data: Option<QueryData>,
    error_type: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

/// Client for the Prometheus HTTP query API.
#[derive(Debug, Clone)]
pub struct PrometheusBackend {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build metrics client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn parse_response(query: &str, body: &[u8]) -> QueryResult {
        let response: ApiResponse = serde_json::from_slice(body)
            .map_err(|e| GatewayError::UnexpectedResultShape(format!("undecodable body: {}", e)))?;

        if response.status != "success" {
            let err = GatewayError::BackendUnavailable(format!(
                "query {:?} rejected ({}): {}",
                query,
                response.error_type.unwrap_or_default(),
                response.error.unwrap_or_default()
            ));
            error!(%err, "backend query failed");
            return Err(err);
        }

        let data = response
            .data
            .ok_or_else(|| GatewayError::UnexpectedResultShape("missing data".to_string()))?;
        if data.result_type != "vector" {
            let err = GatewayError::UnexpectedResultShape(data.result_type);
            error!(%err, query, "backend returned a non-vector result");
            return Err(err);
        }

        let vector: Vec<VectorSample> = serde_json::from_value(data.result)
            .map_err(|e| GatewayError::UnexpectedResultShape(format!("malformed vector: {}", e)))?;

        vector.into_iter().map(convert_sample).collect()
    }
}

fn convert_sample(sample: VectorSample) -> Result<LabeledSample> {
    let (timestamp, raw) = sample.value;
    let value = raw
        .parse::<f64>()
        .map_err(|_| GatewayError::UnexpectedResultShape(format!("non-numeric sample {:?}", raw)))?;

    Ok(LabeledSample::new(
        sample.metric,
        value,
        (timestamp * 1000.0).round() as i64,
    ))
}

#[async_trait]
impl MetricsBackend for PrometheusBackend {
    async fn instant_query(&self, query: &str, at: DateTime<Utc>) -> QueryResult {
        let time = format!("{:.3}", at.timestamp_millis() as f64 / 1000.0);
        let url = format!("{}/api/v1/query", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("query", query), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| {
                error!(query, error = %e, "Query failed");
                GatewayError::BackendUnavailable(e.to_string())
            })?;

        let status = response.status();
        let body = response.bytes().await?;
        debug!(query, %status, bytes = body.len(), "Query response");

        if !status.is_success() && serde_json::from_slice::<ApiResponse>(&body).is_err() {
            return Err(GatewayError::BackendUnavailable(format!(
                "metrics store answered {}",
                status
            )));
        }

        Self::parse_response(query, &body)
    }
}
