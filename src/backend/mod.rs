//! Metrics query backend: query templates and the adapter seam.

pub mod prometheus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{MetricKind, QueryResult, ResourceType, Window};

pub use self::prometheus::PrometheusBackend;

/// Executes an instant query against a time-series store.
///
/// Implementations return `UnexpectedResultShape` for anything but an
/// instant vector and `BackendUnavailable` when the store cannot be reached.
/// No retries happen at this layer.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn instant_query(&self, query: &str, at: DateTime<Utc>) -> QueryResult;
}

/// Renders the query for one metric kind grouped by the resource's label.
pub fn build_query(
    kind: MetricKind,
    resource: ResourceType,
    namespace: &str,
    window: Window,
) -> String {
    let namespace = escape_label_value(namespace);
    let label = resource.grouping_label();
    let range = window.as_range();

    match kind {
        MetricKind::RequestRate => format!(
            "sum(irate(request_total{{namespace=\"{namespace}\"}}[{range}])) by ({label})"
        ),
        MetricKind::SuccessRate => format!(
            "sum(irate(response_total{{classification=\"success\",namespace=\"{namespace}\"}}[{range}])) by ({label}) \
             / sum(irate(response_total{{namespace=\"{namespace}\"}}[{range}])) by ({label})"
        ),
        MetricKind::Latency => format!(
            "histogram_quantile(0.99, sum(irate(response_latency_ms_bucket{{namespace=\"{namespace}\"}}[{range}])) by (le, {label}))"
        ),
    }
}

/// Queries one metric kind for one resource type, grouped by its label.
pub async fn query_resource(
    backend: &dyn MetricsBackend,
    kind: MetricKind,
    resource: ResourceType,
    namespace: &str,
    window: Window,
) -> QueryResult {
    let query = build_query(kind, resource, namespace, window);
    debug!(%resource, metric = %kind, %query, "dispatching backend query");
    backend.instant_query(&query, Utc::now()).await
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
