//! Fan-out of backend queries per (resource type, metric kind) and the
//! best-effort merge of their results.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::{self, MetricsBackend};
use crate::inventory::{ResourceDescriptor, ResourceInventory};
use crate::metrics::GatewayMetrics;
use crate::models::{
    AggregationRequest, AggregationResponse, LabeledSample, MetricKind, MetricSeries, QueryResult,
    ResourceType, SeriesEntry,
};
use crate::{GatewayError, Result};

/// Result of one aggregation: whatever merged, plus every failure seen.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub response: AggregationResponse,
    /// Composite of all failures, `None` when every unit succeeded.
    pub error: Option<GatewayError>,
    pub dispatched: usize,
    pub failed_queries: usize,
}

impl Aggregation {
    /// True when queries were dispatched and none of them succeeded.
    pub fn is_total_failure(&self) -> bool {
        self.dispatched > 0 && self.failed_queries == self.dispatched
    }

    /// Splits into the merged response and an error, failing outright on total failure.
    pub fn into_result(self) -> Result<(AggregationResponse, Option<GatewayError>)> {
        if self.is_total_failure() {
            return Err(self.error.unwrap_or_else(|| {
                GatewayError::Internal("every query failed without a cause".to_string())
            }));
        }
        Ok((self.response, self.error))
    }
}

struct QueryUnit {
    kind: MetricKind,
    resource: ResourceType,
    result: QueryResult,
}

#[derive(Clone)]
pub struct Aggregator {
    backend: Arc<dyn MetricsBackend>,
    inventory: Arc<dyn ResourceInventory>,
    metrics: GatewayMetrics,
}

impl Aggregator {
    pub fn new(
        backend: Arc<dyn MetricsBackend>,
        inventory: Arc<dyn ResourceInventory>,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            backend,
            inventory,
            metrics,
        }
    }

    pub fn inventory(&self) -> &Arc<dyn ResourceInventory> {
        &self.inventory
    }

    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    /// Runs one query per (resource type, metric kind) pair and merges the
    /// results. Failures never abort the other queries; they are collected
    /// into a single composite error next to the merged data.
    ///
    /// Dropping the returned future aborts every in-flight query.
    pub async fn aggregate(&self, req: &AggregationRequest) -> Aggregation {
        if req.metrics.is_empty() {
            debug!("no metrics requested, skipping dispatch");
            return Aggregation::default();
        }

        let resources = req.scope.resource_types();
        let mut queries = JoinSet::new();
        for &resource in &resources {
            for &kind in &req.metrics {
                let backend = self.backend.clone();
                let namespace = req.namespace.clone();
                let window = req.window;
                let timer = self.metrics.query_timer(resource, kind);
                queries.spawn(async move {
                    let result = backend::query_resource(
                        backend.as_ref(),
                        kind,
                        resource,
                        &namespace,
                        window,
                    )
                    .await;
                    timer.finish(result.is_ok());
                    QueryUnit {
                        kind,
                        resource,
                        result,
                    }
                });
            }
        }
        let dispatched = queries.len();

        let mut listings = JoinSet::new();
        if req.include_inventory {
            for &resource in &resources {
                let inventory = self.inventory.clone();
                let namespace = req.namespace.clone();
                listings.spawn(async move {
                    (resource, inventory.list_resources(resource, &namespace).await)
                });
            }
        }

        info!(
            namespace = %req.namespace,
            dispatched,
            inventory = req.include_inventory,
            "aggregating metrics"
        );

        let mut causes = Vec::new();
        let mut failed_queries = 0;

        // Keyed so the merge never depends on completion order.
        let mut succeeded = BTreeMap::new();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok(QueryUnit {
                    kind,
                    resource,
                    result: Ok(samples),
                }) => {
                    succeeded.insert((kind, resource), samples);
                }
                Ok(QueryUnit {
                    kind,
                    resource,
                    result: Err(err),
                }) => {
                    error!(%resource, metric = %kind, error = %err, "backend query failed");
                    failed_queries += 1;
                    causes.push(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "backend query worker did not complete");
                    failed_queries += 1;
                    causes.push(GatewayError::Internal(join_err.to_string()));
                }
            }
        }

        let mut inventories: BTreeMap<ResourceType, Vec<ResourceDescriptor>> = BTreeMap::new();
        while let Some(joined) = listings.join_next().await {
            match joined {
                Ok((resource, Ok(items))) => {
                    inventories.insert(resource, items);
                }
                Ok((resource, Err(err))) => {
                    error!(%resource, error = %err, "inventory listing failed");
                    causes.push(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "inventory worker did not complete");
                    causes.push(GatewayError::Internal(join_err.to_string()));
                }
            }
        }

        let mut series = Vec::with_capacity(succeeded.len());
        for ((kind, resource), samples) in succeeded {
            let mut merged = MetricSeries {
                kind,
                resource,
                entries: BTreeMap::new(),
            };
            merge_samples(&mut merged, samples);
            if let Some(items) = inventories.get(&resource) {
                for item in items {
                    merged
                        .entries
                        .entry(item.identity(resource).to_string())
                        .or_default();
                }
            }
            series.push(merged);
        }

        let error = if causes.is_empty() {
            None
        } else {
            Some(GatewayError::PartialFailure {
                failed: causes.len(),
                dispatched: dispatched + req.include_inventory as usize * resources.len(),
                causes,
            })
        };

        Aggregation {
            response: AggregationResponse { series },
            error,
            dispatched,
            failed_queries,
        }
    }
}

/// Folds samples into a series keyed by the grouping label. A repeated
/// identity overwrites the earlier sample.
fn merge_samples(series: &mut MetricSeries, samples: Vec<LabeledSample>) {
    let label = series.resource.grouping_label();
    for sample in samples {
        let Some(identity) = sample.label(label).map(str::to_string) else {
            warn!(label, resource = %series.resource, "sample without grouping label dropped");
            continue;
        };
        let entry = SeriesEntry {
            labels: sample.labels,
            datapoints: sample.value.into_iter().collect(),
        };
        if series.entries.insert(identity.clone(), entry).is_some() {
            debug!(%identity, metric = %series.kind, "duplicate sample overwrote earlier value");
        }
    }
}
