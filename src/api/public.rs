use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::metrics::GatewayMetrics;
use crate::models::{
    AggregationRequest, AggregationResponse, MetricKind, ResourceScope, ResourceType, Window,
};
use crate::proto::{
    metric_value, CheckResult, CheckStatus, Empty, ListPodsResponse, MetricDatapoint,
    MetricName, MetricRequest, MetricResponse, MetricSeries, MetricValue, Pod, SelfCheckRequest,
    SelfCheckResponse, TapRequest, TimeWindow, VersionInfo,
};
use crate::tap::{TapEventSource, TapSession, TapSink};
use crate::{GatewayError, Result};

pub const KUBERNETES_SUBSYSTEM: &str = "kubernetes-api";
pub const METRICS_SUBSYSTEM: &str = "metrics-backend";

/// Query used to probe the metrics backend during a self check.
const PROBE_QUERY: &str = "vector(1)";

pub type RpcResult<T> = std::result::Result<Response<T>, Status>;

/// The request/response calls plus the server-streaming Tap call.
#[tonic::async_trait]
pub trait PublicApi: Send + Sync + 'static {
    async fn stat(&self, request: Request<MetricRequest>) -> RpcResult<MetricResponse>;

    /// Like `stat`, but always for request rate only.
    async fn stat_v2(&self, request: Request<MetricRequest>) -> RpcResult<MetricResponse>;

    async fn version(&self, request: Request<Empty>) -> RpcResult<VersionInfo>;

    async fn list_pods(&self, request: Request<Empty>) -> RpcResult<ListPodsResponse>;

    async fn self_check(
        &self,
        request: Request<SelfCheckRequest>,
    ) -> RpcResult<SelfCheckResponse>;

    /// Pushes events to `sink` until the feed ends, a send fails or `cancel` fires.
    async fn tap(
        &self,
        request: Request<TapRequest>,
        sink: &mut dyn TapSink,
        cancel: CancellationToken,
    ) -> std::result::Result<(), Status>;
}

#[derive(Clone)]
pub struct PublicService {
    aggregator: Aggregator,
    tap_source: Arc<dyn TapEventSource>,
    metrics: GatewayMetrics,
    controller_namespace: String,
}

impl PublicService {
    pub fn new(
        aggregator: Aggregator,
        tap_source: Arc<dyn TapEventSource>,
        metrics: GatewayMetrics,
        controller_namespace: impl Into<String>,
    ) -> Self {
        Self {
            aggregator,
            tap_source,
            metrics,
            controller_namespace: controller_namespace.into(),
        }
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    async fn run_stat(&self, request: &MetricRequest) -> Result<MetricResponse> {
        let req = aggregation_request(request)?;
        let (response, error) = self.aggregator.aggregate(&req).await.into_result()?;

        let errors = match &error {
            Some(err) => {
                warn!(namespace = %req.namespace, error = %err, "partial stat result");
                err.causes().iter().map(ToString::to_string).collect()
            }
            None => Vec::new(),
        };

        Ok(MetricResponse {
            metrics: to_series(&response),
            errors,
        })
    }

    async fn check_kubernetes(&self) -> CheckResult {
        let mut result = CheckResult {
            subsystem_name: KUBERNETES_SUBSYSTEM.to_string(),
            check_description: "can query the Kubernetes API".to_string(),
            ..Default::default()
        };
        match self.aggregator.inventory().check().await {
            Ok(()) => result.set_status(CheckStatus::Ok),
            Err(err) => {
                result.set_status(CheckStatus::Fail);
                result.friendly_message_to_user = err.to_string();
            }
        }
        result
    }

    async fn check_backend(&self) -> CheckResult {
        let mut result = CheckResult {
            subsystem_name: METRICS_SUBSYSTEM.to_string(),
            check_description: "can query the metrics backend".to_string(),
            ..Default::default()
        };
        match self
            .aggregator
            .backend()
            .instant_query(PROBE_QUERY, Utc::now())
            .await
        {
            Ok(_) => result.set_status(CheckStatus::Ok),
            Err(err) => {
                result.set_status(CheckStatus::Fail);
                result.friendly_message_to_user = err.to_string();
            }
        }
        result
    }
}

#[tonic::async_trait]
impl PublicApi for PublicService {
    async fn stat(&self, request: Request<MetricRequest>) -> RpcResult<MetricResponse> {
        let response = self.run_stat(request.get_ref()).await?;
        Ok(Response::new(response))
    }

    async fn stat_v2(&self, request: Request<MetricRequest>) -> RpcResult<MetricResponse> {
        let mut request = request.into_inner();
        request.metrics = vec![MetricName::RequestRate as i32];
        let response = self.run_stat(&request).await?;
        Ok(Response::new(response))
    }

    async fn version(&self, _request: Request<Empty>) -> RpcResult<VersionInfo> {
        Ok(Response::new(VersionInfo {
            release_version: env!("CARGO_PKG_VERSION").to_string(),
            build_date: option_env!("BUILD_DATE").unwrap_or("unknown").to_string(),
        }))
    }

    async fn list_pods(&self, _request: Request<Empty>) -> RpcResult<ListPodsResponse> {
        let descriptors = self
            .aggregator
            .inventory()
            .list_resources(ResourceType::Pod, "")
            .await?;

        let pods = descriptors
            .into_iter()
            .map(|pod| Pod {
                deployment: pod.owning_deployment().unwrap_or_default(),
                control_plane: pod.namespace == self.controller_namespace,
                pod_ip: pod.pod_ip.unwrap_or_default(),
                status: pod.phase.unwrap_or_default(),
                name: pod.name,
                namespace: pod.namespace,
            })
            .collect::<Vec<_>>();

        debug!(pods = pods.len(), "listed pods");
        Ok(Response::new(ListPodsResponse { pods }))
    }

    async fn self_check(
        &self,
        _request: Request<SelfCheckRequest>,
    ) -> RpcResult<SelfCheckResponse> {
        let (kubernetes, backend) = tokio::join!(self.check_kubernetes(), self.check_backend());
        Ok(Response::new(SelfCheckResponse {
            results: vec![kubernetes, backend],
        }))
    }

    async fn tap(
        &self,
        request: Request<TapRequest>,
        sink: &mut dyn TapSink,
        cancel: CancellationToken,
    ) -> std::result::Result<(), Status> {
        let request = request.into_inner();
        let mut session = TapSession::new(self.metrics.clone());
        let reason = session
            .run(&request, self.tap_source.as_ref(), sink, &cancel)
            .await?;
        info!(?reason, delivered = session.delivered(), "tap call finished");
        Ok(())
    }
}

/// Normalizes a schema request. Unknown enum values are rejected rather than skipped.
pub fn aggregation_request(request: &MetricRequest) -> Result<AggregationRequest> {
    let scope = if request.resource.is_empty() {
        ResourceScope::All
    } else {
        request.resource.parse()?
    };

    let metrics = request
        .metrics
        .iter()
        .map(|&value| {
            MetricName::from_i32(value)
                .map(MetricKind::from)
                .ok_or_else(|| GatewayError::Decode(format!("unknown metric {}", value)))
        })
        .collect::<Result<Vec<_>>>()?;

    let window = TimeWindow::from_i32(request.window)
        .map(Window::from)
        .ok_or_else(|| GatewayError::Decode(format!("unknown window {}", request.window)))?;

    Ok(AggregationRequest::new(scope, request.namespace.clone(), metrics)
        .with_window(window)
        .with_inventory(request.include_inventory))
}

fn to_series(response: &AggregationResponse) -> Vec<MetricSeries> {
    response
        .series
        .iter()
        .flat_map(|series| {
            series.entries.iter().map(move |(identity, entry)| MetricSeries {
                name: MetricName::from(series.kind) as i32,
                resource: series.resource.category().to_string(),
                identity: identity.clone(),
                metadata: entry.labels.clone(),
                datapoints: entry
                    .datapoints
                    .iter()
                    .map(|point| MetricDatapoint {
                        value: Some(MetricValue {
                            value: Some(metric_value::Value::Gauge(point.value)),
                        }),
                        timestamp_ms: point.timestamp_ms,
                    })
                    .collect(),
            })
        })
        .collect()
}
