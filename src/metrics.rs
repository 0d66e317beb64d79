use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;

use crate::models::{MetricKind, ResourceType};
use crate::{GatewayError, Result};

/// The gateway's own collectors, owned by one registry built at startup.
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    backend_queries: IntCounterVec,
    backend_query_duration: HistogramVec,
    http_requests: IntCounterVec,
    tap_events: IntCounter,
    tap_sessions: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("mesh_stats_gateway".to_string()), None)
            .map_err(metrics_error)?;

        let backend_queries = IntCounterVec::new(
            Opts::new("backend_queries_total", "Backend queries by outcome"),
            &["resource", "metric", "outcome"],
        )
        .map_err(metrics_error)?;
        let backend_query_duration = HistogramVec::new(
            HistogramOpts::new(
                "backend_query_duration_seconds",
                "Backend query duration in seconds",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
            &["resource", "metric"],
        )
        .map_err(metrics_error)?;
        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "HTTP bridge requests by route and status"),
            &["route", "status"],
        )
        .map_err(metrics_error)?;
        let tap_events = IntCounter::new("tap_events_total", "Tap events relayed to clients")
            .map_err(metrics_error)?;
        let tap_sessions = IntGauge::new("tap_sessions_active", "Open tap relays")
            .map_err(metrics_error)?;

        registry
            .register(Box::new(backend_queries.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(backend_query_duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(http_requests.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(tap_events.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(tap_sessions.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            backend_queries,
            backend_query_duration,
            http_requests,
            tap_events,
            tap_sessions,
        })
    }

    pub fn query_timer(&self, resource: ResourceType, kind: MetricKind) -> QueryTimer {
        QueryTimer {
            metrics: self.clone(),
            resource,
            kind,
            start: Instant::now(),
        }
    }

    pub fn record_http(&self, route: &str, status: u16) {
        self.http_requests
            .with_label_values(&[route, &status.to_string()])
            .inc();
    }

    pub fn record_tap_event(&self) {
        self.tap_events.inc();
    }

    pub fn tap_session(&self) -> TapSessionGuard {
        self.tap_sessions.inc();
        TapSessionGuard {
            gauge: self.tap_sessions.clone(),
        }
    }

    /// Renders every collector in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| GatewayError::Encode(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| GatewayError::Encode(e.to_string()))
    }
}

fn metrics_error(err: prometheus::Error) -> GatewayError {
    GatewayError::Internal(format!("metrics registry: {}", err))
}

pub struct QueryTimer {
    metrics: GatewayMetrics,
    resource: ResourceType,
    kind: MetricKind,
    start: Instant,
}

impl QueryTimer {
    pub fn finish(self, ok: bool) {
        let resource = self.resource.to_string();
        let kind = self.kind.to_string();
        self.metrics
            .backend_query_duration
            .with_label_values(&[&resource, &kind])
            .observe(self.start.elapsed().as_secs_f64());
        self.metrics
            .backend_queries
            .with_label_values(&[&resource, &kind, if ok { "success" } else { "failure" }])
            .inc();
    }
}

pub struct TapSessionGuard {
    gauge: IntGauge,
}

impl Drop for TapSessionGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
