//! HTTP bridge onto the public API.
//!
//! Schema routes speak the JSON mapping of the API messages, or binary
//! protobuf when the request says `application/x-protobuf`. `New` answers
//! with a plain `category -> name -> sample` map instead.

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::QueryRejection, MatchedPath, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri, Version},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use prost::Message;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::{Code, Status};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::public::{PublicApi, PublicService, RpcResult};
use crate::aggregator::Aggregator;
use crate::metrics::GatewayMetrics;
use crate::models::{AggregationRequest, MetricKind, ResourceScope, Window};
use crate::proto::{
    Empty, MetricName, MetricRequest, SelfCheckRequest, TapEvent, TapRequest, TimeWindow,
};
use crate::tap::TapSink;
use crate::{GatewayError, Result};

pub const API_PREFIX: &str = "/api/v1/";

const JSON_CONTENT_TYPE: &str = "application/json";
const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";
const PARTIAL_FAILURE_HEADER: &str = "x-partial-failure";

/// One slot, so the relay waits for the body to take each frame.
const TAP_FRAME_BUFFER: usize = 1;

#[derive(Clone)]
pub struct ApiState {
    pub api: Arc<dyn PublicApi>,
    pub aggregator: Aggregator,
    pub metrics: GatewayMetrics,
}

impl ApiState {
    pub fn new(service: PublicService, metrics: GatewayMetrics) -> Self {
        Self {
            aggregator: service.aggregator().clone(),
            api: Arc::new(service),
            metrics,
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/Stat", post(stat))
        .route("/api/v1/StatV2", get(stat_v2))
        .route("/api/v1/New", get(new_stat))
        .route("/api/v1/Version", any(version))
        .route("/api/v1/ListPods", any(list_pods))
        .route("/api/v1/Tap", post(tap))
        .route("/api/v1/SelfCheck", any(self_check))
        .route("/metrics", get(render_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), record_request))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireFormat {
    Json,
    Protobuf,
}

impl WireFormat {
    /// Picks `(request, reply)` formats. The body is read per `Content-Type`;
    /// the reply follows `Accept` and otherwise mirrors the request.
    fn negotiate(headers: &HeaderMap) -> (Self, Self) {
        let declared = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(Self::from_media_types)
        };

        let request = declared(header::CONTENT_TYPE).unwrap_or(WireFormat::Json);
        let reply = declared(header::ACCEPT).unwrap_or(request);
        (request, reply)
    }

    /// First known type in a comma-separated media type list.
    fn from_media_types(value: &str) -> Option<Self> {
        value.split(',').map(str::trim).find_map(|media| {
            if media.starts_with(PROTOBUF_CONTENT_TYPE) {
                Some(WireFormat::Protobuf)
            } else if [JSON_CONTENT_TYPE, NDJSON_CONTENT_TYPE]
                .iter()
                .any(|json| media.starts_with(json))
            {
                Some(WireFormat::Json)
            } else {
                None
            }
        })
    }

    fn content_type(self) -> &'static str {
        match self {
            WireFormat::Json => JSON_CONTENT_TYPE,
            WireFormat::Protobuf => PROTOBUF_CONTENT_TYPE,
        }
    }

    fn stream_content_type(self) -> &'static str {
        match self {
            WireFormat::Json => NDJSON_CONTENT_TYPE,
            WireFormat::Protobuf => PROTOBUF_CONTENT_TYPE,
        }
    }

    /// An empty body decodes to the message's defaults.
    fn decode<M>(self, body: &[u8]) -> Result<M>
    where
        M: Message + Default + DeserializeOwned,
    {
        if body.is_empty() {
            return Ok(M::default());
        }
        match self {
            WireFormat::Json => Ok(serde_json::from_slice(body)?),
            WireFormat::Protobuf => Ok(M::decode(body)?),
        }
    }

    fn encode<M: Message + Serialize>(self, message: &M) -> Result<Vec<u8>> {
        match self {
            WireFormat::Json => {
                serde_json::to_vec(message).map_err(|e| GatewayError::Encode(e.to_string()))
            }
            WireFormat::Protobuf => Ok(message.encode_to_vec()),
        }
    }

    /// One stream frame: a JSON line, or a length-delimited message.
    fn encode_frame<M: Message + Serialize>(self, message: &M) -> Result<Bytes> {
        match self {
            WireFormat::Json => {
                let mut line = self.encode(message)?;
                line.push(b'\n');
                Ok(Bytes::from(line))
            }
            WireFormat::Protobuf => Ok(Bytes::from(message.encode_length_delimited_to_vec())),
        }
    }

    fn reply<M: Message + Serialize>(self, result: RpcResult<M>) -> Response {
        let message = match result {
            Ok(response) => response.into_inner(),
            Err(status) => return status_response(&status),
        };
        match self.encode(&message) {
            Ok(body) => ([(header::CONTENT_TYPE, self.content_type())], body).into_response(),
            Err(err) => err.into_response(),
        }
    }
}

fn status_response(status: &Status) -> Response {
    let code = match status.code() {
        Code::InvalidArgument | Code::OutOfRange | Code::FailedPrecondition => {
            StatusCode::BAD_REQUEST
        }
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let body = Json(json!({
        "error": status.message(),
        "code": format!("{:?}", status.code()),
    }));
    (code, body).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatParams {
    namespace: String,
    resource: Option<String>,
    window: Option<String>,
}

impl StatParams {
    fn window(&self) -> Result<Window> {
        self.window
            .as_deref()
            .map_or(Ok(Window::default()), str::parse)
    }
}

type ParamsResult = std::result::Result<Query<StatParams>, QueryRejection>;

fn stat_params(params: ParamsResult) -> Result<StatParams> {
    params
        .map(|Query(params)| params)
        .map_err(|rejection| GatewayError::Decode(rejection.body_text()))
}

async fn stat(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let (input, output) = WireFormat::negotiate(&headers);
    match input.decode::<MetricRequest>(&body) {
        Ok(request) => output.reply(state.api.stat(tonic::Request::new(request)).await),
        Err(err) => err.into_response(),
    }
}

async fn stat_v2(
    State(state): State<ApiState>,
    headers: HeaderMap,
    params: ParamsResult,
) -> Response {
    let (_, format) = WireFormat::negotiate(&headers);
    let request = match stat_params(params).and_then(|params| {
        Ok(MetricRequest {
            metrics: vec![MetricName::RequestRate as i32],
            window: TimeWindow::from(params.window()?) as i32,
            resource: params.resource.unwrap_or_default(),
            namespace: params.namespace,
            include_inventory: false,
        })
    }) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    format.reply(state.api.stat_v2(tonic::Request::new(request)).await)
}

/// Ad-hoc stat: request rate per resource, including resources with no traffic.
async fn new_stat(
    State(state): State<ApiState>,
    params: ParamsResult,
) -> Response {
    let params = match stat_params(params) {
        Ok(params) => params,
        Err(err) => return err.into_response(),
    };
    let scope = match params.resource.as_deref().unwrap_or_default().parse::<ResourceScope>() {
        Ok(scope) => scope,
        Err(err) => return err.into_response(),
    };
    let window = match params.window() {
        Ok(window) => window,
        Err(err) => return err.into_response(),
    };

    let req = AggregationRequest::new(scope, params.namespace, [MetricKind::RequestRate])
        .with_window(window)
        .with_inventory(true);
    let (response, error) = match state.aggregator.aggregate(&req).await.into_result() {
        Ok(outcome) => outcome,
        Err(err) => return err.into_response(),
    };

    let mut reply = Json(response.by_category(MetricKind::RequestRate)).into_response();
    if let Some(err) = error {
        warn!(namespace = %req.namespace, error = %err, "partial stat result");
        let value = HeaderValue::from_str(&err.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("true"));
        reply.headers_mut().insert(PARTIAL_FAILURE_HEADER, value);
    }
    reply
}

async fn version(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let (input, output) = WireFormat::negotiate(&headers);
    match input.decode::<Empty>(&body) {
        Ok(request) => output.reply(state.api.version(tonic::Request::new(request)).await),
        Err(err) => err.into_response(),
    }
}

async fn list_pods(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let (input, output) = WireFormat::negotiate(&headers);
    match input.decode::<Empty>(&body) {
        Ok(request) => output.reply(state.api.list_pods(tonic::Request::new(request)).await),
        Err(err) => err.into_response(),
    }
}

async fn self_check(State(state): State<ApiState>, headers: HeaderMap, body: Bytes) -> Response {
    let (input, output) = WireFormat::negotiate(&headers);
    match input.decode::<SelfCheckRequest>(&body) {
        Ok(request) => output.reply(state.api.self_check(tonic::Request::new(request)).await),
        Err(err) => err.into_response(),
    }
}

/// Forwards encoded events to the response body.
struct ChannelSink {
    frames: mpsc::Sender<Bytes>,
    format: WireFormat,
    sent: u64,
}

impl ChannelSink {
    /// Reports a failure in-band once the stream has started. Protobuf
    /// streams are simply cut short.
    async fn fail(&mut self, status: &Status) {
        if self.sent == 0 || self.format == WireFormat::Protobuf {
            return;
        }
        let mut line = json!({ "error": status.message() }).to_string().into_bytes();
        line.push(b'\n');
        if self.frames.send(Bytes::from(line)).await.is_err() {
            debug!(error = %status.message(), "tap client gone before the error line");
        }
    }
}

#[async_trait]
impl TapSink for ChannelSink {
    async fn send(&mut self, event: &TapEvent) -> Result<()> {
        let frame = self.format.encode_frame(event)?;
        self.frames
            .send(frame)
            .await
            .map_err(|_| GatewayError::Internal("tap client went away".to_string()))?;
        self.sent += 1;
        Ok(())
    }
}

/// Response body of a tap call. Dropping it cancels the relay.
struct TapBody<S> {
    frames: S,
    _cancel: DropGuard,
}

impl<S> Stream for TapBody<S>
where
    S: Stream<Item = Bytes> + Unpin,
{
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().frames)
            .poll_next(cx)
            .map(|frame| frame.map(Ok))
    }
}

/// Relays a tap as a streamed body. Headers are held back until the first
/// event, so a call that fails before streaming still gets an error status.
async fn tap(
    State(state): State<ApiState>,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if version < Version::HTTP_11 {
        return GatewayError::StreamingUnsupported.into_response();
    }

    let (input, format) = WireFormat::negotiate(&headers);
    let request = match input.decode::<TapRequest>(&body) {
        Ok(request) => request,
        Err(err) => return err.into_response(),
    };

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let (frames, mut received) = mpsc::channel(TAP_FRAME_BUFFER);
    let mut sink = ChannelSink {
        frames,
        format,
        sent: 0,
    };

    let api = state.api.clone();
    let relay = tokio::spawn(async move {
        let result = api.tap(tonic::Request::new(request), &mut sink, cancel).await;
        if let Err(status) = &result {
            sink.fail(status).await;
        }
        result
    });

    let Some(first) = received.recv().await else {
        return match relay.await {
            Ok(Ok(())) => {
                debug!("tap ended before any event");
                ([(header::CONTENT_TYPE, format.stream_content_type())], Body::empty())
                    .into_response()
            }
            Ok(Err(status)) => status_response(&status),
            Err(join_err) => GatewayError::Internal(join_err.to_string()).into_response(),
        };
    };

    let frames = stream::iter([first]).chain(ReceiverStream::new(received));
    let body = TapBody {
        frames,
        _cancel: guard,
    };
    (
        [(header::CONTENT_TYPE, format.stream_content_type())],
        Body::from_stream(body),
    )
        .into_response()
}

async fn render_metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.render() {
        Ok(text) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn not_found(State(state): State<ApiState>, uri: Uri) -> Response {
    state
        .metrics
        .record_http("unmatched", StatusCode::NOT_FOUND.as_u16());
    let body = Json(json!({
        "error": format!("no route for {}", uri.path()),
        "code": "NotFound",
    }));
    (StatusCode::NOT_FOUND, body).into_response()
}

async fn record_request(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().trim_start_matches(API_PREFIX).to_string())
        .unwrap_or_default();
    let response = next.run(request).await;
    state.metrics.record_http(&route, response.status().as_u16());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::ResourceDescriptor;
    use crate::models::{NewStatResponse, ResourceType};
    use crate::proto::{MetricResponse, VersionInfo};
    use crate::tap::TapEventSource;
    use crate::testing::{
        sample, tap_event, Canned, FakeBackend, FakeInventory, ScriptedTapSource,
    };
    use pretty_assertions::assert_eq;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_with(
        backend: FakeBackend,
        inventory: FakeInventory,
        source: ScriptedTapSource,
    ) -> Router {
        app_with_metrics(backend, inventory, source, GatewayMetrics::new().unwrap())
    }

    fn app_with_metrics(
        backend: FakeBackend,
        inventory: FakeInventory,
        source: ScriptedTapSource,
        metrics: GatewayMetrics,
    ) -> Router {
        let source: Arc<dyn TapEventSource> = Arc::new(source);
        let service = PublicService::new(
            Aggregator::new(Arc::new(backend), Arc::new(inventory), metrics.clone()),
            source,
            metrics.clone(),
            "conduit",
        );
        router(ApiState::new(service, metrics))
    }

    fn app(backend: FakeBackend) -> Router {
        app_with(backend, FakeInventory::default(), ScriptedTapSource::new(Vec::new()))
    }

    fn deployments_backend() -> FakeBackend {
        FakeBackend::new().respond(
            "k8s_deployment",
            Canned::Samples(vec![sample("k8s_deployment", "web", 2.0)]),
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    async fn eventually(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn active_taps(metrics: &GatewayMetrics, count: u32) -> bool {
        metrics
            .render()
            .unwrap()
            .contains(&format!("mesh_stats_gateway_tap_sessions_active {}", count))
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let response = app(FakeBackend::new())
            .oneshot(get("/api/v1/Nope"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "NotFound");
    }

    #[tokio::test]
    async fn stat_round_trips_json() {
        let request = post_json(
            "/api/v1/Stat",
            json!({"metrics": ["REQUEST_RATE"], "namespace": "prod", "resource": "deployments"}),
        );

        let response = app(deployments_backend()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["metrics"][0]["identity"], "web");
        assert_eq!(body["metrics"][0]["name"], "REQUEST_RATE");
        assert_eq!(body["metrics"][0]["datapoints"][0]["value"]["gauge"], 2.0);
        assert_eq!(body["errors"], json!([]));
    }

    #[tokio::test]
    async fn stat_speaks_protobuf() {
        let message = MetricRequest {
            metrics: vec![MetricName::RequestRate as i32],
            namespace: "prod".to_string(),
            resource: "deployments".to_string(),
            ..Default::default()
        };
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/Stat")
            .header(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(Body::from(message.encode_to_vec()))
            .unwrap();

        let response = app(deployments_backend()).oneshot(request).await.unwrap();

        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROTOBUF_CONTENT_TYPE
        );
        let decoded = MetricResponse::decode(body_bytes(response).await).unwrap();
        assert_eq!(decoded.metrics.len(), 1);
        assert_eq!(decoded.metrics[0].identity, "web");
    }

    #[tokio::test]
    async fn json_request_can_ask_for_a_protobuf_reply() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/Stat")
            .header(header::CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(header::ACCEPT, PROTOBUF_CONTENT_TYPE)
            .body(Body::from(
                json!({"metrics": ["REQUEST_RATE"], "namespace": "prod", "resource": "deployments"})
                    .to_string(),
            ))
            .unwrap();

        let response = app(deployments_backend()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            PROTOBUF_CONTENT_TYPE
        );
        let decoded = MetricResponse::decode(body_bytes(response).await).unwrap();
        assert_eq!(decoded.metrics[0].identity, "web");
    }

    #[test]
    fn reply_format_follows_accept_then_request() {
        let headers = |pairs: &[(header::HeaderName, &'static str)]| {
            let mut map = HeaderMap::new();
            for (name, value) in pairs {
                map.insert(name.clone(), HeaderValue::from_static(*value));
            }
            map
        };

        assert_eq!(
            WireFormat::negotiate(&headers(&[])),
            (WireFormat::Json, WireFormat::Json)
        );
        assert_eq!(
            WireFormat::negotiate(&headers(&[
                (header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE),
                (header::ACCEPT, "*/*"),
            ])),
            (WireFormat::Protobuf, WireFormat::Protobuf)
        );
        assert_eq!(
            WireFormat::negotiate(&headers(&[
                (header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE),
                (header::ACCEPT, "text/html, application/json;q=0.9"),
            ])),
            (WireFormat::Protobuf, WireFormat::Json)
        );
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/Stat")
            .body(Body::from("{not json"))
            .unwrap();

        let response = app(FakeBackend::new()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "DecodeError");
    }

    #[tokio::test]
    async fn total_failure_is_service_unavailable() {
        let backend = FakeBackend::new()
            .respond("k8s_deployment", Canned::Unavailable("refused".to_string()));
        let request = post_json(
            "/api/v1/Stat",
            json!({"metrics": ["REQUEST_RATE"], "resource": "deployments"}),
        );

        let response = app(backend).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["code"], "Unavailable");
        assert!(body["error"].as_str().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn stat_v2_reads_query_parameters() {
        let backend = deployments_backend();
        let queries = backend.recorded_queries();

        let response = app(backend)
            .oneshot(get("/api/v1/StatV2?namespace=prod&window=1m"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let queries = queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert!(queries
            .iter()
            .all(|query| query.contains("namespace=\"prod\"") && query.contains("[1m]")));
    }

    #[tokio::test]
    async fn stat_v2_rejects_unknown_window() {
        let response = app(FakeBackend::new())
            .oneshot(get("/api/v1/StatV2?window=5y"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn new_stat_includes_idle_resources() {
        let inventory = FakeInventory::default().with(
            ResourceType::Deployment,
            vec![
                ResourceDescriptor::new("web", "prod"),
                ResourceDescriptor::new("idle", "prod"),
            ],
        );
        let app = app_with(deployments_backend(), inventory, ScriptedTapSource::new(Vec::new()));

        let response = app
            .oneshot(get("/api/v1/New?namespace=prod&resource=deployments"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(PARTIAL_FAILURE_HEADER).is_none());
        let body: NewStatResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body.len(), 1);
        assert_eq!(body["deployments"]["web"].value.unwrap().value, 2.0);
        assert_eq!(body["deployments"]["idle"].value, None);
    }

    #[tokio::test]
    async fn new_stat_flags_partial_failure() {
        let backend = deployments_backend()
            .respond("k8s_pod_template_hash", Canned::Unavailable("timeout".to_string()));

        let response = app(backend)
            .oneshot(get("/api/v1/New?namespace=prod&resource=all"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let flag = response.headers()[PARTIAL_FAILURE_HEADER].to_str().unwrap();
        assert!(flag.contains("timeout"));
        let body: NewStatResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(body.contains_key("deployments"));
        assert!(!body.contains_key("pods"));
    }

    #[tokio::test]
    async fn new_stat_requires_a_known_resource() {
        let response = app(FakeBackend::new())
            .oneshot(get("/api/v1/New?namespace=prod&resource=services"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "InvalidResource");
    }

    #[tokio::test]
    async fn version_accepts_an_empty_body() {
        let response = app(FakeBackend::new())
            .oneshot(get("/api/v1/Version"))
            .await
            .unwrap();

        let version: VersionInfo = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(version.release_version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn tap_streams_one_line_per_event() {
        let source = ScriptedTapSource::new(vec![tap_event(1), tap_event(2), tap_event(3)]);
        let app = app_with(FakeBackend::new(), FakeInventory::default(), source);

        let response = app
            .oneshot(post_json("/api/v1/Tap", json!({"targetDeployment": "web"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], NDJSON_CONTENT_TYPE);
        let body = body_bytes(response).await;
        let events: Vec<TapEvent> = std::str::from_utf8(&body)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(events, vec![tap_event(1), tap_event(2), tap_event(3)]);
    }

    #[tokio::test]
    async fn tap_error_after_events_ends_with_error_line() {
        let source = ScriptedTapSource::failing_after(vec![tap_event(1)], "feed lost");
        let app = app_with(FakeBackend::new(), FakeInventory::default(), source);

        let response = app
            .oneshot(post_json("/api/v1/Tap", json!({"targetPod": "web-1"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_bytes(response).await;
        let lines: Vec<&str> = std::str::from_utf8(&body).unwrap().lines().collect();
        assert_eq!(lines.len(), 2);
        let trailer: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert!(trailer["error"].as_str().unwrap().contains("feed lost"));
    }

    #[tokio::test]
    async fn tap_protobuf_frames_are_length_delimited() {
        let source = ScriptedTapSource::new(vec![tap_event(1), tap_event(2)]);
        let app = app_with(FakeBackend::new(), FakeInventory::default(), source);
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/Tap")
            .header(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(Body::from(
                TapRequest {
                    target_pod: "web-1".to_string(),
                    ..Default::default()
                }
                .encode_to_vec(),
            ))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        let mut body = body_bytes(response).await;
        assert_eq!(TapEvent::decode_length_delimited(&mut body).unwrap(), tap_event(1));
        assert_eq!(TapEvent::decode_length_delimited(&mut body).unwrap(), tap_event(2));
        assert!(body.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn error_line_for_a_departed_client_is_skipped() {
        let (frames, received) = mpsc::channel(TAP_FRAME_BUFFER);
        let mut sink = ChannelSink {
            frames,
            format: WireFormat::Json,
            sent: 0,
        };
        tokio_test::assert_ok!(sink.send(&tap_event(1)).await);
        drop(received);

        sink.fail(&Status::unavailable("feed lost")).await;

        assert_eq!(sink.sent, 1);
        assert!(sink.frames.is_closed());
    }

    #[tokio::test]
    async fn dropping_the_tap_body_stops_the_relay() {
        let metrics = GatewayMetrics::new().unwrap();
        let source = ScriptedTapSource::pending_after(vec![tap_event(1)]);
        let app = app_with_metrics(
            FakeBackend::new(),
            FakeInventory::default(),
            source,
            metrics.clone(),
        );

        let response = app
            .oneshot(post_json("/api/v1/Tap", json!({"targetPod": "web-1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        let event: TapEvent = serde_json::from_slice(&first).unwrap();
        assert_eq!(event, tap_event(1));
        assert!(active_taps(&metrics, 1));

        drop(frames);
        eventually(|| active_taps(&metrics, 0)).await;
    }

    #[tokio::test]
    async fn abandoned_tap_cancels_a_pending_subscribe() {
        let source = ScriptedTapSource::stalled();
        let waiting = source.stalled_calls();
        let app = app_with(FakeBackend::new(), FakeInventory::default(), source);

        let call = tokio::spawn(
            app.oneshot(post_json("/api/v1/Tap", json!({"targetDeployment": "web"}))),
        );
        eventually(|| waiting.load(Ordering::SeqCst) == 1).await;
        assert!(!call.is_finished());

        call.abort();
        eventually(|| waiting.load(Ordering::SeqCst) == 0).await;
    }

    #[tokio::test]
    async fn invalid_tap_fails_before_streaming() {
        let source = ScriptedTapSource::new(vec![tap_event(1)]);
        let app = app_with(FakeBackend::new(), FakeInventory::default(), source);

        let response = app
            .oneshot(post_json("/api/v1/Tap", json!({"maxRps": 1.0})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "InvalidArgument");
    }

    #[tokio::test]
    async fn tap_over_http_1_0_is_refused() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/Tap")
            .version(Version::HTTP_10)
            .body(Body::from(json!({"targetPod": "web-1"}).to_string()))
            .unwrap();

        let response = app(FakeBackend::new()).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::HTTP_VERSION_NOT_SUPPORTED);
        assert_eq!(body_json(response).await["code"], "StreamingUnsupported");
    }

    #[tokio::test]
    async fn requests_are_counted_per_route() {
        let app = app(FakeBackend::new());

        app.clone().oneshot(get("/api/v1/Version")).await.unwrap();
        let response = app.oneshot(get("/metrics")).await.unwrap();

        let text = String::from_utf8(body_bytes(response).await.to_vec()).unwrap();
        assert!(text.contains(
            "mesh_stats_gateway_http_requests_total{route=\"Version\",status=\"200\"} 1"
        ));
    }
}
