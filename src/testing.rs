//! In-process fakes shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::MetricsBackend;
use crate::inventory::{ResourceDescriptor, ResourceInventory};
use crate::models::{LabeledSample, QueryResult, ResourceType};
use crate::proto::{tap_http_event, RequestInit, TapEvent, TapHttpEvent, TapRequest};
use crate::tap::{TapEventSource, TapEventStream, TapSink};
use crate::{GatewayError, Result};

pub fn sample(label: &str, identity: &str, value: f64) -> LabeledSample {
    let mut labels = BTreeMap::new();
    labels.insert(label.to_string(), identity.to_string());
    LabeledSample::new(labels, value, 1_700_000_000_000)
}

/// What the fake backend answers for a query.
#[derive(Debug, Clone)]
pub enum Canned {
    Samples(Vec<LabeledSample>),
    Shape(String),
    Unavailable(String),
}

impl Canned {
    fn to_result(&self) -> QueryResult {
        match self {
            Canned::Samples(samples) => Ok(samples.clone()),
            Canned::Shape(kind) => Err(GatewayError::UnexpectedResultShape(kind.clone())),
            Canned::Unavailable(message) => Err(GatewayError::BackendUnavailable(message.clone())),
        }
    }
}

struct Rule {
    needle: String,
    delay: Option<Duration>,
    answer: Canned,
}

/// Answers each query with the first rule whose needle the query contains,
/// or an empty vector when none match.
#[derive(Default)]
pub struct FakeBackend {
    rules: Vec<Rule>,
    queries: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, needle: &str, answer: Canned) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            delay: None,
            answer,
        });
        self
    }

    pub fn respond_after(mut self, needle: &str, delay: Duration, answer: Canned) -> Self {
        self.rules.push(Rule {
            needle: needle.to_string(),
            delay: Some(delay),
            answer,
        });
        self
    }

    pub fn recorded_queries(&self) -> Arc<Mutex<Vec<String>>> {
        self.queries.clone()
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl MetricsBackend for FakeBackend {
    async fn instant_query(&self, query: &str, _at: DateTime<Utc>) -> QueryResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());

        let Some(rule) = self.rules.iter().find(|rule| query.contains(&rule.needle)) else {
            return Ok(Vec::new());
        };
        if let Some(delay) = rule.delay {
            tokio::time::sleep(delay).await;
        }
        rule.answer.to_result()
    }
}

#[derive(Default)]
pub struct FakeInventory {
    resources: BTreeMap<ResourceType, Vec<ResourceDescriptor>>,
    failing: BTreeSet<ResourceType>,
    unreachable: bool,
}

impl FakeInventory {
    pub fn with(mut self, resource: ResourceType, items: Vec<ResourceDescriptor>) -> Self {
        self.resources.insert(resource, items);
        self
    }

    pub fn failing(mut self, resource: ResourceType) -> Self {
        self.failing.insert(resource);
        self
    }

    /// Fails the health check as well as every listing.
    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }
}

#[async_trait]
impl ResourceInventory for FakeInventory {
    async fn list_resources(
        &self,
        resource: ResourceType,
        namespace: &str,
    ) -> Result<Vec<ResourceDescriptor>> {
        if self.unreachable || self.failing.contains(&resource) {
            return Err(GatewayError::InventoryUnavailable(format!(
                "listing {} failed",
                resource
            )));
        }
        Ok(self
            .resources
            .get(&resource)
            .into_iter()
            .flatten()
            .filter(|item| namespace.is_empty() || item.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn check(&self) -> Result<()> {
        if self.unreachable {
            return Err(GatewayError::InventoryUnavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

pub fn tap_event(stream_id: u64) -> TapEvent {
    TapEvent {
        source: "10.0.0.1:40000".to_string(),
        destination: "10.0.0.2:8080".to_string(),
        http: Some(TapHttpEvent {
            event: Some(tap_http_event::Event::RequestInit(RequestInit {
                stream_id,
                method: "GET".to_string(),
                scheme: "http".to_string(),
                authority: "web.prod:8080".to_string(),
                path: "/".to_string(),
            })),
        }),
        ..Default::default()
    }
}

fn stream_id(event: &TapEvent) -> Option<u64> {
    match event.http.as_ref()?.event.as_ref()? {
        tap_http_event::Event::RequestInit(init) => Some(init.stream_id),
        tap_http_event::Event::ResponseInit(init) => Some(init.stream_id),
        tap_http_event::Event::ResponseEnd(end) => Some(end.stream_id),
    }
}

/// Records delivered events. `failing_at(n)` rejects the n-th send.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Vec<TapEvent>,
    attempts: usize,
    fail_at: Option<usize>,
}

impl RecordingSink {
    pub fn failing_at(attempt: usize) -> Self {
        Self {
            fail_at: Some(attempt),
            ..Default::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn stream_ids(&self) -> Vec<u64> {
        self.delivered.iter().filter_map(stream_id).collect()
    }
}

#[async_trait]
impl TapSink for RecordingSink {
    async fn send(&mut self, event: &TapEvent) -> Result<()> {
        self.attempts += 1;
        if self.fail_at == Some(self.attempts) {
            return Err(GatewayError::Internal("client went away".to_string()));
        }
        self.delivered.push(event.clone());
        Ok(())
    }
}

/// Replays a fixed list of events, then ends, hangs or fails. A stalled
/// source never answers `subscribe` at all.
pub struct ScriptedTapSource {
    events: Vec<TapEvent>,
    hang: bool,
    stall: bool,
    error: Option<String>,
    subscriptions: AtomicUsize,
    stalled: Arc<AtomicUsize>,
}

/// Counts a subscribe call that is still waiting.
struct Stalled(Arc<AtomicUsize>);

impl Drop for Stalled {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedTapSource {
    pub fn new(events: Vec<TapEvent>) -> Self {
        Self {
            events,
            hang: false,
            stall: false,
            error: None,
            subscriptions: AtomicUsize::new(0),
            stalled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn stalled() -> Self {
        Self {
            stall: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn pending_after(events: Vec<TapEvent>) -> Self {
        Self {
            hang: true,
            ..Self::new(events)
        }
    }

    pub fn failing_after(events: Vec<TapEvent>, message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::new(events)
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Subscribe calls currently parked on a stalled source.
    pub fn stalled_calls(&self) -> Arc<AtomicUsize> {
        self.stalled.clone()
    }
}

#[async_trait]
impl TapEventSource for ScriptedTapSource {
    async fn subscribe(&self, _request: &TapRequest) -> Result<TapEventStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            self.stalled.fetch_add(1, Ordering::SeqCst);
            let _waiting = Stalled(self.stalled.clone());
            return std::future::pending().await;
        }
        let events = stream::iter(self.events.clone().into_iter().map(Ok));
        if self.hang {
            return Ok(events.chain(stream::pending()).boxed());
        }
        match &self.error {
            Some(message) => {
                let failure = GatewayError::BackendUnavailable(message.clone());
                Ok(events.chain(stream::once(async move { Err(failure) })).boxed())
            }
            None => Ok(events.boxed()),
        }
    }
}
