//! Live tap relay: request validation, the sink seam and the per-call
//! session that moves events from a source to a sink in order.

pub mod source;

use async_trait::async_trait;
use futures::StreamExt;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::GatewayMetrics;
use crate::proto::{TapEvent, TapRequest};
use crate::{GatewayError, Result};

pub use self::source::{DisabledTapSource, HttpTapSource, TapEventSource, TapEventStream};

/// Destination of relayed events.
///
/// `send` must hand the event to the peer before returning; buffering an
/// event without flushing it breaks incremental delivery.
#[async_trait]
pub trait TapSink: Send {
    async fn send(&mut self, event: &TapEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapState {
    Idle,
    Streaming,
    Closed,
}

/// Why a session closed without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Exhausted,
    Cancelled,
}

pub fn validate(request: &TapRequest) -> Result<()> {
    let invalid = |message: String| Err(GatewayError::InvalidTapRequest(message));

    match (
        request.target_pod.is_empty(),
        request.target_deployment.is_empty(),
    ) {
        (true, true) => return invalid("a target pod or deployment is required".to_string()),
        (false, false) => {
            return invalid("only one of target pod and target deployment may be set".to_string())
        }
        _ => {}
    }

    if !request.max_rps.is_finite() || request.max_rps < 0.0 {
        return invalid(format!("maxRps must be a non-negative number, got {}", request.max_rps));
    }

    for (name, port) in [("toPort", request.to_port), ("fromPort", request.from_port)] {
        if port > u32::from(u16::MAX) {
            return invalid(format!("{} {} is out of range", name, port));
        }
    }

    for (name, ip) in [("toIp", &request.to_ip), ("fromIp", &request.from_ip)] {
        if !ip.is_empty() && ip.parse::<IpAddr>().is_err() {
            return invalid(format!("{} {:?} is not an IP address", name, ip));
        }
    }

    if !matches!(request.scheme.as_str(), "" | "http" | "https") {
        return invalid(format!("unsupported scheme {:?}", request.scheme));
    }

    if !request.method.chars().all(is_token_char) {
        return invalid(format!("invalid method {:?}", request.method));
    }

    Ok(())
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// One tap call: `Idle -> Streaming -> Closed`.
pub struct TapSession {
    id: Uuid,
    state: TapState,
    delivered: u64,
    metrics: GatewayMetrics,
}

impl TapSession {
    pub fn new(metrics: GatewayMetrics) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TapState::Idle,
            delivered: 0,
            metrics,
        }
    }

    pub fn state(&self) -> TapState {
        self.state
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Relays events from `source` to `sink` in source order until the source
    /// ends, the sink fails, or `cancel` fires.
    pub async fn run(
        &mut self,
        request: &TapRequest,
        source: &dyn TapEventSource,
        sink: &mut dyn TapSink,
        cancel: &CancellationToken,
    ) -> Result<CloseReason> {
        if let Err(err) = validate(request) {
            warn!(session = %self.id, error = %err, "rejecting tap request");
            self.state = TapState::Closed;
            return Err(err);
        }

        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.state = TapState::Closed;
                debug!(session = %self.id, "tap cancelled before subscribing");
                return Ok(CloseReason::Cancelled);
            }
            subscribed = source.subscribe(request) => subscribed,
        };
        let mut events = match subscribed {
            Ok(events) => events,
            Err(err) => {
                self.state = TapState::Closed;
                return Err(err);
            }
        };

        let _active = self.metrics.tap_session();
        self.state = TapState::Streaming;
        info!(
            session = %self.id,
            pod = %request.target_pod,
            deployment = %request.target_deployment,
            "tap streaming"
        );

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(CloseReason::Cancelled),
                next = events.next() => next,
            };

            match next {
                None => break Ok(CloseReason::Exhausted),
                Some(Err(err)) => break Err(err),
                Some(Ok(event)) => {
                    if let Err(err) = sink.send(&event).await {
                        break Err(err);
                    }
                    self.delivered += 1;
                    self.metrics.record_tap_event();
                }
            }
        };

        self.state = TapState::Closed;
        debug!(session = %self.id, delivered = self.delivered, ?outcome, "tap closed");
        outcome
    }
}
