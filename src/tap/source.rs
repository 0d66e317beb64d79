use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};

use crate::proto::{TapEvent, TapRequest};
use crate::{GatewayError, Result};

pub type TapEventStream = BoxStream<'static, Result<TapEvent>>;

/// Longest event line accepted from the upstream feed.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// The data-plane observation feed.
#[async_trait]
pub trait TapEventSource: Send + Sync {
    async fn subscribe(&self, request: &TapRequest) -> Result<TapEventStream>;
}

/// Used when no upstream feed is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledTapSource;

#[async_trait]
impl TapEventSource for DisabledTapSource {
    async fn subscribe(&self, _request: &TapRequest) -> Result<TapEventStream> {
        Err(GatewayError::BackendUnavailable(
            "no tap feed is configured".to_string(),
        ))
    }
}

/// Reads newline-delimited JSON events from an upstream tap service.
#[derive(Debug, Clone)]
pub struct HttpTapSource {
    client: reqwest::Client,
    url: String,
}

impl HttpTapSource {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build tap client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}/api/v1/Tap", base_url.into().trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl TapEventSource for HttpTapSource {
    async fn subscribe(&self, request: &TapRequest) -> Result<TapEventStream> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!(url = %self.url, error = %e, "tap feed unreachable");
                GatewayError::BackendUnavailable(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::BackendUnavailable(format!(
                "tap feed answered {}",
                response.status()
            )));
        }

        debug!(url = %self.url, "subscribed to tap feed");
        Ok(ndjson_events(Box::pin(response.bytes_stream()), MAX_LINE_BYTES))
    }
}

struct LineReader<S> {
    body: S,
    buffer: Vec<u8>,
    max_line: usize,
    done: bool,
}

/// Splits a byte stream into lines and decodes one event per line. A line
/// longer than `max_line` ends the stream with an error.
fn ndjson_events<S>(body: S, max_line: usize) -> TapEventStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + Unpin + 'static,
{
    let reader = LineReader {
        body,
        buffer: Vec::new(),
        max_line,
        done: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if let Some(pos) = reader.buffer.iter().position(|b| *b == b'\n') {
                let line = reader.buffer.drain(..=pos).collect::<Vec<u8>>();
                match decode_line(&line) {
                    Some(item) => return Some((item, reader)),
                    None => continue,
                }
            }

            if reader.buffer.len() > reader.max_line {
                let len = reader.buffer.len();
                reader.done = true;
                reader.buffer.clear();
                error!(bytes = len, limit = reader.max_line, "tap feed line too long");
                let err = GatewayError::BackendUnavailable(format!(
                    "tap feed sent a line over {} bytes",
                    reader.max_line
                ));
                return Some((Err(err), reader));
            }

            if reader.done {
                let rest = std::mem::take(&mut reader.buffer);
                return decode_line(&rest).map(|item| (item, reader));
            }

            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.done = true;
                    reader.buffer.clear();
                    return Some((Err(GatewayError::BackendUnavailable(e.to_string())), reader));
                }
                None => reader.done = true,
            }
        }
    })
    .boxed()
}

/// `None` for blank lines. An `{"error": ...}` line ends the feed with that error.
fn decode_line(line: &[u8]) -> Option<Result<TapEvent>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return Some(Err(GatewayError::Decode(e.to_string()))),
    };
    if text.is_empty() {
        return None;
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return Some(Err(e.into())),
    };
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return Some(Err(GatewayError::BackendUnavailable(format!(
            "tap feed failed: {}",
            message
        ))));
    }

    Some(serde_json::from_value(value).map_err(GatewayError::from))
}
