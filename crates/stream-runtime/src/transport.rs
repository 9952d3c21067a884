//! Event-source transports.
//!
//! A transport opens one attempt for a [`SourceRequest`] and reports what
//! happens on it as [`TransportEvent`]s. The driver owns the receiving half
//! and closes it when the state machine tears the attempt down.

use eventsource_stream::{Event, Eventsource};
use futures_util::StreamExt;
use reqwest::{Method, StatusCode};
use stream_core::{EventPayload, SourceEvent, SourceRequest, TransportEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const DEFAULT_SOURCE_BUFFER: usize = 64;

/// Opens one event-source attempt per call.
pub trait EventSourceFactory: Send + Sync + 'static {
    fn open(&self, request: SourceRequest) -> EventSource;
}

/// Receiving half of one attempt. Dropping or closing it cancels the
/// producer.
#[derive(Debug)]
pub struct EventSource {
    events: mpsc::Receiver<TransportEvent>,
    cancel: CancellationToken,
}

/// Producing half of one attempt.
#[derive(Debug, Clone)]
pub struct SourceSink {
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

impl EventSource {
    /// Create a connected sink/source pair.
    pub fn pair(buffer: usize) -> (SourceSink, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancellationToken::new();
        (
            SourceSink {
                events: tx,
                cancel: cancel.clone(),
            },
            Self { events: rx, cancel },
        )
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Detach from the producer; buffered events are discarded.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl SourceSink {
    /// Deliver one event. Returns `false` once the attempt was closed.
    pub async fn send(&self, event: TransportEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.events.send(event).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.events.is_closed()
    }

    /// Resolves when the consumer closed the attempt.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }
}

/// Server-sent events over HTTP(S).
///
/// `with_credentials` has no counterpart outside browsers; cookies follow
/// whatever the supplied `reqwest::Client` is configured with.
#[derive(Debug, Clone)]
pub struct HttpEventSourceFactory {
    client: reqwest::Client,
    buffer: usize,
}

impl HttpEventSourceFactory {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            buffer: DEFAULT_SOURCE_BUFFER,
        }
    }

    /// Build a client with a TCP connect timeout. Overall request time is
    /// left unbounded; the state machine owns the connect and idle budgets.
    pub fn with_connect_timeout(timeout: std::time::Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Self::new(client))
    }
}

impl Default for HttpEventSourceFactory {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl EventSourceFactory for HttpEventSourceFactory {
    fn open(&self, request: SourceRequest) -> EventSource {
        let (sink, source) = EventSource::pair(self.buffer);
        let client = self.client.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sink.closed() => debug!(url = %request.url, "event source closed by consumer"),
                _ = pump(&client, &request, &sink) => {}
            }
        });
        source
    }
}

async fn pump(client: &reqwest::Client, request: &SourceRequest, sink: &SourceSink) {
    let Ok(method) = Method::from_bytes(request.method.as_bytes()) else {
        let message = format!("invalid HTTP method `{}`", request.method);
        sink.send(TransportEvent::Error(SourceEvent::failure(message)))
            .await;
        return;
    };

    let mut builder = client.request(method, &request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
        builder = builder.body(body.clone());
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(err) => {
            warn!(url = %request.url, error = %err, "event source request failed");
            sink.send(TransportEvent::Error(SourceEvent::failure(err.to_string())))
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(url = %request.url, status = status.as_u16(), "event source rejected");
        let failure =
            SourceEvent::failure(http_failure_message(status, &body)).with_status(status.as_u16());
        sink.send(TransportEvent::Error(failure)).await;
        return;
    }

    if !sink.send(TransportEvent::Open).await {
        return;
    }

    let mut events = response.bytes_stream().eventsource();
    while let Some(item) = events.next().await {
        let event = match item {
            Ok(event) => to_transport_event(event),
            Err(err) => {
                warn!(url = %request.url, error = %err, "event stream broke");
                sink.send(TransportEvent::Error(SourceEvent::failure(err.to_string())))
                    .await;
                return;
            }
        };
        if !sink.send(event).await {
            return;
        }
    }

    sink.send(TransportEvent::Close).await;
}

/// Map one decoded SSE frame onto the transport vocabulary.
///
/// Unnamed frames are `message`; a frame named `error` is reported as a
/// transport error carrying its data; every other name is a custom event.
pub fn to_transport_event(event: Event) -> TransportEvent {
    let last_event_id = Some(event.id).filter(|id| !id.is_empty());
    let name = if event.event.is_empty() {
        "message".to_owned()
    } else {
        event.event
    };
    let source = SourceEvent {
        event: name.clone(),
        data: Some(event.data),
        last_event_id,
        ..SourceEvent::default()
    };

    match name.as_str() {
        "message" => TransportEvent::Message(source),
        "error" => TransportEvent::Error(source),
        _ => TransportEvent::Custom {
            name,
            event: source,
        },
    }
}

/// Describe a rejected response, preferring a message from its JSON body.
pub fn http_failure_message(status: StatusCode, body: &str) -> String {
    let fallback = match status.canonical_reason() {
        Some(reason) => format!("HTTP {} {reason}", status.as_u16()),
        None => format!("HTTP {}", status.as_u16()),
    };
    let detail = stream_core::normalization::event_error_message(
        &EventPayload::parse(Some(body)),
        &fallback,
    );
    if detail == fallback {
        fallback
    } else {
        format!("{fallback}: {detail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(event: &str, data: &str, id: &str) -> Event {
        Event {
            event: event.to_owned(),
            data: data.to_owned(),
            id: id.to_owned(),
            retry: None,
        }
    }

    #[test]
    fn unnamed_frames_are_messages() {
        let event = to_transport_event(frame("", "hi", "7"));
        assert_eq!(
            event,
            TransportEvent::Message(SourceEvent::named("message", "hi").with_id("7"))
        );
    }

    #[test]
    fn named_frames_become_custom_or_error() {
        match to_transport_event(frame("message_delta", "{}", "")) {
            TransportEvent::Custom { name, event } => {
                assert_eq!(name, "message_delta");
                assert_eq!(event.last_event_id, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        match to_transport_event(frame("error", "{\"message\":\"quota\"}", "")) {
            TransportEvent::Error(event) => assert!(event.has_payload()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn failure_message_uses_body_when_available() {
        assert_eq!(
            http_failure_message(StatusCode::UNAUTHORIZED, "{\"message\":\"token expired\"}"),
            "HTTP 401 Unauthorized: token expired"
        );
        assert_eq!(
            http_failure_message(StatusCode::BAD_GATEWAY, ""),
            "HTTP 502 Bad Gateway"
        );
        assert_eq!(
            http_failure_message(StatusCode::TOO_MANY_REQUESTS, "slow down"),
            "HTTP 429 Too Many Requests: slow down"
        );
    }

    #[tokio::test]
    async fn closing_the_source_cancels_the_sink() {
        let (sink, mut source) = EventSource::pair(4);
        assert!(sink.send(TransportEvent::Open).await);
        assert_eq!(source.recv().await, Some(TransportEvent::Open));

        source.close();
        sink.closed().await;
        assert!(sink.is_closed());
        assert!(!sink.send(TransportEvent::Close).await);
    }

    #[tokio::test]
    async fn dropping_the_source_cancels_the_sink() {
        let (sink, source) = EventSource::pair(4);
        drop(source);
        sink.closed().await;
        assert!(!sink.send(TransportEvent::Open).await);
    }
}
