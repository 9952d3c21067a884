use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::StreamError, retry::ReconnectPolicy};

/// Header used to ask the server to replay from the last seen event.
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Connect budget used when the descriptor does not override it.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Idle budget used when the descriptor does not override it.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Lifecycle state of one stream client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    /// No transport, no timers; `start` is required to resume.
    Stopped,
    /// Started, but held back because the app is not in the foreground.
    Paused,
    /// First attempt after a manual start is in flight.
    Connecting,
    /// A backoff attempt is pending or in flight.
    Reconnecting,
    /// Transport reported it is open.
    Open,
}

/// Foreground/background signal reported by the host application.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppLifecycleState {
    #[default]
    Active,
    Inactive,
    Background,
}

impl AppLifecycleState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active)
    }
}

/// Why a connection attempt is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenReason {
    Manual,
    Reconnect,
}

/// Why the live transport went away.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    Error,
    Close,
    ConnectTimeout,
    IdleTimeout,
}

/// Identity of one connection attempt.
///
/// Every transport event and timer firing carries the token of the attempt
/// that produced it; anything not matching the current token is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AttemptToken(u64);

impl AttemptToken {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// The three cancelable timers owned by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    ConnectTimeout,
    IdleTimeout,
    Reconnect,
}

/// One event as delivered by the event-source primitive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SourceEvent {
    /// Event name (`message` for unnamed events).
    pub event: String,
    /// Raw `data` payload, if the event carried one.
    pub data: Option<String>,
    /// Resumption id attached by the server.
    pub last_event_id: Option<String>,
    /// Human-readable failure description for transport errors.
    pub message: Option<String>,
    /// HTTP status when the failure came from a non-success response.
    pub status: Option<u16>,
}

impl SourceEvent {
    /// Build a data-bearing event.
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// Build a transport failure without payload.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            event: "error".to_owned(),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Attach a resumption id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }

    /// Attach the HTTP status of a failed response.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Whether `data` holds anything besides whitespace.
    pub fn has_payload(&self) -> bool {
        self.data
            .as_deref()
            .is_some_and(|data| !data.trim().is_empty())
    }
}

/// Signals emitted by a transport for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(SourceEvent),
    Custom { name: String, event: SourceEvent },
    Error(SourceEvent),
    Close,
}

/// Notifications published to client subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Opened,
    Message(SourceEvent),
    CustomEvent { name: String, event: SourceEvent },
    Error(StreamError),
    Closed,
    StateChanged(ClientState),
    LastEventIdChanged(Option<String>),
}

/// Commands accepted by a running client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Start,
    Stop,
    Restart,
    SetLastEventId(Option<String>),
    /// Stop and terminate the driver task.
    Shutdown,
}

/// Everything a transport needs to open one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub with_credentials: bool,
}

/// Caller-supplied description of one logical subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDescriptor {
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub with_credentials: bool,
    /// Named events the caller wants to receive.
    pub custom_events: Vec<String>,
    /// Zero disables the connect timeout.
    pub connect_timeout: Duration,
    /// Zero disables the idle timeout.
    pub idle_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub pause_when_background: bool,
    pub initial_last_event_id: Option<String>,
}

impl ConnectionDescriptor {
    /// `GET` descriptor with default timeouts and reconnect policy.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_owned(),
            headers: BTreeMap::new(),
            body: None,
            with_credentials: false,
            custom_events: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            pause_when_background: false,
            initial_last_event_id: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    pub fn with_custom_events<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_events = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_pause_when_background(mut self, pause: bool) -> Self {
        self.pause_when_background = pause;
        self
    }

    pub fn with_initial_last_event_id(mut self, id: impl Into<String>) -> Self {
        self.initial_last_event_id = Some(id.into());
        self
    }

    /// Whether the caller registered for `name`.
    pub fn declares_event(&self, name: &str) -> bool {
        self.custom_events.iter().any(|declared| declared == name)
    }

    /// Build the transport request for one attempt, injecting the resume
    /// cursor header when one is known.
    pub fn request_for_attempt(&self, last_event_id: Option<&str>) -> SourceRequest {
        let mut headers = self.headers.clone();
        if let Some(id) = last_event_id {
            headers.insert(LAST_EVENT_ID_HEADER.to_owned(), id.to_owned());
        }

        SourceRequest {
            url: self.url.clone(),
            method: self.method.clone(),
            headers,
            body: self.body.clone(),
            with_credentials: self.with_credentials,
        }
    }
}

/// Trim a resume cursor, mapping blank values to `None`.
pub fn normalize_last_event_id(id: Option<&str>) -> Option<String> {
    id.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}
