//! Core contract for resilient server-pushed event streams.
//!
//! This crate holds the transport-agnostic pieces: the connection state
//! machine and its reconnect policy, the command/notification channels, and
//! the reducers that fold assist and completion events into results.

/// Folding stream events into candidates or completion text.
pub mod aggregation;
/// Assist candidate model and id-based merging.
pub mod candidates;
/// Async command/notification channel primitives.
pub mod channel;
/// Stream error types and HTTP classification helpers.
pub mod error;
/// Protocol event names.
pub mod events;
/// Payload parsing and candidate normalization.
pub mod normalization;
/// Backoff policy used between reconnect attempts.
pub mod retry;
/// Connection lifecycle state machine.
pub mod state_machine;
/// Client-facing protocol types (commands, events, descriptors).
pub mod types;

pub use aggregation::{
    AggregateStep, AssistAggregate, CompletionBuffer, FALLBACK_MARKER, StreamAggregate,
    reduce_assist_candidates, sanitize_stream_text,
};
pub use candidates::{
    AssistCandidate, CandidateKind, STREAM_TEXT_CANDIDATE_ID, merge_assist_candidates,
};
pub use channel::{
    ClientChannelError, ClientChannels, CommandEnvelope, EventStream, NotificationTap,
};
pub use error::{ErrorCategory, StreamError, StreamErrorKind, classify_http_status};
pub use events::{ASSIST_EVENTS, COMPLETION_EVENTS, StreamEventName, event_names};
pub use normalization::{EventPayload, PayloadShape, detect_payload_shape};
pub use retry::ReconnectPolicy;
pub use state_machine::{ConnectionMachine, Effect, JitterSource};
pub use types::{
    AppLifecycleState, AttemptToken, ClientCommand, ClientEvent, ClientState,
    ConnectionDescriptor, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DisconnectReason,
    LAST_EVENT_ID_HEADER, OpenReason, SourceEvent, SourceRequest, TimerKind, TransportEvent,
    normalize_last_event_id,
};
