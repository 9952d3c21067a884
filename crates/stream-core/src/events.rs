use std::fmt;

/// Event names understood by the assist and completions protocols.
///
/// Anything else is carried verbatim in `Other` so the text-delta heuristics
/// can still classify vendor-specific names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamEventName {
    Message,
    AssistCandidates,
    MessageDelta,
    Trace,
    MessageStart,
    MessageEnd,
    Done,
    Ping,
    Error,
    ResponseOutputTextDelta,
    ResponseOutputTextDone,
    ResponseCompleted,
    ResponseError,
    Delta,
    OutputTextDelta,
    OutputTextDone,
    Other(String),
}

/// Named events the assist endpoint emits besides plain `message`.
pub const ASSIST_EVENTS: &[StreamEventName] = &[
    StreamEventName::AssistCandidates,
    StreamEventName::MessageDelta,
    StreamEventName::Trace,
    StreamEventName::MessageStart,
    StreamEventName::MessageEnd,
    StreamEventName::Done,
    StreamEventName::Ping,
    StreamEventName::Error,
    StreamEventName::ResponseOutputTextDelta,
    StreamEventName::ResponseOutputTextDone,
    StreamEventName::ResponseCompleted,
    StreamEventName::ResponseError,
    StreamEventName::Delta,
    StreamEventName::OutputTextDelta,
    StreamEventName::OutputTextDone,
];

/// Named events the completions endpoint emits besides plain `message`.
pub const COMPLETION_EVENTS: &[StreamEventName] = &[
    StreamEventName::MessageDelta,
    StreamEventName::MessageStart,
    StreamEventName::MessageEnd,
    StreamEventName::Done,
    StreamEventName::Ping,
    StreamEventName::Error,
    StreamEventName::ResponseOutputTextDelta,
    StreamEventName::ResponseError,
    StreamEventName::Delta,
    StreamEventName::OutputTextDelta,
];

impl StreamEventName {
    pub fn parse(name: &str) -> Self {
        match name {
            "" | "message" => Self::Message,
            "assist_candidates" => Self::AssistCandidates,
            "message_delta" => Self::MessageDelta,
            "trace" => Self::Trace,
            "message_start" => Self::MessageStart,
            "message_end" => Self::MessageEnd,
            "done" => Self::Done,
            "ping" => Self::Ping,
            "error" => Self::Error,
            "response.output_text.delta" => Self::ResponseOutputTextDelta,
            "response.output_text.done" => Self::ResponseOutputTextDone,
            "response.completed" => Self::ResponseCompleted,
            "response.error" => Self::ResponseError,
            "delta" => Self::Delta,
            "output_text.delta" => Self::OutputTextDelta,
            "output_text.done" => Self::OutputTextDone,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Message => "message",
            Self::AssistCandidates => "assist_candidates",
            Self::MessageDelta => "message_delta",
            Self::Trace => "trace",
            Self::MessageStart => "message_start",
            Self::MessageEnd => "message_end",
            Self::Done => "done",
            Self::Ping => "ping",
            Self::Error => "error",
            Self::ResponseOutputTextDelta => "response.output_text.delta",
            Self::ResponseOutputTextDone => "response.output_text.done",
            Self::ResponseCompleted => "response.completed",
            Self::ResponseError => "response.error",
            Self::Delta => "delta",
            Self::OutputTextDelta => "output_text.delta",
            Self::OutputTextDone => "output_text.done",
            Self::Other(name) => name,
        }
    }

    /// `done` ends a stream successfully.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Application-level failure reported inside the stream.
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Error | Self::ResponseError)
    }

    /// Events that never carry assistant text, even when their payload
    /// happens to look like a delta.
    pub fn is_non_text(&self) -> bool {
        match self {
            Self::Trace
            | Self::Ping
            | Self::Done
            | Self::Error
            | Self::ResponseError
            | Self::MessageStart
            | Self::MessageEnd => true,
            Self::Other(name) => name.starts_with("tool_"),
            _ => false,
        }
    }

    /// Whether the name alone marks a text-delta event.
    pub fn looks_like_delta(&self) -> bool {
        match self {
            Self::MessageDelta
            | Self::ResponseOutputTextDelta
            | Self::OutputTextDelta
            | Self::Delta => true,
            Self::Other(name) => name.contains(".delta") || name.ends_with("_delta"),
            _ => false,
        }
    }

    /// Whether top-level `text`/`message`/`output_text` fields and raw string
    /// payloads count as delta text for this event.
    pub fn accepts_loose_text(&self) -> bool {
        matches!(self, Self::Message | Self::Delta) || self.as_str().contains("delta")
    }
}

impl fmt::Display for StreamEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire names for a set of protocol events.
pub fn event_names(events: &[StreamEventName]) -> Vec<String> {
    events.iter().map(|name| name.as_str().to_owned()).collect()
}
