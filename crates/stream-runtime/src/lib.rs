//! Tokio runtime for resilient event streams.
//!
//! [`StreamClient`] drives a [`stream_core::ConnectionMachine`] over a
//! pluggable [`EventSourceFactory`]; [`ChatStreamRunner`] uses it for
//! one-shot assist and completion requests.

/// Endpoint configuration and request bodies.
pub mod api;
/// Background driver and client handle.
pub mod client;
/// Foreground/background signal publisher.
pub mod lifecycle;
/// One-shot stream runs folded into results.
pub mod runner;
/// Event-source transports (HTTP and test doubles).
pub mod transport;

pub use api::{ApiConfig, ChatAssistAction, ChatAssistRequest, ChatCompletionsRequest, TargetType};
pub use client::StreamClient;
pub use lifecycle::AppLifecycle;
pub use runner::{
    AssistRun, ChatStreamRunner, CompletionRun, StreamFinish, StreamRunError, run_stream,
};
pub use transport::{EventSource, EventSourceFactory, HttpEventSourceFactory, SourceSink};
