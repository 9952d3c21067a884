//! One-shot streaming requests folded into a final result.
//!
//! Each run spawns a [`StreamClient`] with reconnects disabled, feeds every
//! notification from its lossless tap through a [`StreamAggregate`] and
//! shuts the client down on every exit path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use stream_core::{
    AggregateStep, AssistAggregate, AssistCandidate, ClientChannelError, ClientEvent, ClientState,
    CompletionBuffer, ConnectionDescriptor, ErrorCategory, EventPayload, NotificationTap,
    StreamAggregate, StreamError, StreamEventName,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::{ApiConfig, ChatAssistRequest, ChatCompletionsRequest},
    client::StreamClient,
    transport::EventSourceFactory,
};

/// Errors that end a streaming run.
#[derive(Debug, Error)]
pub enum StreamRunError {
    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
    /// The server sent an `error`-named event.
    #[error("stream reported an error: {message}")]
    Protocol { message: String },
    /// The transport failed or timed out.
    #[error(transparent)]
    Transport(#[from] StreamError),
    /// The client settled without a terminal event.
    #[error("stream stopped before completion")]
    Stopped,
    #[error(transparent)]
    Channel(#[from] ClientChannelError),
}

impl StreamRunError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidRequest(_) | Self::Encode(_) => ErrorCategory::Config,
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Transport(err) => err.category,
            Self::Stopped => ErrorCategory::Network,
            Self::Channel(_) => ErrorCategory::Internal,
        }
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamFinish {
    /// The server sent `done`.
    Done,
    /// The server closed the stream without `done`.
    Closed,
    /// The caller cancelled; the result holds whatever arrived before.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistRun {
    pub candidates: Vec<AssistCandidate>,
    pub finish: StreamFinish,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRun {
    pub text: String,
    pub finish: StreamFinish,
}

/// Runs assist and completion streams against one API.
#[derive(Clone)]
pub struct ChatStreamRunner {
    config: ApiConfig,
    factory: Arc<dyn EventSourceFactory>,
}

impl std::fmt::Debug for ChatStreamRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStreamRunner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChatStreamRunner {
    pub fn new(config: ApiConfig, factory: Arc<dyn EventSourceFactory>) -> Self {
        Self { config, factory }
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Stream `/v1/chat/assist`, reporting each changed candidate list.
    pub async fn run_chat_assist(
        &self,
        request: &ChatAssistRequest,
        cancel: &CancellationToken,
        on_candidates: impl FnMut(&[AssistCandidate]),
    ) -> Result<AssistRun, StreamRunError> {
        self.run_chat_assist_observed(request, cancel, on_candidates, |_, _| {})
            .await
    }

    /// Like [`ChatStreamRunner::run_chat_assist`], also handing every raw
    /// event to `on_event` before it is reduced.
    pub async fn run_chat_assist_observed(
        &self,
        request: &ChatAssistRequest,
        cancel: &CancellationToken,
        mut on_candidates: impl FnMut(&[AssistCandidate]),
        mut on_event: impl FnMut(&StreamEventName, &EventPayload),
    ) -> Result<AssistRun, StreamRunError> {
        let descriptor = self.config.chat_assist_descriptor(request)?;
        let mut aggregate = AssistAggregate::default();
        let mut observed = Observed {
            inner: &mut aggregate,
            on_event: &mut on_event,
        };
        let finish = run_stream(
            descriptor,
            Arc::clone(&self.factory),
            &mut observed,
            cancel,
            &mut on_candidates,
        )
        .await?;
        info!(
            action = ?request.action,
            count = aggregate.candidates().len(),
            ?finish,
            "assist stream finished"
        );
        Ok(AssistRun {
            candidates: aggregate.into_candidates(),
            finish,
        })
    }

    /// Stream `/v1/chat/completions`, reporting the text accumulated so far.
    pub async fn run_chat_completions(
        &self,
        request: &ChatCompletionsRequest,
        cancel: &CancellationToken,
        on_text: impl FnMut(&str),
    ) -> Result<CompletionRun, StreamRunError> {
        let descriptor = self.config.chat_completions_descriptor(request)?;
        self.run_completion(descriptor, cancel, on_text).await
    }

    /// Stream `/v1/mini-apps/{app_id}/chat/completions`.
    pub async fn run_mini_app_completions(
        &self,
        app_id: &str,
        request: &ChatCompletionsRequest,
        cancel: &CancellationToken,
        on_text: impl FnMut(&str),
    ) -> Result<CompletionRun, StreamRunError> {
        let descriptor = self
            .config
            .mini_app_completions_descriptor(app_id, request)?;
        self.run_completion(descriptor, cancel, on_text).await
    }

    async fn run_completion(
        &self,
        descriptor: ConnectionDescriptor,
        cancel: &CancellationToken,
        mut on_text: impl FnMut(&str),
    ) -> Result<CompletionRun, StreamRunError> {
        let mut buffer = CompletionBuffer::default();
        let finish = run_stream(
            descriptor,
            Arc::clone(&self.factory),
            &mut buffer,
            cancel,
            &mut on_text,
        )
        .await?;
        info!(chars = buffer.text().chars().count(), ?finish, "completion stream finished");
        Ok(CompletionRun {
            text: buffer.into_text(),
            finish,
        })
    }
}

/// Aggregate wrapper that reports each event before applying it.
struct Observed<'a, A> {
    inner: &'a mut A,
    on_event: &'a mut dyn FnMut(&StreamEventName, &EventPayload),
}

impl<A: StreamAggregate> StreamAggregate for Observed<'_, A> {
    type Snapshot = A::Snapshot;

    fn apply(&mut self, event: &StreamEventName, payload: &EventPayload) -> AggregateStep {
        (self.on_event)(event, payload);
        self.inner.apply(event, payload)
    }

    fn snapshot(&self) -> &A::Snapshot {
        self.inner.snapshot()
    }
}

/// Drive one stream to its terminal event.
pub async fn run_stream<A: StreamAggregate>(
    descriptor: ConnectionDescriptor,
    factory: Arc<dyn EventSourceFactory>,
    aggregate: &mut A,
    cancel: &CancellationToken,
    on_update: &mut dyn FnMut(&A::Snapshot),
) -> Result<StreamFinish, StreamRunError> {
    if cancel.is_cancelled() {
        return Ok(StreamFinish::Cancelled);
    }

    debug!(url = %descriptor.url, "starting one-shot stream");
    let (client, mut events) = StreamClient::spawn_tapped(descriptor, factory, None);
    let outcome = match client.start().await {
        Ok(_) => consume(&mut events, aggregate, cancel, on_update).await,
        Err(err) => Err(err.into()),
    };

    // A full tap would otherwise hold the driver away from the shutdown command.
    drop(events);
    if let Err(err) = client.shutdown().await {
        debug!(error = %err, "stream client already gone");
    }
    if let Err(err) = &outcome {
        warn!(error = %err, category = ?err.category(), "stream run failed");
    }
    outcome
}

async fn consume<A: StreamAggregate>(
    events: &mut NotificationTap,
    aggregate: &mut A,
    cancel: &CancellationToken,
    on_update: &mut dyn FnMut(&A::Snapshot),
) -> Result<StreamFinish, StreamRunError> {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StreamFinish::Cancelled),
            received = events.recv() => received,
        };

        let (name, event) = match received {
            Some(ClientEvent::Message(event)) => (StreamEventName::Message, event),
            Some(ClientEvent::CustomEvent { name, event }) => (StreamEventName::parse(&name), event),
            Some(ClientEvent::Error(err)) => return Err(StreamRunError::Transport(err)),
            Some(ClientEvent::Closed) => return Ok(StreamFinish::Closed),
            Some(ClientEvent::StateChanged(ClientState::Stopped)) | None => {
                return Err(StreamRunError::Stopped);
            }
            Some(_) => continue,
        };

        let payload = EventPayload::parse(event.data.as_deref());
        match aggregate.apply(&name, &payload) {
            AggregateStep::Updated => on_update(aggregate.snapshot()),
            AggregateStep::Unchanged => {}
            AggregateStep::Finished => return Ok(StreamFinish::Done),
            AggregateStep::Failed(message) => return Err(StreamRunError::Protocol { message }),
        }
    }
}
