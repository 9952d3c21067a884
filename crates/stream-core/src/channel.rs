use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::types::{ClientCommand, ClientEvent, ClientState};

/// Broadcast notification stream handed to subscribers.
pub type EventStream = broadcast::Receiver<ClientEvent>;

/// Lossless notification feed for a single consumer.
///
/// Unlike [`EventStream`], the driver waits for room in the tap, so a slow
/// reader throttles the transport instead of missing events.
pub type NotificationTap = mpsc::Receiver<ClientEvent>;

/// One queued command plus the channel its resulting state is acked on.
pub type CommandEnvelope = (ClientCommand, oneshot::Sender<ClientState>);

/// Errors returned by client channel operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientChannelError {
    /// The driver task is gone.
    #[error("command channel is closed")]
    CommandChannelClosed,
    /// The driver dropped the command without acknowledging it.
    #[error("command was not acknowledged")]
    CommandDropped,
}

/// Command, notification and snapshot channels shared by a client handle and
/// its driver task.
#[derive(Clone, Debug)]
pub struct ClientChannels {
    command_tx: mpsc::Sender<CommandEnvelope>,
    event_tx: broadcast::Sender<ClientEvent>,
    state_tx: watch::Sender<ClientState>,
    cursor_tx: watch::Sender<Option<String>>,
}

impl ClientChannels {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
        initial_cursor: Option<String>,
    ) -> (Self, mpsc::Receiver<CommandEnvelope>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        let (state_tx, _) = watch::channel(ClientState::Stopped);
        let (cursor_tx, _) = watch::channel(initial_cursor);

        (
            Self {
                command_tx,
                event_tx,
                state_tx,
                cursor_tx,
            },
            command_rx,
        )
    }

    /// Subscribe to client notifications.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Watch the lifecycle state.
    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    /// Watch the resume cursor.
    pub fn watch_last_event_id(&self) -> watch::Receiver<Option<String>> {
        self.cursor_tx.subscribe()
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.cursor_tx.borrow().clone()
    }

    /// Send one command and wait for the state it left the client in.
    pub async fn send_command(
        &self,
        command: ClientCommand,
    ) -> Result<ClientState, ClientChannelError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send((command, ack_tx))
            .await
            .map_err(|_| ClientChannelError::CommandChannelClosed)?;
        ack_rx.await.map_err(|_| ClientChannelError::CommandDropped)
    }

    /// Publish a notification and keep the snapshots in sync with it.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: ClientEvent) {
        match &event {
            ClientEvent::StateChanged(state) => {
                self.state_tx.send_replace(*state);
            }
            ClientEvent::LastEventIdChanged(id) => {
                self.cursor_tx.send_replace(id.clone());
            }
            _ => {}
        }
        let _ = self.event_tx.send(event);
    }
}
