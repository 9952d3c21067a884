//! Tokio driver for [`ConnectionMachine`].

use std::{future, pin::Pin, sync::Arc, time::Duration};

use stream_core::{
    AppLifecycleState, AttemptToken, ClientChannelError, ClientChannels, ClientCommand,
    ClientEvent, ClientState, CommandEnvelope, ConnectionDescriptor, ConnectionMachine, Effect,
    EventStream, JitterSource, NotificationTap, TimerKind, TransportEvent,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Sleep, sleep},
};
use tracing::{debug, info, warn};

use crate::transport::{EventSource, EventSourceFactory};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;
const TAP_BUFFER: usize = 64;

/// Handle to one resilient event-stream subscription.
///
/// The connection runs on a background task. Dropping the handle aborts the
/// task and closes any live transport; [`StreamClient::shutdown`] stops it
/// gracefully.
#[derive(Debug)]
pub struct StreamClient {
    channels: ClientChannels,
    task: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Spawn a client. `lifecycle` is the host's foreground signal; without
    /// one the app is treated as always active.
    pub fn spawn(
        descriptor: ConnectionDescriptor,
        factory: Arc<dyn EventSourceFactory>,
        lifecycle: Option<watch::Receiver<AppLifecycleState>>,
    ) -> Self {
        let machine = ConnectionMachine::new(&descriptor, current_app_state(lifecycle.as_ref()));
        Self::spawn_machine(descriptor, machine, factory, lifecycle, None)
    }

    /// Spawn a client together with a lossless [`NotificationTap`].
    ///
    /// The driver blocks on a full tap, so the receiver must be drained or
    /// dropped; dropping it detaches the tap and the client keeps running.
    pub fn spawn_tapped(
        descriptor: ConnectionDescriptor,
        factory: Arc<dyn EventSourceFactory>,
        lifecycle: Option<watch::Receiver<AppLifecycleState>>,
    ) -> (Self, NotificationTap) {
        let machine = ConnectionMachine::new(&descriptor, current_app_state(lifecycle.as_ref()));
        let (tap_tx, tap_rx) = mpsc::channel(TAP_BUFFER);
        let client = Self::spawn_machine(descriptor, machine, factory, lifecycle, Some(tap_tx));
        (client, tap_rx)
    }

    /// Like [`StreamClient::spawn`], with a fixed jitter source.
    pub fn spawn_with_jitter(
        descriptor: ConnectionDescriptor,
        factory: Arc<dyn EventSourceFactory>,
        lifecycle: Option<watch::Receiver<AppLifecycleState>>,
        jitter: JitterSource,
    ) -> Self {
        let machine = ConnectionMachine::new(&descriptor, current_app_state(lifecycle.as_ref()))
            .with_jitter(jitter);
        Self::spawn_machine(descriptor, machine, factory, lifecycle, None)
    }

    fn spawn_machine(
        descriptor: ConnectionDescriptor,
        machine: ConnectionMachine,
        factory: Arc<dyn EventSourceFactory>,
        lifecycle: Option<watch::Receiver<AppLifecycleState>>,
        tap: Option<mpsc::Sender<ClientEvent>>,
    ) -> Self {
        let (channels, command_rx) = ClientChannels::new(
            COMMAND_BUFFER,
            EVENT_BUFFER,
            machine.last_event_id().map(str::to_owned),
        );
        let driver = ClientDriver {
            descriptor,
            machine,
            factory,
            channels: channels.clone(),
            tap,
            command_rx,
            lifecycle,
            lifecycle_bound: false,
            source: None,
            timers: DriverTimers::default(),
        };
        let task = tokio::spawn(driver.run());

        Self {
            channels,
            task: Some(task),
        }
    }

    /// Begin connecting. A no-op when already started.
    pub async fn start(&self) -> Result<ClientState, ClientChannelError> {
        self.channels.send_command(ClientCommand::Start).await
    }

    /// Close the transport, cancel all timers and settle in `Stopped`.
    pub async fn stop(&self) -> Result<ClientState, ClientChannelError> {
        self.channels.send_command(ClientCommand::Stop).await
    }

    pub async fn restart(&self) -> Result<ClientState, ClientChannelError> {
        self.channels.send_command(ClientCommand::Restart).await
    }

    /// Seed or clear the resume cursor used by the next attempt.
    pub async fn set_last_event_id(
        &self,
        id: Option<String>,
    ) -> Result<ClientState, ClientChannelError> {
        self.channels
            .send_command(ClientCommand::SetLastEventId(id))
            .await
    }

    pub fn state(&self) -> ClientState {
        self.channels.state()
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.channels.last_event_id()
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.channels.watch_state()
    }

    /// Stop the client and wait for its task to finish.
    pub async fn shutdown(mut self) -> Result<(), ClientChannelError> {
        let result = self
            .channels
            .send_command(ClientCommand::Shutdown)
            .await
            .map(|_| ());
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        result
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn current_app_state(lifecycle: Option<&watch::Receiver<AppLifecycleState>>) -> AppLifecycleState {
    lifecycle.map(|rx| *rx.borrow()).unwrap_or_default()
}

struct LiveSource {
    token: AttemptToken,
    source: EventSource,
}

struct ArmedTimer {
    token: AttemptToken,
    sleep: Pin<Box<Sleep>>,
}

impl ArmedTimer {
    fn new(token: AttemptToken, after: Duration) -> Self {
        Self {
            token,
            sleep: Box::pin(sleep(after)),
        }
    }
}

#[derive(Default)]
struct DriverTimers {
    connect_timeout: Option<ArmedTimer>,
    idle_timeout: Option<ArmedTimer>,
    reconnect: Option<ArmedTimer>,
}

impl DriverTimers {
    fn slot(&mut self, timer: TimerKind) -> &mut Option<ArmedTimer> {
        match timer {
            TimerKind::ConnectTimeout => &mut self.connect_timeout,
            TimerKind::IdleTimeout => &mut self.idle_timeout,
            TimerKind::Reconnect => &mut self.reconnect,
        }
    }
}

struct ClientDriver {
    descriptor: ConnectionDescriptor,
    machine: ConnectionMachine,
    factory: Arc<dyn EventSourceFactory>,
    channels: ClientChannels,
    tap: Option<mpsc::Sender<ClientEvent>>,
    command_rx: mpsc::Receiver<CommandEnvelope>,
    lifecycle: Option<watch::Receiver<AppLifecycleState>>,
    lifecycle_bound: bool,
    source: Option<LiveSource>,
    timers: DriverTimers,
}

impl ClientDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some((command, ack)) = command else {
                        debug!("command channel closed; stopping");
                        let effects = self.machine.stop();
                        self.apply(effects).await;
                        break;
                    };
                    let shutdown = command == ClientCommand::Shutdown;
                    self.handle_command(command).await;
                    let _ = ack.send(self.machine.state());
                    if shutdown {
                        break;
                    }
                }
                (token, event) = next_source_event(&mut self.source) => {
                    let event = event.unwrap_or_else(|| {
                        self.source = None;
                        TransportEvent::Close
                    });
                    let effects = self.machine.on_transport(token, event);
                    self.apply(effects).await;
                }
                token = fire(&mut self.timers.connect_timeout) => {
                    self.on_timer(TimerKind::ConnectTimeout, token).await;
                }
                token = fire(&mut self.timers.idle_timeout) => {
                    self.on_timer(TimerKind::IdleTimeout, token).await;
                }
                token = fire(&mut self.timers.reconnect) => {
                    self.on_timer(TimerKind::Reconnect, token).await;
                }
                next = lifecycle_change(&mut self.lifecycle, self.lifecycle_bound) => {
                    match next {
                        Some(next) => {
                            debug!(?next, "app lifecycle changed");
                            let effects = self.machine.on_app_state(next);
                            self.apply(effects).await;
                        }
                        None => self.lifecycle = None,
                    }
                }
            }
        }
        debug!("stream client task finished");
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        let effects = match command {
            ClientCommand::Start => {
                self.sync_app_state().await;
                self.machine.start()
            }
            ClientCommand::Restart => {
                self.sync_app_state().await;
                self.machine.restart()
            }
            ClientCommand::Stop | ClientCommand::Shutdown => self.machine.stop(),
            ClientCommand::SetLastEventId(id) => self.machine.set_last_event_id(id.as_deref()),
        };
        self.apply(effects).await;
    }

    /// The signal is only polled while bound; catch up before deciding
    /// whether a start may connect.
    async fn sync_app_state(&mut self) {
        let Some(rx) = self.lifecycle.as_mut() else {
            return;
        };
        let current = *rx.borrow_and_update();
        let effects = self.machine.on_app_state(current);
        self.apply(effects).await;
    }

    async fn on_timer(&mut self, timer: TimerKind, token: AttemptToken) {
        *self.timers.slot(timer) = None;
        let effects = self.machine.on_timer(timer, token);
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::OpenSource {
                    token,
                    last_event_id,
                } => {
                    let request = self
                        .descriptor
                        .request_for_attempt(last_event_id.as_deref());
                    debug!(
                        attempt = token.value(),
                        url = %request.url,
                        resume = last_event_id.is_some(),
                        "opening event source"
                    );
                    let source = self.factory.open(request);
                    self.source = Some(LiveSource { token, source });
                }
                Effect::CloseSource => {
                    if let Some(mut live) = self.source.take() {
                        debug!(attempt = live.token.value(), "closing event source");
                        live.source.close();
                    }
                }
                Effect::ArmTimer {
                    timer,
                    token,
                    after,
                } => {
                    *self.timers.slot(timer) = Some(ArmedTimer::new(token, after));
                }
                Effect::CancelTimer(timer) => {
                    *self.timers.slot(timer) = None;
                }
                Effect::BindLifecycle => self.lifecycle_bound = true,
                Effect::UnbindLifecycle => self.lifecycle_bound = false,
                Effect::Notify(event) => {
                    log_notification(&event);
                    if self.tap.is_some() {
                        self.channels.emit(event.clone());
                        self.forward(event).await;
                    } else {
                        self.channels.emit(event);
                    }
                }
            }
        }
    }

    /// Hand one notification to the tap, waiting for room.
    async fn forward(&mut self, event: ClientEvent) {
        let Some(tap) = &self.tap else {
            return;
        };
        if tap.send(event).await.is_err() {
            debug!("notification tap dropped; detaching");
            self.tap = None;
        }
    }
}

fn log_notification(event: &ClientEvent) {
    match event {
        ClientEvent::StateChanged(state) => info!(?state, "stream client state changed"),
        ClientEvent::Error(err) => warn!(
            kind = err.kind.code(),
            status = ?err.status,
            message = %err.message,
            "stream client error"
        ),
        ClientEvent::Closed => debug!("event source closed by server"),
        _ => {}
    }
}

async fn next_source_event(
    source: &mut Option<LiveSource>,
) -> (AttemptToken, Option<TransportEvent>) {
    match source {
        Some(live) => (live.token, live.source.recv().await),
        None => future::pending().await,
    }
}

async fn fire(timer: &mut Option<ArmedTimer>) -> AttemptToken {
    match timer {
        Some(armed) => {
            armed.sleep.as_mut().await;
            armed.token
        }
        None => future::pending().await,
    }
}

async fn lifecycle_change(
    lifecycle: &mut Option<watch::Receiver<AppLifecycleState>>,
    bound: bool,
) -> Option<AppLifecycleState> {
    match lifecycle {
        Some(rx) if bound => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        _ => future::pending().await,
    }
}
