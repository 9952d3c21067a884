use std::{fmt, mem, time::Duration};

use crate::{
    error::StreamError,
    retry::ReconnectPolicy,
    types::{
        AppLifecycleState, AttemptToken, ClientEvent, ClientState, ConnectionDescriptor,
        DisconnectReason, OpenReason, TimerKind, TransportEvent, normalize_last_event_id,
    },
};

/// Source of uniform samples in `[0, 1)` used for backoff jitter.
pub type JitterSource = Box<dyn FnMut() -> f64 + Send>;

/// Side effect requested by the state machine.
///
/// The machine owns no sockets or timers; a driver executes these in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open a new transport bound to `token`.
    OpenSource {
        token: AttemptToken,
        last_event_id: Option<String>,
    },
    /// Remove listeners from and close the live transport.
    CloseSource,
    /// Arm `timer`; when it fires, feed `token` back through `on_timer`.
    ArmTimer {
        timer: TimerKind,
        token: AttemptToken,
        after: Duration,
    },
    CancelTimer(TimerKind),
    /// Start listening to the app lifecycle signal.
    BindLifecycle,
    /// Stop listening to the app lifecycle signal.
    UnbindLifecycle,
    /// Publish a notification to subscribers.
    Notify(ClientEvent),
}

#[derive(Debug, Default, Clone, Copy)]
struct TimerSlots {
    connect_timeout: Option<AttemptToken>,
    idle_timeout: Option<AttemptToken>,
    reconnect: Option<AttemptToken>,
}

impl TimerSlots {
    fn slot(&mut self, timer: TimerKind) -> &mut Option<AttemptToken> {
        match timer {
            TimerKind::ConnectTimeout => &mut self.connect_timeout,
            TimerKind::IdleTimeout => &mut self.idle_timeout,
            TimerKind::Reconnect => &mut self.reconnect,
        }
    }
}

/// Connection lifecycle for one logical subscription.
///
/// Inputs are commands (`start`, `stop`, ...), transport events, timer
/// firings and lifecycle changes. Each input returns the effects to execute.
/// Transport events and timers carry the `AttemptToken` they were created
/// with; inputs from a superseded attempt return no effects.
pub struct ConnectionMachine {
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    idle_timeout: Duration,
    pause_when_background: bool,
    accepts_error_events: bool,
    jitter: JitterSource,
    state: ClientState,
    started: bool,
    current: AttemptToken,
    source_live: bool,
    attempts: u32,
    last_event_id: Option<String>,
    app_state: AppLifecycleState,
    lifecycle_bound: bool,
    timers: TimerSlots,
    effects: Vec<Effect>,
}

impl fmt::Debug for ConnectionMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMachine")
            .field("state", &self.state)
            .field("started", &self.started)
            .field("current", &self.current)
            .field("attempts", &self.attempts)
            .field("last_event_id", &self.last_event_id)
            .field("app_state", &self.app_state)
            .finish_non_exhaustive()
    }
}

impl ConnectionMachine {
    pub fn new(descriptor: &ConnectionDescriptor, app_state: AppLifecycleState) -> Self {
        Self {
            policy: descriptor.reconnect,
            connect_timeout: descriptor.connect_timeout,
            idle_timeout: descriptor.idle_timeout,
            pause_when_background: descriptor.pause_when_background,
            accepts_error_events: descriptor.declares_event("error"),
            jitter: Box::new(rand::random::<f64>),
            state: ClientState::Stopped,
            started: false,
            current: AttemptToken::default(),
            source_live: false,
            attempts: 0,
            last_event_id: normalize_last_event_id(descriptor.initial_last_event_id.as_deref()),
            app_state,
            lifecycle_bound: false,
            timers: TimerSlots::default(),
            effects: Vec::new(),
        }
    }

    /// Replace the jitter sample source.
    pub fn with_jitter(mut self, jitter: JitterSource) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_token(&self) -> AttemptToken {
        self.current
    }

    pub fn is_timer_armed(&self, timer: TimerKind) -> bool {
        let mut timers = self.timers;
        timers.slot(timer).is_some()
    }

    pub fn start(&mut self) -> Vec<Effect> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        self.bind_lifecycle();
        if !self.can_connect_now() {
            self.set_state(ClientState::Paused);
        } else {
            self.open(OpenReason::Manual);
        }
        self.take_effects()
    }

    pub fn stop(&mut self) -> Vec<Effect> {
        if !self.started && self.state == ClientState::Stopped {
            return Vec::new();
        }
        self.started = false;
        self.unbind_lifecycle();
        self.clear_timers();
        self.teardown_source();
        self.attempts = 0;
        self.set_state(ClientState::Stopped);
        self.take_effects()
    }

    pub fn restart(&mut self) -> Vec<Effect> {
        let mut effects = self.stop();
        effects.extend(self.start());
        effects
    }

    /// Seed or clear the resume cursor.
    pub fn set_last_event_id(&mut self, id: Option<&str>) -> Vec<Effect> {
        self.update_last_event_id(normalize_last_event_id(id));
        self.take_effects()
    }

    /// Feed a lifecycle transition reported by the host application.
    pub fn on_app_state(&mut self, next: AppLifecycleState) -> Vec<Effect> {
        let previous = self.app_state;
        self.app_state = next;
        if !self.started || !self.lifecycle_bound {
            return Vec::new();
        }

        match (previous.is_active(), next.is_active()) {
            (true, false) => self.pause_for_background(),
            (false, true) => {
                self.attempts = 0;
                self.open(OpenReason::Manual);
            }
            _ => {}
        }
        self.take_effects()
    }

    /// Feed one transport event produced by the attempt `token`.
    pub fn on_transport(&mut self, token: AttemptToken, event: TransportEvent) -> Vec<Effect> {
        if !self.is_current_source(token) {
            return Vec::new();
        }

        match event {
            TransportEvent::Open => {
                self.attempts = 0;
                self.cancel_timer(TimerKind::ConnectTimeout);
                self.touch_activity(token);
                self.set_state(ClientState::Open);
                self.notify(ClientEvent::Opened);
            }
            TransportEvent::Message(event) => {
                self.capture_last_event_id(event.last_event_id.as_deref());
                self.touch_activity(token);
                self.notify(ClientEvent::Message(event));
            }
            TransportEvent::Custom { name, event } => {
                self.capture_last_event_id(event.last_event_id.as_deref());
                self.touch_activity(token);
                self.notify(ClientEvent::CustomEvent { name, event });
            }
            TransportEvent::Error(event) if self.accepts_error_events && event.has_payload() => {
                self.capture_last_event_id(event.last_event_id.as_deref());
                self.touch_activity(token);
                self.notify(ClientEvent::CustomEvent {
                    name: "error".to_owned(),
                    event,
                });
            }
            TransportEvent::Error(event) => {
                self.notify(ClientEvent::Error(StreamError::from_source(&event)));
                self.schedule_reconnect(token, DisconnectReason::Error);
            }
            TransportEvent::Close => {
                self.notify(ClientEvent::Closed);
                self.schedule_reconnect(token, DisconnectReason::Close);
            }
        }
        self.take_effects()
    }

    /// Feed a timer firing armed for attempt `token`.
    pub fn on_timer(&mut self, timer: TimerKind, token: AttemptToken) -> Vec<Effect> {
        let slot = self.timers.slot(timer);
        if *slot != Some(token) {
            return Vec::new();
        }
        *slot = None;

        match timer {
            TimerKind::ConnectTimeout => {
                if self.is_current_source(token)
                    && matches!(
                        self.state,
                        ClientState::Connecting | ClientState::Reconnecting
                    )
                {
                    self.schedule_reconnect(token, DisconnectReason::ConnectTimeout);
                }
            }
            TimerKind::IdleTimeout => {
                if self.is_current_source(token) {
                    self.schedule_reconnect(token, DisconnectReason::IdleTimeout);
                }
            }
            TimerKind::Reconnect => {
                if self.started && self.current == token {
                    self.open(OpenReason::Reconnect);
                }
            }
        }
        self.take_effects()
    }

    fn open(&mut self, reason: OpenReason) {
        if !self.started || !self.can_connect_now() {
            self.set_state(ClientState::Paused);
            return;
        }

        self.clear_timers();
        self.teardown_source();

        self.current = self.current.next();
        let token = self.current;
        self.set_state(match reason {
            OpenReason::Manual => ClientState::Connecting,
            OpenReason::Reconnect => ClientState::Reconnecting,
        });

        self.source_live = true;
        self.effects.push(Effect::OpenSource {
            token,
            last_event_id: self.last_event_id.clone(),
        });

        if !self.connect_timeout.is_zero() {
            self.arm_timer(TimerKind::ConnectTimeout, token, self.connect_timeout);
        }
    }

    fn schedule_reconnect(&mut self, token: AttemptToken, reason: DisconnectReason) {
        if !self.is_current_source(token) {
            return;
        }

        self.cancel_timer(TimerKind::ConnectTimeout);
        self.cancel_timer(TimerKind::IdleTimeout);
        self.teardown_source();

        match reason {
            DisconnectReason::ConnectTimeout => {
                self.notify(ClientEvent::Error(StreamError::connect_timeout()));
            }
            DisconnectReason::IdleTimeout => {
                self.notify(ClientEvent::Error(StreamError::idle_timeout()));
            }
            _ => {}
        }

        if !self.started {
            self.set_state(ClientState::Stopped);
            return;
        }
        if !self.can_connect_now() {
            self.set_state(ClientState::Paused);
            return;
        }
        if !self.policy.enabled() || self.policy.is_exhausted(self.attempts) {
            self.settle_stopped();
            return;
        }

        self.attempts = self.attempts.saturating_add(1);
        let sample = (self.jitter)();
        let delay = self.policy.delay_for_attempt(self.attempts, sample);
        self.set_state(ClientState::Reconnecting);
        self.arm_timer(TimerKind::Reconnect, token, delay);
    }

    fn pause_for_background(&mut self) {
        self.clear_timers();
        self.teardown_source();
        self.set_state(ClientState::Paused);
    }

    /// Terminal stop after policy exhaustion: nothing stays armed and a
    /// later `start` begins a fresh subscription.
    fn settle_stopped(&mut self) {
        self.started = false;
        self.unbind_lifecycle();
        self.clear_timers();
        self.attempts = 0;
        self.set_state(ClientState::Stopped);
    }

    fn can_connect_now(&self) -> bool {
        !self.pause_when_background || self.app_state.is_active()
    }

    fn is_current_source(&self, token: AttemptToken) -> bool {
        self.started && self.source_live && self.current == token
    }

    fn bind_lifecycle(&mut self) {
        if !self.pause_when_background || self.lifecycle_bound {
            return;
        }
        self.lifecycle_bound = true;
        self.effects.push(Effect::BindLifecycle);
    }

    fn unbind_lifecycle(&mut self) {
        if !self.lifecycle_bound {
            return;
        }
        self.lifecycle_bound = false;
        self.effects.push(Effect::UnbindLifecycle);
    }

    fn touch_activity(&mut self, token: AttemptToken) {
        self.cancel_timer(TimerKind::IdleTimeout);
        if !self.idle_timeout.is_zero() {
            self.arm_timer(TimerKind::IdleTimeout, token, self.idle_timeout);
        }
    }

    fn capture_last_event_id(&mut self, id: Option<&str>) {
        if let Some(id) = normalize_last_event_id(id) {
            self.update_last_event_id(Some(id));
        }
    }

    fn update_last_event_id(&mut self, next: Option<String>) {
        if self.last_event_id == next {
            return;
        }
        self.last_event_id = next.clone();
        self.notify(ClientEvent::LastEventIdChanged(next));
    }

    fn set_state(&mut self, next: ClientState) {
        if self.state == next {
            return;
        }
        self.state = next;
        self.notify(ClientEvent::StateChanged(next));
    }

    fn arm_timer(&mut self, timer: TimerKind, token: AttemptToken, after: Duration) {
        *self.timers.slot(timer) = Some(token);
        self.effects.push(Effect::ArmTimer {
            timer,
            token,
            after,
        });
    }

    fn cancel_timer(&mut self, timer: TimerKind) {
        if self.timers.slot(timer).take().is_some() {
            self.effects.push(Effect::CancelTimer(timer));
        }
    }

    fn clear_timers(&mut self) {
        self.cancel_timer(TimerKind::Reconnect);
        self.cancel_timer(TimerKind::ConnectTimeout);
        self.cancel_timer(TimerKind::IdleTimeout);
    }

    fn teardown_source(&mut self) {
        if !self.source_live {
            return;
        }
        self.source_live = false;
        self.effects.push(Effect::CloseSource);
    }

    fn notify(&mut self, event: ClientEvent) {
        self.effects.push(Effect::Notify(event));
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        mem::take(&mut self.effects)
    }
}
