use stream_core::AppLifecycleState;
use tokio::sync::watch;

/// Host-side publisher of foreground/background transitions.
///
/// Clients only observe the signal while their descriptor asks to pause in
/// the background.
#[derive(Debug, Clone)]
pub struct AppLifecycle {
    tx: watch::Sender<AppLifecycleState>,
}

impl AppLifecycle {
    pub fn new(initial: AppLifecycleState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a transition. Repeating the current state is a no-op.
    pub fn set(&self, next: AppLifecycleState) {
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    pub fn current(&self) -> AppLifecycleState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AppLifecycleState> {
        self.tx.subscribe()
    }
}

impl Default for AppLifecycle {
    fn default() -> Self {
        Self::new(AppLifecycleState::Active)
    }
}
