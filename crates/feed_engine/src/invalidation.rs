//! Cache-wide invalidation triggers from outside the engine.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidationSignal {
    /// Connectivity came back after being lost.
    NetworkRestored,
    /// The session ended (logout or an unrecoverable auth failure).
    SessionCleared,
}

/// Cloneable emitter for [`InvalidationSignal`]s.
///
/// Hand it to whatever observes connectivity and the session, and attach
/// engines with [`FeedEngine::listen`](crate::FeedEngine::listen).
#[derive(Clone, Debug)]
pub struct InvalidationBus {
    sender: broadcast::Sender<InvalidationSignal>,
    online: Arc<AtomicBool>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self {
            sender,
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationSignal> {
        self.sender.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Records connectivity; only an offline to online transition is
    /// signalled.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            tracing::info!("network restored");
            self.emit(InvalidationSignal::NetworkRestored);
            return true;
        }
        if !online && was_online {
            tracing::info!("network lost");
        }
        false
    }

    pub fn session_cleared(&self) {
        tracing::info!("session cleared");
        self.emit(InvalidationSignal::SessionCleared);
    }

    fn emit(&self, signal: InvalidationSignal) {
        // No listener attached yet is not an error.
        let _ = self.sender.send(signal);
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}
