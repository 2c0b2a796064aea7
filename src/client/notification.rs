//! Client notifications
//!
//! Lifecycle events surfaced to the owning application through channels.

use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::AtlasError;
use crate::protocol::{MessageId, OpCode};

/// Something the application may want to react to
#[derive(Debug, Clone)]
pub enum Notification {
    /// The connection is usable (after setup, if any)
    Connect,

    /// A transport connect attempt failed
    ConnectError(Arc<AtlasError>),

    /// The setup hook is running on a fresh connection
    Setup,

    /// The setup hook rejected the connection
    SetupError(Arc<AtlasError>),

    /// No traffic and nothing pending for the idle timeout
    Idle,

    /// The connection closed
    Close { had_error: bool },

    /// A connection-level failure; `fatal` means the client gave up
    Error { error: Arc<AtlasError>, fatal: bool },

    /// The peer sent a message nobody was waiting for
    Unsolicited { id: MessageId, op: OpCode },

    /// The client was destroyed
    Destroy,
}

impl Notification {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Notification::Error { fatal: true, .. })
    }
}

/// Fans notifications out to every live subscriber
#[derive(Debug, Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<Sender<Notification>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every subscriber, forgetting the ones that hung up
    pub fn emit(&self, notification: Notification) {
        tracing::trace!(?notification, "notify");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    }
}
