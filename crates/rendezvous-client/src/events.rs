//! Events surfaced to the UI layer.

use serde::Serialize;
use tokio::sync::broadcast;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A match was created.  `instant` is set when the swipe response itself
    /// reported it, before any sync.
    MatchCreated {
        match_id: String,
        other_user_id: Option<String>,
        instant: bool,
    },
    MatchUpdated {
        match_id: String,
    },
    ChatCreated {
        chat_id: String,
    },
    MessageReceived {
        chat_id: String,
        message_id: String,
    },
    MessageSent {
        message_id: String,
        temp_id: String,
    },
    MessageFailed {
        message_id: String,
    },
    SyncCompleted {
        pulled: usize,
        pushed: usize,
        timestamp: i64,
    },
    SyncFailed {
        error: String,
    },
    LoggedOut,
}

/// Fan-out of [`ClientEvent`]s to any number of listeners.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        // No listeners is normal before the UI attaches.
        if let Err(e) = self.tx.send(event) {
            tracing::debug!(event = ?e.0, "Event dropped, no listeners");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
