//! Per-device conversation history.
//!
//! A small rolling window of prior turns, used to enrich outgoing chat
//! commands with context. Bounded at [`MAX_TURNS`] entries per device with
//! FIFO eviction — the oldest turn goes first, regardless of access order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

/// Maximum turns retained per device.
pub const MAX_TURNS: usize = 10;

/// One prior exchange entry.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp_ms: u64,
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Bounded per-device conversation windows, keyed by device id.
#[derive(Clone, Default)]
pub struct ConversationStore {
    inner: Arc<Mutex<HashMap<String, VecDeque<ConversationTurn>>>>,
}

impl ConversationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn, evicting the oldest if the window is full.
    pub async fn push(&self, device_id: &str, role: TurnRole, content: String) {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let mut inner = self.inner.lock().await;
        let window = inner.entry(device_id.to_string()).or_default();
        if window.len() >= MAX_TURNS {
            window.pop_front();
        }
        window.push_back(ConversationTurn {
            role,
            content,
            timestamp_ms,
        });
    }

    /// The most recent turn, if any.
    pub async fn last_turn(&self, device_id: &str) -> Option<ConversationTurn> {
        let inner = self.inner.lock().await;
        inner.get(device_id).and_then(|w| w.back().cloned())
    }

    /// All retained turns, oldest first.
    pub async fn recent(&self, device_id: &str) -> Vec<ConversationTurn> {
        let inner = self.inner.lock().await;
        inner
            .get(device_id)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a device's window entirely.
    pub async fn clear(&self, device_id: &str) {
        self.inner.lock().await.remove(device_id);
    }
}
