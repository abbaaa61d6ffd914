use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use fortistate_protocol::{HistoryEntry, ServerMessage};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::session::now_ms;

/// Mutation-history ring buffer capacity.
pub const HISTORY_CAPACITY: usize = 200;

/// Fans store/presence/history frames out to every connected WebSocket peer.
///
/// Frames are serialized once and shared; delivery is best-effort at-most-once
/// per peer. Every mutation path serializes through [`BroadcastHub::send`]
/// while the mutating lock is still held, so per-key frame order matches the
/// order the store accepted the mutations.
pub struct BroadcastHub {
    frames: broadcast::Sender<Arc<str>>,
    history: Mutex<VecDeque<HistoryEntry>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(256);
        Self {
            frames,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.frames.subscribe()
    }

    /// Peers currently subscribed.
    pub fn peer_count(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Serialize and fan out one frame. A send error only means no peer is
    /// connected; it is never surfaced.
    pub fn send(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => {
                let _ = self.frames.send(Arc::from(json.as_str()));
            }
            Err(e) => tracing::error!("Failed to serialize broadcast frame: {e}"),
        }
    }

    pub fn store_create(&self, key: &str, initial: Value) {
        self.send(&ServerMessage::StoreCreate {
            key: key.to_string(),
            initial,
        });
    }

    pub fn store_change(&self, key: &str, value: Value) {
        self.send(&ServerMessage::StoreChange {
            key: key.to_string(),
            value,
        });
    }

    /// Append to the history ring buffer and broadcast `history:add`.
    pub fn record_history(&self, action: &str, details: serde_json::Map<String, Value>) {
        let entry = HistoryEntry {
            action: action.to_string(),
            ts: now_ms(),
            details,
        };
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }
        self.send(&ServerMessage::HistoryAdd { entry });
    }

    /// Ring buffer contents, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
