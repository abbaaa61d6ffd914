use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::broadcast;

/// Telemetry replay-buffer capacity; oldest entries evicted first.
pub const TELEMETRY_CAPACITY: usize = 100;

/// Buffers telemetry entries and fans them out to SSE subscribers.
///
/// New subscribers replay the buffer before receiving live entries. Streams
/// whose writes fail are dropped by the SSE layer; the hub itself never
/// blocks on a slow consumer.
pub struct TelemetryHub {
    buffer: Mutex<VecDeque<Arc<str>>>,
    live: broadcast::Sender<Arc<str>>,
}

impl TelemetryHub {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(TELEMETRY_CAPACITY);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(TELEMETRY_CAPACITY)),
            live,
        }
    }

    /// Record one opaque telemetry object and push it to live subscribers.
    pub fn publish(&self, entry: &Value) {
        let json = match serde_json::to_string(entry) {
            Ok(json) => Arc::<str>::from(json.as_str()),
            Err(e) => {
                tracing::error!("Failed to serialize telemetry entry: {e}");
                return;
            }
        };
        {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.len() == TELEMETRY_CAPACITY {
                buffer.pop_front();
            }
            buffer.push_back(Arc::clone(&json));
        }
        let _ = self.live.send(json);
    }

    /// Buffered entries, oldest first.
    pub fn replay(&self) -> Vec<Arc<str>> {
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.live.subscribe()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for TelemetryHub {
    fn default() -> Self {
        Self::new()
    }
}
