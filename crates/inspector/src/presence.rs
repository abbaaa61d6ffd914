use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use fortistate_protocol::{PathSegment, PresenceUser, ServerMessage};
use uuid::Uuid;

use crate::broadcast::BroadcastHub;
use crate::session::{SessionContext, now_ms};

/// Tracks connected WebSocket peers and what they are looking at.
///
/// Join/update/leave events go through the broadcast hub; `presence:init`
/// is sent directly to the joining socket by the gateway.
pub struct PresenceManager {
    users: Mutex<HashMap<Uuid, PresenceUser>>,
    guest_counter: AtomicU64,
}

impl PresenceManager {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            guest_counter: AtomicU64::new(0),
        }
    }

    /// Register a peer and broadcast `presence:join` to everyone already
    /// subscribed.
    pub fn add(
        &self,
        conn: Uuid,
        context: Option<&SessionContext>,
        remote_address: Option<String>,
        hub: &BroadcastHub,
    ) -> PresenceUser {
        let now = now_ms();
        let display_name = match context {
            Some(ctx) => match &ctx.session.label {
                Some(label) => format!("{label} ({})", ctx.session.role),
                None => {
                    let prefix: String = ctx.session.id.chars().take(8).collect();
                    format!("{} {prefix}", ctx.session.role)
                }
            },
            None => {
                let n = self.guest_counter.fetch_add(1, Ordering::Relaxed) + 1;
                format!("Guest {n}")
            }
        };

        let user = PresenceUser {
            session_id: context.map(|c| c.session.id.clone()),
            display_name,
            role: context.map(|c| c.session.role).unwrap_or_default(),
            connected_at: now,
            last_activity: now,
            active_store: None,
            cursor_path: None,
            remote_address,
        };

        self.users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(conn, user.clone());
        hub.send(&ServerMessage::PresenceJoin { user: user.clone() });
        user
    }

    /// Partial focus update; provided fields replace, absent fields persist.
    pub fn update(
        &self,
        conn: Uuid,
        active_store: Option<String>,
        cursor_path: Option<Vec<PathSegment>>,
        hub: &BroadcastHub,
    ) {
        let updated = {
            let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            let Some(user) = users.get_mut(&conn) else {
                return;
            };
            if let Some(store) = active_store {
                user.active_store = Some(store);
            }
            if let Some(path) = cursor_path {
                user.cursor_path = Some(path);
            }
            user.last_activity = now_ms();
            user.clone()
        };
        hub.send(&ServerMessage::PresenceUpdate {
            session_id: updated.session_id,
            active_store: updated.active_store,
            cursor_path: updated.cursor_path,
        });
    }

    /// Heartbeat without a focus change.
    pub fn touch(&self, conn: Uuid) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(user) = users.get_mut(&conn) {
            user.last_activity = now_ms();
        }
    }

    /// Remove a peer and broadcast `presence:leave`.
    pub fn remove(&self, conn: Uuid, hub: &BroadcastHub) -> Option<PresenceUser> {
        let user = self
            .users
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn)?;
        hub.send(&ServerMessage::PresenceLeave {
            session_id: user.session_id.clone(),
        });
        Some(user)
    }

    pub fn get_all(&self) -> Vec<PresenceUser> {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<PresenceUser> = users.values().cloned().collect();
        all.sort_by_key(|u| u.connected_at);
        all
    }

    pub fn count(&self) -> usize {
        self.users.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Drop peers idle longer than `max_idle_ms`, broadcasting a leave for
    /// each. Returns how many were removed.
    pub fn remove_idle_users(&self, max_idle_ms: u64, hub: &BroadcastHub) -> usize {
        let now = now_ms();
        let idle: Vec<Uuid> = {
            let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            users
                .iter()
                .filter(|(_, u)| now.saturating_sub(u.last_activity) > max_idle_ms)
                .map(|(conn, _)| *conn)
                .collect()
        };
        for conn in &idle {
            self.remove(*conn, hub);
        }
        idle.len()
    }
}

impl Default for PresenceManager {
    fn default() -> Self {
        Self::new()
    }
}
