use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller roles, ordered: an action requiring role R is allowed for any
/// caller whose role compares `>= R`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Observer,
    Editor,
    Admin,
}

impl Role {
    /// Total-order role check.
    pub fn can_act(self, required: Role) -> bool {
        self >= required
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Observer => "observer",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observer" => Ok(Role::Observer),
            "editor" => Ok(Role::Editor),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

/// Server-side record authorizing a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// UUIDv4, stable for the session's lifetime.
    pub id: String,
    pub role: Role,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Absent means the session never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Session id of the creator, when minted through another session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// How the bearer credential for a session is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Opaque,
    Jwt,
}

/// One element of a presence cursor path (object key or array index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(u64),
    Key(String),
}

/// Live metadata for one connected WebSocket peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub session_id: Option<String>,
    pub display_name: String,
    pub role: Role,
    /// Milliseconds since the Unix epoch.
    pub connected_at: u64,
    pub last_activity: u64,
    pub active_store: Option<String>,
    pub cursor_path: Option<Vec<PathSegment>>,
    pub remote_address: Option<String>,
}

/// One append-only audit record; serialized as a single JSONL line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// RFC3339 timestamp.
    pub time: String,
    pub action: String,
    pub session_id: Option<String>,
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// One mutation-history record kept in the in-memory ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: String,
    /// Milliseconds since the Unix epoch.
    pub ts: u64,
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

/// Frames the inspector pushes to WebSocket peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "hello")]
    Hello { version: u32 },
    #[serde(rename = "snapshot")]
    Snapshot { stores: BTreeMap<String, Value> },
    #[serde(rename = "store:create")]
    StoreCreate { key: String, initial: Value },
    #[serde(rename = "store:change")]
    StoreChange { key: String, value: Value },
    #[serde(rename = "store:duplicate")]
    StoreDuplicate { source_key: String, dest_key: String },
    #[serde(rename = "history:add")]
    HistoryAdd { entry: HistoryEntry },
    #[serde(rename = "presence:init")]
    PresenceInit { users: Vec<PresenceUser> },
    #[serde(rename = "presence:join")]
    PresenceJoin { user: PresenceUser },
    #[serde(rename = "presence:update")]
    PresenceUpdate {
        session_id: Option<String>,
        active_store: Option<String>,
        cursor_path: Option<Vec<PathSegment>>,
    },
    #[serde(rename = "presence:leave")]
    PresenceLeave { session_id: Option<String> },
}

/// JSON frames peers may send. The literal text `req:snapshot` is handled
/// before JSON parsing and is not part of this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "presence:update")]
    PresenceUpdate {
        #[serde(default)]
        active_store: Option<String>,
        #[serde(default)]
        cursor_path: Option<Vec<PathSegment>>,
    },
    #[serde(rename = "presence:ping")]
    PresencePing,
}

/// WebSocket close code for missing/invalid credentials.
pub const WS_CLOSE_UNAUTHORIZED: u16 = 4401;
/// WebSocket close code for insufficient role or rejected origin.
pub const WS_CLOSE_FORBIDDEN: u16 = 4403;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_is_total() {
        assert!(Role::Observer < Role::Editor);
        assert!(Role::Editor < Role::Admin);
        assert!(Role::Admin.can_act(Role::Observer));
        assert!(Role::Editor.can_act(Role::Editor));
        assert!(!Role::Observer.can_act(Role::Editor));
        assert!(!Role::Editor.can_act(Role::Admin));
    }

    #[test]
    fn role_roundtrips_through_serde() {
        for role in [Role::Observer, Role::Editor, Role::Admin] {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{role}\""));
            let back: Role = serde_json::from_str(&json).unwrap();
            assert_eq!(back, role);
        }
    }

    #[test]
    fn server_frames_use_colon_tags() {
        let frame = ServerMessage::StoreChange {
            key: "counter".into(),
            value: serde_json::json!(5),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "store:change");
        assert_eq!(json["key"], "counter");
        assert_eq!(json["value"], 5);
    }

    #[test]
    fn store_duplicate_frame_uses_camel_case() {
        let frame = ServerMessage::StoreDuplicate {
            source_key: "a".into(),
            dest_key: "b".into(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["sourceKey"], "a");
        assert_eq!(json["destKey"], "b");
    }

    #[test]
    fn client_presence_update_parses_partial_fields() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"presence:update","activeStore":"x"}"#).unwrap();
        match msg {
            ClientMessage::PresenceUpdate {
                active_store,
                cursor_path,
            } => {
                assert_eq!(active_store.as_deref(), Some("x"));
                assert!(cursor_path.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn client_ping_parses() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"presence:ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::PresencePing));
    }

    #[test]
    fn cursor_path_mixes_keys_and_indices() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"presence:update","cursorPath":["items",0,"name"]}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::PresenceUpdate { cursor_path, .. } => {
                let path = cursor_path.unwrap();
                assert_eq!(path[0], PathSegment::Key("items".into()));
                assert_eq!(path[1], PathSegment::Index(0));
                assert_eq!(path[2], PathSegment::Key("name".into()));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn session_serializes_camel_case_and_omits_absent_expiry() {
        let session = Session {
            id: "abc".into(),
            role: Role::Editor,
            created_at: 1,
            expires_at: None,
            label: Some("ci".into()),
            issued_by: None,
            ip: None,
            user_agent: None,
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["createdAt"], 1);
        assert_eq!(json["label"], "ci");
        assert!(json.get("expiresAt").is_none());
        assert!(json.get("issuedBy").is_none());
    }

    #[test]
    fn history_entry_flattens_details() {
        let mut details = serde_json::Map::new();
        details.insert("key".into(), serde_json::json!("counter"));
        let entry = HistoryEntry {
            action: "change".into(),
            ts: 42,
            details,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["action"], "change");
        assert_eq!(json["ts"], 42);
        assert_eq!(json["key"], "counter");
    }
}
