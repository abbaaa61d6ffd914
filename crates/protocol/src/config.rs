use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Origin policy for CORS and WebSocket upgrades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowOrigin {
    /// Send `Access-Control-Allow-Origin: *` and accept any WS origin.
    Any,
    /// Echo the request origin when it matches one of these entries.
    List(Vec<String>),
}

impl AllowOrigin {
    /// Parse the env-var form: `*`, or a comma-separated list.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(AllowOrigin::Any);
        }
        let list: Vec<String> = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if list.is_empty() {
            None
        } else {
            Some(AllowOrigin::List(list))
        }
    }

    pub fn matches(&self, origin: &str) -> bool {
        match self {
            AllowOrigin::Any => true,
            AllowOrigin::List(list) => list.iter().any(|o| o == origin),
        }
    }
}

/// Runtime configuration for the inspector process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// Working directory that namespaces all persisted state.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Mutating endpoints demand a session (or legacy token).
    #[serde(default)]
    pub require_sessions: bool,
    /// Observer endpoints stay anonymous even when sessions are required.
    #[serde(default)]
    pub allow_anon_sessions: bool,
    /// Opaque-token HMAC secret. Absent means an ephemeral secret is
    /// generated at startup and tokens die with the process.
    pub session_secret: Option<String>,
    /// Presence selects JWT token mode.
    pub jwt_secret: Option<String>,
    /// Default session lifetime in milliseconds.
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    /// Cap on concurrent sessions; oldest evicted beyond this.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Audit rotation threshold in bytes.
    #[serde(default = "default_audit_max_size")]
    pub audit_max_size: u64,
    /// Audit rotation threshold in days.
    #[serde(default = "default_audit_rotate_days")]
    pub audit_rotate_days: u64,
    pub allow_origin: Option<AllowOrigin>,
    /// With an allowlist configured, reject WS upgrades carrying no origin.
    #[serde(default)]
    pub allow_origin_strict: bool,
    /// Overrides the derived remote-store namespace.
    pub namespace_override: Option<String>,
    #[serde(default)]
    pub disable_config_watch: bool,
    /// Verbose auth/session/storage logging.
    #[serde(default)]
    pub debug: bool,
    /// Gates the open-in-editor endpoint.
    #[serde(default)]
    pub allow_open: bool,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            port: default_port(),
            require_sessions: false,
            allow_anon_sessions: false,
            session_secret: None,
            jwt_secret: None,
            session_ttl_ms: default_session_ttl_ms(),
            max_sessions: default_max_sessions(),
            audit_max_size: default_audit_max_size(),
            audit_rotate_days: default_audit_rotate_days(),
            allow_origin: None,
            allow_origin_strict: false,
            namespace_override: None,
            disable_config_watch: false,
            debug: false,
            allow_open: false,
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_port() -> u16 {
    4000
}

fn default_session_ttl_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_max_sessions() -> usize {
    500
}

fn default_audit_max_size() -> u64 {
    1024 * 1024
}

fn default_audit_rotate_days() -> u64 {
    30
}
