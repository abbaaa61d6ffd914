use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fortistate_protocol::{AllowOrigin, InspectorConfig};
use serde::{Deserialize, Serialize};

/// Legacy shared-secret token file under the working root.
pub const LEGACY_TOKEN_FILE: &str = ".fortistate-inspector-token";

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a duration string with `ms`, `s`, `m`, `h`, `d`, or `w` suffix.
/// A bare number is milliseconds.
pub fn parse_duration_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let number: u64 = number.parse().ok()?;
    let multiplier = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1000,
        "m" => 60 * 1000,
        "h" => 60 * 60 * 1000,
        "d" => 24 * 60 * 60 * 1000,
        "w" => 7 * 24 * 60 * 60 * 1000,
        _ => return None,
    };
    number.checked_mul(multiplier)
}

/// Build the runtime configuration from environment variables, with CLI
/// overrides for root and port.
pub fn load_config(root: PathBuf, port_override: Option<u16>) -> InspectorConfig {
    let defaults = InspectorConfig::default();

    let session_ttl_ms = env_string("FORTISTATE_SESSION_TTL")
        .and_then(|raw| {
            let parsed = parse_duration_ms(&raw);
            if parsed.is_none() {
                tracing::warn!("Unparsable FORTISTATE_SESSION_TTL {raw:?}, using default");
            }
            parsed
        })
        .unwrap_or(defaults.session_ttl_ms);

    let port = port_override
        .or_else(|| env_string("FORTISTATE_PORT").and_then(|p| p.parse().ok()))
        .unwrap_or(defaults.port);

    InspectorConfig {
        root,
        port,
        require_sessions: env_flag("FORTISTATE_REQUIRE_SESSIONS"),
        allow_anon_sessions: env_flag("FORTISTATE_ALLOW_ANON_SESSIONS"),
        session_secret: env_string("FORTISTATE_SESSION_SECRET"),
        jwt_secret: env_string("FORTISTATE_JWT_SECRET"),
        session_ttl_ms,
        max_sessions: env_string("FORTISTATE_SESSION_MAX")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_sessions),
        audit_max_size: env_string("FORTISTATE_AUDIT_MAX_SIZE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.audit_max_size),
        audit_rotate_days: env_string("FORTISTATE_AUDIT_ROTATE_DAYS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.audit_rotate_days),
        allow_origin: env_string("FORTISTATE_INSPECTOR_ALLOW_ORIGIN")
            .as_deref()
            .and_then(AllowOrigin::parse),
        allow_origin_strict: env_flag("FORTISTATE_INSPECTOR_ALLOW_ORIGIN_STRICT"),
        namespace_override: env_string("FORTISTATE_INSPECTOR_NAMESPACE")
            .or_else(|| env_string("FORTISTATE_REMOTE_NAMESPACE")),
        disable_config_watch: env_flag("FORTISTATE_DISABLE_CONFIG_WATCH"),
        debug: env_flag("FORTISTATE_DEBUG"),
        allow_open: env_flag("FORTISTATE_INSPECTOR_ALLOW_OPEN"),
    }
}

#[derive(Serialize, Deserialize)]
struct LegacyTokenFile {
    token: String,
}

/// Read the legacy token dev-helper file, if present and well-formed.
pub fn load_legacy_token(root: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(root.join(LEGACY_TOKEN_FILE)).ok()?;
    let parsed: LegacyTokenFile = serde_json::from_str(&contents).ok()?;
    let token = parsed.token.trim().to_string();
    if token.is_empty() { None } else { Some(token) }
}

pub fn save_legacy_token(root: &Path, token: &str) -> Result<()> {
    let path = root.join(LEGACY_TOKEN_FILE);
    let json = serde_json::to_string_pretty(&LegacyTokenFile {
        token: token.to_string(),
    })?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
}
