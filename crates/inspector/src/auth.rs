use std::sync::{Arc, Mutex};

use axum::http::{HeaderMap, StatusCode};
use fortistate_protocol::Role;
use subtle::ConstantTimeEq;

use crate::session::{SessionContext, SessionStore};

/// Resolved credential for one request, computed at most once and reused by
/// every helper on that request's path.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub context: Option<SessionContext>,
    pub legacy: bool,
}

impl AuthInfo {
    pub fn session_id(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.session.id.as_str())
    }

    pub fn role(&self) -> Option<Role> {
        self.context.as_ref().map(|c| c.session.role)
    }

    /// Attribution string for audit entries.
    pub fn via(&self) -> &'static str {
        if self.legacy {
            "legacy-token"
        } else if self.context.is_some() {
            "session"
        } else {
            "anonymous"
        }
    }
}

/// What a given call demands of the caller.
#[derive(Debug, Clone, Copy)]
pub struct AccessPolicy {
    pub required: Role,
    /// Anonymous access acceptable when no credential is presented.
    pub optional: bool,
    /// The legacy shared-secret token satisfies this call.
    pub allow_legacy: bool,
}

impl AccessPolicy {
    pub fn require(required: Role) -> Self {
        Self {
            required,
            optional: false,
            allow_legacy: true,
        }
    }
}

/// A deny decision, renderable as an HTTP status or a WS close code.
#[derive(Debug, Clone)]
pub struct Denial {
    pub status: StatusCode,
    pub reason: &'static str,
    pub message: String,
}

impl Denial {
    fn unauthorized(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            reason,
            message: message.into(),
        }
    }

    fn forbidden(reason: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            reason,
            message: message.into(),
        }
    }

    /// 4401 for unauthorized, 4403 otherwise.
    pub fn ws_close_code(&self) -> u16 {
        if self.status == StatusCode::UNAUTHORIZED {
            fortistate_protocol::WS_CLOSE_UNAUTHORIZED
        } else {
            fortistate_protocol::WS_CLOSE_FORBIDDEN
        }
    }
}

/// Maps an extracted credential to an allow/deny decision for a required role.
pub struct RoleEnforcer {
    sessions: Arc<SessionStore>,
    legacy_token: Mutex<Option<String>>,
    require_sessions: bool,
    debug: bool,
}

impl RoleEnforcer {
    pub fn new(
        sessions: Arc<SessionStore>,
        legacy_token: Option<String>,
        require_sessions: bool,
        debug: bool,
    ) -> Self {
        Self {
            sessions,
            legacy_token: Mutex::new(legacy_token),
            require_sessions,
            debug,
        }
    }

    pub fn require_sessions(&self) -> bool {
        self.require_sessions
    }

    pub fn has_legacy_token(&self) -> bool {
        self.legacy_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn set_legacy_token(&self, token: Option<String>) {
        *self.legacy_token.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Extraction order: explicit query token, then `x-fortistate-token`,
    /// then `Authorization: Bearer`. Whitespace-only values count as absent.
    pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
        let candidate = query_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .or_else(|| {
                headers
                    .get("x-fortistate-token")
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
            })
            .or_else(|| {
                headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
            });
        candidate
    }

    /// Resolve a token to an `AuthInfo` without applying any policy.
    pub fn resolve(&self, headers: &HeaderMap, query_token: Option<&str>) -> AuthInfo {
        let token = Self::extract_token(headers, query_token);
        let Some(token) = token else {
            return AuthInfo::default();
        };

        let legacy = {
            let guard = self.legacy_token.lock().unwrap_or_else(|e| e.into_inner());
            guard
                .as_ref()
                .is_some_and(|expected| constant_time_str_eq(expected, &token))
        };
        let context = self.sessions.validate_token(&token);
        if self.debug && context.is_none() && !legacy {
            tracing::debug!("Presented token resolved to no session");
        }
        AuthInfo { context, legacy }
    }

    /// Apply the evaluation order to an already-resolved `AuthInfo`:
    /// legacy token, then session role, then the configured requirements.
    pub fn evaluate(&self, info: &AuthInfo, policy: AccessPolicy) -> Result<(), Denial> {
        if info.legacy && policy.allow_legacy {
            return Ok(());
        }

        if let Some(context) = &info.context {
            if context.session.role.can_act(policy.required) {
                return Ok(());
            }
            return Err(Denial::forbidden(
                "insufficient-role",
                format!(
                    "requires {} role (have {})",
                    policy.required, context.session.role
                ),
            ));
        }

        if self.has_legacy_token() && !policy.optional {
            return Err(Denial::unauthorized(
                "legacy-token-required",
                "valid token required",
            ));
        }

        // Existing sessions also force authentication for non-optional
        // calls; otherwise a freshly bootstrapped deployment would keep
        // accepting anonymous mutations.
        let require_session =
            !policy.optional && (self.require_sessions || self.sessions.has_sessions());
        if require_session {
            return Err(Denial::unauthorized(
                "session-required",
                "session token required",
            ));
        }

        Ok(())
    }

    /// Resolve and evaluate in one step.
    pub fn authorize(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
        policy: AccessPolicy,
    ) -> Result<AuthInfo, Denial> {
        let info = self.resolve(headers, query_token);
        self.evaluate(&info, policy)?;
        Ok(info)
    }
}

fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CreateSessionOptions;
    use tempfile::TempDir;

    fn store(root: &std::path::Path) -> Arc<SessionStore> {
        Arc::new(SessionStore::open(
            root,
            None,
            Some("enforcer-test-secret!".to_string()),
            Some(60_000),
            10,
            false,
        ))
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-fortistate-token", token.parse().unwrap());
        headers
    }

    fn optional(required: Role) -> AccessPolicy {
        AccessPolicy {
            required,
            optional: true,
            allow_legacy: true,
        }
    }

    #[test]
    fn extraction_prefers_query_then_header_then_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-fortistate-token", "header-token".parse().unwrap());
        headers.insert("authorization", "Bearer bearer-token".parse().unwrap());

        assert_eq!(
            RoleEnforcer::extract_token(&headers, Some("query-token")).as_deref(),
            Some("query-token")
        );
        assert_eq!(
            RoleEnforcer::extract_token(&headers, None).as_deref(),
            Some("header-token")
        );

        let mut bearer_only = HeaderMap::new();
        bearer_only.insert("authorization", "Bearer bearer-token".parse().unwrap());
        assert_eq!(
            RoleEnforcer::extract_token(&bearer_only, None).as_deref(),
            Some("bearer-token")
        );
    }

    #[test]
    fn whitespace_tokens_count_as_absent() {
        let mut headers = HeaderMap::new();
        headers.insert("x-fortistate-token", "   ".parse().unwrap());
        assert!(RoleEnforcer::extract_token(&headers, Some("  ")).is_none());
    }

    #[test]
    fn legacy_token_allows_when_permitted() {
        let root = TempDir::new().unwrap();
        let enforcer = RoleEnforcer::new(
            store(root.path()),
            Some("legacy-secret".to_string()),
            false,
            false,
        );

        let info = enforcer.resolve(&headers_with("legacy-secret"), None);
        assert!(info.legacy);
        assert!(enforcer.evaluate(&info, AccessPolicy::require(Role::Admin)).is_ok());

        let mut no_legacy_policy = AccessPolicy::require(Role::Admin);
        no_legacy_policy.allow_legacy = false;
        assert!(enforcer.evaluate(&info, no_legacy_policy).is_err());
    }

    #[test]
    fn session_role_gate_denies_403() {
        let root = TempDir::new().unwrap();
        let sessions = store(root.path());
        let observer = sessions
            .create_session(CreateSessionOptions {
                role: Role::Observer,
                ..Default::default()
            })
            .unwrap();
        let enforcer = RoleEnforcer::new(sessions, None, true, false);

        let info = enforcer.resolve(&headers_with(&observer.token), None);
        let denial = enforcer
            .evaluate(&info, AccessPolicy::require(Role::Editor))
            .unwrap_err();
        assert_eq!(denial.status, StatusCode::FORBIDDEN);
        assert_eq!(denial.ws_close_code(), 4403);

        assert!(enforcer
            .evaluate(&info, AccessPolicy::require(Role::Observer))
            .is_ok());
    }

    #[test]
    fn missing_token_with_sessions_required_denies_401() {
        let root = TempDir::new().unwrap();
        let enforcer = RoleEnforcer::new(store(root.path()), None, true, false);

        let denial = enforcer
            .authorize(&HeaderMap::new(), None, AccessPolicy::require(Role::Observer))
            .unwrap_err();
        assert_eq!(denial.status, StatusCode::UNAUTHORIZED);
        assert_eq!(denial.ws_close_code(), 4401);
    }

    #[test]
    fn missing_token_with_legacy_configured_denies_401() {
        let root = TempDir::new().unwrap();
        let enforcer = RoleEnforcer::new(
            store(root.path()),
            Some("legacy".to_string()),
            false,
            false,
        );

        let denial = enforcer
            .authorize(&HeaderMap::new(), None, AccessPolicy::require(Role::Observer))
            .unwrap_err();
        assert_eq!(denial.reason, "legacy-token-required");
    }

    #[test]
    fn existing_sessions_force_auth_for_non_optional_calls() {
        let root = TempDir::new().unwrap();
        let sessions = store(root.path());
        sessions
            .create_session(CreateSessionOptions {
                role: Role::Editor,
                ..Default::default()
            })
            .unwrap();
        let enforcer = RoleEnforcer::new(sessions, None, false, false);

        let denial = enforcer
            .authorize(&HeaderMap::new(), None, AccessPolicy::require(Role::Editor))
            .unwrap_err();
        assert_eq!(denial.status, StatusCode::UNAUTHORIZED);

        // Observer reads marked optional stay anonymous.
        assert!(enforcer
            .authorize(&HeaderMap::new(), None, optional(Role::Observer))
            .is_ok());
    }

    #[test]
    fn anonymous_allowed_when_nothing_demands_auth() {
        let root = TempDir::new().unwrap();
        let enforcer = RoleEnforcer::new(store(root.path()), None, false, false);

        let info = enforcer
            .authorize(&HeaderMap::new(), None, AccessPolicy::require(Role::Editor))
            .unwrap();
        assert!(info.context.is_none());
        assert_eq!(info.via(), "anonymous");
    }

    #[test]
    fn optional_policy_allows_anonymous_despite_require_sessions() {
        let root = TempDir::new().unwrap();
        let enforcer = RoleEnforcer::new(store(root.path()), None, true, false);

        assert!(enforcer
            .authorize(&HeaderMap::new(), None, optional(Role::Observer))
            .is_ok());
    }

    #[test]
    fn invalid_token_falls_back_to_policy_not_error() {
        let root = TempDir::new().unwrap();
        let enforcer = RoleEnforcer::new(store(root.path()), None, false, false);

        // Bad token, but nothing requires auth: allowed as anonymous.
        assert!(enforcer
            .authorize(
                &headers_with("bogus"),
                None,
                AccessPolicy::require(Role::Editor)
            )
            .is_ok());

        let strict = RoleEnforcer::new(store(root.path()), None, true, false);
        assert!(strict
            .authorize(
                &headers_with("bogus"),
                None,
                AccessPolicy::require(Role::Editor)
            )
            .is_err());
    }
}
