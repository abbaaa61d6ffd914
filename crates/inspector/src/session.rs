use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use fortistate_protocol::{Role, Session, TokenType};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

/// Session state file under the working root.
pub const SESSIONS_FILE: &str = ".fortistate-sessions.json";

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A validated caller: the session record plus how its token was encoded.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session: Session,
    pub token_type: TokenType,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub role: Role,
    /// Overrides the store's default TTL for this session.
    pub ttl_ms: Option<u64>,
    pub label: Option<String>,
    pub issued_by: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// A freshly minted session with its one-time-visible token.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session: Session,
    pub token: String,
    pub token_type: TokenType,
}

/// JWT claims for JWT-mode tokens.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sid: String,
    role: Role,
    /// Seconds since the Unix epoch.
    iat: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<u64>,
    iss: String,
}

const JWT_ISSUER: &str = "fortistate";

#[derive(Serialize, Deserialize, Default)]
struct PersistedState {
    version: u32,
    sessions: BTreeMap<String, Session>,
    /// base64url(HMAC-SHA256(secret, token)) → session id. Opaque mode only.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tokens: BTreeMap<String, String>,
}

enum TokenMode {
    /// HMAC-signed JWTs carry their own claims; the session record is still
    /// required server-side so revocation works.
    Jwt { secret: String },
    /// Opaque random tokens; only their keyed hash is stored.
    Opaque { secret: Vec<u8> },
}

struct SharedState {
    sessions: BTreeMap<String, Session>,
    tokens: BTreeMap<String, String>,
}

/// Creates, validates, and revokes sessions, persisting every mutation to a
/// single JSON file.
pub struct SessionStore {
    path: PathBuf,
    mode: TokenMode,
    /// `None` means sessions never expire by default.
    default_ttl_ms: Option<u64>,
    max_sessions: usize,
    debug: bool,
    state: Mutex<SharedState>,
}

impl SessionStore {
    /// Open (or initialize) the session store under `root`.
    ///
    /// A configured `jwt_secret` selects JWT mode. Otherwise `session_secret`
    /// keys the opaque-token HMAC; when absent, 48 random bytes are generated
    /// and tokens are invalidated on restart.
    pub fn open(
        root: &Path,
        jwt_secret: Option<String>,
        session_secret: Option<String>,
        default_ttl_ms: Option<u64>,
        max_sessions: usize,
        debug: bool,
    ) -> Self {
        let mode = match jwt_secret {
            Some(secret) => TokenMode::Jwt { secret },
            None => {
                let secret = match session_secret {
                    Some(s) if s.len() >= 16 => s.into_bytes(),
                    other => {
                        if other.is_some() {
                            tracing::warn!(
                                "FORTISTATE_SESSION_SECRET is shorter than 16 chars; ignoring it"
                            );
                        }
                        tracing::warn!(
                            "No session secret configured; using an ephemeral secret, \
                             tokens will not survive a restart"
                        );
                        let mut bytes = vec![0u8; 48];
                        rand::thread_rng().fill_bytes(&mut bytes);
                        bytes
                    }
                };
                TokenMode::Opaque { secret }
            }
        };

        let path = root.join(SESSIONS_FILE);
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<PersistedState>(&contents) {
                Ok(persisted) => SharedState {
                    sessions: persisted.sessions,
                    tokens: persisted.tokens,
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), "Unreadable session file, starting empty: {e}");
                    SharedState {
                        sessions: BTreeMap::new(),
                        tokens: BTreeMap::new(),
                    }
                }
            },
            Err(_) => SharedState {
                sessions: BTreeMap::new(),
                tokens: BTreeMap::new(),
            },
        };

        Self {
            path,
            mode,
            default_ttl_ms,
            max_sessions,
            debug,
            state: Mutex::new(state),
        }
    }

    pub fn token_type(&self) -> TokenType {
        match self.mode {
            TokenMode::Jwt { .. } => TokenType::Jwt,
            TokenMode::Opaque { .. } => TokenType::Opaque,
        }
    }

    /// Mint a session and its bearer token. The raw token is visible exactly
    /// once, in the returned value.
    pub fn create_session(&self, opts: CreateSessionOptions) -> anyhow::Result<IssuedSession> {
        let now = now_ms();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            role: opts.role,
            created_at: now,
            expires_at: opts
                .ttl_ms
                .or(self.default_ttl_ms)
                .map(|ttl| now.saturating_add(ttl)),
            label: opts.label,
            issued_by: opts.issued_by,
            ip: opts.ip,
            user_agent: opts.user_agent,
        };

        let (token, token_type, token_hash) = match &self.mode {
            TokenMode::Jwt { secret } => {
                let claims = Claims {
                    sid: session.id.clone(),
                    role: session.role,
                    iat: now / 1000,
                    exp: session.expires_at.map(|ms| ms / 1000),
                    iss: JWT_ISSUER.to_string(),
                };
                let token = jsonwebtoken::encode(
                    &Header::default(),
                    &claims,
                    &EncodingKey::from_secret(secret.as_bytes()),
                )?;
                (token, TokenType::Jwt, None)
            }
            TokenMode::Opaque { secret } => {
                let mut bytes = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                let token = URL_SAFE_NO_PAD.encode(bytes);
                let hash = hash_token(secret, &token);
                (token, TokenType::Opaque, Some(hash))
            }
        };

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hash) = token_hash {
                state.tokens.insert(hash, session.id.clone());
            }
            state.sessions.insert(session.id.clone(), session.clone());
            while state.sessions.len() > self.max_sessions {
                let oldest = state
                    .sessions
                    .values()
                    .min_by_key(|s| s.created_at)
                    .map(|s| s.id.clone());
                match oldest {
                    Some(id) => {
                        tracing::warn!(%id, "Session cap exceeded, evicting oldest session");
                        Self::remove_locked(&mut state, &id);
                    }
                    None => break,
                }
            }
            self.persist_locked(&state);
        }

        Ok(IssuedSession {
            session,
            token,
            token_type,
        })
    }

    /// Resolve a bearer token to a live session. All decode and signature
    /// failures surface as `None`; expired sessions are removed as a side
    /// effect.
    pub fn validate_token(&self, token: &str) -> Option<SessionContext> {
        match &self.mode {
            TokenMode::Jwt { secret } => {
                let mut validation = Validation::new(Algorithm::HS256);
                validation.set_issuer(&[JWT_ISSUER]);
                validation.required_spec_claims.clear();
                let claims = match jsonwebtoken::decode::<Claims>(
                    token,
                    &DecodingKey::from_secret(secret.as_bytes()),
                    &validation,
                ) {
                    Ok(data) => data.claims,
                    Err(e) => {
                        if self.debug {
                            tracing::debug!("JWT rejected: {e}");
                        }
                        return None;
                    }
                };
                self.lookup_live(&claims.sid).map(|session| SessionContext {
                    session,
                    token_type: TokenType::Jwt,
                })
            }
            TokenMode::Opaque { secret } => {
                let hash = hash_token(secret, token);
                let id = {
                    let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.tokens.get(&hash).cloned()
                }?;
                self.lookup_live(&id).map(|session| SessionContext {
                    session,
                    token_type: TokenType::Opaque,
                })
            }
        }
    }

    fn lookup_live(&self, id: &str) -> Option<Session> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let session = state.sessions.get(id)?.clone();
        if let Some(expires_at) = session.expires_at
            && now_ms() >= expires_at
        {
            if self.debug {
                tracing::debug!(%id, "Session expired, removing");
            }
            Self::remove_locked(&mut state, id);
            self.persist_locked(&state);
            return None;
        }
        Some(session)
    }

    /// Returns false when the session did not exist.
    pub fn revoke_session(&self, id: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let existed = Self::remove_locked(&mut state, id);
        if existed {
            self.persist_locked(&state);
        }
        existed
    }

    pub fn list_sessions(&self) -> Vec<Session> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.sessions.values().cloned().collect()
    }

    pub fn has_sessions(&self) -> bool {
        !self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .is_empty()
    }

    /// Sweep expired sessions. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.expires_at.is_some_and(|at| now >= at))
            .map(|s| s.id.clone())
            .collect();
        for id in &expired {
            Self::remove_locked(&mut state, id);
        }
        if !expired.is_empty() {
            self.persist_locked(&state);
        }
        expired.len()
    }

    fn remove_locked(state: &mut SharedState, id: &str) -> bool {
        let existed = state.sessions.remove(id).is_some();
        state.tokens.retain(|_, sid| sid != id);
        existed
    }

    fn persist_locked(&self, state: &SharedState) {
        let persisted = PersistedState {
            version: 1,
            sessions: state.sessions.clone(),
            tokens: state.tokens.clone(),
        };
        let json = match serde_json::to_string_pretty(&persisted) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize session state: {e}");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, json)
            && self.debug
        {
            tracing::debug!(path = %self.path.display(), "Failed to persist sessions: {e}");
        }
    }
}

fn hash_token(secret: &[u8], token: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(token.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}
