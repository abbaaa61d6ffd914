use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use fortistate_protocol::{AllowOrigin, InspectorConfig, Role};
use fortistate_store::{PluginLoader, Preset, StoreFactory};
use futures_util::StreamExt;
use futures_util::stream;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::limit::RequestBodyLimitLayer;

use crate::audit::AuditLog;
use crate::auth::{AccessPolicy, AuthInfo, RoleEnforcer};
use crate::broadcast::BroadcastHub;
use crate::presence::PresenceManager;
use crate::reload::ReloadControl;
use crate::remote::{RemoteStoreRegistry, derive_namespace};
use crate::session::{CreateSessionOptions, SessionStore};
use crate::telemetry::TelemetryHub;
use crate::universe::{CanvasRequest, MetadataRequest, UniverseRegistry, VersionRequest};

/// Maximum accepted JSON body.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: InspectorConfig,
    pub factory: StoreFactory,
    pub loader: PluginLoader,
    pub sessions: Arc<SessionStore>,
    pub enforcer: RoleEnforcer,
    pub audit: AuditLog,
    pub presence: PresenceManager,
    pub remote: RemoteStoreRegistry,
    pub hub: BroadcastHub,
    pub telemetry: TelemetryHub,
    pub universes: UniverseRegistry,
    pub reload: ReloadControl,
    /// Woken once at shutdown; every WebSocket peer task exits on it.
    pub shutdown: Notify,
    pub shutting_down: AtomicBool,
    /// Unsubscribe handles for the store-factory bridges, released at
    /// shutdown.
    store_subs: std::sync::Mutex<Vec<fortistate_store::Subscription>>,
    pub started_at: std::time::Instant,
}

impl AppState {
    /// Flag shutdown, stop the watcher, detach the store bridges, and kick
    /// every connected peer.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.reload.stop();
        for sub in self
            .store_subs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            sub.unsubscribe();
        }
        self.shutdown.notify_waiters();
    }
}

/// Assemble the application state for one working root and wire the store
/// factory's create/change subscriptions into the broadcast hub and remote
/// registry.
pub fn build_state(config: InspectorConfig) -> Arc<AppState> {
    let sessions = Arc::new(SessionStore::open(
        &config.root,
        config.jwt_secret.clone(),
        config.session_secret.clone(),
        Some(config.session_ttl_ms),
        config.max_sessions,
        config.debug,
    ));
    let legacy_token = crate::config::load_legacy_token(&config.root);
    if legacy_token.is_some() {
        tracing::info!("Loaded legacy inspector token");
    }
    let enforcer = RoleEnforcer::new(
        Arc::clone(&sessions),
        legacy_token,
        config.require_sessions,
        config.debug,
    );
    let audit = AuditLog::new(
        &config.root,
        config.audit_max_size,
        config.audit_rotate_days,
        config.debug,
    );
    let namespace = derive_namespace(
        config.namespace_override.as_deref(),
        std::env::var("PACKAGE_NAME").ok().as_deref(),
        &config.root,
    );
    let remote = RemoteStoreRegistry::open(
        &config.root,
        namespace,
        config.namespace_override.is_none(),
        config.debug,
    );
    remote.load_initial();
    let universes = UniverseRegistry::new(&config.root);

    let state = Arc::new(AppState {
        config,
        factory: StoreFactory::new(),
        loader: PluginLoader::new(),
        sessions,
        enforcer,
        audit,
        presence: PresenceManager::new(),
        remote,
        hub: BroadcastHub::new(),
        telemetry: TelemetryHub::new(),
        universes,
        reload: ReloadControl::new(),
        shutdown: Notify::new(),
        shutting_down: AtomicBool::new(false),
        store_subs: std::sync::Mutex::new(Vec::new()),
        started_at: std::time::Instant::now(),
    });

    let weak = Arc::downgrade(&state);
    let on_create = state.factory.subscribe_create(move |key, initial| {
        if let Some(state) = weak.upgrade() {
            state.hub.store_create(key, initial.clone());
        }
    });
    let weak = Arc::downgrade(&state);
    let on_change = state.factory.subscribe_change(move |key, value| {
        if let Some(state) = weak.upgrade() {
            state.hub.store_change(key, value.clone());
        }
    });
    state
        .store_subs
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .extend([on_create, on_change]);

    state
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/ws", get(crate::ws::ws_upgrade))
        .route("/session/create", post(session_create))
        .route("/session/current", get(session_current))
        .route("/session/list", get(session_list))
        .route("/session/revoke", post(session_revoke))
        .route("/audit/log", get(audit_log))
        .route("/remote-stores", get(remote_stores))
        .route("/register", post(register_store))
        .route("/change", post(change_store))
        .route("/apply-preset", post(apply_preset))
        .route("/duplicate-store", post(duplicate_store))
        .route("/swap-stores", post(swap_stores))
        .route("/move-store", post(move_store))
        .route("/history", get(history))
        .route("/presets", get(presets))
        .route("/presence", get(presence))
        .route("/telemetry/stream", get(telemetry_stream))
        .route("/api/universes", get(universes_list).post(universes_create))
        .route("/api/universes/{id}", delete(universe_delete))
        .route("/api/universes/{id}/versions", post(universe_add_version))
        .route(
            "/api/universes/{id}/versions/{vid}",
            get(universe_get_version),
        )
        .route("/api/universes/{id}/launch", post(universe_launch))
        .route("/set-token", get(set_token_via_query).post(set_token))
        .route("/open-source", post(open_source))
        .route("/debug", get(debug_info))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            cors,
        ))
        .with_state(state)
}

/// CORS middleware. Answers every OPTIONS with 204 and stamps the
/// configured origin policy on all other responses.
async fn cors(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(&state.config, origin.as_deref(), response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(&state.config, origin.as_deref(), response.headers_mut());
    response
}

fn apply_cors_headers(config: &InspectorConfig, origin: Option<&str>, headers: &mut HeaderMap) {
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, x-fortistate-token, Authorization"),
    );
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );

    let echo = |headers: &mut HeaderMap, origin: &str| {
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert("access-control-allow-origin", value);
            headers.insert(
                "access-control-allow-credentials",
                HeaderValue::from_static("true"),
            );
        }
    };

    match &config.allow_origin {
        Some(AllowOrigin::Any) => {
            headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
        }
        Some(allow @ AllowOrigin::List(_)) => {
            if let Some(origin) = origin
                && allow.matches(origin)
            {
                echo(headers, origin);
            }
        }
        None => {
            if let Some(origin) = origin {
                echo(headers, origin);
            }
        }
    }
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    policy: AccessPolicy,
) -> Result<AuthInfo, Response> {
    state
        .enforcer
        .authorize(headers, None, policy)
        .map_err(|denial| (denial.status, denial.message).into_response())
}

/// Observer reads stay anonymous unless sessions are required (and even
/// then when anonymous sessions are explicitly allowed).
fn observer_policy(state: &AppState) -> AccessPolicy {
    AccessPolicy {
        required: Role::Observer,
        optional: !state.enforcer.require_sessions() || state.config.allow_anon_sessions,
        allow_legacy: true,
    }
}

fn editor_policy() -> AccessPolicy {
    AccessPolicy::require(Role::Editor)
}

fn admin_policy() -> AccessPolicy {
    AccessPolicy::require(Role::Admin)
}

/// Empty bodies read as `{}`; anything else must be valid JSON.
fn parse_json_body(bytes: &Bytes) -> Result<Value, Response> {
    if bytes.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_slice(bytes)
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid JSON body").into_response())
}

fn parse_body<T: serde::de::DeserializeOwned>(bytes: &Bytes) -> Result<T, Response> {
    let value = parse_json_body(bytes)?;
    serde_json::from_value(value).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("invalid request body: {e}"),
        )
            .into_response()
    })
}

fn caller_id(info: &AuthInfo) -> String {
    info.session_id().unwrap_or("anonymous").to_string()
}

/// GET / - embedded inspector landing page. The full UI ships separately;
/// this page documents the endpoints and the WebSocket address.
async fn index() -> impl IntoResponse {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>Fortistate Inspector</title>
  <style>
    body { font-family: ui-monospace, monospace; margin: 2rem auto; max-width: 42rem; }
    code { background: #f2f2f2; padding: 0 .3rem; }
  </style>
</head>
<body>
  <h1>Fortistate Inspector</h1>
  <p>This server exposes the in-process reactive stores of the attached
  application. Connect a WebSocket client to <code>/ws</code> for a snapshot
  plus live <code>store:create</code>/<code>store:change</code> frames, or
  read <code>/remote-stores</code>, <code>/history</code>,
  <code>/presence</code>, and <code>/telemetry/stream</code> over HTTP.</p>
  <p>Mutations (<code>/register</code>, <code>/change</code>, …) require an
  editor session; mint one via <code>POST /session/create</code>.</p>
</body>
</html>
"#;

#[derive(Deserialize)]
struct SessionCreateBody {
    role: String,
    #[serde(rename = "expiresIn")]
    expires_in: Option<String>,
    label: Option<String>,
}

/// POST /session/create - mint a session token.
///
/// Requesting admin with prior sessions on record demands an admin caller;
/// otherwise editor when sessions are required, else observer (which lets
/// the first session bootstrap anonymously).
async fn session_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: SessionCreateBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let role: Role = match body.role.parse() {
        Ok(role) => role,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                "role must be observer, editor, or admin",
            )
                .into_response();
        }
    };
    let ttl_ms = match body.expires_in.as_deref() {
        Some(raw) => match crate::config::parse_duration_ms(raw) {
            Some(ms) => Some(ms),
            None => {
                return (StatusCode::BAD_REQUEST, "unparsable expiresIn").into_response();
            }
        },
        None => None,
    };

    let required = if role == Role::Admin && state.sessions.has_sessions() {
        Role::Admin
    } else if state.enforcer.require_sessions() {
        Role::Editor
    } else {
        Role::Observer
    };
    let info = match authorize(&state, &headers, AccessPolicy::require(required)) {
        Ok(info) => info,
        Err(resp) => return resp,
    };

    let issued = match state.sessions.create_session(CreateSessionOptions {
        role,
        ttl_ms,
        label: body.label,
        issued_by: info.session_id().map(String::from),
        ip: headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        user_agent: headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
    }) {
        Ok(issued) => issued,
        Err(e) => {
            tracing::error!("Failed to create session: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to create session")
                .into_response();
        }
    };

    state.audit.append(
        "session:create",
        Some(&issued.session.id),
        Some(issued.session.role),
        Some(json!({"issuedBy": info.session_id(), "via": info.via()})),
    );
    tracing::info!(session_id = %issued.session.id, role = %role, "Session created");

    (
        StatusCode::OK,
        axum::Json(json!({
            "session": issued.session,
            "token": issued.token,
            "tokenType": issued.token_type,
        })),
    )
        .into_response()
}

/// GET /session/current - the caller's session, or null (observer, optional).
async fn session_current(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let info = match authorize(&state, &headers, observer_policy(&state)) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    axum::Json(json!({
        "session": info.context.as_ref().map(|c| &c.session),
        "tokenType": info.context.as_ref().map(|c| c.token_type),
        "legacy": info.legacy,
        "requireSessions": state.enforcer.require_sessions(),
        "allowAnonSessions": state.config.allow_anon_sessions,
    }))
    .into_response()
}

/// GET /session/list - every live session (admin).
async fn session_list(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, admin_policy()) {
        return resp;
    }
    state.sessions.cleanup_expired();
    axum::Json(json!({"sessions": state.sessions.list_sessions()})).into_response()
}

#[derive(Deserialize)]
struct SessionRevokeBody {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    token: Option<String>,
}

/// POST /session/revoke - revoke by explicit session id or token (admin).
async fn session_revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, admin_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let body: SessionRevokeBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let target = match (&body.session_id, &body.token) {
        (Some(id), _) => Some(id.clone()),
        (None, Some(token)) => state
            .sessions
            .validate_token(token)
            .map(|ctx| ctx.session.id),
        (None, None) => {
            return (StatusCode::BAD_REQUEST, "sessionId or token required").into_response();
        }
    };
    let Some(target) = target else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    if !state.sessions.revoke_session(&target) {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    }
    state.audit.append(
        "session:revoke",
        info.session_id(),
        info.role(),
        Some(json!({"revoked": target, "via": info.via()})),
    );
    axum::Json(json!({"revoked": target})).into_response()
}

#[derive(Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
    format: Option<String>,
}

/// GET /audit/log?limit=&format=json|csv|plain - tail the audit file (admin).
async fn audit_log(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, admin_policy()) {
        return resp;
    }
    let entries = state.audit.tail(query.limit.unwrap_or(100));
    match query.format.as_deref().unwrap_or("json") {
        "csv" => {
            let mut out = String::from("time,action,sessionId,role\n");
            for entry in &entries {
                out.push_str(&format!(
                    "{},{},{},{}\n",
                    entry.time,
                    entry.action,
                    entry.session_id.as_deref().unwrap_or(""),
                    entry.role.map(|r| r.to_string()).unwrap_or_default(),
                ));
            }
            ([("content-type", "text/csv")], out).into_response()
        }
        "plain" => {
            let mut out = String::new();
            for entry in &entries {
                out.push_str(&format!(
                    "{} {} session={} role={}\n",
                    entry.time,
                    entry.action,
                    entry.session_id.as_deref().unwrap_or("-"),
                    entry.role.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
                ));
            }
            out.into_response()
        }
        _ => axum::Json(json!({"entries": entries})).into_response(),
    }
}

/// GET /remote-stores - the full remote map (observer).
async fn remote_stores(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, observer_policy(&state)) {
        return resp;
    }
    axum::Json(state.remote.entries()).into_response()
}

#[derive(Deserialize)]
struct RegisterBody {
    key: String,
    #[serde(default)]
    initial: Value,
}

/// Upsert into the store graph and remote mirror. Create/change frames
/// reach peers through the factory bridge, so exactly one frame is emitted
/// per mutation.
fn write_store(state: &AppState, key: &str, value: Value) {
    match state.factory.get(key) {
        Some(store) => store.set(value.clone()),
        None => {
            state.factory.create(key, value.clone());
        }
    }
    state.remote.set(key, value);
}

/// Change semantics: an existing store mutates through the primitive (the
/// bridge emits the frame); a key with no live store only updates the
/// remote mirror, with a `store:change` broadcast.
fn change_value(state: &AppState, key: &str, value: Value) {
    match state.factory.get(key) {
        Some(store) => store.set(value.clone()),
        None => state.hub.store_change(key, value.clone()),
    }
    state.remote.set(key, value);
}

/// POST /register - upsert a remote store (editor).
async fn register_store(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let body: RegisterBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    if body.key.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "key required").into_response();
    }

    write_store(&state, &body.key, body.initial.clone());
    let mut details = serde_json::Map::new();
    details.insert("key".into(), json!(body.key));
    state.hub.record_history("register", details);
    state.audit.append(
        "register",
        info.session_id(),
        info.role(),
        Some(json!({"key": body.key, "via": info.via()})),
    );
    axum::Json(json!({"ok": true, "key": body.key})).into_response()
}

#[derive(Deserialize)]
struct ChangeBody {
    key: String,
    value: Value,
}

/// POST /change - update a remote store's value (editor).
async fn change_store(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let body: ChangeBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    if body.key.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "key required").into_response();
    }

    change_value(&state, &body.key, body.value.clone());
    let mut details = serde_json::Map::new();
    details.insert("key".into(), json!(body.key));
    state.hub.record_history("change", details);
    state.audit.append(
        "change",
        info.session_id(),
        info.role(),
        Some(json!({"key": body.key, "via": info.via()})),
    );
    axum::Json(json!({"ok": true, "key": body.key})).into_response()
}

#[derive(Deserialize)]
struct ApplyPresetBody {
    name: String,
    #[serde(rename = "targetKey")]
    target_key: Option<String>,
    #[serde(rename = "installCss", default)]
    _install_css: Option<bool>,
}

fn builtin_presets() -> Vec<Preset> {
    vec![
        Preset {
            name: "counter".into(),
            value: json!({"count": 0}),
            css: None,
        },
        Preset {
            name: "todo-list".into(),
            value: json!({"items": [], "filter": "all"}),
            css: None,
        },
        Preset {
            name: "theme".into(),
            value: json!({"mode": "light", "accent": "#5865f2"}),
            css: Some(":root { color-scheme: light dark; }".into()),
        },
    ]
}

fn preset_catalog(state: &AppState) -> Vec<Preset> {
    let mut catalog = builtin_presets();
    catalog.extend(state.loader.presets());
    catalog
}

/// GET /presets - the preset catalog (observer).
async fn presets(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, observer_policy(&state)) {
        return resp;
    }
    axum::Json(json!({"presets": preset_catalog(&state)})).into_response()
}

/// POST /apply-preset - write a named preset's value to a store (editor).
async fn apply_preset(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let body: ApplyPresetBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let Some(preset) = preset_catalog(&state)
        .into_iter()
        .find(|p| p.name == body.name)
    else {
        return (StatusCode::NOT_FOUND, "unknown preset").into_response();
    };
    let target = body.target_key.unwrap_or_else(|| preset.name.clone());

    change_value(&state, &target, preset.value.clone());
    let mut details = serde_json::Map::new();
    details.insert("name".into(), json!(preset.name));
    details.insert("key".into(), json!(target));
    state.hub.record_history("apply-preset", details);
    state.audit.append(
        "apply-preset",
        info.session_id(),
        info.role(),
        Some(json!({"name": preset.name, "key": target, "via": info.via()})),
    );
    axum::Json(json!({"ok": true, "key": target})).into_response()
}

#[derive(Deserialize)]
struct DuplicateBody {
    #[serde(rename = "sourceKey")]
    source_key: String,
    #[serde(rename = "destKey")]
    dest_key: String,
}

/// POST /duplicate-store - deep-copy a store under a new key (editor).
async fn duplicate_store(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let body: DuplicateBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    // Live stores win; persisted-only keys can still be duplicated.
    let value = match state.factory.get(&body.source_key) {
        Some(source) => source.get(),
        None => match state.remote.get(&body.source_key) {
            Some(value) => value,
            None => {
                return (StatusCode::NOT_FOUND, "source store not found").into_response();
            }
        },
    };
    write_store(&state, &body.dest_key, value);
    state
        .hub
        .send(&fortistate_protocol::ServerMessage::StoreDuplicate {
            source_key: body.source_key.clone(),
            dest_key: body.dest_key.clone(),
        });

    let mut details = serde_json::Map::new();
    details.insert("sourceKey".into(), json!(body.source_key));
    details.insert("destKey".into(), json!(body.dest_key));
    state.hub.record_history("duplicate-store", details);
    state.audit.append(
        "duplicate-store",
        info.session_id(),
        info.role(),
        Some(json!({"sourceKey": body.source_key, "destKey": body.dest_key, "via": info.via()})),
    );
    axum::Json(json!({"ok": true})).into_response()
}

#[derive(Deserialize)]
struct SwapBody {
    #[serde(rename = "keyA")]
    key_a: String,
    #[serde(rename = "keyB")]
    key_b: String,
}

/// POST /swap-stores - exchange the values of two stores (editor).
async fn swap_stores(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let body: SwapBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let (Some(store_a), Some(store_b)) = (
        state.factory.get(&body.key_a),
        state.factory.get(&body.key_b),
    ) else {
        return (StatusCode::NOT_FOUND, "both stores must exist").into_response();
    };

    let value_a = store_a.get();
    let value_b = store_b.get();
    store_a.set(value_b.clone());
    store_b.set(value_a.clone());
    state.remote.set(&body.key_a, value_b);
    state.remote.set(&body.key_b, value_a);

    let mut details = serde_json::Map::new();
    details.insert("keyA".into(), json!(body.key_a));
    details.insert("keyB".into(), json!(body.key_b));
    state.hub.record_history("swap-stores", details);
    state.audit.append(
        "swap-stores",
        info.session_id(),
        info.role(),
        Some(json!({"keyA": body.key_a, "keyB": body.key_b, "via": info.via()})),
    );
    axum::Json(json!({"ok": true})).into_response()
}

/// POST /move-store - duplicate then remove the source (editor). This is the
/// only way to remove a remote-owned key.
async fn move_store(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let body: DuplicateBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let value = match state.factory.get(&body.source_key) {
        Some(source) => source.get(),
        None => match state.remote.get(&body.source_key) {
            Some(value) => value,
            None => {
                return (StatusCode::NOT_FOUND, "source store not found").into_response();
            }
        },
    };
    write_store(&state, &body.dest_key, value);
    state.factory.remove(&body.source_key);
    state.remote.delete(&body.source_key);
    state.hub.store_change(&body.source_key, Value::Null);

    let mut details = serde_json::Map::new();
    details.insert("sourceKey".into(), json!(body.source_key));
    details.insert("destKey".into(), json!(body.dest_key));
    state.hub.record_history("move-store", details);
    state.audit.append(
        "move-store",
        info.session_id(),
        info.role(),
        Some(json!({"sourceKey": body.source_key, "destKey": body.dest_key, "via": info.via()})),
    );
    axum::Json(json!({"ok": true})).into_response()
}

/// GET /history - the mutation-history ring buffer (observer).
async fn history(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, observer_policy(&state)) {
        return resp;
    }
    axum::Json(json!({"entries": state.hub.history()})).into_response()
}

/// GET /presence - connected peers (observer).
async fn presence(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, observer_policy(&state)) {
        return resp;
    }
    let users = state.presence.get_all();
    axum::Json(json!({"total": users.len(), "users": users})).into_response()
}

/// GET /telemetry/stream - SSE stream: buffered replay, then live entries,
/// with a comment keepalive every 30 seconds (observer).
async fn telemetry_stream(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, observer_policy(&state)) {
        return resp;
    }

    let replay = state.telemetry.replay();
    let live = BroadcastStream::new(state.telemetry.subscribe());
    let events = stream::iter(
        replay
            .into_iter()
            .map(|entry| Ok::<_, Infallible>(Event::default().data(&*entry))),
    )
    .chain(live.filter_map(|entry| async move {
        entry
            .ok()
            .map(|e| Ok::<_, Infallible>(Event::default().data(&*e)))
    }));

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(30))
                .text("ping"),
        )
        .into_response()
}

/// GET /api/universes - universe metadata listing (observer).
async fn universes_list(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, observer_policy(&state)) {
        return resp;
    }
    axum::Json(json!({"universes": state.universes.list()})).into_response()
}

/// GET /api/universes/:id/versions/:vid - one version document (observer).
async fn universe_get_version(
    State(state): State<Arc<AppState>>,
    Path((id, vid)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, observer_policy(&state)) {
        return resp;
    }
    match state.universes.get_version(&id, &vid) {
        Some(version) => axum::Json(json!({"version": version})).into_response(),
        None => (StatusCode::NOT_FOUND, "version not found").into_response(),
    }
}

/// POST /api/universes - create a universe (editor). A `canvas` field
/// selects the canvas form; otherwise the metadata-only form is expected.
async fn universes_create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let raw = match parse_json_body(&body) {
        Ok(raw) => raw,
        Err(resp) => return resp,
    };

    if raw.get("canvas").is_some() {
        let req: CanvasRequest = match serde_json::from_value(raw) {
            Ok(req) => req,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("invalid canvas payload: {e}"),
                )
                    .into_response();
            }
        };
        match state.universes.save_canvas(req, &caller_id(&info)) {
            Ok((universe, created)) => {
                state.audit.append(
                    "universe:create",
                    info.session_id(),
                    info.role(),
                    Some(json!({"id": universe.id, "created": created, "via": info.via()})),
                );
                let status = if created {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                };
                (status, axum::Json(json!({"universe": universe}))).into_response()
            }
            Err(e) => {
                tracing::error!("Failed to save universe: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to save universe").into_response()
            }
        }
    } else {
        let req: MetadataRequest = match serde_json::from_value(raw) {
            Ok(req) => req,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "id, label, and ownerId required")
                    .into_response();
            }
        };
        match state.universes.create_metadata(req) {
            Ok(universe) => {
                state.audit.append(
                    "universe:create",
                    info.session_id(),
                    info.role(),
                    Some(json!({"id": universe.id, "created": true, "via": info.via()})),
                );
                (StatusCode::CREATED, axum::Json(json!({"universe": universe}))).into_response()
            }
            Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        }
    }
}

/// POST /api/universes/:id/versions - append a version (editor).
async fn universe_add_version(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let req: VersionRequest = match parse_body(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };

    match state.universes.add_version(&id, req, &caller_id(&info)) {
        Ok(Some((universe, version))) => {
            state.audit.append(
                "universe:version",
                info.session_id(),
                info.role(),
                Some(json!({"id": universe.id, "versionId": version.id, "via": info.via()})),
            );
            (
                StatusCode::CREATED,
                axum::Json(json!({"universe": universe, "version": version})),
            )
                .into_response()
        }
        Ok(None) => (StatusCode::NOT_FOUND, "universe not found").into_response(),
        Err(e) => {
            tracing::error!("Failed to add version: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to add version").into_response()
        }
    }
}

/// DELETE /api/universes/:id - remove a universe and its versions (editor).
async fn universe_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    if !state.universes.delete(&id) {
        return (StatusCode::NOT_FOUND, "universe not found").into_response();
    }
    state.audit.append(
        "universe:delete",
        info.session_id(),
        info.role(),
        Some(json!({"id": id, "via": info.via()})),
    );
    axum::Json(json!({"deleted": id})).into_response()
}

/// POST /api/universes/:id/launch - queue a launch, 202 (editor).
async fn universe_launch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let info = match authorize(&state, &headers, editor_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let Some(ticket) = state.universes.launch(&id) else {
        return (StatusCode::NOT_FOUND, "universe not found").into_response();
    };
    state.audit.append(
        "universe:launch",
        info.session_id(),
        info.role(),
        Some(json!({"id": id, "launchId": ticket.launch_id, "via": info.via()})),
    );
    (StatusCode::ACCEPTED, axum::Json(json!(ticket))).into_response()
}

#[derive(Deserialize)]
struct SetTokenBody {
    token: String,
}

#[derive(Deserialize)]
struct SetTokenQuery {
    token: Option<String>,
}

fn store_legacy_token(state: &AppState, info: &AuthInfo, token: String) -> Response {
    if token.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "token required").into_response();
    }
    if let Err(e) = crate::config::save_legacy_token(&state.config.root, &token) {
        tracing::error!("Failed to persist legacy token: {e}");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to persist token").into_response();
    }
    state.enforcer.set_legacy_token(Some(token));
    state.audit.append(
        "set-token",
        info.session_id(),
        info.role(),
        Some(json!({"via": info.via()})),
    );
    axum::Json(json!({"ok": true})).into_response()
}

/// GET /set-token?token= - local-dev helper to set the legacy token (admin).
async fn set_token_via_query(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SetTokenQuery>,
    headers: HeaderMap,
) -> Response {
    let info = match authorize(&state, &headers, admin_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    match query.token {
        Some(token) => store_legacy_token(&state, &info, token),
        None => axum::Json(json!({"configured": state.enforcer.has_legacy_token()}))
            .into_response(),
    }
}

/// POST /set-token - body form of the legacy-token helper (admin).
async fn set_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let info = match authorize(&state, &headers, admin_policy()) {
        Ok(info) => info,
        Err(resp) => return resp,
    };
    let body: SetTokenBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    store_legacy_token(&state, &info, body.token)
}

#[derive(Deserialize)]
struct OpenSourceBody {
    path: String,
}

/// POST /open-source - open a file in a local editor (admin, gated by
/// FORTISTATE_INSPECTOR_ALLOW_OPEN). Editor spawning belongs to the CLI
/// front-end, so the endpoint validates and answers 501.
async fn open_source(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, admin_policy()) {
        return resp;
    }
    if !state.config.allow_open {
        return (StatusCode::FORBIDDEN, "open-in-editor is disabled").into_response();
    }
    let body: OpenSourceBody = match parse_body(&body) {
        Ok(body) => body,
        Err(resp) => return resp,
    };

    let root = state
        .config
        .root
        .canonicalize()
        .unwrap_or_else(|_| state.config.root.clone());
    let target = match root.join(&body.path).canonicalize() {
        Ok(target) if target.starts_with(&root) => target,
        _ => return (StatusCode::BAD_REQUEST, "path must resolve under root").into_response(),
    };
    let _ = target;
    (StatusCode::NOT_IMPLEMENTED, "no editor integration configured").into_response()
}

/// GET /debug - runtime counters (admin).
async fn debug_info(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorize(&state, &headers, admin_policy()) {
        return resp;
    }
    axum::Json(json!({
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "namespace": state.remote.namespace(),
        "remoteStorePath": state.remote.path().display().to_string(),
        "sessions": state.sessions.list_sessions().len(),
        "tokenMode": state.sessions.token_type(),
        "peers": state.presence.count(),
        "wsSubscribers": state.hub.peer_count(),
        "stores": state.factory.keys().len(),
        "remoteStores": state.remote.entries().len(),
        "requireSessions": state.enforcer.require_sessions(),
        "allowAnonSessions": state.config.allow_anon_sessions,
        "legacyToken": state.enforcer.has_legacy_token(),
        "telemetryBuffered": state.telemetry.buffered_len(),
    }))
    .into_response()
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fortistate_protocol::Session;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn post_json_with_token(uri: &str, token: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-fortistate-token", token)
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn get_with_token(uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-fortistate-token", token)
            .body(Body::empty())
            .unwrap()
    }

    async fn mint(app: &Router, role: &str) -> (Session, String) {
        let response = app
            .clone()
            .oneshot(post_json("/session/create", json!({"role": role})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        (
            serde_json::from_value(json["session"].clone()).unwrap(),
            json["token"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn index_serves_html() {
        let (state, _root) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn session_lifecycle_with_header_token() {
        let (state, _root) = test_state();
        let app = build_router(state);

        // S1: anonymous bootstrap when nothing demands auth.
        let response = app
            .clone()
            .oneshot(post_json(
                "/session/create",
                json!({"role": "editor", "expiresIn": "2h", "label": "ci"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["session"]["role"], "editor");
        assert_eq!(json["session"]["label"], "ci");
        assert_eq!(json["tokenType"], "opaque");
        let token = json["token"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(get_with_token("/session/current", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["session"]["role"], "editor");

        // Wrong token: still 200 but no session resolves.
        let response = app
            .clone()
            .oneshot(get_with_token("/session/current", "bogus"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["session"].is_null());
    }

    #[tokio::test]
    async fn sessions_survive_restart_with_same_secret() {
        let (state, root) = test_state();
        let app = build_router(state);
        let (_, token) = mint(&app, "editor").await;

        // Same root, same secret: token still validates.
        let config = InspectorConfig {
            root: root.path().to_path_buf(),
            session_secret: Some("integration-test-secret".to_string()),
            ..InspectorConfig::default()
        };
        let app2 = build_router(build_state(config));
        let response = app2
            .clone()
            .oneshot(get_with_token("/session/current", &token))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["session"]["role"], "editor");

        // Different secret: 200, session null.
        let config = InspectorConfig {
            root: root.path().to_path_buf(),
            session_secret: Some("another-secret-entirely".to_string()),
            ..InspectorConfig::default()
        };
        let app3 = build_router(build_state(config));
        let response = app3
            .oneshot(get_with_token("/session/current", &token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["session"].is_null());
    }

    #[tokio::test]
    async fn role_gate_on_change_endpoint() {
        let (state, _root) = test_state_with(|c| c.require_sessions = true);
        let app = build_router(Arc::clone(&state));

        // No token: 401.
        let response = app
            .clone()
            .oneshot(post_json("/change", json!({"key": "a", "value": 1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Bootstrap an admin to mint the others (sessions-required mode
        // demands editor for session creation once configured).
        let issued = state
            .sessions
            .create_session(crate::session::CreateSessionOptions {
                role: Role::Admin,
                ..Default::default()
            })
            .unwrap();
        let admin_token = issued.token;

        let response = app
            .clone()
            .oneshot(post_json_with_token(
                "/session/create",
                &admin_token,
                json!({"role": "observer"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let observer_token = body_json(response).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        // Observer: 403.
        let response = app
            .clone()
            .oneshot(post_json_with_token(
                "/change",
                &observer_token,
                json!({"key": "a", "value": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Editor: 200 plus a broadcast frame.
        let response = app
            .clone()
            .oneshot(post_json_with_token(
                "/session/create",
                &admin_token,
                json!({"role": "editor"}),
            ))
            .await
            .unwrap();
        let editor_token = body_json(response).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        let mut rx = state.hub.subscribe();
        let response = app
            .clone()
            .oneshot(post_json_with_token(
                "/change",
                &editor_token,
                json!({"key": "a", "value": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "store:change");
        assert_eq!(frame["key"], "a");
        assert_eq!(frame["value"], 1);
    }

    #[tokio::test]
    async fn register_persists_to_namespaced_file() {
        let (state, root) = test_state();
        let app = build_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(post_json(
                "/register",
                json!({"key": "x", "initial": {"n": 1}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let file = root
            .path()
            .join(".fortistate")
            .join(format!("remote-stores-{}.json", state.remote.namespace()));
        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(on_disk["x"]["n"], 1);

        // A fresh server over the same root re-emits the key in snapshots.
        let config = InspectorConfig {
            root: root.path().to_path_buf(),
            session_secret: Some("integration-test-secret".to_string()),
            ..InspectorConfig::default()
        };
        let state2 = build_state(config);
        assert_eq!(state2.remote.get("x"), Some(json!({"n": 1})));
    }

    #[tokio::test]
    async fn oversize_body_yields_413() {
        let (state, _root) = test_state();
        let app = build_router(state);

        let huge = "x".repeat(MAX_BODY_BYTES + 1);
        let response = app
            .oneshot(post_json("/change", json!({"key": "a", "value": huge})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn invalid_json_yields_400_and_empty_body_is_object() {
        let (state, _root) = test_state();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/change")
                    .header("content-type", "application/json")
                    .body(Body::from("{ not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Empty body parses as {}, which then fails shape validation, not
        // JSON parsing.
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/change")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn audit_matches_each_accepted_mutation() {
        let (state, _root) = test_state();
        let app = build_router(Arc::clone(&state));

        let (session, token) = mint(&app, "editor").await;
        let response = app
            .clone()
            .oneshot(post_json_with_token(
                "/register",
                &token,
                json!({"key": "k", "initial": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let entries = state.audit.tail(10);
        let registers: Vec<_> = entries.iter().filter(|e| e.action == "register").collect();
        assert_eq!(registers.len(), 1);
        assert_eq!(registers[0].session_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(registers[0].role, Some(Role::Editor));

        // The session mint itself was audited exactly once too.
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.action == "session:create")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn session_list_and_revoke_require_admin() {
        let (state, _root) = test_state();
        let app = build_router(Arc::clone(&state));

        let (_, editor_token) = mint(&app, "editor").await;
        let response = app
            .clone()
            .oneshot(get_with_token("/session/list", &editor_token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let issued = state
            .sessions
            .create_session(crate::session::CreateSessionOptions {
                role: Role::Admin,
                ..Default::default()
            })
            .unwrap();
        let response = app
            .clone()
            .oneshot(get_with_token("/session/list", &issued.token))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["sessions"].as_array().unwrap().len() >= 2);

        // Revoke the editor session by token.
        let response = app
            .clone()
            .oneshot(post_json_with_token(
                "/session/revoke",
                &issued.token,
                json!({"token": editor_token}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(get_with_token("/session/current", &editor_token))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert!(json["session"].is_null());
    }

    #[tokio::test]
    async fn duplicate_swap_move_operate_on_stores() {
        let (state, _root) = test_state();
        let app = build_router(Arc::clone(&state));

        state.factory.create("a", json!(1));
        state.factory.create("b", json!(2));

        let response = app
            .clone()
            .oneshot(post_json(
                "/duplicate-store",
                json!({"sourceKey": "a", "destKey": "a-copy"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.factory.get("a-copy").unwrap().get(), json!(1));

        let response = app
            .clone()
            .oneshot(post_json(
                "/swap-stores",
                json!({"keyA": "a", "keyB": "b"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.factory.get("a").unwrap().get(), json!(2));
        assert_eq!(state.factory.get("b").unwrap().get(), json!(1));

        let response = app
            .clone()
            .oneshot(post_json(
                "/move-store",
                json!({"sourceKey": "a", "destKey": "moved"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.factory.has("a"));
        assert!(state.remote.get("a").is_none());
        assert_eq!(state.factory.get("moved").unwrap().get(), json!(2));

        let response = app
            .oneshot(post_json(
                "/duplicate-store",
                json!({"sourceKey": "missing", "destKey": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn history_records_mutations() {
        let (state, _root) = test_state();
        let app = build_router(Arc::clone(&state));

        app.clone()
            .oneshot(post_json("/register", json!({"key": "k", "initial": 0})))
            .await
            .unwrap();
        app.clone()
            .oneshot(post_json("/change", json!({"key": "k", "value": 5})))
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/history").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        let entries = json["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["action"], "register");
        assert_eq!(entries[1]["action"], "change");
        assert_eq!(entries[1]["key"], "k");
    }

    #[tokio::test]
    async fn apply_preset_writes_catalog_value() {
        let (state, _root) = test_state();
        let app = build_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(post_json(
                "/apply-preset",
                json!({"name": "counter", "targetKey": "my-counter"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.remote.get("my-counter"), Some(json!({"count": 0})));

        let response = app
            .oneshot(post_json("/apply-preset", json!({"name": "nope"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn universe_create_flow_matches_slug_rules() {
        let (state, _root) = test_state();
        let app = build_router(state);

        let body = json!({
            "label": "Alpha",
            "canvas": {"nodes": [], "edges": [], "viewport": {"x": 0, "y": 0, "zoom": 1}},
            "bindings": [{"providerId": "slack"}],
        });
        let response = app.clone().oneshot(post_json("/api/universes", body.clone())).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["universe"]["id"], "alpha");
        assert!(json["universe"]["activeVersionId"].is_string());
        assert_eq!(json["universe"]["integrationCounts"]["slack"], 1);

        let response = app.clone().oneshot(post_json("/api/universes", body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["universe"]["id"], "alpha-1");

        // Canvas without viewport: 400.
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/universes",
                json!({"label": "Bad", "canvas": {"nodes": [], "edges": []}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Launch: 202 queued.
        let response = app
            .clone()
            .oneshot(post_json("/api/universes/alpha/launch", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "queued");
        assert!(json["launchId"].as_str().unwrap().starts_with("launch-"));

        // Version read + delete.
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/universes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        let vid = json["universes"][0]["activeVersionId"].as_str().unwrap().to_string();
        let id = json["universes"][0]["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/universes/{id}/versions/{vid}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/universes/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_preflight_answers_204_with_headers() {
        let (state, _root) = test_state();
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/change")
                    .header("origin", "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            "http://localhost:5173"
        );
        assert_eq!(
            headers.get("access-control-allow-credentials").unwrap(),
            "true"
        );
        assert_eq!(
            headers.get("access-control-allow-methods").unwrap(),
            "GET, POST, OPTIONS"
        );
    }

    #[tokio::test]
    async fn cors_wildcard_when_configured() {
        let (state, _root) = test_state_with(|c| c.allow_origin = Some(AllowOrigin::Any));
        let app = build_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/history")
                    .header("origin", "http://anywhere.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
        assert!(response
            .headers()
            .get("access-control-allow-credentials")
            .is_none());
    }

    #[tokio::test]
    async fn cors_allowlist_echoes_only_matches() {
        let (state, _root) = test_state_with(|c| {
            c.allow_origin = Some(AllowOrigin::List(vec!["http://ok.test".into()]))
        });
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/history")
                    .header("origin", "http://ok.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "http://ok.test"
        );

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/history")
                    .header("origin", "http://evil.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn admin_helpers_gate_on_allow_open() {
        let (state, _root) = test_state();
        let app = build_router(state);

        let response = app
            .oneshot(post_json("/open-source", json!({"path": "src/main.rs"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let (state, _root2) = test_state_with(|c| c.allow_open = true);
        let app = build_router(state);
        let response = app
            .clone()
            .oneshot(post_json("/open-source", json!({"path": "../escape"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn set_token_installs_legacy_token() {
        let (state, root) = test_state();
        let app = build_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(post_json("/set-token", json!({"token": "shared-secret"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.enforcer.has_legacy_token());
        assert!(root.path().join(crate::config::LEGACY_TOKEN_FILE).exists());

        // The legacy token now authorizes mutations.
        let response = app
            .clone()
            .oneshot(post_json_with_token(
                "/change",
                "shared-secret",
                json!({"key": "via-legacy", "value": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // And anonymous mutations are now denied.
        let response = app
            .oneshot(post_json("/change", json!({"key": "x", "value": 1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn debug_endpoint_reports_counters() {
        let (state, _root) = test_state();
        let app = build_router(Arc::clone(&state));
        state.factory.create("s1", json!(0));

        let response = app
            .oneshot(Request::builder().uri("/debug").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["stores"], 1);
        assert_eq!(json["peers"], 0);
        assert_eq!(json["namespace"], state.remote.namespace());
    }

    #[tokio::test]
    async fn audit_log_formats() {
        let (state, _root) = test_state();
        let app = build_router(Arc::clone(&state));
        state.audit.append("seed", None, Some(Role::Editor), None);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/audit/log").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["entries"][0]["action"], "seed");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/audit/log?format=csv&limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/csv"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("time,action,sessionId,role\n"));
        assert!(text.contains("seed"));
    }

    #[tokio::test]
    async fn presence_endpoint_reports_users() {
        let (state, _root) = test_state();
        let app = build_router(Arc::clone(&state));
        state.presence.add(uuid::Uuid::new_v4(), None, None, &state.hub);

        let response = app
            .oneshot(Request::builder().uri("/presence").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["total"], 1);
        assert_eq!(json["users"][0]["displayName"], "Guest 1");
    }
}
