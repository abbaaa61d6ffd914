use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use fortistate_protocol::{ClientMessage, Role, ServerMessage};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth::{AccessPolicy, AuthInfo};
use crate::web::AppState;

/// Query parameters accepted on the WebSocket upgrade.
#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
    #[serde(rename = "sessionToken")]
    session_token: Option<String>,
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
}

impl WsQuery {
    fn token(&self) -> Option<&str> {
        self.token
            .as_deref()
            .or(self.session_token.as_deref())
            .or(self.access_token.as_deref())
    }
}

/// GET /ws - upgrade, authorize as observer, enforce origin policy, then
/// run the peer loop. Denials complete the upgrade and close with 4401
/// (unauthorized) or 4403 (forbidden/origin).
pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let optional = !(state.enforcer.require_sessions() || state.sessions.has_sessions())
        || state.config.allow_anon_sessions;
    let policy = AccessPolicy {
        required: Role::Observer,
        optional,
        allow_legacy: true,
    };

    let info = state.enforcer.resolve(&headers, query.token());
    if let Err(denial) = state.enforcer.evaluate(&info, policy) {
        tracing::debug!(reason = denial.reason, "WebSocket upgrade denied");
        let code = denial.ws_close_code();
        let reason = denial.reason;
        return ws.on_upgrade(move |socket| close_with(socket, code, reason));
    }

    if let Some(allow) = &state.config.allow_origin {
        let origin = headers
            .get("origin")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let rejected = if origin.is_empty() {
            state.config.allow_origin_strict
        } else {
            !allow.matches(origin)
        };
        if rejected {
            tracing::debug!(origin, "WebSocket origin rejected");
            return ws.on_upgrade(move |socket| {
                close_with(socket, fortistate_protocol::WS_CLOSE_FORBIDDEN, "origin not allowed")
            });
        }
    }

    let remote_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string());

    ws.on_upgrade(move |socket| handle_socket(state, socket, info, remote_address))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Live stores overlaid on the persisted remote map; live values win.
fn snapshot_frame(state: &AppState) -> ServerMessage {
    let mut stores: BTreeMap<String, serde_json::Value> = state.remote.entries();
    stores.extend(state.factory.snapshot());
    ServerMessage::Snapshot { stores }
}

async fn send_frame(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to serialize frame: {e}");
            true
        }
    }
}

async fn handle_socket(
    state: Arc<AppState>,
    mut socket: WebSocket,
    info: AuthInfo,
    remote_address: Option<String>,
) {
    let conn = Uuid::new_v4();
    state.audit.append(
        "ws:connect",
        info.session_id(),
        info.role(),
        Some(json!({"success": true, "via": info.via()})),
    );

    // Join is broadcast before this peer subscribes, so it reaches everyone
    // else but not the peer itself; the snapshot below is computed after the
    // subscription so no store frame can fall into the gap.
    state
        .presence
        .add(conn, info.context.as_ref(), remote_address, &state.hub);
    let mut frames = state.hub.subscribe();

    let seeded = send_frame(&mut socket, &ServerMessage::Hello { version: 1 }).await
        && send_frame(&mut socket, &snapshot_frame(&state)).await
        && send_frame(
            &mut socket,
            &ServerMessage::PresenceInit {
                users: state.presence.get_all(),
            },
        )
        .await;
    if !seeded {
        finish(&state, conn, info, None).await;
        return;
    }

    tracing::debug!(%conn, "WebSocket peer connected");
    let mut close_info: Option<(u16, String)> = None;

    // Register the shutdown waiter before the loop; notify_waiters only
    // reaches futures that already exist. The flag covers the window before
    // registration.
    let shutdown = state.shutdown.notified();
    tokio::pin!(shutdown);
    if state.shutting_down.load(std::sync::atomic::Ordering::SeqCst) {
        finish(&state, conn, info, None).await;
        return;
    }

    loop {
        tokio::select! {
            () = &mut shutdown => {
                // Forced termination on shutdown; no graceful close handshake.
                break;
            }
            frame = frames.recv() => {
                match frame {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(%conn, skipped = n, "Peer lagged, frames dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "req:snapshot" {
                            if !send_frame(&mut socket, &snapshot_frame(&state)).await {
                                break;
                            }
                            continue;
                        }
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::PresenceUpdate { active_store, cursor_path }) => {
                                state.presence.update(conn, active_store, cursor_path, &state.hub);
                            }
                            Ok(ClientMessage::PresencePing) => {
                                state.presence.touch(conn);
                            }
                            // Unknown and invalid payloads are silently ignored.
                            Err(_) => {}
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        close_info = frame.map(|f| (f.code, f.reason.to_string()));
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(%conn, "WebSocket error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    finish(&state, conn, info, close_info).await;
}

async fn finish(
    state: &Arc<AppState>,
    conn: Uuid,
    info: AuthInfo,
    close_info: Option<(u16, String)>,
) {
    state.presence.remove(conn, &state.hub);
    let details = match &close_info {
        Some((code, reason)) => json!({"code": code, "reason": reason}),
        None => json!({}),
    };
    state
        .audit
        .append("ws:disconnect", info.session_id(), info.role(), Some(details));
    tracing::debug!(%conn, "WebSocket peer disconnected");
}
