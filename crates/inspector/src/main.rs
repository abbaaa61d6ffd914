mod audit;
mod auth;
mod broadcast;
mod config;
mod presence;
mod reload;
mod remote;
mod session;
mod telemetry;
mod universe;
mod web;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

fn parse_args() -> (PathBuf, Option<u16>) {
    let args: Vec<String> = std::env::args().collect();
    let mut root = PathBuf::from(".");
    let mut port_override = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--root" | "-r" => {
                if i + 1 < args.len() {
                    root = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    port_override = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    (root, port_override)
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_level = if std::env::var("FORTISTATE_DEBUG").as_deref() == Ok("1") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let (root, port_override) = parse_args();
    // Canonicalize so namespace derivation and watcher path matching see the
    // same absolute paths as filesystem events.
    let root = root
        .canonicalize()
        .with_context(|| format!("invalid root directory {}", root.display()))?;
    let config = config::load_config(root, port_override);
    let port = config.port;

    let state = web::build_state(config);

    // Initial plugin/preset load, then keep watching for edits.
    reload::refresh(&state, "startup");
    reload::spawn_watcher(Arc::clone(&state));

    state.telemetry.publish(&serde_json::json!({
        "event": "inspector:started",
        "namespace": state.remote.namespace(),
        "stores": state.factory.keys().len(),
    }));

    // Background task: sweep expired sessions and long-idle presence rows.
    let sweeper_state = Arc::clone(&state);
    tokio::spawn(async move {
        const MAX_PRESENCE_IDLE_MS: u64 = 60 * 60 * 1000;
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            if sweeper_state
                .shutting_down
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                break;
            }
            let removed = sweeper_state.sessions.cleanup_expired();
            if removed > 0 {
                tracing::info!(removed, "Swept expired sessions");
            }
            let idle = sweeper_state
                .presence
                .remove_idle_users(MAX_PRESENCE_IDLE_MS, &sweeper_state.hub);
            if idle > 0 {
                tracing::info!(idle, "Removed idle presence entries");
            }
        }
    });

    let app = web::build_router(Arc::clone(&state))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        path = %request.uri().path(),
                        request_id = %request_id,
                    )
                })
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        tracing::event!(
                            Level::DEBUG,
                            status = %response.status().as_u16(),
                            duration_ms = %latency.as_millis(),
                            "completed"
                        );
                    },
                ),
        )
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let bind_addr: SocketAddr = format!("127.0.0.1:{port}")
        .parse()
        .context("Invalid bind address")?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("===========================================");
    tracing::info!("  Fortistate Inspector");
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("  Root: {}", state.config.root.display());
    tracing::info!("  Namespace: {}", state.remote.namespace());
    tracing::info!("===========================================");

    let shutdown_state = Arc::clone(&state);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down");
                }
            }
            // Stop the watcher, detach store subscriptions, and kick every
            // WebSocket peer so the graceful shutdown can complete.
            shutdown_state.begin_shutdown();
        })
        .await
        .context("server error")?;

    tracing::info!("Inspector shut down cleanly");
    Ok(())
}
