//! Subscriber WebSocket sessions.
//!
//! # Lifecycle
//! 1. Client connects and sends `{api_key}` within 10 s
//! 2. Registry validates the key (active flag + unexpired subscription)
//! 3. Server replies `auth_success` with the full subscriber snapshot and
//!    writes a `connected` audit row
//! 4. Inbound frames are commands; outbound frames interleave command
//!    replies with token deliveries, in the order the dispatcher produced
//!    them
//! 5. Disconnect writes a `disconnected` audit row and drops the session
//!
//! Bad JSON and unknown commands answer with an `error` frame (carrying the
//! request id when one can be recovered) and keep the connection open; only
//! auth failure closes it.

use axum::{
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use dt_protocol::{AuthFrame, ClientCommand, ServerFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::commands::{SessionCtx, handle_command};
use crate::state::{AppState, FilterSnapshot, SessionHandle};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound frames queued per session before sends start failing.
const OUTBOUND_CAPACITY: usize = 64;

pub async fn ws_subscriber_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_subscriber_socket(socket, state, addr))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize outbound frame");
            true
        }
    }
}

async fn send_error(socket: &mut WebSocket, request_id: Option<String>, message: &str) {
    let _ = send_frame(
        socket,
        &ServerFrame::Error {
            request_id,
            message: message.to_owned(),
        },
    )
    .await;
}

async fn handle_subscriber_socket(mut socket: WebSocket, state: AppState, addr: SocketAddr) {
    // -- auth handshake --
    let Some(auth) = recv_auth_frame(&mut socket).await else {
        send_error(&mut socket, None, "Authentication timeout").await;
        return;
    };
    let auth = match auth {
        Ok(frame) => frame,
        Err(message) => {
            send_error(&mut socket, None, &message).await;
            return;
        }
    };

    match state.db.is_active(&auth.api_key) {
        Ok(true) => {}
        Ok(false) => {
            send_error(&mut socket, None, "Invalid or expired API key").await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "registry lookup failed during auth");
            send_error(&mut socket, None, "Registry error").await;
            return;
        }
    }
    let user = match state.db.get_user_by_api_key(&auth.api_key) {
        Ok(Some(user)) => user,
        _ => {
            send_error(&mut socket, None, "Invalid or expired API key").await;
            return;
        }
    };

    let (settings, whitelist, blacklist) = match (
        state.db.get_settings(user.id),
        state.db.get_whitelist(user.id),
        state.db.get_blacklist(user.id),
    ) {
        (Ok(s), Ok(w), Ok(b)) => (s, w, b),
        _ => {
            send_error(&mut socket, None, "Registry error").await;
            return;
        }
    };

    if !send_frame(
        &mut socket,
        &ServerFrame::AuthSuccess {
            username: user.username.clone(),
            settings: settings.clone(),
            whitelist: whitelist.clone(),
            blacklist: blacklist.clone(),
        },
    )
    .await
    {
        return;
    }

    if let Err(e) = state
        .db
        .log_connection(user.id, "connected", Some(&addr.ip().to_string()))
    {
        warn!(error = %e, "failed to write connected audit row");
    }

    // -- register with the dispatcher --
    let session_id = Uuid::new_v4();
    let snapshot = Arc::new(RwLock::new(FilterSnapshot {
        settings,
        whitelist: whitelist.into_iter().map(|e| e.dev_wallet).collect(),
        blacklist: blacklist.into_iter().map(|e| e.dev_wallet).collect(),
    }));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_CAPACITY);
    state
        .register_session(
            session_id,
            SessionHandle {
                user_id: user.id,
                username: user.username.clone(),
                snapshot: Arc::clone(&snapshot),
                outbound: outbound_tx,
            },
        )
        .await;
    info!(username = %user.username, %addr, "subscriber connected");

    let ctx = SessionCtx {
        user_id: user.id,
        username: user.username.clone(),
        snapshot,
    };

    // -- session loop --
    loop {
        tokio::select! {
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let reply = dispatch_text(&state, &ctx, &text).await;
                    if !send_frame(&mut socket, &reply).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = socket.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(username = %user.username, error = %e, "WS error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            maybe = outbound_rx.recv() => match maybe {
                Some(frame) => {
                    if !send_frame(&mut socket, &frame).await {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // -- cleanup --
    state.unregister_session(&session_id).await;
    if let Err(e) = state.db.log_connection(user.id, "disconnected", None) {
        warn!(error = %e, "failed to write disconnected audit row");
    }
    info!(username = %user.username, "subscriber disconnected");
}

/// Wait for the auth frame.  `None` = timeout or transport loss;
/// `Some(Err)` = a frame arrived but was not a usable auth frame.
async fn recv_auth_frame(socket: &mut WebSocket) -> Option<Result<AuthFrame, String>> {
    match tokio::time::timeout(AUTH_TIMEOUT, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthFrame>(&text) {
            Ok(frame) if !frame.api_key.is_empty() => Some(Ok(frame)),
            Ok(_) => Some(Err("API key required".to_owned())),
            Err(_) => Some(Err("API key required".to_owned())),
        },
        Ok(_) => Some(Err("API key required".to_owned())),
        Err(_) => None,
    }
}

/// Parse and run one inbound command frame.
///
/// An unparseable frame still answers with the request id when the raw JSON
/// carries one, so clients can correlate the failure.
async fn dispatch_text(state: &AppState, ctx: &SessionCtx, text: &str) -> ServerFrame {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(cmd) => handle_command(state, ctx, cmd).await,
        Err(_) => {
            let raw: Option<serde_json::Value> = serde_json::from_str(text).ok();
            let request_id = raw
                .as_ref()
                .and_then(|v| v.get("request_id"))
                .and_then(|v| v.as_str())
                .map(ToOwned::to_owned);
            let command = raw
                .as_ref()
                .and_then(|v| v.get("command"))
                .and_then(|v| v.as_str())
                .unwrap_or("<invalid JSON>");
            warn!(username = %ctx.username, command, "unknown or malformed command");
            ServerFrame::Error {
                request_id,
                message: format!("Unknown command: {command}"),
            }
        }
    }
}
