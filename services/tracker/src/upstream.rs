//! Upstream streaming session.
//!
//! Maintains exactly one authenticated WebSocket connection to the token
//! venue and publishes parsed `RawToken` events to a broadcast sink in
//! arrival order.
//!
//! # Protocol
//! 1. Refresh the access credential if it is expired
//! 2. Connect to `ws_url` with the credential pair as a Cookie header
//! 3. Send the room-join frame `{"action": "join", "room": "new_pairs"}`
//! 4. Parse `{room, content, created_at}` frames into `RawToken`s
//! 5. Ping every 20 s; a pong missing for 10 s tears the connection down
//!
//! Transport and auth failures are never fatal: the session backs off
//! (1 s → 3 s, capped at 5 s) and reconnects until `stop` is called.

use dt_protocol::RawToken;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthSession};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Config and state
// ---------------------------------------------------------------------------

/// Configuration for the upstream WS session.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket URL of the venue's streaming cluster.
    pub ws_url: String,
    /// Server-side room to join after the stream opens.
    pub room: String,
    /// Capacity of the raw-event sink; on overflow the oldest undelivered
    /// event is dropped.
    pub queue_capacity: usize,
}

/// Observable session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Idle,
    Authenticating,
    Connected,
    Streaming,
    Reconnecting,
    Stopped,
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("connect: {0}")]
    Connect(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("no pong within {PONG_TIMEOUT:?}")]
    PingTimeout,
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

enum SessionEnd {
    Stopped,
    Disconnected,
}

/// Handle to the running session task.
pub struct UpstreamSession {
    handle: tokio::task::JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<UpstreamState>,
}

impl UpstreamSession {
    /// Spawn the session task.  Returns the handle and a receiver on the
    /// raw-event sink; further receivers come from [`Self::subscribe`]-style
    /// resubscription on the returned receiver.
    pub fn start(
        cfg: UpstreamConfig,
        auth: Arc<AuthSession>,
    ) -> (Self, broadcast::Receiver<RawToken>) {
        let (raw_tx, raw_rx) = broadcast::channel(cfg.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(UpstreamState::Idle);
        let handle = tokio::spawn(run_session(cfg, auth, raw_tx, shutdown_rx, state_tx));
        (
            UpstreamSession {
                handle,
                shutdown: shutdown_tx,
                state: state_rx,
            },
            raw_rx,
        )
    }

    /// A watch receiver over the session lifecycle state.
    pub fn state(&self) -> watch::Receiver<UpstreamState> {
        self.state.clone()
    }

    /// Signal shutdown and wait for the session task to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

// ---------------------------------------------------------------------------
// Session loop
// ---------------------------------------------------------------------------

async fn run_session(
    cfg: UpstreamConfig,
    auth: Arc<AuthSession>,
    raw_tx: broadcast::Sender<RawToken>,
    mut shutdown: watch::Receiver<bool>,
    state_tx: watch::Sender<UpstreamState>,
) {
    let mut backoff = RECONNECT_INITIAL;
    loop {
        if *shutdown.borrow() {
            break;
        }
        state_tx.send_replace(UpstreamState::Authenticating);
        match connect_and_stream(&cfg, &auth, &raw_tx, &mut shutdown, &state_tx).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Disconnected) => {
                warn!("upstream connection closed, reconnecting");
            }
            Err(e) => {
                warn!(error = %e, "upstream session error, reconnecting");
            }
        }
        state_tx.send_replace(UpstreamState::Reconnecting);
        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            // A dropped shutdown handle means the owner is gone; stop too.
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        backoff = next_backoff(backoff);
    }
    state_tx.send_replace(UpstreamState::Stopped);
    info!("upstream session stopped");
}

async fn connect_and_stream(
    cfg: &UpstreamConfig,
    auth: &AuthSession,
    raw_tx: &broadcast::Sender<RawToken>,
    shutdown: &mut watch::Receiver<bool>,
    state_tx: &watch::Sender<UpstreamState>,
) -> Result<SessionEnd, UpstreamError> {
    let pair = auth.ensure_fresh().await?;
    let request = build_ws_request(&cfg.ws_url, &pair.cookie_header(), auth.origin())?;
    let (mut ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| UpstreamError::Connect(e.to_string()))?;
    state_tx.send_replace(UpstreamState::Connected);

    let join = serde_json::json!({"action": "join", "room": cfg.room});
    ws.send(Message::Text(join.to_string().into()))
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;
    state_tx.send_replace(UpstreamState::Streaming);
    info!(room = %cfg.room, "upstream streaming");

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    loop {
        let deadline = pong_deadline;
        let pong_timeout = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = ws.close(None).await;
                    return Ok(SessionEnd::Stopped);
                }
            }
            () = pong_timeout => return Err(UpstreamError::PingTimeout),
            _ = ping_interval.tick() => {
                ws.send(Message::Ping(Vec::new().into()))
                    .await
                    .map_err(|e| UpstreamError::Transport(e.to_string()))?;
                if pong_deadline.is_none() {
                    pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                }
            }
            msg = ws.next() => match msg {
                None => return Ok(SessionEnd::Disconnected),
                Some(Err(e)) => return Err(UpstreamError::Transport(e.to_string())),
                Some(Ok(Message::Text(text))) => {
                    if let Some(token) = parse_raw_frame(&text, &cfg.room) {
                        // Zero subscribers is fine; the engine attaches later.
                        let _ = raw_tx.send(token);
                    }
                }
                Some(Ok(Message::Pong(_))) => pong_deadline = None,
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) => return Ok(SessionEnd::Disconnected),
                Some(Ok(_)) => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct UpstreamFrame {
    #[serde(default)]
    room: String,
    content: Option<RawToken>,
    #[serde(default)]
    created_at: String,
}

/// Parse an upstream text frame into a `RawToken`.
///
/// Frames for other rooms, frames without content, frames without a token
/// address, and unparseable frames all yield `None` (logged and dropped).
fn parse_raw_frame(text: &str, room: &str) -> Option<RawToken> {
    let frame: UpstreamFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(error = %e, "dropping unparseable upstream frame");
            return None;
        }
    };
    if frame.room != room {
        return None;
    }
    let mut token = frame.content?;
    if token.token_address.is_empty() {
        return None;
    }
    if !frame.created_at.is_empty() {
        token.created_at = frame.created_at;
    }
    Some(token)
}

fn next_backoff(current: Duration) -> Duration {
    match current.as_secs() {
        0 | 1 => Duration::from_secs(3),
        _ => Duration::from_secs(5),
    }
}

fn build_ws_request(
    url: &str,
    cookie: &str,
    origin: Option<&str>,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, UpstreamError> {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| UpstreamError::Connect(format!("invalid URL '{}': {}", url, e)))?;

    let headers = request.headers_mut();
    headers.insert(
        "Cookie",
        cookie
            .parse()
            .map_err(|_| UpstreamError::Connect("invalid cookie header".to_owned()))?,
    );
    if let Some(origin) = origin {
        headers.insert(
            "Origin",
            origin
                .parse()
                .map_err(|_| UpstreamError::Connect("invalid origin header".to_owned()))?,
        );
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_raw_frame_extracts_token_and_overrides_created_at() {
        let text = r#"{
            "room": "new_pairs",
            "created_at": "2026-07-30T12:00:00Z",
            "content": {
                "token_address": "So1Token",
                "pair_address": "So1Pair",
                "token_name": "Example",
                "token_ticker": "EXM",
                "deployer_address": "So1Dev",
                "protocol": "pump v1",
                "twitter": "https://x.com/example"
            }
        }"#;
        let token = parse_raw_frame(text, "new_pairs").expect("frame parses");
        assert_eq!(token.token_address, "So1Token");
        assert_eq!(token.created_at, "2026-07-30T12:00:00Z");
        assert_eq!(token.twitter.as_deref(), Some("https://x.com/example"));
    }

    #[test]
    fn parse_raw_frame_ignores_other_rooms_and_bad_frames() {
        let other_room = r#"{"room": "trades", "content": {"token_address": "x"}}"#;
        assert!(parse_raw_frame(other_room, "new_pairs").is_none());

        assert!(parse_raw_frame("{not json", "new_pairs").is_none());
        assert!(parse_raw_frame(r#"{"room": "new_pairs"}"#, "new_pairs").is_none());

        let no_address = r#"{"room": "new_pairs", "content": {"token_name": "x"}}"#;
        assert!(parse_raw_frame(no_address, "new_pairs").is_none());
    }

    #[test]
    fn backoff_steps_one_three_five_and_caps() {
        let first = RECONNECT_INITIAL;
        let second = next_backoff(first);
        let third = next_backoff(second);
        let fourth = next_backoff(third);
        assert_eq!(first, Duration::from_secs(1));
        assert_eq!(second, Duration::from_secs(3));
        assert_eq!(third, Duration::from_secs(5));
        assert_eq!(fourth, Duration::from_secs(5));
    }

    #[test]
    fn ws_request_carries_cookie_and_origin() {
        let request = build_ws_request(
            "wss://cluster9.example.trade/",
            "auth-access-token=a; auth-refresh-token=r",
            Some("https://example.trade"),
        )
        .expect("request builds");
        assert_eq!(
            request.headers().get("Cookie").unwrap(),
            "auth-access-token=a; auth-refresh-token=r"
        );
        assert_eq!(
            request.headers().get("Origin").unwrap(),
            "https://example.trade"
        );
    }
}
