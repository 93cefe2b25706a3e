//! Upstream session tests against a mock streaming venue.

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

use tracker::auth::{AuthConfig, AuthSession};
use tracker::upstream::{UpstreamConfig, UpstreamSession, UpstreamState};

fn far_future_jwt() -> String {
    let engine = &base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let exp = chrono::Utc::now().timestamp() + 86_400;
    let payload = engine.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}

fn auth_session(dir: &tempfile::TempDir) -> Arc<AuthSession> {
    let path = dir.path().join("auth_data.json");
    std::fs::write(
        &path,
        json!({"tokens": {
            "auth-access-token": far_future_jwt(),
            "auth-refresh-token": "refresh"
        }})
        .to_string(),
    )
    .expect("write credentials");
    Arc::new(
        AuthSession::load(
            AuthConfig {
                credential_file: path,
                refresh_url: "http://127.0.0.1:1/refresh".to_owned(),
                origin: None,
            },
            reqwest::Client::new(),
        )
        .expect("auth session"),
    )
}

/// Mock venue: accepts one WS connection, asserts the join frame, then sends
/// the provided frames and keeps the connection open.
async fn start_mock_venue(frames: Vec<serde_json::Value>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };

        // First frame must be the room join.
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let join: serde_json::Value = serde_json::from_str(&text).expect("join frame JSON");
                assert_eq!(join["action"], "join");
                assert_eq!(join["room"], "new_pairs");
            }
            other => panic!("expected join frame, got {other:?}"),
        }

        for frame in frames {
            let _ = ws.send(Message::Text(frame.to_string().into())).await;
        }

        // Keep the connection alive, answering pings, until the peer closes.
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Ping(data) = msg {
                let _ = ws.send(Message::Pong(data)).await;
            }
        }
    });
    addr
}

fn pair_frame(address: &str, ticker: &str) -> serde_json::Value {
    json!({
        "room": "new_pairs",
        "created_at": "2026-07-30T12:00:00Z",
        "content": {
            "token_address": address,
            "pair_address": format!("{address}-pair"),
            "token_name": "Mock",
            "token_ticker": ticker,
            "deployer_address": "So1Dev",
            "protocol": "pump v1"
        }
    })
}

#[tokio::test]
async fn session_joins_the_room_and_publishes_raw_tokens_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_mock_venue(vec![
        pair_frame("So1Token1", "ONE"),
        json!({"room": "trades", "content": {"token_address": "ignored"}}),
        json!({"room": "new_pairs", "content": null}),
        pair_frame("So1Token2", "TWO"),
    ])
    .await;

    let (session, mut raw_rx) = UpstreamSession::start(
        UpstreamConfig {
            ws_url: format!("ws://{addr}/"),
            room: "new_pairs".to_owned(),
            queue_capacity: 64,
        },
        auth_session(&dir),
    );

    let first = tokio::time::timeout(Duration::from_secs(5), raw_rx.recv())
        .await
        .expect("first token within deadline")
        .expect("channel open");
    assert_eq!(first.token_address, "So1Token1");
    assert_eq!(first.created_at, "2026-07-30T12:00:00Z");

    let second = tokio::time::timeout(Duration::from_secs(5), raw_rx.recv())
        .await
        .expect("second token within deadline")
        .expect("channel open");
    assert_eq!(second.token_ticker, "TWO");

    session.stop().await;
}

#[tokio::test]
async fn stop_transitions_the_state_machine_to_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let addr = start_mock_venue(vec![pair_frame("So1Token1", "ONE")]).await;

    let (session, mut raw_rx) = UpstreamSession::start(
        UpstreamConfig {
            ws_url: format!("ws://{addr}/"),
            room: "new_pairs".to_owned(),
            queue_capacity: 64,
        },
        auth_session(&dir),
    );
    let mut state = session.state();

    // Wait until the session is streaming (it has delivered a token).
    let _ = tokio::time::timeout(Duration::from_secs(5), raw_rx.recv())
        .await
        .expect("token within deadline");
    assert_eq!(*state.borrow_and_update(), UpstreamState::Streaming);

    session.stop().await;
    assert_eq!(*state.borrow(), UpstreamState::Stopped);
}

#[tokio::test]
async fn unreachable_venue_keeps_reconnecting_until_stop() {
    let dir = tempfile::tempdir().unwrap();
    // Nothing listens here; every connect fails.
    let (session, _raw_rx) = UpstreamSession::start(
        UpstreamConfig {
            ws_url: "ws://127.0.0.1:9/".to_owned(),
            room: "new_pairs".to_owned(),
            queue_capacity: 64,
        },
        auth_session(&dir),
    );
    let mut state = session.state();

    // The session must reach Reconnecting (not die) after the failed dial.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *state.borrow_and_update() == UpstreamState::Reconnecting {
                break;
            }
            state.changed().await.expect("state channel open");
        }
    })
    .await
    .expect("reached Reconnecting within deadline");

    session.stop().await;
    assert_eq!(*state.borrow(), UpstreamState::Stopped);
}
