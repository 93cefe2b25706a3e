//! Token fan-out.
//!
//! A single channel carries enriched tokens out of the tracker.  For each
//! token the dispatcher snapshots the subscriber set, evaluates the filter
//! per subscriber against their cached snapshot, and enqueues a `token`
//! frame on every passing session's outbound channel.  A slow or dead
//! subscriber only loses its own frame.
//!
//! One `token_logs` audit row is written per token that reached at least
//! one subscriber (not one per delivery).

use dt_protocol::{EnrichedToken, ServerFrame};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::filter;
use crate::state::AppState;

pub async fn run_dispatch(state: AppState, mut tokens: mpsc::Receiver<EnrichedToken>) {
    info!("token dispatch loop started");
    while let Some(token) = tokens.recv().await {
        state.stats.tokens_received.fetch_add(1, Ordering::Relaxed);
        dispatch_one(&state, &token).await;
    }
    info!("token dispatch loop ended");
}

/// Fan one token out to the current subscriber set.  Returns how many
/// subscribers it was enqueued for.
pub async fn dispatch_one(state: &AppState, token: &EnrichedToken) -> usize {
    let sessions = state.session_handles().await;
    if sessions.is_empty() {
        state.stats.tokens_filtered.fetch_add(1, Ordering::Relaxed);
        return 0;
    }

    let mut sent = 0u64;
    let mut filtered = 0u64;
    for session in sessions {
        let passes = {
            let snapshot = session.snapshot.read().await;
            filter::accepts(token, &snapshot.settings, &snapshot.blacklist)
        };
        if passes {
            let frame = ServerFrame::Token {
                data: token.clone(),
            };
            match session.outbound.try_send(frame) {
                Ok(()) => sent += 1,
                Err(e) => {
                    // Failure is per-subscriber only; the rest of the round
                    // continues.
                    warn!(
                        username = %session.username,
                        error = %e,
                        "failed to enqueue token for subscriber"
                    );
                }
            }
        } else {
            filtered += 1;
        }
    }

    state.stats.tokens_sent.fetch_add(sent, Ordering::Relaxed);
    state
        .stats
        .tokens_filtered
        .fetch_add(filtered, Ordering::Relaxed);

    if sent > 0 {
        if let Err(e) = state.db.log_token_sent(
            None,
            &token.token_address,
            &token.token_name,
            &token.token_ticker,
            false,
        ) {
            warn!(error = %e, "failed to write token audit row");
        }
    }
    debug!(
        token = %token.token_ticker,
        sent,
        filtered,
        "token dispatched"
    );
    sent as usize
}
