//! Periodic statistics persistence and audit-log maintenance.

use std::time::Duration;
use tracing::{info, warn};

use crate::state::AppState;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Persist a counter snapshot and log a summary every `interval`.
///
/// The first snapshot is written one full interval after startup, so a
/// freshly restarted server does not immediately append a zero row.
pub async fn run_stats_loop(state: AppState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let snapshot = state.stats.snapshot();
        if let Err(e) = state.db.save_server_stats(
            snapshot.active_connections,
            snapshot.tokens_received,
            snapshot.tokens_sent,
            snapshot.tokens_filtered,
        ) {
            warn!(error = %e, "failed to persist server stats");
            continue;
        }
        info!(
            connected = snapshot.active_connections,
            tokens_received = snapshot.tokens_received,
            tokens_sent = snapshot.tokens_sent,
            tokens_filtered = snapshot.tokens_filtered,
            "server statistics"
        );
    }
}

/// Prune audit rows older than `retention_days`, once a day.
pub async fn run_log_cleanup(state: AppState, retention_days: u32) {
    let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match state.db.cleanup_logs(retention_days) {
            Ok(report) if report.total() > 0 => info!(
                tokens = report.tokens,
                connections = report.connections,
                requests = report.requests,
                stats = report.stats,
                "audit logs pruned"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "audit log cleanup failed"),
        }
    }
}
