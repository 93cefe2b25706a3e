//! Subscriber command handling.
//!
//! Every mutating command writes a `request_logs` audit row (success or
//! failure) and refreshes the session's filter snapshot atomically, so an
//! in-flight settings update never partially applies to token filtering.
//! Registry failures answer with an `error` frame carrying the request id;
//! the connection stays open.

use dt_protocol::{ClientCommand, ListAction, ServerFrame};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::db::DbError;
use crate::state::{AppState, FilterSnapshot};

/// The per-session context command handling needs.
pub struct SessionCtx {
    pub user_id: i64,
    pub username: String,
    pub snapshot: Arc<RwLock<FilterSnapshot>>,
}

pub async fn handle_command(state: &AppState, ctx: &SessionCtx, cmd: ClientCommand) -> ServerFrame {
    let request_id = cmd.request_id().map(ToOwned::to_owned);
    match cmd {
        ClientCommand::GetSettings { .. } => match state.db.get_settings(ctx.user_id) {
            Ok(data) => ServerFrame::Settings { request_id, data },
            Err(e) => registry_error(request_id, &e),
        },

        ClientCommand::UpdateSettings { params, .. } => {
            let payload = serde_json::to_value(&params).unwrap_or_else(|_| json!({}));
            let result = state.db.update_settings(ctx.user_id, &params);
            audit(state, ctx, "update_settings", &payload, result.is_ok());
            if let Err(e) = result {
                return registry_error(request_id, &e);
            }
            match refresh_snapshot(state, ctx).await {
                Ok(snapshot) => {
                    info!(username = %ctx.username, "settings updated");
                    ServerFrame::SettingsUpdated {
                        request_id,
                        data: snapshot.settings,
                    }
                }
                Err(e) => registry_error(request_id, &e),
            }
        }

        ClientCommand::AddWhitelist {
            dev_wallet,
            token_name,
            token_ticker,
            ..
        } => {
            let result = state.db.add_whitelist(
                ctx.user_id,
                &dev_wallet,
                token_name.as_deref(),
                token_ticker.as_deref(),
            );
            list_reply(
                state,
                ctx,
                request_id,
                "add_to_whitelist",
                ListKind::Whitelist,
                ListAction::Added,
                dev_wallet,
                json!({"name": token_name, "ticker": token_ticker}),
                result,
            )
            .await
        }

        ClientCommand::RemoveWhitelist { dev_wallet, .. } => {
            let result = state.db.remove_whitelist(ctx.user_id, &dev_wallet);
            list_reply(
                state,
                ctx,
                request_id,
                "remove_from_whitelist",
                ListKind::Whitelist,
                ListAction::Removed,
                dev_wallet,
                json!({}),
                result,
            )
            .await
        }

        ClientCommand::AddBlacklist {
            dev_wallet,
            token_name,
            token_ticker,
            ..
        } => {
            let result = state.db.add_blacklist(
                ctx.user_id,
                &dev_wallet,
                token_name.as_deref(),
                token_ticker.as_deref(),
            );
            list_reply(
                state,
                ctx,
                request_id,
                "add_to_blacklist",
                ListKind::Blacklist,
                ListAction::Added,
                dev_wallet,
                json!({"name": token_name, "ticker": token_ticker}),
                result,
            )
            .await
        }

        ClientCommand::RemoveBlacklist { dev_wallet, .. } => {
            let result = state.db.remove_blacklist(ctx.user_id, &dev_wallet);
            list_reply(
                state,
                ctx,
                request_id,
                "remove_from_blacklist",
                ListKind::Blacklist,
                ListAction::Removed,
                dev_wallet,
                json!({}),
                result,
            )
            .await
        }

        ClientCommand::GetWhitelist { .. } => match state.db.get_whitelist(ctx.user_id) {
            Ok(data) => ServerFrame::Whitelist { request_id, data },
            Err(e) => registry_error(request_id, &e),
        },

        ClientCommand::GetBlacklist { .. } => match state.db.get_blacklist(ctx.user_id) {
            Ok(data) => ServerFrame::Blacklist { request_id, data },
            Err(e) => registry_error(request_id, &e),
        },

        ClientCommand::Ping { .. } => ServerFrame::Pong {
            request_id,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        },
    }
}

#[derive(Clone, Copy)]
enum ListKind {
    Whitelist,
    Blacklist,
}

/// Common tail of the four list mutations: audit, snapshot refresh, reply.
#[allow(clippy::too_many_arguments)]
async fn list_reply(
    state: &AppState,
    ctx: &SessionCtx,
    request_id: Option<String>,
    audit_type: &str,
    kind: ListKind,
    action: ListAction,
    dev_wallet: String,
    mut payload: serde_json::Value,
    result: Result<bool, DbError>,
) -> ServerFrame {
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("dev_wallet".to_owned(), json!(dev_wallet));
    }
    let success = matches!(result, Ok(true));
    audit(state, ctx, audit_type, &payload, success);

    match result {
        Ok(success) => {
            if success {
                if let Err(e) = refresh_snapshot(state, ctx).await {
                    return registry_error(request_id, &e);
                }
            }
            info!(
                username = %ctx.username,
                wallet = %dev_wallet,
                action = audit_type,
                success,
                "list mutation"
            );
            match kind {
                ListKind::Whitelist => ServerFrame::WhitelistUpdated {
                    request_id,
                    action,
                    dev_wallet,
                    success,
                },
                ListKind::Blacklist => ServerFrame::BlacklistUpdated {
                    request_id,
                    action,
                    dev_wallet,
                    success,
                },
            }
        }
        Err(e) => registry_error(request_id, &e),
    }
}

/// Re-read settings and both lists and swap the session snapshot in one
/// write-lock critical section.
pub async fn refresh_snapshot(
    state: &AppState,
    ctx: &SessionCtx,
) -> Result<FilterSnapshot, DbError> {
    let fresh = FilterSnapshot {
        settings: state.db.get_settings(ctx.user_id)?,
        whitelist: state.db.whitelist_wallets(ctx.user_id)?,
        blacklist: state.db.blacklist_wallets(ctx.user_id)?,
    };
    let mut guard = ctx.snapshot.write().await;
    *guard = fresh.clone();
    Ok(fresh)
}

fn audit(
    state: &AppState,
    ctx: &SessionCtx,
    request_type: &str,
    payload: &serde_json::Value,
    success: bool,
) {
    if let Err(e) = state.db.log_request(ctx.user_id, request_type, payload, success) {
        warn!(username = %ctx.username, error = %e, "failed to write request audit row");
    }
}

fn registry_error(request_id: Option<String>, e: &DbError) -> ServerFrame {
    warn!(error = %e, "registry call failed");
    ServerFrame::Error {
        request_id,
        message: format!("Registry error: {e}"),
    }
}
