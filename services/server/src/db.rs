//! SQLite-backed subscriber registry.
//!
//! # Schema
//! - `users`: identity, api_key, subscription expiry, active flag.
//! - `user_options`: one settings row per user.
//! - `user_whitelist` / `user_blacklist`: deployer lists, UNIQUE(user_id, dev_wallet).
//! - `connection_logs`, `request_logs`, `token_logs`: append-only audit
//!   tables, pruned by [`Db::cleanup_logs`].
//! - `server_stats`: periodic counter snapshots.
//!
//! All access goes through one connection behind a mutex; every operation is
//! a single short statement, so contention stays negligible next to the
//! network work around it.

use base64::Engine;
use dt_protocol::{ListEntry, SettingsPatch, SubscriberSettings};
use rand::RngCore;
use rusqlite::{Connection, params};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// A registry user row.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub api_key: String,
    pub is_admin: bool,
    pub created_at: String,
    pub expires_at: String,
    pub is_active: bool,
}

/// Rows removed per audit table by a cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub tokens: usize,
    pub connections: usize,
    pub requests: usize,
    pub stats: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.tokens + self.connections + self.requests + self.stats
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

// ---------------------------------------------------------------------------
// Db handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the registry database.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) the registry at the given path.
    ///
    /// Applies PRAGMAs and creates tables if needed.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory registry for tests.
    pub fn open_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Db {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Create a user with a fresh api key and an empty settings row.
    ///
    /// `subscription_days` may be negative to create an already-expired
    /// subscription (used by admin tooling and tests).
    pub fn add_user(
        &self,
        username: &str,
        subscription_days: i64,
        is_admin: bool,
    ) -> Result<(i64, String), DbError> {
        let api_key = generate_api_key();
        let created_at = chrono::Utc::now().to_rfc3339();
        let expires_at = (chrono::Utc::now() + chrono::TimeDelta::days(subscription_days))
            .to_rfc3339();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (username, api_key, is_admin, created_at, expires_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![username, api_key, i64::from(is_admin), created_at, expires_at],
        )?;
        let user_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO user_options (user_id) VALUES (?1)",
            params![user_id],
        )?;
        Ok((user_id, api_key))
    }

    pub fn get_user_by_api_key(&self, api_key: &str) -> Result<Option<User>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, username, api_key, is_admin, created_at, expires_at, is_active
             FROM users WHERE api_key = ?1",
        )?;
        let user = stmt
            .query_row(params![api_key], |row| {
                Ok(User {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    api_key: row.get(2)?,
                    is_admin: row.get::<_, i64>(3)? != 0,
                    created_at: row.get(4)?,
                    expires_at: row.get(5)?,
                    is_active: row.get::<_, i64>(6)? != 0,
                })
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(user)
    }

    /// True when the key belongs to an active user whose subscription has
    /// not expired.  An unparseable expiry counts as expired.
    pub fn is_active(&self, api_key: &str) -> Result<bool, DbError> {
        let Some(user) = self.get_user_by_api_key(api_key)? else {
            return Ok(false);
        };
        if !user.is_active {
            return Ok(false);
        }
        let expires = chrono::DateTime::parse_from_rfc3339(&user.expires_at)
            .map_err(|e| DbError::InvalidData(format!("expires_at: {e}")))?;
        Ok(chrono::Utc::now() < expires)
    }

    pub fn set_user_active(&self, user_id: i64, active: bool) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![i64::from(active), user_id],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub fn get_settings(&self, user_id: i64) -> Result<SubscriberSettings, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT enable_avg_mcap, min_avg_mcap, enable_avg_ath_mcap, min_avg_ath_mcap,
                    enable_migrations, min_migration_percent, dev_tokens_count,
                    enable_protocol_filter, protocols, enable_twitter_user,
                    min_twitter_followers, enable_twitter_community, min_community_members,
                    min_admin_followers, use_and_mode
             FROM user_options WHERE user_id = ?1",
        )?;
        let settings = stmt
            .query_row(params![user_id], |row| {
                let protocols_text: String = row.get(8)?;
                Ok(SubscriberSettings {
                    enable_avg_mcap: row.get::<_, i64>(0)? != 0,
                    min_avg_mcap: row.get(1)?,
                    enable_avg_ath_mcap: row.get::<_, i64>(2)? != 0,
                    min_avg_ath_mcap: row.get(3)?,
                    enable_migrations: row.get::<_, i64>(4)? != 0,
                    min_migration_percent: row.get(5)?,
                    dev_tokens_count: row.get::<_, i64>(6)? as u32,
                    enable_protocol_filter: row.get::<_, i64>(7)? != 0,
                    protocols: serde_json::from_str(&protocols_text).unwrap_or_default(),
                    enable_twitter_user: row.get::<_, i64>(9)? != 0,
                    min_twitter_followers: row.get::<_, i64>(10)? as u64,
                    enable_twitter_community: row.get::<_, i64>(11)? != 0,
                    min_community_members: row.get::<_, i64>(12)? as u64,
                    min_admin_followers: row.get::<_, i64>(13)? as u64,
                    use_and_mode: row.get::<_, i64>(14)? != 0,
                })
            })
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(SubscriberSettings::default()),
                other => Err(other),
            })?;
        Ok(settings)
    }

    /// Apply a partial settings update; unsupplied fields keep prior values.
    pub fn update_settings(&self, user_id: i64, patch: &SettingsPatch) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM user_options WHERE user_id = ?1",
                params![user_id],
                |_| Ok(true),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })?;
        if !exists {
            conn.execute(
                "INSERT INTO user_options (user_id) VALUES (?1)",
                params![user_id],
            )?;
        }

        let mut sets: Vec<&str> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        let mut push_bool = |field: &'static str, value: Option<bool>| {
            if let Some(v) = value {
                sets.push(field);
                values.push(i64::from(v).into());
            }
        };
        push_bool("enable_avg_mcap = ?", patch.enable_avg_mcap);
        push_bool("enable_avg_ath_mcap = ?", patch.enable_avg_ath_mcap);
        push_bool("enable_migrations = ?", patch.enable_migrations);
        push_bool("enable_protocol_filter = ?", patch.enable_protocol_filter);
        push_bool("enable_twitter_user = ?", patch.enable_twitter_user);
        push_bool("enable_twitter_community = ?", patch.enable_twitter_community);
        push_bool("use_and_mode = ?", patch.use_and_mode);

        if let Some(v) = patch.min_avg_mcap {
            sets.push("min_avg_mcap = ?");
            values.push(v.into());
        }
        if let Some(v) = patch.min_avg_ath_mcap {
            sets.push("min_avg_ath_mcap = ?");
            values.push(v.into());
        }
        if let Some(v) = patch.min_migration_percent {
            sets.push("min_migration_percent = ?");
            values.push(v.into());
        }
        if let Some(v) = patch.dev_tokens_count {
            sets.push("dev_tokens_count = ?");
            values.push(i64::from(v).into());
        }
        if let Some(v) = patch.min_twitter_followers {
            sets.push("min_twitter_followers = ?");
            values.push((v as i64).into());
        }
        if let Some(v) = patch.min_community_members {
            sets.push("min_community_members = ?");
            values.push((v as i64).into());
        }
        if let Some(v) = patch.min_admin_followers {
            sets.push("min_admin_followers = ?");
            values.push((v as i64).into());
        }
        if let Some(protocols) = &patch.protocols {
            sets.push("protocols = ?");
            let text = serde_json::to_string(protocols)
                .map_err(|e| DbError::InvalidData(e.to_string()))?;
            values.push(text.into());
        }

        if sets.is_empty() {
            return Ok(());
        }
        values.push(user_id.into());
        let sql = format!(
            "UPDATE user_options SET {} WHERE user_id = ?",
            sets.join(", ")
        );
        conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Whitelist / blacklist
    // -----------------------------------------------------------------------

    /// Idempotent add; returns false when the wallet was already listed.
    pub fn add_whitelist(
        &self,
        user_id: i64,
        dev_wallet: &str,
        token_name: Option<&str>,
        token_ticker: Option<&str>,
    ) -> Result<bool, DbError> {
        self.add_list_entry("user_whitelist", user_id, dev_wallet, token_name, token_ticker)
    }

    pub fn add_blacklist(
        &self,
        user_id: i64,
        dev_wallet: &str,
        token_name: Option<&str>,
        token_ticker: Option<&str>,
    ) -> Result<bool, DbError> {
        self.add_list_entry("user_blacklist", user_id, dev_wallet, token_name, token_ticker)
    }

    pub fn remove_whitelist(&self, user_id: i64, dev_wallet: &str) -> Result<bool, DbError> {
        self.remove_list_entry("user_whitelist", user_id, dev_wallet)
    }

    pub fn remove_blacklist(&self, user_id: i64, dev_wallet: &str) -> Result<bool, DbError> {
        self.remove_list_entry("user_blacklist", user_id, dev_wallet)
    }

    pub fn get_whitelist(&self, user_id: i64) -> Result<Vec<ListEntry>, DbError> {
        self.get_list("user_whitelist", user_id)
    }

    pub fn get_blacklist(&self, user_id: i64) -> Result<Vec<ListEntry>, DbError> {
        self.get_list("user_blacklist", user_id)
    }

    /// The deny-list wallets as a set, for the per-session filter snapshot.
    pub fn blacklist_wallets(&self, user_id: i64) -> Result<HashSet<String>, DbError> {
        self.list_wallets("user_blacklist", user_id)
    }

    pub fn whitelist_wallets(&self, user_id: i64) -> Result<HashSet<String>, DbError> {
        self.list_wallets("user_whitelist", user_id)
    }

    fn add_list_entry(
        &self,
        table: &str,
        user_id: i64,
        dev_wallet: &str,
        token_name: Option<&str>,
        token_ticker: Option<&str>,
    ) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {table}
                     (user_id, dev_wallet, token_name, token_ticker, added_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))"
            ),
            params![user_id, dev_wallet, token_name, token_ticker],
        )?;
        Ok(changed > 0)
    }

    fn remove_list_entry(
        &self,
        table: &str,
        user_id: i64,
        dev_wallet: &str,
    ) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            &format!("DELETE FROM {table} WHERE user_id = ?1 AND dev_wallet = ?2"),
            params![user_id, dev_wallet],
        )?;
        Ok(changed > 0)
    }

    fn get_list(&self, table: &str, user_id: i64) -> Result<Vec<ListEntry>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT dev_wallet, token_name, token_ticker, added_at
             FROM {table} WHERE user_id = ?1 ORDER BY added_at DESC"
        ))?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(ListEntry {
                dev_wallet: row.get(0)?,
                name: row.get(1)?,
                ticker: row.get(2)?,
                added: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn list_wallets(&self, table: &str, user_id: i64) -> Result<HashSet<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT dev_wallet FROM {table} WHERE user_id = ?1"
        ))?;
        let rows = stmt.query_map(params![user_id], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<HashSet<_>, _>>()?)
    }

    // -----------------------------------------------------------------------
    // Audit logs
    // -----------------------------------------------------------------------

    pub fn log_connection(
        &self,
        user_id: i64,
        action: &str,
        ip_address: Option<&str>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO connection_logs (user_id, action, timestamp, ip_address)
             VALUES (?1, ?2, datetime('now'), ?3)",
            params![user_id, action, ip_address],
        )?;
        Ok(())
    }

    pub fn log_request(
        &self,
        user_id: i64,
        request_type: &str,
        request_data: &serde_json::Value,
        success: bool,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO request_logs (user_id, request_type, request_data, timestamp, success)
             VALUES (?1, ?2, ?3, datetime('now'), ?4)",
            params![
                user_id,
                request_type,
                request_data.to_string(),
                i64::from(success)
            ],
        )?;
        Ok(())
    }

    pub fn log_token_sent(
        &self,
        user_id: Option<i64>,
        token_address: &str,
        token_name: &str,
        token_ticker: &str,
        filtered: bool,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO token_logs (user_id, token_address, token_name, token_ticker, timestamp, filtered)
             VALUES (?1, ?2, ?3, ?4, datetime('now'), ?5)",
            params![user_id, token_address, token_name, token_ticker, i64::from(filtered)],
        )?;
        Ok(())
    }

    pub fn save_server_stats(
        &self,
        active_connections: u64,
        tokens_received: u64,
        tokens_sent: u64,
        tokens_filtered: u64,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO server_stats
                 (timestamp, active_connections, tokens_received, tokens_sent, tokens_filtered)
             VALUES (datetime('now'), ?1, ?2, ?3, ?4)",
            params![
                active_connections as i64,
                tokens_received as i64,
                tokens_sent as i64,
                tokens_filtered as i64
            ],
        )?;
        Ok(())
    }

    /// Delete audit rows older than `days` from all four append-only tables.
    pub fn cleanup_logs(&self, days: u32) -> Result<CleanupReport, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut report = CleanupReport::default();
        let clause = "datetime(timestamp) < datetime('now', '-' || ?1 || ' days')";
        report.tokens =
            conn.execute(&format!("DELETE FROM token_logs WHERE {clause}"), params![days])?;
        report.connections = conn.execute(
            &format!("DELETE FROM connection_logs WHERE {clause}"),
            params![days],
        )?;
        report.requests = conn.execute(
            &format!("DELETE FROM request_logs WHERE {clause}"),
            params![days],
        )?;
        report.stats = conn.execute(
            &format!("DELETE FROM server_stats WHERE {clause}"),
            params![days],
        )?;
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Schema and helpers
// ---------------------------------------------------------------------------

fn apply_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS users (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             username TEXT UNIQUE NOT NULL,
             api_key TEXT UNIQUE NOT NULL,
             is_admin INTEGER DEFAULT 0,
             created_at TEXT NOT NULL,
             expires_at TEXT NOT NULL,
             is_active INTEGER DEFAULT 1
         );
         CREATE TABLE IF NOT EXISTS user_options (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             user_id INTEGER NOT NULL,
             enable_avg_mcap INTEGER DEFAULT 0,
             min_avg_mcap REAL DEFAULT 0,
             enable_avg_ath_mcap INTEGER DEFAULT 0,
             min_avg_ath_mcap REAL DEFAULT 0,
             enable_migrations INTEGER DEFAULT 0,
             min_migration_percent REAL DEFAULT 0,
             dev_tokens_count INTEGER DEFAULT 10,
             enable_protocol_filter INTEGER DEFAULT 0,
             protocols TEXT DEFAULT '{}',
             enable_twitter_user INTEGER DEFAULT 0,
             min_twitter_followers INTEGER DEFAULT 0,
             enable_twitter_community INTEGER DEFAULT 0,
             min_community_members INTEGER DEFAULT 0,
             min_admin_followers INTEGER DEFAULT 0,
             use_and_mode INTEGER DEFAULT 0,
             FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
         );
         CREATE TABLE IF NOT EXISTS user_whitelist (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             user_id INTEGER NOT NULL,
             dev_wallet TEXT NOT NULL,
             token_name TEXT,
             token_ticker TEXT,
             added_at TEXT NOT NULL DEFAULT (datetime('now')),
             UNIQUE(user_id, dev_wallet),
             FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
         );
         CREATE TABLE IF NOT EXISTS user_blacklist (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             user_id INTEGER NOT NULL,
             dev_wallet TEXT NOT NULL,
             token_name TEXT,
             token_ticker TEXT,
             added_at TEXT NOT NULL DEFAULT (datetime('now')),
             UNIQUE(user_id, dev_wallet),
             FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
         );
         CREATE TABLE IF NOT EXISTS connection_logs (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             user_id INTEGER NOT NULL,
             action TEXT NOT NULL,
             timestamp TEXT NOT NULL DEFAULT (datetime('now')),
             ip_address TEXT,
             FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
         );
         CREATE TABLE IF NOT EXISTS request_logs (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             user_id INTEGER NOT NULL,
             request_type TEXT NOT NULL,
             request_data TEXT,
             timestamp TEXT NOT NULL DEFAULT (datetime('now')),
             success INTEGER DEFAULT 1,
             FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
         );
         CREATE TABLE IF NOT EXISTS token_logs (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             user_id INTEGER,
             token_address TEXT NOT NULL,
             token_name TEXT,
             token_ticker TEXT,
             timestamp TEXT NOT NULL DEFAULT (datetime('now')),
             filtered INTEGER DEFAULT 0,
             FOREIGN KEY (user_id) REFERENCES users (id) ON DELETE CASCADE
         );
         CREATE TABLE IF NOT EXISTS server_stats (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             timestamp TEXT NOT NULL DEFAULT (datetime('now')),
             active_connections INTEGER DEFAULT 0,
             tokens_received INTEGER DEFAULT 0,
             tokens_sent INTEGER DEFAULT 0,
             tokens_filtered INTEGER DEFAULT 0
         );",
    )
}

/// 32 random bytes, url-safe base64 — the shape subscribers paste into their
/// clients.
fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_user() -> (Db, i64, String) {
        let db = Db::open_in_memory().expect("open");
        let (user_id, api_key) = db.add_user("trader-1", 30, false).expect("add user");
        (db, user_id, api_key)
    }

    #[test]
    fn new_user_is_active_and_has_default_settings() {
        let (db, user_id, api_key) = db_with_user();
        assert!(db.is_active(&api_key).expect("is_active"));
        assert!(!db.is_active("bogus-key").unwrap());

        let settings = db.get_settings(user_id).expect("settings");
        assert_eq!(settings, SubscriberSettings::default());
        assert_eq!(settings.dev_tokens_count, 10);
    }

    #[test]
    fn expired_or_deactivated_users_fail_the_active_check() {
        let db = Db::open_in_memory().unwrap();
        let (_, expired_key) = db.add_user("expired", -1, false).unwrap();
        assert!(!db.is_active(&expired_key).unwrap());

        let (user_id, key) = db.add_user("disabled", 30, false).unwrap();
        db.set_user_active(user_id, false).unwrap();
        assert!(!db.is_active(&key).unwrap());
    }

    #[test]
    fn settings_patch_round_trips_every_supplied_field() {
        let (db, user_id, _) = db_with_user();
        let patch = SettingsPatch {
            enable_avg_mcap: Some(true),
            min_avg_mcap: Some(50_000.0),
            enable_migrations: Some(true),
            min_migration_percent: Some(25.0),
            use_and_mode: Some(true),
            protocols: Some(
                [("pump v1".to_owned(), false), ("other".to_owned(), true)]
                    .into_iter()
                    .collect(),
            ),
            ..SettingsPatch::default()
        };
        db.update_settings(user_id, &patch).expect("update");

        let settings = db.get_settings(user_id).expect("settings");
        assert!(settings.enable_avg_mcap);
        assert_eq!(settings.min_avg_mcap, 50_000.0);
        assert!(settings.enable_migrations);
        assert_eq!(settings.min_migration_percent, 25.0);
        assert!(settings.use_and_mode);
        assert_eq!(settings.protocols.get("pump v1"), Some(&false));
        // Unsupplied fields keep their defaults.
        assert!(!settings.enable_avg_ath_mcap);
        assert_eq!(settings.min_twitter_followers, 0);
    }

    #[test]
    fn partial_update_keeps_earlier_values() {
        let (db, user_id, _) = db_with_user();
        db.update_settings(
            user_id,
            &SettingsPatch {
                min_avg_mcap: Some(10_000.0),
                ..SettingsPatch::default()
            },
        )
        .unwrap();
        db.update_settings(
            user_id,
            &SettingsPatch {
                enable_avg_mcap: Some(true),
                ..SettingsPatch::default()
            },
        )
        .unwrap();

        let settings = db.get_settings(user_id).unwrap();
        assert!(settings.enable_avg_mcap);
        assert_eq!(settings.min_avg_mcap, 10_000.0);
    }

    #[test]
    fn duplicate_whitelist_add_reports_false_without_altering_state() {
        let (db, user_id, _) = db_with_user();
        assert!(db.add_whitelist(user_id, "So1Dev", Some("Tok"), Some("TOK")).unwrap());
        assert!(!db.add_whitelist(user_id, "So1Dev", Some("Tok"), Some("TOK")).unwrap());
        assert_eq!(db.get_whitelist(user_id).unwrap().len(), 1);

        assert!(db.remove_whitelist(user_id, "So1Dev").unwrap());
        assert!(!db.remove_whitelist(user_id, "So1Dev").unwrap());
        assert!(db.get_whitelist(user_id).unwrap().is_empty());
    }

    #[test]
    fn blacklist_sets_feed_the_filter_snapshot() {
        let (db, user_id, _) = db_with_user();
        db.add_blacklist(user_id, "0xDEAD", None, None).unwrap();
        db.add_blacklist(user_id, "0xF00D", None, None).unwrap();

        let wallets = db.blacklist_wallets(user_id).unwrap();
        assert!(wallets.contains("0xDEAD"));
        assert!(wallets.contains("0xF00D"));
        assert!(!wallets.contains("0xBEEF"));
        assert!(db.whitelist_wallets(user_id).unwrap().is_empty());
    }

    #[test]
    fn lists_are_per_user() {
        let db = Db::open_in_memory().unwrap();
        let (alice, _) = db.add_user("alice", 30, false).unwrap();
        let (bob, _) = db.add_user("bob", 30, false).unwrap();
        db.add_blacklist(alice, "0xDEAD", None, None).unwrap();

        assert!(db.blacklist_wallets(alice).unwrap().contains("0xDEAD"));
        assert!(db.blacklist_wallets(bob).unwrap().is_empty());
    }

    #[test]
    fn audit_rows_and_stats_snapshots_are_written() {
        let (db, user_id, _) = db_with_user();
        db.log_connection(user_id, "connected", Some("10.0.0.1")).unwrap();
        db.log_request(user_id, "update_settings", &serde_json::json!({"x": 1}), true)
            .unwrap();
        db.log_token_sent(None, "So1Token", "Tok", "TOK", false).unwrap();
        db.save_server_stats(2, 100, 40, 60).unwrap();

        // Fresh rows survive a 30-day cleanup untouched.
        let report = db.cleanup_logs(30).unwrap();
        assert_eq!(report.total(), 0);

        // A zero-day threshold only removes rows strictly older than now;
        // rows stamped this second may legitimately survive, so just check
        // the call succeeds.
        db.cleanup_logs(0).unwrap();
    }

    #[test]
    fn api_keys_are_unique_and_url_safe() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
