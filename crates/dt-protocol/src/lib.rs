// dt-protocol: Token stream protocol types and serialization.
//
// Server frames use a top-level `type` field, client commands a top-level
// `command` field, both for discriminated deserialization.  The enum
// variants map 1:1 to the frozen frame vocabulary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Upstream event payload
// ---------------------------------------------------------------------------

/// A newly created token as reported by the upstream venue.
///
/// Parsed out of the `content` object of a `new_pairs` room frame and
/// immutable from then on.  Missing fields deserialize to their defaults so
/// a sparse upstream payload never drops the whole event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawToken {
    pub token_address: String,
    #[serde(default)]
    pub pair_address: String,
    #[serde(default)]
    pub token_name: String,
    #[serde(default)]
    pub token_ticker: String,
    #[serde(default)]
    pub deployer_address: String,
    /// Launch venue tag, e.g. "pump v1".  Defaults to "unknown".
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Metadata URI; may point at JSON metadata or directly at an image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_uri: Option<String>,
    /// Social URL carried directly on the event, when the venue has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twitter: Option<String>,
    /// Venue-reported creation timestamp; accepted as-is.
    #[serde(default)]
    pub created_at: String,
}

fn default_protocol() -> String {
    "unknown".to_owned()
}

// ---------------------------------------------------------------------------
// Deployer statistics
// ---------------------------------------------------------------------------

/// One prior token of a deployer, as included in the stats breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevTokenInfo {
    pub pair_address: String,
    pub ticker: String,
    pub name: String,
    /// Current market cap in unit currency.
    pub mcap: f64,
    pub supply: f64,
    /// All-time-high market cap; 0 when the chart lookup failed or was
    /// outside the ATH window.
    pub ath_mcap: f64,
    pub migrated: bool,
    pub created_at: String,
    pub protocol: String,
}

/// Computed deployer-history statistics.
///
/// `migrated` and `total` exclude the token currently being enriched;
/// `total >= migrated` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevHistoryStats {
    pub avg_mcap: f64,
    pub avg_ath_mcap: f64,
    pub migrated: u32,
    pub total: u32,
    /// Count of prior tokens that survived outlier rejection.
    pub valid_tokens: u32,
    pub tokens_info: Vec<DevTokenInfo>,
    /// Which upstream replica served the history data.
    pub api_used: String,
    pub cached: bool,
    #[serde(default)]
    pub cache_age_secs: u64,
}

/// Deployer-stats outcome attached to an enriched token.
///
/// Exactly one of the three states applies: populated stats, a first-token
/// marker (deployer has no prior history), or an error tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
#[serde(rename_all = "snake_case")]
pub enum DeployerStats {
    Ready(DevHistoryStats),
    FirstToken,
    Error { reason: String },
}

impl DeployerStats {
    pub fn error(reason: impl Into<String>) -> Self {
        DeployerStats::Error {
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Social statistics
// ---------------------------------------------------------------------------

/// Social-graph statistics for the token's resolved social URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum SocialStats {
    /// A profile URL resolved to follower counts.
    UserProfile { followers: u64, following: u64 },
    /// A community URL resolved to member + admin counts.
    Community {
        members: u64,
        admin_handle: String,
        admin_followers: u64,
        admin_following: u64,
    },
    /// The URL was a post (`…/status/<id>`); no lookup is performed.
    SkippedPost,
    /// No social URL could be resolved for the token.
    None,
    Error { reason: String },
}

impl SocialStats {
    pub fn error(reason: impl Into<String>) -> Self {
        SocialStats::Error {
            reason: reason.into(),
        }
    }
}

/// Where the enriched token's social URL came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialSource {
    /// Carried directly on the upstream event.
    Direct,
    /// Extracted from the token metadata document.
    Metadata,
    None,
}

// ---------------------------------------------------------------------------
// Enriched token
// ---------------------------------------------------------------------------

/// A raw upstream event augmented with deployer and social statistics.
///
/// Immutable once published to the dispatcher.  Numeric accessors read 0
/// out of `Error`/`FirstToken` states so filter thresholds can compare
/// against partially enriched tokens without special cases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedToken {
    pub token_address: String,
    pub pair_address: String,
    pub token_name: String,
    pub token_ticker: String,
    pub deployer_address: String,
    pub protocol: String,
    pub created_at: String,
    /// Resolved social URL, when one was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub social_url: Option<String>,
    pub social_source: SocialSource,
    pub dev: DeployerStats,
    pub social: SocialStats,
    /// Wall-clock enrichment duration in milliseconds.
    pub processing_ms: u64,
    pub enriched_at: String,
}

impl EnrichedToken {
    pub fn avg_mcap(&self) -> f64 {
        match &self.dev {
            DeployerStats::Ready(s) => s.avg_mcap,
            _ => 0.0,
        }
    }

    pub fn avg_ath_mcap(&self) -> f64 {
        match &self.dev {
            DeployerStats::Ready(s) => s.avg_ath_mcap,
            _ => 0.0,
        }
    }

    /// `migrated / total × 100`, or 0 when there is no usable history.
    pub fn migration_percent(&self) -> f64 {
        match &self.dev {
            DeployerStats::Ready(s) if s.total > 0 => {
                f64::from(s.migrated) / f64::from(s.total) * 100.0
            }
            _ => 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriber settings
// ---------------------------------------------------------------------------

/// Per-subscriber filter settings.
///
/// Six enable/threshold filter dimensions plus the AND/OR combinator flag.
/// `protocols` maps protocol names to allowed flags; names missing from the
/// map are treated as allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberSettings {
    pub enable_avg_mcap: bool,
    pub min_avg_mcap: f64,
    pub enable_avg_ath_mcap: bool,
    pub min_avg_ath_mcap: f64,
    pub enable_migrations: bool,
    pub min_migration_percent: f64,
    /// User-visible ATH window size; the engine applies its own global K.
    pub dev_tokens_count: u32,
    pub enable_protocol_filter: bool,
    pub protocols: BTreeMap<String, bool>,
    pub enable_twitter_user: bool,
    pub min_twitter_followers: u64,
    pub enable_twitter_community: bool,
    pub min_community_members: u64,
    pub min_admin_followers: u64,
    /// true = all enabled filters must pass; false = any one suffices.
    pub use_and_mode: bool,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        SubscriberSettings {
            enable_avg_mcap: false,
            min_avg_mcap: 0.0,
            enable_avg_ath_mcap: false,
            min_avg_ath_mcap: 0.0,
            enable_migrations: false,
            min_migration_percent: 0.0,
            dev_tokens_count: 10,
            enable_protocol_filter: false,
            protocols: BTreeMap::new(),
            enable_twitter_user: false,
            min_twitter_followers: 0,
            enable_twitter_community: false,
            min_community_members: 0,
            min_admin_followers: 0,
            use_and_mode: false,
        }
    }
}

/// A partial settings update.  Fields left `None` keep their prior value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_avg_mcap: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_avg_mcap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_avg_ath_mcap: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_avg_ath_mcap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_migrations: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_migration_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_tokens_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_protocol_filter: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocols: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_twitter_user: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_twitter_followers: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_twitter_community: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_community_members: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_admin_followers: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_and_mode: Option<bool>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self == &SettingsPatch::default()
    }
}

// ---------------------------------------------------------------------------
// Allow/deny list rows
// ---------------------------------------------------------------------------

/// One allow- or deny-list row, annotated with the token that prompted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub dev_wallet: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,
    pub added: String,
}

// ---------------------------------------------------------------------------
// Client -> server frames
// ---------------------------------------------------------------------------

/// The first frame a subscriber sends: the auth handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFrame {
    pub api_key: String,
}

/// Subscriber commands after authentication.
///
/// Serializes/deserializes using the `command` field as a tag.
///
/// ```json
/// { "command": "update_settings", "request_id": "r1", "params": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum ClientCommand {
    GetSettings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    UpdateSettings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(default)]
        params: SettingsPatch,
    },
    AddWhitelist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        dev_wallet: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_ticker: Option<String>,
    },
    RemoveWhitelist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        dev_wallet: String,
    },
    AddBlacklist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        dev_wallet: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_ticker: Option<String>,
    },
    RemoveBlacklist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        dev_wallet: String,
    },
    GetWhitelist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    GetBlacklist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ClientCommand {
    /// The request id echoed back in the reply frame, if the client sent one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ClientCommand::GetSettings { request_id }
            | ClientCommand::UpdateSettings { request_id, .. }
            | ClientCommand::AddWhitelist { request_id, .. }
            | ClientCommand::RemoveWhitelist { request_id, .. }
            | ClientCommand::AddBlacklist { request_id, .. }
            | ClientCommand::RemoveBlacklist { request_id, .. }
            | ClientCommand::GetWhitelist { request_id }
            | ClientCommand::GetBlacklist { request_id }
            | ClientCommand::Ping { request_id } => request_id.as_deref(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client frames
// ---------------------------------------------------------------------------

/// Whether a list mutation added or removed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListAction {
    Added,
    Removed,
}

/// All server-to-subscriber frame kinds.
///
/// Serializes/deserializes using the `type` field as a tag.
///
/// ```json
/// { "type": "token", "data": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake success; carries the full subscriber snapshot.
    AuthSuccess {
        username: String,
        settings: SubscriberSettings,
        whitelist: Vec<ListEntry>,
        blacklist: Vec<ListEntry>,
    },
    /// Handshake failure, unknown command, or a failed registry call.
    /// `request_id` is present when the error answers a command.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
    /// An enriched token that passed the subscriber's filters.
    Token { data: EnrichedToken },
    Settings {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: SubscriberSettings,
    },
    SettingsUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: SubscriberSettings,
    },
    Whitelist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: Vec<ListEntry>,
    },
    Blacklist {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: Vec<ListEntry>,
    },
    WhitelistUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        action: ListAction,
        dev_wallet: String,
        success: bool,
    },
    BlacklistUpdated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        action: ListAction,
        dev_wallet: String,
        success: bool,
    },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        timestamp: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_token_tolerates_sparse_upstream_content() {
        let content = r#"{"token_address": "So1abc"}"#;
        let token: RawToken = serde_json::from_str(content).expect("sparse content parses");
        assert_eq!(token.token_address, "So1abc");
        assert_eq!(token.protocol, "unknown");
        assert!(token.twitter.is_none());
        assert!(token.token_uri.is_none());
    }

    #[test]
    fn migration_percent_reads_zero_from_error_and_first_token() {
        let mut token = EnrichedToken {
            token_address: "t".to_owned(),
            pair_address: "p".to_owned(),
            token_name: "n".to_owned(),
            token_ticker: "T".to_owned(),
            deployer_address: "d".to_owned(),
            protocol: "pump v1".to_owned(),
            created_at: String::new(),
            social_url: None,
            social_source: SocialSource::None,
            dev: DeployerStats::error("All APIs failed (last: api3: HTTP 503)"),
            social: SocialStats::None,
            processing_ms: 5,
            enriched_at: String::new(),
        };
        assert_eq!(token.avg_mcap(), 0.0);
        assert_eq!(token.migration_percent(), 0.0);

        token.dev = DeployerStats::FirstToken;
        assert_eq!(token.avg_ath_mcap(), 0.0);
        assert_eq!(token.migration_percent(), 0.0);

        token.dev = DeployerStats::Ready(DevHistoryStats {
            avg_mcap: 10.0,
            avg_ath_mcap: 20.0,
            migrated: 3,
            total: 6,
            valid_tokens: 6,
            tokens_info: vec![],
            api_used: "api3.example".to_owned(),
            cached: false,
            cache_age_secs: 0,
        });
        assert_eq!(token.migration_percent(), 50.0);
    }

    #[test]
    fn settings_patch_default_is_empty() {
        assert!(SettingsPatch::default().is_empty());
        let patch = SettingsPatch {
            min_avg_mcap: Some(1.0),
            ..SettingsPatch::default()
        };
        assert!(!patch.is_empty());
    }
}
