//! Tracker configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/dev-tracker/tracker.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `auth.credential_file`, `auth.refresh_url`
//! - `upstream.ws_url`
//! - `enrichment.unit_price_url`
//! - `dev_history.primary`, `pair_chart.primary`
//! - `social.api_key`

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::AuthConfig;
use crate::enrich::dev_stats::DevStatsConfig;
use crate::enrich::fallback::EndpointGroup;
use crate::enrich::social::SocialConfig;
use crate::upstream::UpstreamConfig;

const DEV_HISTORY_TIMEOUT: Duration = Duration::from_secs(5);
const DEV_HISTORY_STAGGER: Duration = Duration::from_millis(100);
const PAIR_CHART_TIMEOUT: Duration = Duration::from_secs(6);
const PAIR_CHART_STAGGER: Duration = Duration::from_millis(150);

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level tracker configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub schema_version: u32,
    pub auth: AuthConfig,
    pub upstream: UpstreamConfig,
    pub enrichment: EnrichmentConfig,
    pub dev_history: EndpointsConfig,
    pub pair_chart: EndpointsConfig,
    pub social: SocialConfig,
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Worker-pool width for concurrent enrichments.
    pub concurrency: usize,
    /// K: ATH window over the newest prior tokens of a deployer.
    pub dev_tokens_count: usize,
    pub unit_price_url: String,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct EndpointsConfig {
    pub primary: String,
    pub replicas: Vec<String>,
}

impl TrackerConfig {
    /// Assemble the deployer-stats client config from the endpoint tables.
    pub fn dev_stats_config(&self) -> DevStatsConfig {
        DevStatsConfig {
            dev_history: EndpointGroup {
                primary: self.dev_history.primary.clone(),
                replicas: self.dev_history.replicas.clone(),
                stagger: DEV_HISTORY_STAGGER,
                attempt_timeout: DEV_HISTORY_TIMEOUT,
            },
            pair_chart: EndpointGroup {
                primary: self.pair_chart.primary.clone(),
                replicas: self.pair_chart.replicas.clone(),
                stagger: PAIR_CHART_STAGGER,
                attempt_timeout: PAIR_CHART_TIMEOUT,
            },
            unit_price_url: self.enrichment.unit_price_url.clone(),
            ath_window: self.enrichment.dev_tokens_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    auth: Option<RawAuthConfig>,
    upstream: Option<RawUpstreamConfig>,
    enrichment: Option<RawEnrichmentConfig>,
    dev_history: Option<RawEndpointsConfig>,
    pair_chart: Option<RawEndpointsConfig>,
    social: Option<RawSocialConfig>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    credential_file: Option<PathBuf>,
    refresh_url: Option<String>,
    origin: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUpstreamConfig {
    ws_url: Option<String>,
    room: Option<String>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawEnrichmentConfig {
    concurrency: Option<usize>,
    dev_tokens_count: Option<usize>,
    unit_price_url: Option<String>,
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEndpointsConfig {
    primary: Option<String>,
    replicas: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawSocialConfig {
    api_base: Option<String>,
    api_key: Option<String>,
    cache_cap: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load tracker config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<TrackerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load tracker config from the default path `/etc/dev-tracker/tracker.toml`.
pub fn load_config() -> Result<TrackerConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/dev-tracker/tracker.toml"))
}

/// Load tracker config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<TrackerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let raw_auth = raw
        .auth
        .ok_or_else(|| ConfigError::MissingField("auth".to_owned()))?;
    let auth = AuthConfig {
        credential_file: raw_auth
            .credential_file
            .ok_or_else(|| ConfigError::MissingField("auth.credential_file".to_owned()))?,
        refresh_url: raw_auth
            .refresh_url
            .ok_or_else(|| ConfigError::MissingField("auth.refresh_url".to_owned()))?,
        origin: raw_auth.origin,
    };

    let raw_upstream = raw
        .upstream
        .ok_or_else(|| ConfigError::MissingField("upstream".to_owned()))?;
    let upstream = UpstreamConfig {
        ws_url: raw_upstream
            .ws_url
            .ok_or_else(|| ConfigError::MissingField("upstream.ws_url".to_owned()))?,
        room: raw_upstream.room.unwrap_or_else(|| "new_pairs".to_owned()),
        queue_capacity: raw_upstream.queue_capacity.unwrap_or(1024),
    };

    let raw_enrichment = raw
        .enrichment
        .ok_or_else(|| ConfigError::MissingField("enrichment".to_owned()))?;
    let enrichment = EnrichmentConfig {
        concurrency: raw_enrichment.concurrency.unwrap_or(50),
        dev_tokens_count: raw_enrichment.dev_tokens_count.unwrap_or(10),
        unit_price_url: raw_enrichment
            .unit_price_url
            .ok_or_else(|| ConfigError::MissingField("enrichment.unit_price_url".to_owned()))?,
        user_agent: raw_enrichment.user_agent.unwrap_or_else(|| {
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_owned()
        }),
    };

    let dev_history = validate_endpoints("dev_history", raw.dev_history)?;
    let pair_chart = validate_endpoints("pair_chart", raw.pair_chart)?;

    let raw_social = raw
        .social
        .ok_or_else(|| ConfigError::MissingField("social".to_owned()))?;
    let social = SocialConfig {
        api_base: raw_social
            .api_base
            .unwrap_or_else(|| "https://api.twitterapi.io".to_owned()),
        api_key: raw_social
            .api_key
            .ok_or_else(|| ConfigError::MissingField("social.api_key".to_owned()))?,
        cache_cap: raw_social.cache_cap.unwrap_or(10_000),
    };

    Ok(TrackerConfig {
        schema_version,
        auth,
        upstream,
        enrichment,
        dev_history,
        pair_chart,
        social,
    })
}

fn validate_endpoints(
    section: &str,
    raw: Option<RawEndpointsConfig>,
) -> Result<EndpointsConfig, ConfigError> {
    let raw = raw.ok_or_else(|| ConfigError::MissingField(section.to_owned()))?;
    Ok(EndpointsConfig {
        primary: raw
            .primary
            .ok_or_else(|| ConfigError::MissingField(format!("{section}.primary")))?,
        replicas: raw.replicas.unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
