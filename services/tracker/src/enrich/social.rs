//! Social-graph lookups.
//!
//! Classifies a resolved social URL as a post, community, or profile and
//! fetches the matching statistics.  Post URLs are never looked up.
//! Profile and community results are memoised without expiry in capped
//! caches; lookups that fail outright are not cached so a transient API
//! error does not poison the handle forever.

use dt_protocol::SocialStats;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

use crate::cache::MemoCache;

const TOTAL_TIMEOUT: Duration = Duration::from_secs(2);
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

static POST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://(?:twitter\.com|x\.com)/[A-Za-z0-9_]+/status/\d+")
        .expect("valid regex")
});
static COMMUNITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:twitter\.com|x\.com)/i/communities/(\d+)").expect("valid regex")
});
static USER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:twitter\.com|x\.com)/([A-Za-z0-9_]+)(?:\?|/status|$)")
        .expect("valid regex")
});

// ---------------------------------------------------------------------------
// URL classification
// ---------------------------------------------------------------------------

/// What a social URL points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocialTarget {
    Post,
    Community(String),
    Profile(String),
    Invalid,
}

pub fn is_post_url(url: &str) -> bool {
    POST_RE.is_match(url)
}

pub fn classify(url: &str) -> SocialTarget {
    if is_post_url(url) {
        return SocialTarget::Post;
    }
    if let Some(caps) = COMMUNITY_RE.captures(url) {
        return SocialTarget::Community(caps[1].to_owned());
    }
    if let Some(caps) = USER_RE.captures(url) {
        return SocialTarget::Profile(caps[1].to_owned());
    }
    SocialTarget::Invalid
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Configuration for the social API client.
#[derive(Debug, Clone)]
pub struct SocialConfig {
    /// Base URL of the social API, e.g. `https://api.twitterapi.io`.
    pub api_base: String,
    pub api_key: String,
    /// Entry cap for each memo cache.
    pub cache_cap: usize,
}

pub struct SocialClient {
    http: reqwest::Client,
    cfg: SocialConfig,
    profiles: MemoCache<String, SocialStats>,
    communities: MemoCache<String, SocialStats>,
}

impl SocialClient {
    pub fn new(cfg: SocialConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(TOTAL_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let cap = cfg.cache_cap;
        Ok(SocialClient {
            http,
            cfg,
            profiles: MemoCache::new(cap),
            communities: MemoCache::new(cap),
        })
    }

    /// Resolve statistics for a social URL.
    pub async fn lookup(&self, url: &str) -> SocialStats {
        match classify(url) {
            SocialTarget::Post => SocialStats::SkippedPost,
            SocialTarget::Community(id) => self.community_stats(&id).await,
            SocialTarget::Profile(handle) => self.profile_stats(&handle).await,
            SocialTarget::Invalid => SocialStats::error("Invalid URL"),
        }
    }

    async fn profile_stats(&self, handle: &str) -> SocialStats {
        if let Some(hit) = self.profiles.get(&handle.to_owned()) {
            return hit;
        }
        match self.fetch_profile(handle).await {
            Ok(stats) => {
                self.profiles.insert(handle.to_owned(), stats.clone());
                stats
            }
            Err(reason) => {
                debug!(handle, %reason, "profile lookup failed");
                SocialStats::error(reason)
            }
        }
    }

    async fn fetch_profile(&self, handle: &str) -> Result<SocialStats, String> {
        let url = format!("{}/twitter/user/info", self.cfg.api_base);
        let response = self
            .http
            .get(&url)
            .header("X-API-Key", &self.cfg.api_key)
            .query(&[("userName", handle)])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }
        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        parse_profile_response(&body)
    }

    async fn community_stats(&self, community_id: &str) -> SocialStats {
        if let Some(hit) = self.communities.get(&community_id.to_owned()) {
            return hit;
        }
        match self.fetch_community(community_id).await {
            Ok(stats) => {
                // "Admin not found" is a stable property of the community,
                // so it is cached just like a successful lookup.
                self.communities.insert(community_id.to_owned(), stats.clone());
                stats
            }
            Err(reason) => {
                debug!(community_id, %reason, "community lookup failed");
                SocialStats::error(reason)
            }
        }
    }

    async fn fetch_community(&self, community_id: &str) -> Result<SocialStats, String> {
        let url = format!("{}/twitter/community/info", self.cfg.api_base);
        let response = self
            .http
            .get(&url)
            .header("X-API-Key", &self.cfg.api_key)
            .query(&[("community_id", community_id)])
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }
        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        parse_community_response(&body)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_profile_response(body: &Value) -> Result<SocialStats, String> {
    let data = body.get("data").ok_or_else(|| "Invalid response".to_owned())?;
    Ok(SocialStats::UserProfile {
        followers: u64_field(data, "followers"),
        following: u64_field(data, "following"),
    })
}

fn parse_community_response(body: &Value) -> Result<SocialStats, String> {
    let info = body
        .get("community_info")
        .ok_or_else(|| "Invalid response".to_owned())?;
    let Some(admin) = info.get("admin").filter(|a| a.is_object()) else {
        return Ok(SocialStats::error("Admin not found"));
    };
    Ok(SocialStats::Community {
        members: u64_field(info, "member_count"),
        admin_handle: admin
            .get("screen_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        admin_followers: u64_field(admin, "followers_count"),
        admin_following: u64_field(admin, "friends_count"),
    })
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}
