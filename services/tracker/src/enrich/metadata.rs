//! Social-URL extraction from token metadata.
//!
//! Metadata documents are wildly heterogeneous: the social link may sit in a
//! dedicated field, under any of a dozen container keys, inside a typed link
//! list, or only as free text.  Extraction is a single pass over the declared
//! key sets followed by a regex last resort over the stringified document.
//! Results (including "nothing found") are memoised per URI.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

use crate::cache::MemoCache;

/// Metadata fetches must finish within this deadline.
const FETCH_TIMEOUT: Duration = Duration::from_secs(1);

/// URIs with these suffixes are images and never fetched.
const IMAGE_EXTENSIONS: [&str; 5] = [".png", ".jpg", ".jpeg", ".gif", ".svg"];

/// Fields that carry the social link directly.
const TWITTER_KEYS: [&str; 20] = [
    "twitter",
    "Twitter",
    "TWITTER",
    "x",
    "X",
    "twitterUrl",
    "twitter_url",
    "TwitterUrl",
    "twitterLink",
    "twitter_link",
    "TwitterLink",
    "twitterHandle",
    "twitter_handle",
    "TwitterHandle",
    "twitterUsername",
    "twitter_username",
    "social_twitter",
    "socialTwitter",
    "handle",
    "username",
];

/// Container keys whose children are searched with the twitter key set.
const CONTAINER_KEYS: [&str; 26] = [
    "social",
    "socials",
    "Social",
    "Socials",
    "links",
    "Links",
    "LINKS",
    "urls",
    "Urls",
    "URLS",
    "external_url",
    "externalUrl",
    "ExternalUrl",
    "socialLinks",
    "social_links",
    "SocialLinks",
    "socialMedia",
    "social_media",
    "SocialMedia",
    "contacts",
    "Contacts",
    "extensions",
    "Extensions",
    "attributes",
    "Attributes",
    "properties",
];

/// Value keys checked on typed list items.
const URL_VALUE_KEYS: [&str; 5] = ["url", "value", "link", "href", "address"];

static FULL_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://(?:twitter\.com|x\.com)/[^\s"\\]+"#).expect("valid regex")
});

static HANDLE_FIELD_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)"twitter[^"]*"\s*:\s*"@?([A-Za-z0-9_]{1,15})""#,
        r#"(?i)"x[^"]*"\s*:\s*"@?([A-Za-z0-9_]{1,15})""#,
        r#"(?i)"handle[^"]*"\s*:\s*"@?([A-Za-z0-9_]{1,15})""#,
        r"@([A-Za-z0-9_]{1,15})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract a social URL from a metadata document, if one can be found.
pub fn extract_social_url(data: &Value) -> Option<String> {
    if let Value::Object(map) = data {
        for key in TWITTER_KEYS {
            if let Some(url) = map.get(key).and_then(normalize_social_value) {
                return Some(url);
            }
        }

        for parent in CONTAINER_KEYS {
            match map.get(parent) {
                Some(Value::Object(inner)) => {
                    for key in TWITTER_KEYS {
                        if let Some(url) = inner.get(key).and_then(normalize_social_value) {
                            return Some(url);
                        }
                    }
                }
                Some(Value::Array(items)) => {
                    for item in items {
                        if let Some(url) = extract_from_list_item(item) {
                            return Some(url);
                        }
                    }
                }
                // A bare string container (e.g. external_url) is covered by
                // the regex pass below.
                _ => {}
            }
        }
    }

    extract_via_regex(&data.to_string())
}

fn extract_from_list_item(item: &Value) -> Option<String> {
    let Value::Object(map) = item else {
        return None;
    };

    let item_type = map
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    let item_name = map
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();

    if item_type.contains("twitter") || item_name.contains("twitter") || item_type == "x" {
        for key in URL_VALUE_KEYS {
            if let Some(url) = map.get(key).and_then(normalize_social_value) {
                return Some(url);
            }
        }
    }
    for key in TWITTER_KEYS {
        if let Some(url) = map.get(key).and_then(normalize_social_value) {
            return Some(url);
        }
    }
    None
}

fn extract_via_regex(text: &str) -> Option<String> {
    if let Some(m) = FULL_URL_RE.find(text) {
        return Some(m.as_str().to_owned());
    }
    for re in HANDLE_FIELD_RES.iter() {
        if let Some(caps) = re.captures(text) {
            let handle = &caps[1];
            if !matches!(handle.to_lowercase().as_str(), "null" | "none" | "n" | "a") {
                return Some(format!("https://x.com/{handle}"));
            }
        }
    }
    None
}

/// Normalise a candidate value into a social URL.
///
/// Full twitter/x URLs pass through; anything else is treated as a bare
/// handle: stripped of `@` and non-word characters and rebuilt as an x.com
/// profile URL.  Empty and null-ish values yield `None`.
fn normalize_social_value(value: &Value) -> Option<String> {
    let text = value.as_str()?.trim();
    if text.is_empty() || matches!(text.to_lowercase().as_str(), "null" | "none" | "n/a") {
        return None;
    }
    let lower = text.to_lowercase();
    if lower.contains("twitter.com") || lower.contains("x.com") {
        return Some(text.to_owned());
    }
    let handle: String = text
        .trim_start_matches('@')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if handle.is_empty() {
        None
    } else {
        Some(format!("https://x.com/{handle}"))
    }
}

pub fn is_image_uri(uri: &str) -> bool {
    let lower = uri.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Fetch a metadata URI and extract a social URL, memoised per URI.
///
/// An empty string is a cached "nothing found".  Image URIs are never
/// fetched, non-JSON responses yield nothing, and every failure path caches
/// empty so a bad URI is only ever tried once.
pub async fn fetch_social_url(
    client: &reqwest::Client,
    uri: &str,
    cache: &MemoCache<String, String>,
) -> String {
    if let Some(hit) = cache.get(&uri.to_owned()) {
        return hit;
    }
    if is_image_uri(uri) {
        cache.insert(uri.to_owned(), String::new());
        return String::new();
    }
    let url = fetch_and_extract(client, uri).await.unwrap_or_default();
    cache.insert(uri.to_owned(), url.clone());
    url
}

async fn fetch_and_extract(client: &reqwest::Client, uri: &str) -> Option<String> {
    let response = client
        .get(uri)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| debug!(uri, error = %e, "metadata fetch failed"))
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.contains("application/json"));
    if !is_json {
        return None;
    }
    let data: Value = response.json().await.ok()?;
    extract_social_url(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dedicated_field_wins() {
        let data = json!({"name": "T", "twitter": "https://x.com/project"});
        assert_eq!(
            extract_social_url(&data).as_deref(),
            Some("https://x.com/project")
        );
    }

    #[test]
    fn bare_handle_normalises_to_profile_url() {
        let data = json!({"twitter_handle": "@team_dev!"});
        assert_eq!(
            extract_social_url(&data).as_deref(),
            Some("https://x.com/team_dev")
        );
    }

    #[test]
    fn nested_container_objects_are_searched() {
        let data = json!({"extensions": {"twitter": "https://twitter.com/nested"}});
        assert_eq!(
            extract_social_url(&data).as_deref(),
            Some("https://twitter.com/nested")
        );

        let data = json!({"socials": {"x": "deep_handle"}});
        assert_eq!(
            extract_social_url(&data).as_deref(),
            Some("https://x.com/deep_handle")
        );
    }

    #[test]
    fn typed_link_lists_are_searched() {
        let data = json!({
            "links": [
                {"type": "discord", "url": "https://discord.gg/abc"},
                {"type": "twitter", "url": "https://x.com/from_list"}
            ]
        });
        assert_eq!(
            extract_social_url(&data).as_deref(),
            Some("https://x.com/from_list")
        );

        let data = json!({"socialLinks": [{"name": "Twitter", "href": "https://x.com/via_href"}]});
        assert_eq!(
            extract_social_url(&data).as_deref(),
            Some("https://x.com/via_href")
        );
    }

    #[test]
    fn regex_last_resort_finds_buried_urls_and_handles() {
        let data = json!({"description": "follow us at https://x.com/buried for news"});
        assert_eq!(
            extract_social_url(&data).as_deref(),
            Some("https://x.com/buried")
        );

        let data = json!({"notes": {"contact": "reach @just_a_handle today"}});
        assert_eq!(
            extract_social_url(&data).as_deref(),
            Some("https://x.com/just_a_handle")
        );
    }

    #[test]
    fn null_ish_values_are_rejected() {
        assert_eq!(extract_social_url(&json!({"twitter": "null"})), None);
        assert_eq!(extract_social_url(&json!({"twitter": ""})), None);
        assert_eq!(extract_social_url(&json!({"twitter": "N/A"})), None);
        assert_eq!(extract_social_url(&json!({"irrelevant": 42})), None);
    }

    #[test]
    fn image_uris_are_recognised_case_insensitively() {
        assert!(is_image_uri("https://cdn.example.com/logo.png"));
        assert!(is_image_uri("https://cdn.example.com/logo.JPEG"));
        assert!(!is_image_uri("https://cdn.example.com/meta.json"));
    }

    #[tokio::test]
    async fn image_uri_is_never_fetched_and_caches_empty() {
        // Client pointed at a dead address: any fetch attempt would error,
        // so a clean empty result proves no request was made.
        let client = reqwest::Client::new();
        let cache = MemoCache::new(16);
        let url = fetch_social_url(&client, "http://127.0.0.1:1/logo.png", &cache).await;
        assert_eq!(url, "");
        assert_eq!(
            cache.get(&"http://127.0.0.1:1/logo.png".to_owned()),
            Some(String::new())
        );
    }
}
