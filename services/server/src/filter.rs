//! Per-subscriber token filtering.
//!
//! A denied deployer drops the token unconditionally.  Otherwise every
//! *enabled* filter dimension contributes one check; `use_and_mode` picks
//! conjunction or disjunction over the collected checks, and a subscriber
//! with no enabled filters receives everything.  Numeric fields missing
//! from a partially enriched token read as zero.
//!
//! The allow list never influences acceptance; it exists for tooling.

use dt_protocol::{EnrichedToken, SocialStats, SubscriberSettings};
use std::collections::HashSet;

/// Known protocol vocabulary.  An incoming protocol tag is matched by
/// substring against these names; tags matching none fall under "other".
pub const PROTOCOL_NAMES: [&str; 12] = [
    "pump v1",
    "meteora amm v2",
    "orca",
    "virtual curve",
    "raydium cpmm",
    "launchlab",
    "meteora dlmm",
    "sugar",
    "pump amm",
    "raydium clmm",
    "moonshot",
    "other",
];

/// Decide whether `token` should be delivered to a subscriber with the
/// given settings snapshot and deny list.
pub fn accepts(
    token: &EnrichedToken,
    settings: &SubscriberSettings,
    blacklist: &HashSet<String>,
) -> bool {
    // Deny list wins regardless of the combinator mode.
    if blacklist.contains(&token.deployer_address) {
        return false;
    }

    let mut checks = Vec::new();

    if settings.enable_avg_mcap {
        checks.push(token.avg_mcap() >= settings.min_avg_mcap);
    }
    if settings.enable_avg_ath_mcap {
        checks.push(token.avg_ath_mcap() >= settings.min_avg_ath_mcap);
    }
    if settings.enable_migrations {
        checks.push(token.migration_percent() >= settings.min_migration_percent);
    }
    if settings.enable_protocol_filter {
        checks.push(protocol_allowed(&token.protocol, settings));
    }
    if settings.enable_twitter_user {
        checks.push(match &token.social {
            SocialStats::UserProfile { followers, .. } => {
                *followers >= settings.min_twitter_followers
            }
            _ => false,
        });
    }
    if settings.enable_twitter_community {
        checks.push(match &token.social {
            SocialStats::Community {
                members,
                admin_followers,
                ..
            } => {
                *members >= settings.min_community_members
                    && *admin_followers >= settings.min_admin_followers
            }
            _ => false,
        });
    }

    if checks.is_empty() {
        return true;
    }
    if settings.use_and_mode {
        checks.iter().all(|c| *c)
    } else {
        checks.iter().any(|c| *c)
    }
}

/// Match the token's protocol tag against the vocabulary and look the
/// matched name up in the subscriber's allowed map.  Names absent from the
/// map default to allowed; unmatched tags use the "other" entry.
fn protocol_allowed(protocol: &str, settings: &SubscriberSettings) -> bool {
    let normalized = protocol.to_lowercase();
    let matched = PROTOCOL_NAMES
        .iter()
        .any(|name| normalized.contains(name));
    if matched {
        PROTOCOL_NAMES.iter().any(|name| {
            normalized.contains(name) && settings.protocols.get(*name).copied().unwrap_or(true)
        })
    } else {
        settings.protocols.get("other").copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dt_protocol::{DeployerStats, DevHistoryStats, SocialSource};

    fn token(deployer: &str, avg_mcap: f64, migrated: u32, total: u32) -> EnrichedToken {
        EnrichedToken {
            token_address: "So1Token".to_owned(),
            pair_address: "So1Pair".to_owned(),
            token_name: "Tok".to_owned(),
            token_ticker: "TOK".to_owned(),
            deployer_address: deployer.to_owned(),
            protocol: "pump v1".to_owned(),
            created_at: String::new(),
            social_url: None,
            social_source: SocialSource::None,
            dev: DeployerStats::Ready(DevHistoryStats {
                avg_mcap,
                avg_ath_mcap: 0.0,
                migrated,
                total,
                valid_tokens: total,
                tokens_info: vec![],
                api_used: "api3".to_owned(),
                cached: false,
                cache_age_secs: 0,
            }),
            social: SocialStats::None,
            processing_ms: 1,
            enriched_at: String::new(),
        }
    }

    fn settings() -> SubscriberSettings {
        SubscriberSettings::default()
    }

    #[test]
    fn no_enabled_filters_accepts_everything() {
        let t = token("dev", 0.0, 0, 0);
        assert!(accepts(&t, &settings(), &HashSet::new()));
    }

    #[test]
    fn avg_mcap_threshold_is_inclusive() {
        let mut s = settings();
        s.enable_avg_mcap = true;
        s.min_avg_mcap = 50_000.0;

        assert!(!accepts(&token("dev", 49_999.0, 0, 1), &s, &HashSet::new()));
        assert!(accepts(&token("dev", 50_000.0, 0, 1), &s, &HashSet::new()));
    }

    #[test]
    fn and_mode_requires_every_enabled_check() {
        let mut s = settings();
        s.enable_avg_mcap = true;
        s.min_avg_mcap = 50_000.0;
        s.enable_migrations = true;
        s.min_migration_percent = 25.0;
        s.use_and_mode = true;

        // avg passes, migration 20% fails -> rejected.
        assert!(!accepts(&token("dev", 60_000.0, 1, 5), &s, &HashSet::new()));
        // Both pass (25%).
        assert!(accepts(&token("dev", 60_000.0, 1, 4), &s, &HashSet::new()));
    }

    #[test]
    fn or_mode_accepts_on_any_passing_check() {
        let mut s = settings();
        s.enable_avg_mcap = true;
        s.min_avg_mcap = 50_000.0;
        s.enable_migrations = true;
        s.min_migration_percent = 25.0;
        s.use_and_mode = false;

        // Migration fails but avg_mcap passes.
        assert!(accepts(&token("dev", 60_000.0, 1, 5), &s, &HashSet::new()));
        assert!(accepts(&token("dev", 60_000.0, 1, 4), &s, &HashSet::new()));
        // Both fail.
        assert!(!accepts(&token("dev", 10_000.0, 0, 5), &s, &HashSet::new()));
    }

    #[test]
    fn denied_deployer_drops_regardless_of_mode_or_filters() {
        let blacklist: HashSet<String> = ["0xDEAD".to_owned()].into_iter().collect();
        let s = settings();

        assert!(!accepts(&token("0xDEAD", 0.0, 0, 0), &s, &blacklist));
        assert!(accepts(&token("0xBEEF", 0.0, 0, 0), &s, &blacklist));

        let mut or_mode = settings();
        or_mode.enable_avg_mcap = true;
        or_mode.use_and_mode = false;
        assert!(!accepts(&token("0xDEAD", 1e9, 0, 0), &or_mode, &blacklist));
    }

    #[test]
    fn enrichment_gap_reads_as_zero() {
        let mut t = token("dev", 0.0, 0, 0);
        t.dev = DeployerStats::error("All APIs failed (last: api3: Timeout)");

        let mut s = settings();
        s.enable_avg_mcap = true;
        s.min_avg_mcap = 1.0;
        assert!(!accepts(&t, &s, &HashSet::new()));

        // No filters enabled -> the gapped token still flows.
        assert!(accepts(&t, &settings(), &HashSet::new()));
    }

    #[test]
    fn protocol_filter_matches_by_substring_with_default_allow() {
        let mut s = settings();
        s.enable_protocol_filter = true;

        let mut t = token("dev", 0.0, 0, 0);
        t.protocol = "Pump V1".to_owned();
        // Not in the map -> default allowed.
        assert!(accepts(&t, &s, &HashSet::new()));

        s.protocols.insert("pump v1".to_owned(), false);
        assert!(!accepts(&t, &s, &HashSet::new()));

        // Unknown protocol falls under "other" (default true).
        t.protocol = "brand-new-venue".to_owned();
        assert!(accepts(&t, &s, &HashSet::new()));
        s.protocols.insert("other".to_owned(), false);
        assert!(!accepts(&t, &s, &HashSet::new()));
    }

    #[test]
    fn twitter_user_check_requires_the_profile_variant() {
        let mut s = settings();
        s.enable_twitter_user = true;
        s.min_twitter_followers = 100;

        let mut t = token("dev", 0.0, 0, 0);
        t.social = SocialStats::UserProfile {
            followers: 150,
            following: 10,
        };
        assert!(accepts(&t, &s, &HashSet::new()));

        t.social = SocialStats::UserProfile {
            followers: 99,
            following: 10,
        };
        assert!(!accepts(&t, &s, &HashSet::new()));

        // Community stats never satisfy the user dimension.
        t.social = SocialStats::Community {
            members: 100_000,
            admin_handle: "mod".to_owned(),
            admin_followers: 100_000,
            admin_following: 0,
        };
        assert!(!accepts(&t, &s, &HashSet::new()));
    }

    #[test]
    fn twitter_community_check_needs_both_thresholds() {
        let mut s = settings();
        s.enable_twitter_community = true;
        s.min_community_members = 1000;
        s.min_admin_followers = 500;

        let mut t = token("dev", 0.0, 0, 0);
        t.social = SocialStats::Community {
            members: 1500,
            admin_handle: "mod".to_owned(),
            admin_followers: 600,
            admin_following: 0,
        };
        assert!(accepts(&t, &s, &HashSet::new()));

        t.social = SocialStats::Community {
            members: 1500,
            admin_handle: "mod".to_owned(),
            admin_followers: 400,
            admin_following: 0,
        };
        assert!(!accepts(&t, &s, &HashSet::new()));

        t.social = SocialStats::SkippedPost;
        assert!(!accepts(&t, &s, &HashSet::new()));
    }
}
