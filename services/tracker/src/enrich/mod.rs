//! Enrichment engine.
//!
//! Consumes raw upstream events and publishes enriched tokens.  Each token
//! runs two concurrent sub-tasks: the social pipeline (resolve a URL from
//! the event or its metadata, then fetch profile/community statistics) and
//! the deployer-stats pipeline (bounded by a 10 s budget).  A failing
//! sub-task publishes its `Error` variant; dispatch is never stalled by a
//! single bad enrichment.

pub mod dev_stats;
pub mod fallback;
pub mod metadata;
pub mod social;

use dt_protocol::{DeployerStats, EnrichedToken, RawToken, SocialSource, SocialStats};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::auth::AuthSession;
use crate::cache::MemoCache;
use crate::config::TrackerConfig;
use self::dev_stats::DevStatsClient;
use self::social::SocialClient;

/// Overall budget for the deployer-stats sub-task.
const DEV_STATS_BUDGET: Duration = Duration::from_secs(10);
/// Entry cap for the metadata memo cache.
const METADATA_CACHE_CAP: usize = 10_000;

pub struct EnrichmentEngine {
    dev: DevStatsClient,
    social: SocialClient,
    metadata_http: reqwest::Client,
    metadata_cache: MemoCache<String, String>,
    concurrency: Arc<tokio::sync::Semaphore>,
    dropped: AtomicU64,
}

impl EnrichmentEngine {
    pub fn new(cfg: &TrackerConfig, auth: Arc<AuthSession>) -> Result<Self, reqwest::Error> {
        let enrichment_http = reqwest::Client::builder()
            .user_agent(cfg.enrichment.user_agent.clone())
            .build()?;
        Ok(EnrichmentEngine {
            dev: DevStatsClient::new(cfg.dev_stats_config(), auth, enrichment_http.clone()),
            social: SocialClient::new(cfg.social.clone())?,
            metadata_http: enrichment_http,
            metadata_cache: MemoCache::new(METADATA_CACHE_CAP),
            concurrency: Arc::new(tokio::sync::Semaphore::new(cfg.enrichment.concurrency)),
            dropped: AtomicU64::new(0),
        })
    }

    /// Enrich a single raw event.  Infallible by construction: sub-task
    /// failures land in the published token as `Error` variants.
    pub async fn enrich(&self, raw: RawToken) -> EnrichedToken {
        let started = std::time::Instant::now();

        let social_task = self.resolve_social(&raw);
        let dev_task = async {
            match tokio::time::timeout(
                DEV_STATS_BUDGET,
                self.dev
                    .deployer_stats(&raw.deployer_address, &raw.token_address),
            )
            .await
            {
                Ok(stats) => stats,
                Err(_) => DeployerStats::error("Timeout"),
            }
        };
        let ((social_url, social_source, social), dev) = tokio::join!(social_task, dev_task);

        EnrichedToken {
            token_address: raw.token_address,
            pair_address: raw.pair_address,
            token_name: raw.token_name,
            token_ticker: raw.token_ticker,
            deployer_address: raw.deployer_address,
            protocol: raw.protocol,
            created_at: raw.created_at,
            social_url,
            social_source,
            dev,
            social,
            processing_ms: started.elapsed().as_millis() as u64,
            enriched_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Resolve the social URL (direct field preferred, metadata otherwise)
    /// and fetch the matching statistics.
    async fn resolve_social(&self, raw: &RawToken) -> (Option<String>, SocialSource, SocialStats) {
        if let Some(direct) = raw.twitter.as_deref() {
            if is_usable_social_url(direct) {
                let stats = self.social.lookup(direct).await;
                return (Some(direct.to_owned()), SocialSource::Direct, stats);
            }
        }

        if let Some(uri) = raw.token_uri.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            let url =
                metadata::fetch_social_url(&self.metadata_http, uri, &self.metadata_cache).await;
            if !url.is_empty() {
                let stats = self.social.lookup(&url).await;
                return (Some(url), SocialSource::Metadata, stats);
            }
        }

        (None, SocialSource::None, SocialStats::None)
    }

    /// Worker loop: pull raw events off the sink and enrich them on the
    /// bounded pool.  Exits when the upstream sink closes or the dispatcher
    /// side of `out` is dropped.
    pub async fn run(
        self: Arc<Self>,
        mut raw_rx: broadcast::Receiver<RawToken>,
        out: mpsc::Sender<EnrichedToken>,
    ) {
        info!("enrichment engine started");
        loop {
            match raw_rx.recv().await {
                Ok(raw) => {
                    let Ok(permit) = Arc::clone(&self.concurrency).acquire_owned().await else {
                        break;
                    };
                    let engine = Arc::clone(&self);
                    let out = out.clone();
                    tokio::spawn(async move {
                        let token = engine.enrich(raw).await;
                        debug!(
                            token = %token.token_ticker,
                            processing_ms = token.processing_ms,
                            "token enriched"
                        );
                        if out.send(token).await.is_err() {
                            debug!("dispatcher closed, discarding enriched token");
                        }
                        drop(permit);
                    });
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Upstream sink overflowed: the oldest undelivered
                    // events were dropped.
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                    warn!(dropped = n, "enrichment lagging behind upstream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("enrichment engine stopped");
    }

    /// Total raw events dropped because the sink overflowed.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// A direct social field is usable when it actually carries a twitter/x URL
/// (the venue sometimes sends empty strings or a literal "null").
fn is_usable_social_url(url: &str) -> bool {
    let trimmed = url.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return false;
    }
    let lower = trimmed.to_lowercase();
    lower.contains("twitter.com") || lower.contains("x.com")
}
