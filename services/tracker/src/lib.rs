// tracker: Library entry point.
// Exposes modules for integration testing.

pub mod auth;
pub mod cache;
pub mod config;
pub mod enrich;
pub mod upstream;

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use dt_protocol::EnrichedToken;

pub use config::TrackerConfig;
pub use enrich::EnrichmentEngine;
pub use upstream::{UpstreamSession, UpstreamState};

/// Depth of the enriched-token channel into the dispatcher.
const TOKEN_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error(transparent)]
    Auth(#[from] auth::AuthError),
    #[error("building HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// A running tracker: upstream session plus enrichment engine.
///
/// `tokens` yields enriched tokens in completion order, which is not
/// necessarily upstream arrival order.
pub struct Tracker {
    pub tokens: mpsc::Receiver<EnrichedToken>,
    upstream: UpstreamSession,
    engine: Arc<EnrichmentEngine>,
}

impl Tracker {
    /// The upstream session's lifecycle state, for observability.
    pub fn upstream_state(&self) -> watch::Receiver<UpstreamState> {
        self.upstream.state()
    }

    /// Raw events dropped because enrichment fell behind the upstream sink.
    pub fn dropped_events(&self) -> u64 {
        self.engine.dropped_events()
    }

    /// Stop the upstream session.  In-flight enrichments complete and are
    /// discarded once the token receiver is dropped.
    pub async fn stop(self) {
        self.upstream.stop().await;
    }
}

/// Wire up and start the full tracker pipeline.
pub fn spawn(cfg: TrackerConfig) -> Result<Tracker, SpawnError> {
    let auth_http = reqwest::Client::builder()
        .user_agent(cfg.enrichment.user_agent.clone())
        .build()?;
    let auth = Arc::new(auth::AuthSession::load(cfg.auth.clone(), auth_http)?);
    let engine = Arc::new(EnrichmentEngine::new(&cfg, Arc::clone(&auth))?);

    let (upstream, raw_rx) = UpstreamSession::start(cfg.upstream.clone(), auth);
    let (token_tx, token_rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
    tokio::spawn(Arc::clone(&engine).run(raw_rx, token_tx));

    Ok(Tracker {
        tokens: token_rx,
        upstream,
        engine,
    })
}
