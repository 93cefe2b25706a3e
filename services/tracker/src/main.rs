// tracker: Standalone runner — streams enriched tokens to the log.
//
// The production deployment embeds the tracker in the fan-out server; this
// binary exists for watching the pipeline without any subscribers.

use dt_protocol::DeployerStats;
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "tracker starting");

    let cfg = match config_from_args() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let mut tracker = match tracker::spawn(cfg) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("FATAL: failed to start tracker: {}", e);
            std::process::exit(1);
        }
    };

    run_loop(&mut tracker).await;
    tracker.stop().await;
}

async fn run_loop(tracker: &mut tracker::Tracker) {
    loop {
        tokio::select! {
            maybe = tracker.tokens.recv() => match maybe {
                Some(token) => {
                    match &token.dev {
                        DeployerStats::Ready(stats) => info!(
                            token = %token.token_ticker,
                            deployer = %token.deployer_address,
                            avg_mcap = stats.avg_mcap,
                            avg_ath_mcap = stats.avg_ath_mcap,
                            migrated = stats.migrated,
                            total = stats.total,
                            processing_ms = token.processing_ms,
                            "token enriched"
                        ),
                        DeployerStats::FirstToken => info!(
                            token = %token.token_ticker,
                            deployer = %token.deployer_address,
                            "first token of deployer"
                        ),
                        DeployerStats::Error { reason } => info!(
                            token = %token.token_ticker,
                            deployer = %token.deployer_address,
                            error = %reason,
                            "token enriched without deployer stats"
                        ),
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }
}

fn config_from_args() -> Result<tracker::TrackerConfig, tracker::config::ConfigError> {
    match std::env::args().nth(1) {
        Some(path) => tracker::config::load_config_from_path(std::path::Path::new(&path)),
        None => tracker::config::load_config(),
    }
}
