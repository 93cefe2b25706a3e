// server: Fan-out server — embeds the tracker and serves subscribers.

use server::config::ServerConfig;
use server::state::AppState;
use server::{db::Db, dispatch, stats};
use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "server starting");

    let cfg = match config_from_args() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let db = match Db::open(&cfg.registry.sqlite_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("FATAL: failed to open registry database: {}", e);
            std::process::exit(1);
        }
    };

    let tracker_cfg = match tracker::config::load_config_from_path(&cfg.tracker_config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load tracker config: {}", e);
            std::process::exit(1);
        }
    };
    let tracker = match tracker::spawn(tracker_cfg) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("FATAL: failed to start tracker: {}", e);
            std::process::exit(1);
        }
    };
    info!("tracker pipeline started");

    let state = AppState::new(db);
    tokio::spawn(dispatch::run_dispatch(state.clone(), tracker.tokens));
    tokio::spawn(stats::run_stats_loop(state.clone(), cfg.stats_interval));
    tokio::spawn(stats::run_log_cleanup(
        state.clone(),
        cfg.registry.log_retention_days,
    ));

    let listener = match tokio::net::TcpListener::bind(&cfg.bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: failed to bind {}: {}", cfg.bind, e);
            std::process::exit(1);
        }
    };
    info!(bind = %cfg.bind, "listening for subscribers");

    if let Err(e) = server::serve(listener, state).await {
        eprintln!("FATAL: server error: {}", e);
        std::process::exit(1);
    }
}

fn config_from_args() -> Result<ServerConfig, server::config::ConfigError> {
    match std::env::args().nth(1) {
        Some(path) => server::config::load_config_from_path(std::path::Path::new(&path)),
        None => server::config::load_config(),
    }
}
