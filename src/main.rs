//! BetLimit Host Binary
//!
//! Runs the limiter against the EventSub feed and prints status changes and
//! bet warnings to the log until Ctrl-C.
//!
//! Usage:
//!   betlimit --limit 7500 --timeout 45
//!
//! Environment:
//!   BETLIMIT_WEBSOCKET_URL - EventSub endpoint (default: wss://eventsub.wss.twitch.tv/ws)
//!   BETLIMIT_MAX_BET - Bet limit (default: 5000)
//!   BETLIMIT_TIMEOUT_SECS - Warning display time in seconds (default: 30)
//!   RUST_LOG - Log filter (default: betlimit_eventsub=debug,betlimit=info)

use anyhow::Result;
use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use betlimit_eventsub::{BetLimitService, LimiterConfig};

#[derive(Parser, Debug)]
#[command(name = "betlimit")]
#[command(about = "Twitch EventSub bet limit watcher")]
struct Args {
    /// EventSub WebSocket URL (wss only)
    #[arg(long, env = "BETLIMIT_WEBSOCKET_URL")]
    url: Option<String>,

    /// Maximum bet before a warning is raised
    #[arg(long, env = "BETLIMIT_MAX_BET")]
    limit: Option<u64>,

    /// Turn the limit off entirely
    #[arg(long, default_value = "false")]
    disable_limit: bool,

    /// Warning display time in seconds
    #[arg(long, env = "BETLIMIT_TIMEOUT_SECS")]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("betlimit_eventsub=debug,betlimit=info")),
        )
        .init();

    let args = Args::parse();
    let service = BetLimitService::new(LimiterConfig::from_env());

    if let Some(url) = args.url.as_deref() {
        if let Err(e) = service.set_url(url) {
            warn!(url, error = %e, "ignoring --url");
        }
    }
    if let Some(limit) = args.limit {
        service.set_limit(limit);
    }
    if args.disable_limit {
        service.set_threshold_enabled(false);
    }
    if let Some(timeout) = args.timeout {
        service.set_timeout(timeout);
    }

    service.register_status_callback(|connected| {
        info!(status = if connected { "Connected" } else { "Disconnected" }, "eventsub status");
    });
    service.register_notification_callback(|message, duration_secs| {
        warn!(duration_secs, "{}", message);
    });

    info!("Starting bet limiter");
    info!("  URL: {}", service.get_url());
    info!("  Limit: {}", service.get_threshold());
    info!("  Timeout: {}s", service.get_timeout());

    service.initialize()?;

    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown signal received");

    // The worker join blocks; keep it off the async executor.
    let stopping = service.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown()).await?;

    info!("Bet limiter stopped");
    Ok(())
}
