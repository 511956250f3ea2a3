//! Limiter configuration
//!
//! `LimiterConfig` is the plain startup value (defaults + environment).
//! `ConnectionConfig` is the live, shared copy the host mutates while the
//! worker thread reads it; every field is a single atomic load.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::eventsub::backoff::{
    BackoffPolicy, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BACKOFF_CEILING_SECS, DEFAULT_MAX_ATTEMPTS,
};
use crate::eventsub::url;

pub const DEFAULT_WEBSOCKET_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
pub const DEFAULT_MAX_BET_LIMIT: u64 = 5_000;
pub const DEFAULT_BET_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WATCHDOG_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Host-facing limit range (settings panel bounds)
pub const MIN_BET_LIMIT: u64 = 100;
pub const MAX_BET_LIMIT: u64 = 100_000;
/// Host-facing notification duration range, in seconds
pub const MIN_BET_TIMEOUT_SECS: u64 = 5;
pub const MAX_BET_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// THRESHOLD
// =============================================================================

/// Bet limit: either a numeric ceiling or switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    Disabled,
    Limit(u64),
}

impl Threshold {
    /// `amount > limit`; always false when disabled.
    #[inline]
    pub fn is_exceeded_by(self, amount: u64) -> bool {
        match self {
            Self::Disabled => false,
            Self::Limit(limit) => amount > limit,
        }
    }

    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Limit(_))
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::Limit(DEFAULT_MAX_BET_LIMIT)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::Limit(limit) => write!(f, "{}", limit),
        }
    }
}

// =============================================================================
// STARTUP CONFIG
// =============================================================================

/// Startup configuration for the limiter service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub websocket_url: String,
    pub threshold: Threshold,
    pub notification_duration_secs: u64,

    // Backoff parameters
    pub backoff_base_secs: u64,
    pub backoff_ceiling_secs: u64,
    pub max_attempts: u32,

    // Liveness
    pub watchdog_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub liveness_ping: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
            threshold: Threshold::default(),
            notification_duration_secs: DEFAULT_BET_TIMEOUT_SECS,

            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            backoff_ceiling_secs: DEFAULT_BACKOFF_CEILING_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,

            watchdog_interval_secs: DEFAULT_WATCHDOG_INTERVAL_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            liveness_ping: true,
        }
    }
}

fn env_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "TRUE" | "on" | "ON" => Some(true),
        "0" | "false" | "FALSE" | "off" | "OFF" => Some(false),
        _ => None,
    }
}

impl LimiterConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("BETLIMIT_WEBSOCKET_URL") {
            if url::validate(&v) {
                config.websocket_url = v;
            } else {
                warn!(url = %v, "ignoring invalid BETLIMIT_WEBSOCKET_URL");
            }
        }
        if let Ok(v) = std::env::var("BETLIMIT_MAX_BET") {
            if let Ok(limit) = v.parse() {
                config.threshold = Threshold::Limit(limit);
            }
        }
        if let Ok(v) = std::env::var("BETLIMIT_LIMIT_ENABLED") {
            if env_flag(&v) == Some(false) {
                config.threshold = Threshold::Disabled;
            }
        }
        if let Ok(v) = std::env::var("BETLIMIT_TIMEOUT_SECS") {
            config.notification_duration_secs = v.parse().unwrap_or(config.notification_duration_secs);
        }
        if let Ok(v) = std::env::var("BETLIMIT_BACKOFF_BASE_SECS") {
            config.backoff_base_secs = v.parse().unwrap_or(config.backoff_base_secs);
        }
        if let Ok(v) = std::env::var("BETLIMIT_BACKOFF_CEILING_SECS") {
            config.backoff_ceiling_secs = v.parse().unwrap_or(config.backoff_ceiling_secs);
        }
        if let Ok(v) = std::env::var("BETLIMIT_MAX_ATTEMPTS") {
            config.max_attempts = v.parse().unwrap_or(config.max_attempts);
        }
        if let Ok(v) = std::env::var("BETLIMIT_WATCHDOG_SECS") {
            config.watchdog_interval_secs = v.parse().unwrap_or(config.watchdog_interval_secs);
        }
        if let Ok(v) = std::env::var("BETLIMIT_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout_secs = v.parse().unwrap_or(config.connect_timeout_secs);
        }
        if let Ok(v) = std::env::var("BETLIMIT_LIVENESS_PING") {
            config.liveness_ping = env_flag(&v).unwrap_or(config.liveness_ping);
        }

        config
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_base_secs),
            Duration::from_secs(self.backoff_ceiling_secs),
            self.max_attempts,
        )
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

// =============================================================================
// LIVE SHARED CONFIG
// =============================================================================

/// Threshold together with the last numeric limit, swapped as one value so a
/// toggle and a limit change can never interleave into a mixed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LimitState {
    threshold: Threshold,
    /// Restored when the limit is switched back on
    remembered: u64,
}

/// Live connection settings shared between the host thread and the worker.
#[derive(Debug)]
pub struct ConnectionConfig {
    url: ArcSwap<String>,
    limits: ArcSwap<LimitState>,
    notification_duration_secs: AtomicU64,
}

impl LimitState {
    fn new(enabled: bool, limit: u64) -> Self {
        let threshold = if enabled {
            Threshold::Limit(limit)
        } else {
            Threshold::Disabled
        };
        Self {
            threshold,
            remembered: limit,
        }
    }
}

fn clamp_limit(limit: u64) -> u64 {
    let clamped = limit.clamp(MIN_BET_LIMIT, MAX_BET_LIMIT);
    if clamped != limit {
        warn!(requested = limit, applied = clamped, "bet limit clamped");
    }
    clamped
}

impl ConnectionConfig {
    pub fn new(config: &LimiterConfig) -> Arc<Self> {
        let websocket_url = if url::validate(&config.websocket_url) {
            config.websocket_url.clone()
        } else {
            warn!(url = %config.websocket_url, "invalid websocket url, using default");
            DEFAULT_WEBSOCKET_URL.to_string()
        };
        let remembered = match config.threshold {
            Threshold::Limit(limit) => limit,
            Threshold::Disabled => DEFAULT_MAX_BET_LIMIT,
        };

        Arc::new(Self {
            url: ArcSwap::new(Arc::new(websocket_url)),
            limits: ArcSwap::from_pointee(LimitState {
                threshold: config.threshold,
                remembered,
            }),
            notification_duration_secs: AtomicU64::new(config.notification_duration_secs),
        })
    }

    #[inline]
    pub fn threshold(&self) -> Threshold {
        self.limits.load().threshold
    }

    #[inline]
    pub fn notification_duration_secs(&self) -> u64 {
        self.notification_duration_secs.load(Ordering::Acquire)
    }

    /// Snapshot of the current URL
    pub fn url(&self) -> Arc<String> {
        self.url.load_full()
    }

    /// Set both the enable flag and the limit. The limit is clamped into the
    /// host-facing range.
    pub fn set_threshold(&self, enabled: bool, limit: u64) -> Threshold {
        let clamped = clamp_limit(limit);
        self.update_limits(|_| LimitState::new(enabled, clamped))
    }

    /// Change the limit, keeping the current enable flag.
    pub fn set_limit(&self, limit: u64) -> Threshold {
        let clamped = clamp_limit(limit);
        self.update_limits(|current| LimitState::new(current.threshold.is_enabled(), clamped))
    }

    /// Toggle the limit on or off, keeping the last numeric value.
    pub fn set_threshold_enabled(&self, enabled: bool) -> Threshold {
        self.update_limits(|current| LimitState::new(enabled, current.remembered))
    }

    /// Compare-and-swap loop: `next` is re-run against the latest state if
    /// another writer got in first.
    fn update_limits(&self, next: impl Fn(&LimitState) -> LimitState) -> Threshold {
        let previous = self.limits.rcu(|current| next(current));
        let threshold = next(&previous).threshold;
        info!(threshold = %threshold, "bet_limit_updated");
        threshold
    }

    pub fn set_notification_duration(&self, secs: u64) -> u64 {
        let clamped = secs.clamp(MIN_BET_TIMEOUT_SECS, MAX_BET_TIMEOUT_SECS);
        if clamped != secs {
            warn!(requested = secs, applied = clamped, "bet timeout clamped");
        }
        self.notification_duration_secs
            .store(clamped, Ordering::Release);
        info!(seconds = clamped, "bet_timeout_updated");
        clamped
    }

    /// Accept `candidate` only if it validates; empty means "back to default".
    pub fn set_url(&self, candidate: &str) -> Result<Arc<String>, url::UrlError> {
        let candidate = candidate.trim();
        if candidate.is_empty() {
            return Ok(self.reset_url());
        }
        if let Some(reason) = url::rejection(candidate) {
            warn!(url = %candidate, current = %self.url(), reason = %reason, "rejected websocket url");
            return Err(reason);
        }
        let next = Arc::new(candidate.to_string());
        self.url.store(next.clone());
        info!(url = %next, "websocket_url_updated");
        Ok(next)
    }

    pub fn reset_url(&self) -> Arc<String> {
        let next = Arc::new(DEFAULT_WEBSOCKET_URL.to_string());
        self.url.store(next.clone());
        info!(url = %next, "websocket_url_reset");
        next
    }

    /// URL to use for the next connection attempt. An invalid stored value is
    /// replaced with the default before it is returned.
    pub fn connect_url(&self) -> Arc<String> {
        let current = self.url();
        if url::validate(&current) {
            current
        } else {
            warn!(url = %current, "invalid websocket url, reverting to default");
            self.reset_url()
        }
    }
}
