//! Bet Limit Service
//!
//! Host-facing facade. One instance is constructed by the host at startup
//! and shared by `Arc`; there is no global. Setters write the shared
//! `ConnectionConfig` and take effect on the next message or attempt.

use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::{
    ConnectionConfig, LimiterConfig, Threshold, DEFAULT_BET_TIMEOUT_SECS, DEFAULT_MAX_BET_LIMIT,
};
use crate::eventsub::{
    session::{Session, SessionMetrics, SessionSnapshot},
    sinks::{NotificationCallback, Sinks, StatusCallback},
    url::UrlError,
    worker::{Command, WorkerContext, WorkerHandle},
    ConnectTrigger,
};

pub struct BetLimitService {
    settings: LimiterConfig,
    config: Arc<ConnectionConfig>,
    /// Session of the current worker; each `initialize` installs a fresh one
    session: ArcSwap<Session>,
    metrics: Arc<SessionMetrics>,
    sinks: Arc<Sinks>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl BetLimitService {
    pub fn new(settings: LimiterConfig) -> Arc<Self> {
        let config = ConnectionConfig::new(&settings);
        let metrics = Arc::new(SessionMetrics::new());
        let session = Session::with_metrics(settings.backoff_policy(), metrics.clone());
        Arc::new(Self {
            settings,
            config,
            session: ArcSwap::from_pointee(session),
            metrics,
            sinks: Sinks::new(),
            worker: Mutex::new(None),
        })
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Start the worker thread and connect immediately. A no-op if it is
    /// already running.
    pub fn initialize(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            debug!("eventsub worker already running");
            return Ok(());
        }

        // A worker retired from inside a sink callback may still be closing;
        // it keeps its own session and its reports are dropped from here on.
        let session = Arc::new(Session::with_metrics(
            self.settings.backoff_policy(),
            self.metrics.clone(),
        ));
        self.session.store(session.clone());
        let ctx = WorkerContext {
            session,
            config: self.config.clone(),
            sinks: self.sinks.clone(),
            generation: self.sinks.advance_generation(),
            watchdog_interval: self.settings.watchdog_interval(),
            connect_timeout: self.settings.connect_timeout(),
            liveness_ping: self.settings.liveness_ping,
        };
        let handle = WorkerHandle::spawn(ctx).context("failed to start eventsub worker")?;
        *worker = Some(handle);

        info!(url = %self.config.url(), threshold = %self.config.threshold(), "bet limiter initialized");
        Ok(())
    }

    /// Stop the worker: cancels any pending reconnect, closes the socket and
    /// reports disconnected.
    pub fn shutdown(&self) {
        // Join outside the lock; sink callbacks may call back in.
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.shutdown();
            info!(metrics = %self.metrics.summary(), "bet limiter shut down");
        }
    }

    /// Tear down and start over with a zero attempt counter. Clears a halted
    /// session.
    pub fn manual_reconnect(&self) -> Result<()> {
        info!("manual reconnect requested");
        self.shutdown();
        self.initialize()
    }

    /// Ask the running worker for a connection. Duplicates are absorbed.
    pub fn request_connect(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.request(Command::Connect(ConnectTrigger::Host));
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    // =========================================================================
    // CONFIGURATION
    // =========================================================================

    pub fn set_threshold(&self, enabled: bool, limit: u64) -> Threshold {
        self.config.set_threshold(enabled, limit)
    }

    pub fn set_threshold_enabled(&self, enabled: bool) -> Threshold {
        self.config.set_threshold_enabled(enabled)
    }

    pub fn set_limit(&self, limit: u64) -> Threshold {
        self.config.set_limit(limit)
    }

    pub fn set_timeout(&self, secs: u64) -> u64 {
        self.config.set_notification_duration(secs)
    }

    /// Empty input restores the default URL. An invalid URL is rejected and
    /// the current one kept. Applies from the next connection attempt.
    pub fn set_url(&self, url: &str) -> Result<Arc<String>, UrlError> {
        self.config.set_url(url)
    }

    pub fn reset_threshold(&self) -> Threshold {
        self.config.set_threshold(true, DEFAULT_MAX_BET_LIMIT)
    }

    pub fn reset_timeout(&self) -> u64 {
        self.config.set_notification_duration(DEFAULT_BET_TIMEOUT_SECS)
    }

    pub fn reset_url(&self) -> Arc<String> {
        self.config.reset_url()
    }

    pub fn get_threshold(&self) -> Threshold {
        self.config.threshold()
    }

    pub fn get_timeout(&self) -> u64 {
        self.config.notification_duration_secs()
    }

    pub fn get_url(&self) -> Arc<String> {
        self.config.url()
    }

    // =========================================================================
    // PORTS
    // =========================================================================

    /// Called with `true` on entering Listening and `false` on leaving it or
    /// on shutdown. Runs on the worker thread.
    pub fn register_status_callback<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        self.sinks.set_status(callback);
    }

    /// Called once per qualifying event with the warning text and display
    /// duration in seconds. Runs on the worker thread.
    pub fn register_notification_callback<F>(&self, callback: F)
    where
        F: Fn(&str, u64) + Send + Sync + 'static,
    {
        let callback: NotificationCallback = Arc::new(callback);
        self.sinks.set_notification(callback);
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    pub fn is_connected(&self) -> bool {
        self.session.load().is_connected()
    }

    pub fn status_text(&self) -> &'static str {
        if self.is_connected() {
            "Connected"
        } else {
            "Disconnected"
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.load().snapshot()
    }

    /// Counters across every worker this service has started
    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }
}

impl Drop for BetLimitService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
