//! EventSub Session State Machine
//!
//! One owned value holds the connection tag, the reconnect attempt counter,
//! the pending-timer marker and the halted flag, so they cannot drift apart.
//! The worker drives transitions; the host only reads.
//!
//! Lifecycle:
//! Disconnected → Resolving → Connecting → HandshakeInFlight → Listening
//! Any failure drops back to Disconnected and goes through `schedule` again.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; a reconnect may be pending
    Disconnected,
    /// DNS lookup in flight
    Resolving,
    /// TCP connect in flight
    Connecting,
    /// TLS + WebSocket upgrade in flight
    HandshakeInFlight,
    /// Upgraded and reading frames
    Listening,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "DISCONNECTED"),
            Self::Resolving => write!(f, "RESOLVING"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::HandshakeInFlight => write!(f, "HANDSHAKE"),
            Self::Listening => write!(f, "LISTENING"),
        }
    }
}

/// Reason for state transition (for logging/metrics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    BackoffElapsed,
    Resolved,
    TcpConnected,
    HandshakeOk,
    ResolutionFailure,
    ConnectFailure,
    HandshakeFailure,
    ReadFailure,
    ServerClose,
    StaleConnection,
    AttemptsExhausted,
    ShutdownRequested,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BackoffElapsed => write!(f, "backoff_elapsed"),
            Self::Resolved => write!(f, "resolved"),
            Self::TcpConnected => write!(f, "tcp_connected"),
            Self::HandshakeOk => write!(f, "handshake_ok"),
            Self::ResolutionFailure => write!(f, "resolution_failure"),
            Self::ConnectFailure => write!(f, "connect_failure"),
            Self::HandshakeFailure => write!(f, "handshake_failure"),
            Self::ReadFailure => write!(f, "read_failure"),
            Self::ServerClose => write!(f, "server_close"),
            Self::StaleConnection => write!(f, "stale_connection"),
            Self::AttemptsExhausted => write!(f, "attempts_exhausted"),
            Self::ShutdownRequested => write!(f, "shutdown"),
        }
    }
}

/// What asked for a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectTrigger {
    /// `initialize()` or manual reconnect: connect immediately
    Startup,
    /// A failure in the current chain: wait out the backoff
    Failure(TransitionReason),
    /// Health watchdog found the session disconnected
    Watchdog,
    /// Host asked for a connection outside of initialize/reconnect
    Host,
}

impl fmt::Display for ConnectTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => write!(f, "startup"),
            Self::Failure(reason) => write!(f, "{}", reason),
            Self::Watchdog => write!(f, "watchdog"),
            Self::Host => write!(f, "host"),
        }
    }
}

/// Outcome of `Session::schedule`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Reconnect timer should be armed for `delay`
    Armed { attempt: u32, delay: Duration },
    /// A timer is already armed; duplicate trigger
    AlreadyPending,
    /// An attempt is in flight or the session is listening; duplicate trigger
    AlreadyActive(ConnectionState),
    /// Attempt ceiling reached; automation stops until manual reconnect
    Halted { attempts: u32 },
}

// =============================================================================
// ERRORS
// =============================================================================

/// Connection-level failures. All are recovered inside the worker.
#[derive(Debug)]
pub enum SessionError {
    InvalidUrl(String),
    ResolutionFailure(String),
    ConnectFailure(String),
    HandshakeFailure(String),
    ReadFailure(String),
    Timeout(TransitionReason),
    AutomationHalted { attempts: u32 },
}

impl SessionError {
    /// Failure class, for transitions and metrics
    pub fn reason(&self) -> TransitionReason {
        match self {
            Self::InvalidUrl(_) | Self::ResolutionFailure(_) => TransitionReason::ResolutionFailure,
            Self::ConnectFailure(_) => TransitionReason::ConnectFailure,
            Self::HandshakeFailure(_) => TransitionReason::HandshakeFailure,
            Self::ReadFailure(_) => TransitionReason::ReadFailure,
            Self::Timeout(reason) => *reason,
            Self::AutomationHalted { .. } => TransitionReason::AttemptsExhausted,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUrl(e) => write!(f, "invalid url: {}", e),
            Self::ResolutionFailure(e) => write!(f, "failed to resolve host: {}", e),
            Self::ConnectFailure(e) => write!(f, "tcp connect failed: {}", e),
            Self::HandshakeFailure(e) => write!(f, "websocket handshake failed: {}", e),
            Self::ReadFailure(e) => write!(f, "websocket read failed: {}", e),
            Self::Timeout(reason) => write!(f, "timed out ({})", reason),
            Self::AutomationHalted { attempts } => {
                write!(f, "automatic reconnect halted after {} attempts", attempts)
            }
        }
    }
}

impl std::error::Error for SessionError {}

// =============================================================================
// SESSION METRICS
// =============================================================================

/// Session metrics for monitoring
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub connections_attempted: AtomicU64,
    pub connections_succeeded: AtomicU64,
    pub resolution_failures: AtomicU64,
    pub connect_failures: AtomicU64,
    pub handshake_failures: AtomicU64,
    pub read_failures: AtomicU64,
    pub stale_connections: AtomicU64,
    pub watchdog_triggers: AtomicU64,
    pub duplicate_triggers: AtomicU64,
    pub halts: AtomicU64,
    pub messages_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub notifications_raised: AtomicU64,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, reason: TransitionReason) {
        match reason {
            TransitionReason::ResolutionFailure => Self::bump(&self.resolution_failures),
            TransitionReason::ConnectFailure => Self::bump(&self.connect_failures),
            TransitionReason::HandshakeFailure => Self::bump(&self.handshake_failures),
            TransitionReason::ReadFailure | TransitionReason::ServerClose => {
                Self::bump(&self.read_failures)
            }
            TransitionReason::StaleConnection => Self::bump(&self.stale_connections),
            _ => {}
        }
    }

    #[inline]
    pub fn record_watchdog_trigger(&self) {
        Self::bump(&self.watchdog_triggers);
    }

    #[inline]
    pub fn record_duplicate_trigger(&self) {
        Self::bump(&self.duplicate_triggers);
    }

    #[inline]
    pub fn record_message(&self) {
        Self::bump(&self.messages_received);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        Self::bump(&self.parse_errors);
    }

    #[inline]
    pub fn record_notification(&self) {
        Self::bump(&self.notifications_raised);
    }

    /// Summary string for logging
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} resolve_fail={} connect_fail={} handshake_fail={} read_fail={} stale={} watchdog={} dup_triggers={} halts={} messages={} parse_errors={} notifications={}",
            self.connections_succeeded.load(Ordering::Relaxed),
            self.connections_attempted.load(Ordering::Relaxed),
            self.resolution_failures.load(Ordering::Relaxed),
            self.connect_failures.load(Ordering::Relaxed),
            self.handshake_failures.load(Ordering::Relaxed),
            self.read_failures.load(Ordering::Relaxed),
            self.stale_connections.load(Ordering::Relaxed),
            self.watchdog_triggers.load(Ordering::Relaxed),
            self.duplicate_triggers.load(Ordering::Relaxed),
            self.halts.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
            self.parse_errors.load(Ordering::Relaxed),
            self.notifications_raised.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Debug)]
struct Machine {
    state: ConnectionState,
    attempt: u32,
    halted: bool,
    /// Delay of the armed reconnect timer, if one is armed
    reconnect_delay: Option<Duration>,
    connected_since: Option<DateTime<Utc>>,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            halted: false,
            reconnect_delay: None,
            connected_since: None,
        }
    }
}

/// Point-in-time view of the session for the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub attempt: u32,
    pub halted: bool,
    pub reconnect_pending: bool,
    pub reconnect_delay: Option<Duration>,
    pub connected_since: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Session {
    policy: BackoffPolicy,
    machine: RwLock<Machine>,
    metrics: Arc<SessionMetrics>,
}

impl Session {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self::with_metrics(policy, Arc::new(SessionMetrics::new()))
    }

    /// Fresh session that records into `metrics`, so counters survive
    /// across worker restarts.
    pub fn with_metrics(policy: BackoffPolicy, metrics: Arc<SessionMetrics>) -> Self {
        Self {
            policy,
            machine: RwLock::new(Machine::new()),
            metrics,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.read().state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Listening
    }

    pub fn attempt(&self) -> u32 {
        self.machine.read().attempt
    }

    pub fn is_halted(&self) -> bool {
        self.machine.read().halted
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let machine = self.machine.read();
        SessionSnapshot {
            state: machine.state,
            attempt: machine.attempt,
            halted: machine.halted,
            reconnect_pending: machine.reconnect_delay.is_some(),
            reconnect_delay: machine.reconnect_delay,
            connected_since: machine.connected_since,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Back to a fresh Disconnected session with a zero attempt counter.
    pub fn reset(&self) {
        *self.machine.write() = Machine::new();
    }

    /// Decide whether to arm the reconnect timer. On `Armed` the attempt
    /// counter has already been incremented and the timer marked pending.
    pub fn schedule(&self, trigger: ConnectTrigger) -> ScheduleDecision {
        let mut machine = self.machine.write();

        if machine.state != ConnectionState::Disconnected {
            self.metrics.record_duplicate_trigger();
            return ScheduleDecision::AlreadyActive(machine.state);
        }
        if machine.reconnect_delay.is_some() {
            self.metrics.record_duplicate_trigger();
            return ScheduleDecision::AlreadyPending;
        }
        if !self.policy.should_retry(machine.attempt) {
            if !machine.halted {
                machine.halted = true;
                self.metrics.halts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    attempts = machine.attempt,
                    trigger = %trigger,
                    "automation_halted, manual reconnect required"
                );
            } else {
                debug!(attempts = machine.attempt, trigger = %trigger, "automation_halted");
            }
            return ScheduleDecision::Halted {
                attempts: machine.attempt,
            };
        }

        // Immediate connects still consume an attempt, so the first failure
        // after one waits on the second backoff tier.
        let delay = match trigger {
            ConnectTrigger::Startup | ConnectTrigger::Host => Duration::ZERO,
            ConnectTrigger::Failure(_) | ConnectTrigger::Watchdog => {
                self.policy.next_delay(machine.attempt)
            }
        };
        machine.attempt += 1;
        machine.reconnect_delay = Some(delay);

        info!(
            attempt = machine.attempt,
            delay_ms = delay.as_millis() as u64,
            trigger = %trigger,
            "reconnect_scheduled"
        );
        ScheduleDecision::Armed {
            attempt: machine.attempt,
            delay,
        }
    }

    /// Reconnect timer was cancelled before firing.
    pub fn cancel_pending(&self) {
        self.machine.write().reconnect_delay = None;
    }

    /// Reconnect timer fired: clear the marker and enter Resolving.
    pub fn begin_attempt(&self) {
        self.machine.write().reconnect_delay = None;
        self.metrics
            .connections_attempted
            .fetch_add(1, Ordering::Relaxed);
        self.transition(ConnectionState::Resolving, TransitionReason::BackoffElapsed);
    }

    /// Transition to new state with reason; returns the previous state.
    pub fn transition(&self, new_state: ConnectionState, reason: TransitionReason) -> ConnectionState {
        let (old_state, attempt) = {
            let mut machine = self.machine.write();
            let old = machine.state;
            machine.state = new_state;

            match new_state {
                ConnectionState::Listening => {
                    machine.attempt = 0;
                    machine.halted = false;
                    machine.connected_since = Some(Utc::now());
                }
                ConnectionState::Disconnected => {
                    machine.connected_since = None;
                }
                _ => {}
            }
            (old, machine.attempt)
        };

        if new_state == ConnectionState::Listening {
            self.metrics
                .connections_succeeded
                .fetch_add(1, Ordering::Relaxed);
        }
        if new_state == ConnectionState::Disconnected {
            self.metrics.record_failure(reason);
        }

        info!(
            from = %old_state,
            to = %new_state,
            reason = %reason,
            attempt,
            "session_transition"
        );
        old_state
    }
}

// =============================================================================
// TESTS
// =============================================================================
