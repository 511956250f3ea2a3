//! EventSub Module
//!
//! Resilient client for the Twitch EventSub WebSocket feed:
//! - url/backoff/filter: pure building blocks
//! - session: connection state tag, attempt counter, metrics
//! - worker: socket, reconnect timer and watchdog on one dedicated thread
//! - sinks: status and notification ports to the host

pub mod backoff;
pub mod filter;
pub mod session;
pub mod sinks;
pub mod url;
pub mod watchdog;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use filter::{Classification, FilterError, InboundEvent, NotificationRequest};
pub use session::{
    ConnectTrigger, ConnectionState, Session, SessionError, SessionMetrics, SessionSnapshot,
    TransitionReason,
};
pub use sinks::{NotificationCallback, Sinks, StatusCallback};
pub use url::{Endpoint, UrlError};
pub use watchdog::{Watchdog, WatchdogAction};
pub use worker::{Attempt, Command, Connect, TlsConnect, WorkerContext, WorkerHandle};
