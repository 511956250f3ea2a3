//! BetLimit EventSub Library
//!
//! Watches a Twitch EventSub WebSocket for channel-point redemptions and
//! raises a time-boxed warning whenever a bet exceeds the configured limit.
//! The host owns one `BetLimitService` and wires the two sinks.

pub mod config;
pub mod eventsub;
pub mod service;

pub use config::{ConnectionConfig, LimiterConfig, Threshold};
pub use service::BetLimitService;
