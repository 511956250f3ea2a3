//! EventSub message filter
//!
//! Turns one inbound frame into at most one `NotificationRequest`.
//! Only three paths are read: `type`, `subscription.type`, `event.reward.cost`.
//! Anything else in the payload is ignored; structural surprises downgrade to
//! `Classification::Ignored` and never reach the connection loop as errors.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Threshold;

pub const EVENTSUB_TYPE_NOTIFICATION: &str = "notification";
pub const EVENTSUB_BET_EVENT: &str = "channel.channel_points_custom_reward_redemption.add";
pub const BET_LIMIT_WARNING: &str = "Bet exceeds limit! Max: ";

/// Top-level message tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Notification,
    Other(String),
}

/// One parsed inbound message; lives for a single read cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub subscription_type: Option<String>,
    pub amount: Option<u64>,
}

/// Why a well-formed message was not acted on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    NotNotification,
    MissingSubscriptionType,
    OtherSubscription,
    MissingAmount,
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotNotification => write!(f, "not_notification"),
            Self::MissingSubscriptionType => write!(f, "missing_subscription_type"),
            Self::OtherSubscription => write!(f, "other_subscription"),
            Self::MissingAmount => write!(f, "missing_amount"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Redemption event carrying this amount
    Qualifies(u64),
    Ignored(IgnoreReason),
}

/// Request for the host to show a time-boxed warning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRequest {
    pub message: String,
    pub duration_secs: u64,
    pub amount: u64,
    pub raised_at: DateTime<Utc>,
}

/// Errors during message parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    MalformedJson(String),
    MissingField(&'static str),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedJson(e) => write!(f, "malformed json: {}", e),
            Self::MissingField(field) => write!(f, "missing or non-string field: {}", field),
        }
    }
}

impl std::error::Error for FilterError {}

/// Parse a raw payload. Fails on invalid JSON or a missing/non-string `type`.
pub fn parse_message(bytes: &[u8]) -> Result<InboundEvent, FilterError> {
    let json: Value =
        serde_json::from_slice(bytes).map_err(|e| FilterError::MalformedJson(e.to_string()))?;

    let kind = match json.get("type").and_then(Value::as_str) {
        Some(EVENTSUB_TYPE_NOTIFICATION) => EventKind::Notification,
        Some(other) => EventKind::Other(other.to_string()),
        None => return Err(FilterError::MissingField("type")),
    };

    let subscription_type = json
        .pointer("/subscription/type")
        .and_then(Value::as_str)
        .map(str::to_string);

    let amount = json.pointer("/event/reward/cost").and_then(reward_cost);

    Ok(InboundEvent {
        kind,
        subscription_type,
        amount,
    })
}

/// Non-negative integer cost. Floats count only when integral (`7500.0`).
fn reward_cost(value: &Value) -> Option<u64> {
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|cost| *cost >= 0.0 && cost.fract() == 0.0 && *cost < u64::MAX as f64)
            .map(|cost| cost as u64)
    })
}

pub fn classify(event: &InboundEvent) -> Classification {
    if event.kind != EventKind::Notification {
        return Classification::Ignored(IgnoreReason::NotNotification);
    }
    match event.subscription_type.as_deref() {
        None => return Classification::Ignored(IgnoreReason::MissingSubscriptionType),
        Some(EVENTSUB_BET_EVENT) => {}
        Some(_) => return Classification::Ignored(IgnoreReason::OtherSubscription),
    }
    match event.amount {
        Some(amount) => Classification::Qualifies(amount),
        None => Classification::Ignored(IgnoreReason::MissingAmount),
    }
}

#[inline]
pub fn exceeds_threshold(amount: u64, threshold: Threshold) -> bool {
    threshold.is_exceeded_by(amount)
}

/// Full pipeline for one frame. `Ok(None)` covers both ignored messages and
/// qualifying amounts under the limit.
pub fn evaluate(
    bytes: &[u8],
    threshold: Threshold,
    duration_secs: u64,
) -> Result<Option<NotificationRequest>, FilterError> {
    let event = parse_message(bytes)?;

    let amount = match classify(&event) {
        Classification::Qualifies(amount) => amount,
        Classification::Ignored(reason) => {
            debug!(reason = %reason, kind = ?event.kind, "message_ignored");
            return Ok(None);
        }
    };

    if !exceeds_threshold(amount, threshold) {
        debug!(amount, threshold = %threshold, "bet_within_limit");
        return Ok(None);
    }

    info!(amount, threshold = %threshold, duration_secs, "bet_limit_exceeded");
    Ok(Some(NotificationRequest {
        message: format!("{}{}", BET_LIMIT_WARNING, threshold),
        duration_secs,
        amount,
        raised_at: Utc::now(),
    }))
}
