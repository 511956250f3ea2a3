//! Outbound ports to the host
//!
//! Callbacks run on the worker thread. Calling back into the service from
//! inside one is allowed, but `shutdown`/`manual_reconnect` will not wait for
//! the worker to exit when invoked from that thread. Each worker reports under
//! the generation it was started with; once a newer worker starts, anything a
//! retired one still emits is dropped.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;

use super::filter::NotificationRequest;

pub type StatusCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type NotificationCallback = Arc<dyn Fn(&str, u64) + Send + Sync>;

/// Registered host callbacks; either may be absent.
#[derive(Default)]
pub struct Sinks {
    status: RwLock<Option<StatusCallback>>,
    notification: RwLock<Option<NotificationCallback>>,
    generation: AtomicU64,
}

impl Sinks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, callback: StatusCallback) {
        *self.status.write() = Some(callback);
    }

    pub fn set_notification(&self, callback: NotificationCallback) {
        *self.notification.write() = Some(callback);
    }

    /// Start a new worker generation and return its number.
    pub fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    pub fn notify_status(&self, connected: bool) {
        // Clone out of the lock so a callback may re-register without deadlocking.
        let callback = self.status.read().clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }

    pub fn notify(&self, request: &NotificationRequest) {
        let callback = self.notification.read().clone();
        if let Some(callback) = callback {
            callback(&request.message, request.duration_secs);
        }
    }
}

impl std::fmt::Debug for Sinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sinks")
            .field("status", &self.status.read().is_some())
            .field("notification", &self.notification.read().is_some())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unregistered_sinks_are_noops() {
        let sinks = Sinks::new();
        sinks.notify_status(true);
        sinks.notify(&NotificationRequest {
            message: "x".to_string(),
            duration_secs: 1,
            amount: 2,
            raised_at: chrono::Utc::now(),
        });
    }

    #[test]
    fn test_registered_sinks_receive_values() {
        let sinks = Sinks::new();
        let seen = Arc::new(AtomicU64::new(0));

        let seen_status = seen.clone();
        sinks.set_status(Arc::new(move |connected| {
            if connected {
                seen_status.fetch_add(1, Ordering::SeqCst);
            }
        }));
        let seen_notify = seen.clone();
        sinks.set_notification(Arc::new(move |message, duration| {
            assert!(message.starts_with("Bet exceeds limit!"));
            seen_notify.fetch_add(duration, Ordering::SeqCst);
        }));

        sinks.notify_status(true);
        sinks.notify(&NotificationRequest {
            message: "Bet exceeds limit! Max: 5000".to_string(),
            duration_secs: 30,
            amount: 7500,
            raised_at: chrono::Utc::now(),
        });
        assert_eq!(seen.load(Ordering::SeqCst), 31);
    }

    #[test]
    fn test_generations_advance() {
        let sinks = Sinks::new();
        assert!(sinks.is_current(0));
        assert_eq!(sinks.advance_generation(), 1);
        assert!(!sinks.is_current(0));
        assert!(sinks.is_current(1));
    }
}
