use chrono::DateTime;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid booking: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("resource already booked from {} to {}", fmt_ms(.start), fmt_ms(.end))]
    Conflict { booking_id: Ulid, start: Ms, end: Ms },
    #[error("cannot change booking status from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("store unavailable: {0}")]
    TransientStore(String),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("resource {0} is not accepting bookings")]
    ResourceUnavailable(Ulid),
    #[error("cannot delete resource {0}: it still has bookings")]
    HasBookings(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Only store failures are worth retrying; every other kind repeats the same decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientStore(_))
    }
}

/// Render an instant the way conflict messages show it: `2025-01-01 10:00:00` (UTC).
fn fmt_ms(ms: &Ms) -> String {
    match DateTime::from_timestamp_millis(*ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_shows_interval() {
        // 2025-01-01T10:00:00Z .. 11:00:00Z
        let err = EngineError::Conflict {
            booking_id: Ulid::new(),
            start: 1_735_725_600_000,
            end: 1_735_729_200_000,
        };
        assert_eq!(
            err.to_string(),
            "resource already booked from 2025-01-01 10:00:00 to 2025-01-01 11:00:00"
        );
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(EngineError::TransientStore("lock timeout".into()).is_retryable());
        assert!(!EngineError::NotFound(Ulid::new()).is_retryable());
        assert!(!EngineError::Validation("start must be before end".into()).is_retryable());
        assert!(
            !EngineError::InvalidTransition {
                from: BookingStatus::Cancelled,
                to: BookingStatus::Confirmed,
            }
            .is_retryable()
        );
    }
}
