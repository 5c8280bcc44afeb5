//! Pure transitions over a [`CallbackRow`]. No I/O, no clock reads beyond
//! the `now` passed in by the caller, so a transition is fully determined
//! by (row, outcome, now) and testable without a database.

use chrono::{DateTime, Utc};

use crate::models::CallbackRow;

/// Outcome of a single HTTP delivery attempt (C2's contract).
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Ok,
    Err(String),
}

/// Outcome of a single bus publish attempt (C4's contract).
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    Ok,
    Err(String),
}

/// Applies the delivery-leg transition to `row`, in place.
///
/// `attempts' = attempts + 1`; on success the row becomes terminal
/// (`Delivered`); on failure it is either rescheduled with linear backoff
/// and a fresh publish budget, or abandoned once `max_delivery_attempts`
/// is reached.
pub fn apply_delivery_outcome(
    row: &mut CallbackRow,
    outcome: SendOutcome,
    now: DateTime<Utc>,
    max_delivery_attempts: i32,
    delivery_retry_delay_ms: i64,
) {
    row.delivery_attempts += 1;
    row.updated_at = now;

    match outcome {
        SendOutcome::Ok => {
            row.delivered_at = Some(now);
            row.scheduled_at = None;
            row.error = None;
        }
        SendOutcome::Err(e) => {
            if row.delivery_attempts >= max_delivery_attempts {
                row.scheduled_at = None;
                row.error = Some(format!("Max delivery attempts reached. {e}"));
            } else {
                let delay = chrono::Duration::milliseconds(row.delivery_attempts as i64 * delivery_retry_delay_ms);
                row.scheduled_at = Some(now + delay);
                row.error = Some(e);
                row.publish_attempts = 0;
            }
        }
    }
}

/// Applies the publish-leg transition to `row`, in place.
pub fn apply_publish_outcome(
    row: &mut CallbackRow,
    outcome: PublishOutcome,
    now: DateTime<Utc>,
    max_publish_attempts: i32,
    publish_retry_delay_ms: i64,
) {
    row.publish_attempts += 1;
    row.updated_at = now;

    match outcome {
        PublishOutcome::Ok => {
            row.scheduled_at = None;
            row.error = None;
        }
        PublishOutcome::Err(e) => {
            row.error = Some(e);
            if row.publish_attempts >= max_publish_attempts {
                row.scheduled_at = None;
            } else {
                let delay = chrono::Duration::milliseconds(row.publish_attempts as i64 * publish_retry_delay_ms);
                row.scheduled_at = Some(now + delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn row_at(now: DateTime<Utc>) -> CallbackRow {
        CallbackRow::new(Uuid::new_v4(), Uuid::new_v4(), "http://ok/cb".into(), json!({"status": "successful"}), now)
    }

    #[test]
    fn delivery_success_is_terminal() {
        let now = Utc::now();
        let mut row = row_at(now);
        apply_delivery_outcome(&mut row, SendOutcome::Ok, now, 3, 10_000);

        assert_eq!(row.delivery_attempts, 1);
        assert!(row.delivered_at.is_some());
        assert!(row.scheduled_at.is_none());
        assert!(row.error.is_none());
    }

    #[test]
    fn delivery_failure_reschedules_with_linear_backoff_and_resets_publish_budget() {
        let now = Utc::now();
        let mut row = row_at(now);
        row.publish_attempts = 2;

        apply_delivery_outcome(&mut row, SendOutcome::Err("error response: 500".into()), now, 3, 10_000);

        assert_eq!(row.delivery_attempts, 1);
        assert_eq!(row.publish_attempts, 0);
        assert!(row.delivered_at.is_none());
        assert_eq!(row.scheduled_at, Some(now + chrono::Duration::milliseconds(10_000)));
        assert_eq!(row.error.as_deref(), Some("error response: 500"));
    }

    #[test]
    fn delivery_failure_abandons_at_budget() {
        let now = Utc::now();
        let mut row = row_at(now);
        row.delivery_attempts = 2;

        apply_delivery_outcome(&mut row, SendOutcome::Err("error response: 500".into()), now, 3, 10_000);

        assert_eq!(row.delivery_attempts, 3);
        assert!(row.scheduled_at.is_none());
        assert!(row.delivered_at.is_none());
        assert_eq!(row.error.as_deref(), Some("Max delivery attempts reached. error response: 500"));
        assert!(row.is_abandoned());
    }

    #[test]
    fn publish_success_clears_schedule() {
        let now = Utc::now();
        let mut row = row_at(now);

        apply_publish_outcome(&mut row, PublishOutcome::Ok, now, 3, 10_000);

        assert_eq!(row.publish_attempts, 1);
        assert!(row.scheduled_at.is_none());
        assert!(row.error.is_none());
    }

    #[test]
    fn publish_failure_reschedules_then_abandons_at_budget() {
        let now = Utc::now();
        let mut row = row_at(now);

        apply_publish_outcome(&mut row, PublishOutcome::Err("bus down".into()), now, 3, 10_000);
        assert_eq!(row.publish_attempts, 1);
        assert_eq!(row.scheduled_at, Some(now + chrono::Duration::milliseconds(10_000)));

        apply_publish_outcome(&mut row, PublishOutcome::Err("bus down".into()), now, 3, 10_000);
        assert_eq!(row.publish_attempts, 2);
        assert_eq!(row.scheduled_at, Some(now + chrono::Duration::milliseconds(20_000)));

        apply_publish_outcome(&mut row, PublishOutcome::Err("bus down".into()), now, 3, 10_000);
        assert_eq!(row.publish_attempts, 3);
        assert!(row.scheduled_at.is_none(), "abandoned once budget exhausted");
    }

    #[test]
    fn transition_is_deterministic() {
        let now = Utc::now();
        let mut a = row_at(now);
        let mut b = a.clone();

        apply_delivery_outcome(&mut a, SendOutcome::Err("x".into()), now, 3, 10_000);
        apply_delivery_outcome(&mut b, SendOutcome::Err("x".into()), now, 3, 10_000);

        assert_eq!(a, b);
    }
}
