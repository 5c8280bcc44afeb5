use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The sole persisted entity: a durable record of one outbound callback.
///
/// `scheduled_at = NULL` means the row is not eligible for work. Either it
/// is terminal (`delivered_at` set, or abandoned), or it is currently
/// claimed by a worker between a publish and the next state update.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CallbackRow {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub url: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivery_attempts: i32,
    pub publish_attempts: i32,
    pub error: Option<String>,
}

impl CallbackRow {
    /// Construct a freshly ingested row: due immediately, no attempts yet.
    pub fn new(id: Uuid, payment_id: Uuid, url: String, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payment_id,
            url,
            payload,
            created_at: now,
            updated_at: now,
            scheduled_at: Some(now),
            delivered_at: None,
            delivery_attempts: 0,
            publish_attempts: 0,
            error: None,
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered_at.is_some()
    }

    pub fn is_abandoned(&self) -> bool {
        self.delivered_at.is_none() && self.scheduled_at.is_none() && self.error.is_some()
    }
}

/// `{id: uuid, event: string, payload: {...}}` consumed from `payment-events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: Uuid,
    pub event: String,
    pub payload: PaymentEventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEventPayload {
    pub id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "callbackUrl")]
    pub callback_url: String,
}

/// Canonical body posted to the customer endpoint, and the JSON stashed in
/// `CallbackRow::payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackBody {
    pub id: Uuid,
    #[serde(rename = "paymentId")]
    pub payment_id: Uuid,
    pub status: String,
}

/// Value published on `callback-messages`, keyed by `payment_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackMessage {
    pub id: Uuid,
    #[serde(rename = "paymentId")]
    pub payment_id: Uuid,
    pub url: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

/// Statuses from `payment-events` that produce a callback row. Every other
/// status is dropped and counted.
pub const NOTIFIABLE_STATUSES: &[&str] = &["successful", "failed"];
