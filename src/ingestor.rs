//! Event ingestor (C3): consumes `payment-events`, filters by status, and
//! inserts a `CallbackRow` with an initial due time.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use event_bus::{BusMessage, EventBus};
use futures::StreamExt;

use crate::error::CallbackError;
use crate::metrics::CALLBACK_INGEST_TOTAL;
use crate::models::{CallbackBody, CallbackRow, PaymentEvent, NOTIFIABLE_STATUSES};
use crate::store::Store;

const PAYMENT_EVENTS_SUBJECT: &str = "payment.events.raw";

/// Subscribes to `payment-events` and feeds [`ingest_one`] until `shutdown`
/// fires. Logs and keeps consuming on any per-message error; a poison pill
/// must not halt the rest of the pipeline.
pub async fn run(bus: Arc<dyn EventBus>, store: Store, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut stream = match bus.subscribe(PAYMENT_EVENTS_SUBJECT).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, subject = PAYMENT_EVENTS_SUBJECT, "failed to subscribe to payment events");
            return;
        }
    };

    tracing::info!(subject = PAYMENT_EVENTS_SUBJECT, "event ingestor subscribed");

    if *shutdown.borrow() {
        return;
    }

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(msg) => ingest_one(&store, &msg, &mut shutdown).await,
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("event ingestor shutting down");
                break;
            }
        }
    }

    tracing::warn!("event ingestor stream ended");
}

/// Processes a single bus message end to end: parse, check-processed,
/// filter, insert, mark-processed as the last step. The same shape as
/// `modules/notifications::consumer::process_idempotent` (see DESIGN.md).
/// `mark_event_processed` is only ever called once the corresponding work
/// has durably landed, so a crash or a permanent storage failure between
/// parsing and that point always leaves the event eligible for replay.
async fn ingest_one(store: &Store, msg: &BusMessage, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    let event: PaymentEvent = match serde_json::from_slice(&msg.payload) {
        Ok(e) => e,
        Err(e) => {
            let err = CallbackError::Malformed(e.to_string());
            tracing::warn!(error = %err, "malformed payment event, dropping");
            CALLBACK_INGEST_TOTAL.with_label_values(&["filtered"]).inc();
            let _ = store.record_dropped_event(None, &err.to_string()).await;
            return;
        }
    };

    // Ahead of the `callback_message` primary key, this catches a replay of
    // an event whose handling was filtered: a filtered event never creates
    // a row there, so it would otherwise have nothing to conflict on.
    match store.is_event_processed(event.id).await {
        Ok(true) => {
            tracing::debug!(event_id = %event.id, "event already processed, skipping");
            CALLBACK_INGEST_TOTAL.with_label_values(&["duplicate"]).inc();
            return;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::warn!(event_id = %event.id, error = %e, "failed to check processed state, continuing");
        }
    }

    if !NOTIFIABLE_STATUSES.contains(&event.payload.status.as_str()) {
        tracing::debug!(event_id = %event.id, status = %event.payload.status, "status not notifiable, dropping");
        CALLBACK_INGEST_TOTAL.with_label_values(&["filtered"]).inc();
        let _ = store.record_dropped_event(Some(event.id), "status not in notifiable set").await;
        let _ = store.mark_event_processed(event.id, &event.event, "payment-events").await;
        return;
    }

    let body = CallbackBody {
        id: event.id,
        payment_id: event.payload.id,
        status: event.payload.status.clone(),
    };
    let payload = match serde_json::to_value(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize callback body, dropping");
            CALLBACK_INGEST_TOTAL.with_label_values(&["filtered"]).inc();
            return;
        }
    };

    let row = CallbackRow::new(event.id, event.payload.id, event.payload.callback_url.clone(), payload, Utc::now());

    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match store.create(&row).await {
            Ok(true) => {
                tracing::info!(callback_id = %row.id, payment_id = %row.payment_id, "callback row created");
                CALLBACK_INGEST_TOTAL.with_label_values(&["created"]).inc();
                let _ = store.mark_event_processed(event.id, &event.event, "payment-events").await;
                return;
            }
            Ok(false) => {
                // primary-key conflict: replayed event id, idempotent no-op
                tracing::debug!(callback_id = %row.id, "duplicate ingest, no-op");
                CALLBACK_INGEST_TOTAL.with_label_values(&["duplicate"]).inc();
                let _ = store.mark_event_processed(event.id, &event.event, "payment-events").await;
                return;
            }
            Err(e) if attempt < MAX_ATTEMPTS => {
                tracing::warn!(callback_id = %row.id, error = %e, attempt, "transient storage error inserting callback row, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(200 * attempt as u64)) => {}
                    _ = shutdown.changed() => {
                        tracing::info!(callback_id = %row.id, "ingest retry aborted by shutdown");
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    callback_id = %row.id,
                    error = %e,
                    "giving up inserting callback row after repeated storage errors, event left unmarked so a replay can retry"
                );
                return;
            }
        }
    }
}
