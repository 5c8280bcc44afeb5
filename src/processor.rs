//! Delivery processor (C5): consumes `callback-messages`, bounded-concurrency
//! outbound HTTP, then updates delivery-attempt state under a row lock.

use std::sync::Arc;

use chrono::Utc;
use event_bus::{BusMessage, EventBus};
use futures::StreamExt;
use tokio::sync::Semaphore;

use crate::error::CallbackError;
use crate::metrics::CALLBACK_PROCESSOR_TOTAL;
use crate::models::CallbackMessage;
use crate::sender::Sender;
use crate::state_machine::{apply_delivery_outcome, SendOutcome};
use crate::store::Store;

const CALLBACK_MESSAGES_SUBJECT: &str = "callback.messages";

#[derive(Clone)]
pub struct ProcessorConfig {
    pub parallelism: usize,
    pub max_delivery_attempts: i32,
    pub delivery_retry_delay_ms: i64,
}

/// Subscribes to `callback-messages` and spawns one cooperative task per
/// message, admitted through a semaphore of capacity `parallelism`, the
/// sole admission control for outbound HTTP. Stops accepting new messages
/// once `shutdown` fires, then blocks until every admitted task has
/// returned its permit, so in-flight deliveries finish before `run` does.
pub async fn run(
    bus: Arc<dyn EventBus>,
    store: Store,
    sender: Sender,
    config: ProcessorConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut stream = match bus.subscribe(CALLBACK_MESSAGES_SUBJECT).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, subject = CALLBACK_MESSAGES_SUBJECT, "failed to subscribe to callback messages");
            return;
        }
    };

    tracing::info!(subject = CALLBACK_MESSAGES_SUBJECT, parallelism = config.parallelism, "delivery processor subscribed");

    let semaphore = Arc::new(Semaphore::new(config.parallelism));

    if !*shutdown.borrow() {
        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                            let store = store.clone();
                            let sender = sender.clone();
                            let config = config.clone();
                            let task_shutdown = shutdown.clone();

                            tokio::spawn(async move {
                                let _permit = permit;
                                deliver_one(&store, &sender, &config, &msg, task_shutdown).await;
                            });
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("delivery processor shutting down, draining in-flight deliveries");
                    break;
                }
            }
        }
    }

    let _ = semaphore.acquire_many(config.parallelism as u32).await;
    tracing::warn!("delivery processor stream ended");
}

async fn deliver_one(
    store: &Store,
    sender: &Sender,
    config: &ProcessorConfig,
    msg: &BusMessage,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let message: CallbackMessage = match serde_json::from_slice(&msg.payload) {
        Ok(m) => m,
        Err(e) => {
            let err = CallbackError::Malformed(e.to_string());
            tracing::warn!(error = %err, "malformed callback message, dropping");
            return;
        }
    };

    let send_result = sender.send(&message.url, &message.payload, &mut shutdown).await;
    let outcome = match &send_result {
        Ok(()) => SendOutcome::Ok,
        Err(e) => SendOutcome::Err(e.to_string()),
    };
    if send_result.is_err() {
        CALLBACK_PROCESSOR_TOTAL.with_label_values(&["send_error"]).inc();
    }

    let mut tx = match store.begin_tx().await {
        Ok(tx) => tx,
        Err(e) => {
            tracing::error!(callback_id = %message.id, error = %e, "failed to begin transaction for delivery update");
            return;
        }
    };

    let mut row = match store.lock_by_id(&mut tx, message.id).await {
        Ok(Some(row)) => row,
        Ok(None) => {
            tracing::warn!(callback_id = %message.id, "callback row missing, treating as already terminal");
            let _ = tx.rollback().await;
            return;
        }
        Err(e) => {
            tracing::error!(callback_id = %message.id, error = %e, "failed to lock callback row");
            let _ = tx.rollback().await;
            return;
        }
    };

    let now = Utc::now();
    apply_delivery_outcome(&mut row, outcome, now, config.max_delivery_attempts, config.delivery_retry_delay_ms);

    let result_label = if row.is_delivered() {
        "delivered"
    } else if row.is_abandoned() {
        "abandoned"
    } else {
        "rescheduled"
    };
    CALLBACK_PROCESSOR_TOTAL.with_label_values(&[result_label]).inc();

    if let Err(e) = store.update(&mut tx, &row).await {
        tracing::error!(callback_id = %row.id, error = %e, "failed to persist delivery outcome");
        let _ = tx.rollback().await;
        return;
    }

    if let Err(e) = tx.commit().await {
        tracing::error!(callback_id = %row.id, error = %e, "failed to commit delivery outcome");
    } else {
        tracing::info!(
            callback_id = %row.id,
            payment_id = %row.payment_id,
            delivery_attempts = row.delivery_attempts,
            result = result_label,
            "delivery outcome recorded"
        );
    }
}
