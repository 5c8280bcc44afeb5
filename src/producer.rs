//! Outbox producer (C4): periodic batch publish of due rows under
//! row-transactional guarantees.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use event_bus::EventBus;

use crate::error::CallbackError;
use crate::metrics::CALLBACK_PRODUCER_TOTAL;
use crate::models::CallbackMessage;
use crate::state_machine::{apply_publish_outcome, PublishOutcome};
use crate::store::Store;

const CALLBACK_MESSAGES_SUBJECT: &str = "callback.messages";

#[derive(Clone)]
pub struct ProducerConfig {
    pub polling_interval_ms: u64,
    pub fetch_size: i64,
    pub publish_retry_delay_ms: i64,
    pub max_publish_attempts: i32,
}

/// Runs the producer's polling loop until `shutdown` resolves. Each tick
/// is one atomic cycle: fetch due rows under row locks, publish a batch,
/// write back publish-attempt state, commit.
pub async fn run(store: Store, bus: Arc<dyn EventBus>, config: ProducerConfig, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.polling_interval_ms));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                tracing::info!("outbox producer shutting down");
                return;
            }
        }

        if let Err(e) = run_cycle(&store, &bus, &config).await {
            tracing::error!(error = %e, "producer cycle failed, rolled back, will retry next tick");
        }
    }
}

async fn run_cycle(store: &Store, bus: &Arc<dyn EventBus>, config: &ProducerConfig) -> Result<(), CallbackError> {
    let mut tx = store.begin_tx().await?;

    let mut rows = store.fetch_due(&mut tx, config.fetch_size).await?;
    if rows.is_empty() {
        tx.commit().await?;
        return Ok(());
    }

    tracing::debug!(count = rows.len(), "producer fetched due rows");

    for row in rows.iter_mut() {
        let message = CallbackMessage {
            id: row.id,
            payment_id: row.payment_id,
            url: row.url.clone(),
            payload: row.payload.clone(),
            attempts: row.delivery_attempts,
        };

        let outcome = match serde_json::to_vec(&message) {
            Ok(bytes) => match bus.publish_keyed(CALLBACK_MESSAGES_SUBJECT, &row.payment_id.to_string(), bytes).await {
                Ok(()) => {
                    CALLBACK_PRODUCER_TOTAL.with_label_values(&["published"]).inc();
                    PublishOutcome::Ok
                }
                Err(e) => {
                    let err = CallbackError::from(e);
                    tracing::warn!(callback_id = %row.id, error = %err, "failed to publish callback message");
                    PublishOutcome::Err(err.to_string())
                }
            },
            Err(e) => {
                tracing::warn!(callback_id = %row.id, error = %e, "failed to serialize callback message");
                PublishOutcome::Err(format!("serialization error: {e}"))
            }
        };

        let now = Utc::now();
        let abandoning = matches!(outcome, PublishOutcome::Err(_))
            && row.publish_attempts + 1 >= config.max_publish_attempts;

        apply_publish_outcome(row, outcome.clone(), now, config.max_publish_attempts, config.publish_retry_delay_ms);

        if matches!(outcome, PublishOutcome::Err(_)) {
            CALLBACK_PRODUCER_TOTAL
                .with_label_values(&[if abandoning { "publish_abandoned" } else { "publish_failed" }])
                .inc();
        }

        store.update(&mut tx, row).await?;
    }

    tx.commit().await?;
    Ok(())
}
