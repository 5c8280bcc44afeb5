/// Integration tests for the outbox producer (C4): publish-cycle
/// bookkeeping against a live Postgres instance and an in-memory bus.
use std::sync::Arc;

use callback_delivery::models::CallbackRow;
use callback_delivery::producer::{self, ProducerConfig};
use callback_delivery::store::Store;
use chrono::Utc;
use event_bus::{EventBus, InMemoryBus};
use futures::StreamExt;
use serde_json::json;
use serial_test::serial;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn setup_test_db() -> sqlx::PgPool {
    dotenvy::dotenv().ok();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for tests");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to test database");

    sqlx::migrate!("./db/migrations").run(&pool).await.expect("failed to run migrations");
    pool
}

async fn cleanup_test_data(pool: &sqlx::PgPool) {
    sqlx::query("DELETE FROM callback_message").execute(pool).await.expect("failed to clean callback_message");
}

#[tokio::test]
#[serial]
async fn empty_fetch_commits_cleanly_and_produces_no_messages() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let store = Store::new(pool.clone());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let mut stream = bus.subscribe("callback.messages").await.unwrap();

    let config = ProducerConfig {
        polling_interval_ms: 1000,
        fetch_size: 100,
        publish_retry_delay_ms: 10_000,
        max_publish_attempts: 3,
    };

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let producer_store = store.clone();
    let producer_bus = bus.clone();
    let handle = tokio::spawn(async move {
        // run_cycle isn't public; drive one tick through the loop by racing
        // a short sleep against the stream, then aborting.
        producer::run(producer_store, producer_bus, config, rx).await;
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let next = tokio::time::timeout(std::time::Duration::from_millis(300), stream.next()).await;
    assert!(next.is_err(), "no message should be published when nothing is due");

    handle.abort();
    cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn due_row_is_published_and_marked_in_flight() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let store = Store::new(pool.clone());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let mut stream = bus.subscribe("callback.messages").await.unwrap();

    let row = CallbackRow::new(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "http://example/cb".to_string(),
        json!({"id": Uuid::new_v4(), "paymentId": Uuid::new_v4(), "status": "successful"}),
        Utc::now(),
    );
    store.create(&row).await.unwrap();

    let config = ProducerConfig {
        polling_interval_ms: 50,
        fetch_size: 100,
        publish_retry_delay_ms: 10_000,
        max_publish_attempts: 3,
    };

    let (_tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(producer::run(store.clone(), bus.clone(), config, rx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let msg = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
        .await
        .expect("producer should publish the due row")
        .expect("stream should yield a message");

    assert_eq!(msg.key(), Some(row.payment_id.to_string()).as_deref());

    // give the same tick's DB write a moment to land
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let updated = store.get_by_id(row.id).await.unwrap().expect("row must still exist");
    assert!(updated.scheduled_at.is_none(), "published row is no longer due");
    assert_eq!(updated.publish_attempts, 1);
    assert!(updated.error.is_none());

    handle.abort();
    cleanup_test_data(&pool).await;
}
