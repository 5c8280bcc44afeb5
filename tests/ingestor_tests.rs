/// Integration tests for the event ingestor (C3): filtering, dedup, and
/// row creation against a live Postgres instance and an in-memory bus.
use std::sync::Arc;

use callback_delivery::ingestor;
use callback_delivery::store::Store;
use event_bus::{EventBus, InMemoryBus};
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
    sqlx::query("DELETE FROM dropped_events").execute(pool).await.expect("failed to clean dropped_events");
    sqlx::query("DELETE FROM processed_events").execute(pool).await.expect("failed to clean processed_events");
}

fn payment_event(id: Uuid, payment_id: Uuid, status: &str) -> serde_json::Value {
    json!({
        "id": id,
        "event": "payment.status_changed",
        "payload": {
            "id": payment_id,
            "amount": 100,
            "currency": "USD",
            "status": status,
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z",
            "callbackUrl": "http://example/cb"
        }
    })
}

#[tokio::test]
#[serial]
async fn happy_path_creates_a_due_row() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let store = Store::new(pool.clone());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(ingestor::run(bus.clone(), store.clone(), shutdown_rx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let event_id = Uuid::new_v4();
    let payment_id = Uuid::new_v4();
    let event = payment_event(event_id, payment_id, "successful");
    bus.publish("payment.events.raw", serde_json::to_vec(&event).unwrap()).await.unwrap();

    let mut row = None;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if let Some(r) = store.get_by_id(event_id).await.unwrap() {
            row = Some(r);
            break;
        }
    }
    let row = row.expect("callback row should be created within timeout");

    assert_eq!(row.payment_id, payment_id);
    assert!(row.scheduled_at.is_some());
    assert_eq!(row.delivery_attempts, 0);
    assert_eq!(row.publish_attempts, 0);

    handle.abort();
    cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn filtered_status_creates_no_row() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let store = Store::new(pool.clone());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(ingestor::run(bus.clone(), store.clone(), shutdown_rx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let event_id = Uuid::new_v4();
    let event = payment_event(event_id, Uuid::new_v4(), "pending");
    bus.publish("payment.events.raw", serde_json::to_vec(&event).unwrap()).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let row = store.get_by_id(event_id).await.unwrap();
    assert!(row.is_none(), "pending status must not produce a callback row");

    handle.abort();
    cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn replayed_event_id_is_deduplicated() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let store = Store::new(pool.clone());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(ingestor::run(bus.clone(), store.clone(), shutdown_rx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let event_id = Uuid::new_v4();
    let payment_id = Uuid::new_v4();
    let event = payment_event(event_id, payment_id, "successful");

    bus.publish("payment.events.raw", serde_json::to_vec(&event).unwrap()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    bus.publish("payment.events.raw", serde_json::to_vec(&event).unwrap()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM callback_message WHERE id = $1")
        .bind(event_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 1, "replaying the same event id must yield exactly one row");

    handle.abort();
    cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn replayed_filtered_event_is_recorded_only_once() {
    // A filtered event never reaches `callback_message`, so without the
    // `processed_events` guard a replay would be silently reprocessed
    // forever (there is no row to conflict on). The guard must still
    // dedup it.
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;

    let store = Store::new(pool.clone());
    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(ingestor::run(bus.clone(), store.clone(), shutdown_rx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let event_id = Uuid::new_v4();
    let event = payment_event(event_id, Uuid::new_v4(), "pending");

    bus.publish("payment.events.raw", serde_json::to_vec(&event).unwrap()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    bus.publish("payment.events.raw", serde_json::to_vec(&event).unwrap()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let dropped_count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dropped_events WHERE event_id = $1")
        .bind(event_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(dropped_count.0, 1, "the replayed filtered event must not be recorded as dropped twice");

    handle.abort();
    cleanup_test_data(&pool).await;
}
