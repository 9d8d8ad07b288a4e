//! Full HTTP round trips with `reqwest` against a server on an ephemeral port.

#![cfg(all(feature = "server", feature = "sqlite"))]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;

use keyseat::authority::{AuthoritySettings, LicenseAuthority};
use keyseat::jobs::{JobConfig, JobScheduler};
use keyseat::license::LicenseRecord;
use keyseat::server::database::Database;
use keyseat::server::{build_router, AppState};

/// Helper: create an in-memory SQLite `Database` with the `licenses` table
/// and return it wrapped in Arc<Database>.
async fn setup_in_memory_db() -> Arc<Database> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("db connect failed");

    let db = Arc::new(Database::SQLite(pool));
    db.migrate().await.expect("migrate failed");
    db
}

/// Spin up a temporary Keyseat server on a random port using in-memory SQLite.
async fn spawn_test_server(
    records: &[LicenseRecord],
    session_timeout: Duration,
) -> (String, Arc<LicenseAuthority>) {
    let db = setup_in_memory_db().await;
    for record in records {
        db.insert_license(record).await.expect("seed failed");
    }

    let authority = Arc::new(LicenseAuthority::new(
        db,
        AuthoritySettings {
            session_timeout,
            cache_ttl: StdDuration::from_millis(50),
            store_timeout: StdDuration::from_secs(2),
        },
    ));
    let router = build_router(AppState::new(Arc::clone(&authority)));

    // Bind to an ephemeral port
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().unwrap();

    // Spawn server in background
    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .await
            .expect("server failed");
    });

    (format!("http://{}", addr), authority)
}

async fn check_key(client: &Client, base: &str, key: &str) -> (StatusCode, Value) {
    let response = client
        .post(format!("{base}/api/v1/session"))
        .json(&json!({ "license_key": key }))
        .send()
        .await
        .expect("Failed to send request");
    let status = response.status();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let (base, _authority) =
        spawn_test_server(&[LicenseRecord::new("ABC", 2)], Duration::seconds(60)).await;
    let client = Client::new();

    let (status, s1) = check_key(&client, &base, "ABC").await;
    assert_eq!(status, StatusCode::OK);
    let (_, s2) = check_key(&client, &base, "ABC").await;
    assert_ne!(s1["session_id"], s2["session_id"]);

    let (status, denied) = check_key(&client, &base, "ABC").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(denied["status"], "CONCURRENCY_LIMIT_EXCEEDED");

    let response = client
        .delete(format!("{base}/api/v1/session"))
        .json(&json!({ "session_id": s1["session_id"] }))
        .send()
        .await
        .expect("Failed to send request");
    assert_eq!(response.status(), StatusCode::OK);
    let ack: Value = response.json().await.unwrap();
    assert_eq!(ack["acknowledged"], true);

    let (status, s3) = check_key(&client, &base, "ABC").await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(s3["session_id"], s1["session_id"]);
    assert_ne!(s3["session_id"], s2["session_id"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_clients_respect_the_cap() {
    let (base, authority) =
        spawn_test_server(&[LicenseRecord::new("SHARED", 3)], Duration::seconds(60)).await;
    let client = Client::new();

    let mut handles = Vec::new();
    for _ in 0..12 {
        let client = client.clone();
        let base = base.clone();
        handles.push(tokio::spawn(async move {
            check_key(&client, &base, "SHARED").await.0
        }));
    }

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() == StatusCode::OK {
            granted += 1;
        }
    }

    assert_eq!(granted, 3);
    assert_eq!(authority.count_active("SHARED"), 3);
}

#[tokio::test]
async fn scheduler_sweep_frees_abandoned_slot() {
    let (base, authority) =
        spawn_test_server(&[LicenseRecord::new("TIMED", 1)], Duration::seconds(1)).await;
    let client = Client::new();

    let mut scheduler = JobScheduler::new(
        Arc::clone(&authority),
        JobConfig {
            sweep_interval: StdDuration::from_secs(1),
            cache_purge_interval: StdDuration::from_secs(60),
        },
    )
    .await
    .expect("scheduler");
    scheduler.start().await.expect("scheduler start");

    let (status, _) = check_key(&client, &base, "TIMED").await;
    assert_eq!(status, StatusCode::OK);

    // Never closed and never kept alive.
    tokio::time::sleep(StdDuration::from_millis(3500)).await;
    assert_eq!(authority.count_active("TIMED"), 0);

    let (status, _) = check_key(&client, &base, "TIMED").await;
    assert_eq!(status, StatusCode::OK);

    scheduler.shutdown().await.expect("scheduler shutdown");
}
