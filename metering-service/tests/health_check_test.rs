//! Health check integration tests for metering-service.

mod common;

use chrono::Utc;
use common::TestApp;
use metering_service::models::{CustomerRef, IngestEvent};
use reqwest::Client;
use uuid::Uuid;

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;
    let client = Client::new();

    let response = client
        .get(format!("{}/health", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    assert!(response.headers().contains_key("x-request-id"));

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "metering-service");
}

#[tokio::test]
async fn readiness_check_works() {
    let app = TestApp::spawn().await;

    let response = Client::new()
        .get(format!("{}/ready", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
}

#[tokio::test]
async fn metrics_endpoint_exposes_metering_counters() {
    let app = TestApp::spawn().await;
    app.api
        .ingest_event(IngestEvent {
            organization_id: Uuid::new_v4(),
            name: "api.call".to_string(),
            customer: CustomerRef::by_id(Uuid::new_v4()),
            timestamp: Utc::now(),
            external_id: None,
            metadata: Default::default(),
        })
        .await
        .expect("Failed to ingest event");

    let response = Client::new()
        .get(format!("{}/metrics", app.http_address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body = response.text().await.expect("Failed to read body");
    assert!(body.contains("metering_events_ingested_total"));
}
