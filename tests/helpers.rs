// Shared test helpers for engine setup and mock remote services.
//
// This module provides common utilities used across multiple test files to reduce duplication.

use std::time::Duration;

use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parcel_records::{
    BackoffPolicy, CompletionEvent, DataSource, EngineConfig, JobId, PropertyEngine, RemoteConfig,
};

pub const TEST_TOKEN: &str = "test-token";

/// Remote settings pointing at a mock server.
pub fn remote_config(server: &MockServer) -> RemoteConfig {
    RemoteConfig {
        base_url: server.uri(),
        api_token: TEST_TOKEN.to_string(),
        request_timeout: Duration::from_secs(5),
        supports_sales: true,
        ..Default::default()
    }
}

/// Engine settings for tests: unthrottled, no browser, immediate retries.
#[allow(dead_code)] // Used by other test files
pub fn engine_config(dir: &TempDir, server: &MockServer) -> EngineConfig {
    EngineConfig {
        db_path: dir.path().join("records.db"),
        rate_limit_rps: 0,
        backoff: BackoffPolicy::immediate(3),
        sources: vec![DataSource::Cache, DataSource::Remote],
        remote: remote_config(server),
        workers: 2,
        job_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub async fn start_engine(dir: &TempDir, server: &MockServer) -> PropertyEngine {
    PropertyEngine::start(engine_config(dir, server))
        .await
        .expect("Failed to start engine")
}

/// Mounts property, tax and sales responses for `apn`.
#[allow(dead_code)]
pub async fn mount_parcel(server: &MockServer, apn: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/parcels/{apn}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "ParcelNumber": apn,
                "OwnerName": "MARTINEZ ROSA",
                "SitusAddress": "412 W PALM LN",
                "FullCashValue": "$318,400",
                "YearBuilt": "1962"
            }
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/parcels/{apn}/tax-history")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "TaxHistory": [
                {"TaxYear": "2023", "TaxAmount": "$2,140.50", "Delinquent": "N"},
                {"TaxYear": "2022", "TaxAmount": "$2,011.00", "Delinquent": "N"}
            ]
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/parcels/{apn}/sales-history")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"SaleDate": "06/14/2019", "SalePrice": "$250,000", "Grantee": "MARTINEZ ROSA", "DeedType": "WD"}
        ])))
        .mount(server)
        .await;
}

/// Waits for the completion event of `id`.
#[allow(dead_code)]
pub async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<CompletionEvent>,
    id: JobId,
) -> CompletionEvent {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if event.job_id == id {
                return event;
            }
        }
    })
    .await
    .expect("job did not complete in time")
}
