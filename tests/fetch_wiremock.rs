use std::sync::Arc;

use chrono::NaiveDate;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ocea_collector::auth::{AuthClient, AuthSession, Endpoints};
use ocea_collector::clock::FixedClock;
use ocea_collector::fetch::DataFetcher;
use ocea_collector::models::{Fluid, Unit};

async fn fetcher(server: &MockServer) -> DataFetcher {
    let auth = AuthClient::new("resident@example.invalid", "hunter2")
        .unwrap()
        .with_endpoints(Endpoints::with_base_url(server.uri()));
    auth.set_tokens(AuthSession {
        access_token: Some("test-access".into()),
        refresh_token: None,
    })
    .await;
    let clock = FixedClock::on_date(NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
    DataFetcher::new(Arc::new(auth), Arc::new(clock))
}

async fn mount_resident(server: &MockServer, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api/v1/resident"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn mount_conso(server: &MockServer, fluid: &str, body: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path(format!("/api/v1/local/123/conso/{fluid}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn fetch_normalizes_water_to_liters() {
    let server = MockServer::start().await;
    mount_resident(&server, serde_json::json!({"occupations": [{"logementId": 123}]})).await;
    mount_conso(
        &server,
        "EauFroide",
        serde_json::json!({
            "consommations": [
                {"date": "2024-03-08T00:00:00Z", "valeur": 12.0},
                {"date": "2024-03-09T00:00:00Z", "valeur": 12.5, "fuiteEstimee": "non"},
            ],
            "unite": "m3",
        }),
    )
    .await;
    mount_conso(&server, "EauChaude", serde_json::json!({"consommations": []})).await;
    mount_conso(
        &server,
        "Cetc",
        serde_json::json!({
            "consommations": [
                {"date": "2024-03-09T00:00:00Z", "valeur": 44.0},
            ],
            "unite": "kWh",
        }),
    )
    .await;

    let snapshots = fetcher(&server).await.fetch().await.unwrap();

    let cold = &snapshots[&Fluid::ColdWater];
    assert_eq!(cold.latest_value, Some(12500.0));
    assert_eq!(cold.unit, Unit::Liters);
    assert_eq!(cold.latest_date, NaiveDate::from_ymd_opt(2024, 3, 9));
    assert_eq!(cold.leak_estimate.as_deref(), Some("non"));

    let hot = &snapshots[&Fluid::HotWater];
    assert_eq!(hot.latest_value, None);

    let heat = &snapshots[&Fluid::ThermalEnergy];
    assert_eq!(heat.latest_value, Some(44.0));
    assert_eq!(heat.unit, Unit::KilowattHours);
}

#[tokio::test]
async fn fetch_sends_a_monthly_trailing_window() {
    let server = MockServer::start().await;
    mount_resident(&server, serde_json::json!({"occupations": [{"logementId": 123}]})).await;
    // Clock is fixed at 2024-03-10; the window ends at that midnight and
    // reaches back 30 days.
    Mock::given(method("POST"))
        .and(path("/api/v1/local/123/conso/EauFroide"))
        .and(body_string_contains("\"granularity\":\"Month\""))
        .and(body_string_contains("2024-03-10T00:00:00.000Z"))
        .and(body_string_contains("2024-02-09T00:00:00.000Z"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"consommations": []})),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_conso(&server, "EauChaude", serde_json::json!({"consommations": []})).await;
    mount_conso(&server, "Cetc", serde_json::json!({"consommations": []})).await;

    fetcher(&server).await.fetch().await.unwrap();
}

#[tokio::test]
async fn account_without_occupations_is_a_configuration_error() {
    let server = MockServer::start().await;
    mount_resident(&server, serde_json::json!({"occupations": []})).await;

    let err = fetcher(&server).await.fetch().await.unwrap_err();
    assert!(err.is_account_config());
    assert_eq!(err.to_string(), "No occupations found for this account.");
}

#[tokio::test]
async fn numeric_and_string_location_ids_both_work() {
    let server = MockServer::start().await;
    mount_resident(
        &server,
        serde_json::json!({"occupations": [{"logementId": "123"}]}),
    )
    .await;
    mount_conso(&server, "EauFroide", serde_json::json!({"consommations": []})).await;
    mount_conso(&server, "EauChaude", serde_json::json!({"consommations": []})).await;
    mount_conso(&server, "Cetc", serde_json::json!({"consommations": []})).await;

    let snapshots = fetcher(&server).await.fetch().await.unwrap();
    assert_eq!(snapshots.len(), 3);
}

#[tokio::test]
async fn failing_fluid_query_fails_the_poll() {
    let server = MockServer::start().await;
    mount_resident(&server, serde_json::json!({"occupations": [{"logementId": 123}]})).await;
    Mock::given(method("POST"))
        .and(path("/api/v1/local/123/conso/EauFroide"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    mount_conso(&server, "EauChaude", serde_json::json!({"consommations": []})).await;
    mount_conso(&server, "Cetc", serde_json::json!({"consommations": []})).await;

    // Transient upstream failures surface so the scheduler can retry.
    let err = fetcher(&server).await.fetch().await.unwrap_err();
    assert!(!err.is_unauthorized());
    assert!(err.to_string().contains("500"));
}
