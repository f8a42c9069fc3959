mod common;

use common::TestApp;

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "cash-application-service");
    assert_eq!(body["store"], "ok");
    assert_eq!(body["erp_systems"][0], "mock");
}

#[tokio::test]
async fn metrics_endpoint_serves_prometheus_text() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/metrics", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body = response.text().await.expect("Failed to read body");
    assert!(body.contains("cash_application"));
}

#[tokio::test]
async fn erp_test_probe_reports_ok() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/erp/mock/test", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.expect("Failed to parse response");
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn unknown_erp_probe_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(format!("{}/erp/nope/test", app.address))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 400);
}
