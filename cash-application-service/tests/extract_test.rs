//! Extraction endpoint behavior.

mod common;

use common::TestApp;
use serde_json::json;

#[tokio::test]
async fn pattern_tier_extracts_from_remittance_text() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/extract", app.address))
        .json(&json!({
            "remittance_text": "Payment for INV-12345 and invoice #: AB-9981",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["tier_used"], "pattern");
    let ids: Vec<&str> = body["invoice_ids"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(ids.contains(&"INV-12345"));
    assert!(ids.contains(&"AB-9981"));
    assert!(body["confidence"].as_f64().unwrap() > 0.5);
    assert_eq!(body["cost_estimate"], "0");
}

#[tokio::test]
async fn ids_are_normalized_and_deduplicated() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/extract", app.address))
        .json(&json!({
            "remittance_text": "inv-777x, INV-777X. again inv-777x",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    let ids = body["invoice_ids"].as_array().unwrap();
    assert_eq!(ids.len(), 1);
    assert_eq!(ids[0], "INV-777X");
}

#[tokio::test]
async fn empty_extraction_reports_zero_confidence() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/extract", app.address))
        .json(&json!({
            "remittance_text": "wire transfer, no references at all",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["invoice_ids"].as_array().unwrap().is_empty());
    assert_eq!(body["confidence"], 0.0);
}

#[tokio::test]
async fn missing_input_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/extract", app.address))
        .json(&json!({}))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn forcing_an_unconfigured_tier_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/extract", app.address))
        .json(&json!({
            "remittance_text": "INV-4242",
            "tier_preference": "cloud",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 400);
}
