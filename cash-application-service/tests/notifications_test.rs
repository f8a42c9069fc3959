//! Communication dispatch: templates, rate limiting, delivery records.

mod common;

use common::TestApp;
use serde_json::json;

fn clarification_body(recipient: &str) -> serde_json::Value {
    json!({
        "kind": "customer_clarification",
        "recipient": recipient,
        "template_name": "customer_clarification",
        "data": {
            "transaction_id": "TXN-N1",
            "amount": "100.00",
            "currency": "EUR",
            "detail": "partial allocation",
        },
    })
}

#[tokio::test]
async fn dispatch_renders_and_delivers() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/notifications", app.address))
        .json(&clarification_body("customer:ACME"))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(!body["delivery_id"].as_str().unwrap().is_empty());
    assert_eq!(body["status"], "sent");

    let sent = app.transport.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.contains("TXN-N1"));
    assert!(sent[0].body.contains("100.00 EUR"));
}

#[tokio::test]
async fn unknown_template_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/notifications", app.address))
        .json(&json!({
            "kind": "internal_alert",
            "recipient": "ar-team",
            "template_name": "no-such-template",
            "data": {},
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn missing_required_fields_are_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/notifications", app.address))
        .json(&json!({
            "kind": "internal_alert",
            "recipient": "ar-team",
            "template_name": "internal_alert",
            "data": {"transaction_id": "TXN-N2"},
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn per_recipient_rate_limit_throttles_storms() {
    let app = TestApp::spawn_with(|config| {
        config.communicator.notification_rate_per_recipient = 2;
    })
    .await;

    for _ in 0..2 {
        let response = app
            .client
            .post(format!("{}/notifications", app.address))
            .json(&clarification_body("customer:THROTTLED"))
            .send()
            .await
            .expect("Failed to execute request");
        assert_eq!(response.status(), 202);
    }

    let throttled = app
        .client
        .post(format!("{}/notifications", app.address))
        .json(&clarification_body("customer:THROTTLED"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(throttled.status(), 429);

    // Other recipients are unaffected.
    let other = app
        .client
        .post(format!("{}/notifications", app.address))
        .json(&clarification_body("customer:OTHER"))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(other.status(), 202);
}
