//! ERP facade HTTP surface: batch fetch and idempotent posting.

mod common;

use common::{invoice, TestApp};
use serde_json::json;

#[tokio::test]
async fn fetch_reports_found_and_missing_invoices() {
    let app = TestApp::spawn().await;
    app.erp
        .insert_invoice(invoice("INV-F1", "100.00", Some("2024-05-01"), "ACME"));

    let response = app
        .client
        .post(format!("{}/invoices/fetch", app.address))
        .json(&json!({
            "invoice_ids": ["INV-F1", "INV-GHOST"],
            "erp_system": "mock",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["invoices"].as_array().unwrap().len(), 1);
    assert_eq!(body["invoices"][0]["invoice_id"], "INV-F1");
    assert_eq!(body["invoices"][0]["amount_due"], "100.00");
    assert_eq!(body["not_found"][0], "INV-GHOST");
}

#[tokio::test]
async fn fetch_with_unknown_system_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/invoices/fetch", app.address))
        .json(&json!({
            "invoice_ids": ["INV-1"],
            "erp_system": "sap-prod",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn posting_twice_returns_the_original_erp_transaction() {
    let app = TestApp::spawn().await;
    app.erp
        .insert_invoice(invoice("INV-P1", "300.00", None, "ACME"));

    let body = json!({
        "transaction_id": "TXN-POST-1",
        "customer_id": "ACME",
        "erp_system": "mock",
        "applications": [
            {"invoice_id": "INV-P1", "amount_applied": "300.00"}
        ],
        "total_amount": "300.00",
        "currency": "EUR",
    });

    let first = app
        .client
        .post(format!("{}/applications", app.address))
        .json(&body)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(first.status(), 200);
    let first_body: serde_json::Value = first.json().await.unwrap();
    assert_eq!(first_body["duplicate"], false);

    let second = app
        .client
        .post(format!("{}/applications", app.address))
        .json(&body)
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(second.status(), 409);
    let second_body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(second_body["duplicate"], true);
    assert_eq!(
        second_body["erp_transaction_id"],
        first_body["erp_transaction_id"]
    );

    assert_eq!(app.erp.posted_count(), 1);
}

#[tokio::test]
async fn posting_validates_line_sums() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .post(format!("{}/applications", app.address))
        .json(&json!({
            "transaction_id": "TXN-POST-2",
            "customer_id": "ACME",
            "erp_system": "mock",
            "applications": [
                {"invoice_id": "INV-1", "amount_applied": "100.00"}
            ],
            "total_amount": "250.00",
            "currency": "EUR",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn transient_fetch_failures_are_retried_inside_the_facade() {
    let app = TestApp::spawn().await;
    app.erp
        .insert_invoice(invoice("INV-R1", "100.00", None, "ACME"));
    app.erp.fail_next_fetches(2);

    let response = app
        .client
        .post(format!("{}/invoices/fetch", app.address))
        .json(&json!({
            "invoice_ids": ["INV-R1"],
            "erp_system": "mock",
        }))
        .send()
        .await
        .expect("Failed to execute request");

    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["invoices"][0]["invoice_id"], "INV-R1");
    assert_eq!(body["invoices"][0]["amount_due"].as_str().unwrap(), "100.00");
}
