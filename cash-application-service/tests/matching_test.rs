//! End-to-end allocation scenarios driven through the HTTP control plane.

mod common;

use common::{dec, invoice, TestApp};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;

fn amount(value: &serde_json::Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("expected amount string")).expect("invalid amount")
}

#[tokio::test]
async fn perfect_one_to_one_match_posts_once_without_communication() {
    let app = TestApp::spawn().await;
    app.erp
        .insert_invoice(invoice("INV-12345", "1000.00", None, "ACME"));

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-001",
            "source_account_ref": "ACC-1",
            "amount": "1000.00",
            "currency": "EUR",
            "raw_remittance_data": "Payment for INV-12345",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "matched");

    let result = &status["result"];
    assert_eq!(result["discrepancy_code"], "none");
    assert_eq!(amount(&result["unapplied_amount"]), Decimal::ZERO);
    assert_eq!(result["matches"].as_array().unwrap().len(), 1);
    assert_eq!(result["matches"][0]["invoice_id"], "INV-12345");
    assert_eq!(amount(&result["matches"][0]["amount_applied"]), dec("1000.00"));

    assert_eq!(app.erp.posted_count(), 1);
    assert_eq!(app.transport.send_count(), 0);
}

#[tokio::test]
async fn perfect_one_to_n_match_allocates_each_invoice() {
    let app = TestApp::spawn().await;
    app.erp.insert_invoice(invoice("INV-1A", "600.00", None, "ACME"));
    app.erp.insert_invoice(invoice("INV-2B", "900.00", None, "ACME"));

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-002",
            "source_account_ref": "ACC-1",
            "amount": "1500.00",
            "currency": "EUR",
            "raw_remittance_data": "INV-1A and INV-2B",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "matched");

    let matches = status["result"]["matches"].as_array().unwrap();
    assert_eq!(matches.len(), 2);
    let total: Decimal = matches.iter().map(|m| amount(&m["amount_applied"])).sum();
    assert_eq!(total, dec("1500.00"));
    assert_eq!(amount(&status["result"]["unapplied_amount"]), Decimal::ZERO);
    assert_eq!(app.erp.posted_count(), 1);
}

#[tokio::test]
async fn short_payment_fills_oldest_first_and_asks_customer() {
    let app = TestApp::spawn().await;
    app.erp
        .insert_invoice(invoice("INV-AA", "500.00", Some("2024-01-01"), "ACME"));
    app.erp
        .insert_invoice(invoice("INV-BB", "500.00", Some("2024-02-01"), "ACME"));

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-003",
            "source_account_ref": "ACC-1",
            "amount": "800.00",
            "currency": "EUR",
            "raw_remittance_data": "INV-AA, INV-BB",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "partially_matched");
    assert_eq!(status["result"]["discrepancy_code"], "short_payment");
    assert_eq!(amount(&status["result"]["unapplied_amount"]), Decimal::ZERO);

    let matches = status["result"]["matches"].as_array().unwrap();
    assert_eq!(matches[0]["invoice_id"], "INV-AA");
    assert_eq!(amount(&matches[0]["amount_applied"]), dec("500.00"));
    assert_eq!(matches[1]["invoice_id"], "INV-BB");
    assert_eq!(amount(&matches[1]["amount_applied"]), dec("300.00"));

    assert_eq!(app.erp.posted_count(), 1);
    let sent = app.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].kind,
        cash_application_service::models::CommunicationKind::CustomerClarification
    );
}

#[tokio::test]
async fn over_payment_below_threshold_is_written_off_quietly() {
    let app = TestApp::spawn_with(|config| {
        config.matching.short_write_off_threshold = common::dec("10.00");
    })
    .await;
    app.erp
        .insert_invoice(invoice("INV-4040", "1000.00", None, "ACME"));

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-004",
            "source_account_ref": "ACC-1",
            "amount": "1005.00",
            "currency": "EUR",
            "raw_remittance_data": "INV-4040",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "matched");
    assert_eq!(status["result"]["discrepancy_code"], "over_payment");
    assert_eq!(amount(&status["result"]["unapplied_amount"]), Decimal::ZERO);
    assert_eq!(amount(&status["result"]["matches"][0]["amount_applied"]), dec("1000.00"));

    assert_eq!(app.erp.posted_count(), 1);
    // Written-off remainders raise no alert.
    assert_eq!(app.transport.send_count(), 0);
}

#[tokio::test]
async fn over_payment_above_threshold_alerts_the_ar_team() {
    let app = TestApp::spawn_with(|config| {
        config.matching.short_write_off_threshold = common::dec("10.00");
    })
    .await;
    app.erp
        .insert_invoice(invoice("INV-5050", "1000.00", None, "ACME"));

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-005",
            "source_account_ref": "ACC-1",
            "amount": "1200.00",
            "currency": "EUR",
            "raw_remittance_data": "INV-5050",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "partially_matched");
    assert_eq!(status["result"]["discrepancy_code"], "over_payment");
    assert_eq!(amount(&status["result"]["unapplied_amount"]), dec("200.00"));

    let postings = app.erp.postings();
    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].total_amount, dec("1000.00"));

    let sent = app.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].kind,
        cash_application_service::models::CommunicationKind::InternalAlert
    );
    assert_eq!(sent[0].recipient, "ar-team");
}
