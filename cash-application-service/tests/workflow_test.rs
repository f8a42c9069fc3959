//! Workflow lifecycle: idempotency, ordering, cancellation, recovery.

mod common;

use cash_application_service::models::CommunicationKind;
use cash_application_service::services::store::AuditStore;
use cash_application_service::startup::{Application, Components};
use common::{invoice, TestApp};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn unmatched_transaction_raises_internal_alert_without_posting() {
    let app = TestApp::spawn().await;

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-006",
            "source_account_ref": "ACC-1",
            "amount": "500.00",
            "currency": "EUR",
            "raw_remittance_data": "wire from ACME",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "unmatched");
    assert_eq!(status["result"]["discrepancy_code"], "none");
    assert_eq!(status["result"]["confidence"], 0.0);

    assert_eq!(app.erp.posted_count(), 0);
    let sent = app.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, CommunicationKind::InternalAlert);
}

#[tokio::test]
async fn currency_mismatch_short_circuits_to_unmatched() {
    let app = TestApp::spawn().await;
    app.erp
        .insert_invoice(invoice("INV-EU", "1000.00", None, "ACME"));

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-007",
            "source_account_ref": "ACC-1",
            "amount": "1000.00",
            "currency": "USD",
            "raw_remittance_data": "INV-EU",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "unmatched");
    assert_eq!(status["result"]["discrepancy_code"], "currency_mismatch");

    assert_eq!(app.erp.posted_count(), 0);
    assert_eq!(app.transport.sent()[0].kind, CommunicationKind::InternalAlert);
}

#[tokio::test]
async fn replayed_submission_returns_the_same_workflow_and_posts_once() {
    let app = TestApp::spawn().await;
    app.erp
        .insert_invoice(invoice("INV-8888", "1000.00", None, "ACME"));

    let body = json!({
        "transaction_id": "TXN-008",
        "source_account_ref": "ACC-1",
        "amount": "1000.00",
        "currency": "EUR",
        "raw_remittance_data": "Payment for INV-8888",
    });

    let (first, second) = tokio::join!(app.start_transaction(body.clone()), app.start_transaction(body.clone()));

    let statuses = [first.status().as_u16(), second.status().as_u16()];
    assert!(statuses.contains(&202), "one submission must be accepted");
    assert!(statuses.contains(&409), "one submission must be a duplicate");

    let first_body: serde_json::Value = first.json().await.unwrap();
    let second_body: serde_json::Value = second.json().await.unwrap();
    assert_eq!(first_body["workflow_id"], second_body["workflow_id"]);

    let workflow_id = first_body["workflow_id"].as_str().unwrap().to_string();
    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "matched");

    // Exactly one posting and one match result despite the replay.
    assert_eq!(app.erp.posted_count(), 1);
    let recorded = app.store.get_match_result("TXN-008").await.unwrap();
    assert!(recorded.is_some());
}

#[tokio::test]
async fn same_account_transactions_are_processed_in_submission_order() {
    let app = TestApp::spawn().await;
    app.erp.insert_invoice(invoice("INV-O1", "500.00", None, "ACME"));
    app.erp.insert_invoice(invoice("INV-O2", "700.00", None, "ACME"));
    app.erp.set_latency(Duration::from_millis(100));

    let first = app
        .start_transaction(json!({
            "transaction_id": "TXN-ORD-1",
            "source_account_ref": "ACC-SAME",
            "amount": "500.00",
            "currency": "EUR",
            "raw_remittance_data": "INV-O1",
        }))
        .await;
    assert_eq!(first.status(), 202);
    let first_body: serde_json::Value = first.json().await.unwrap();

    let second = app
        .start_transaction(json!({
            "transaction_id": "TXN-ORD-2",
            "source_account_ref": "ACC-SAME",
            "amount": "700.00",
            "currency": "EUR",
            "raw_remittance_data": "INV-O2",
        }))
        .await;
    assert_eq!(second.status(), 202);
    let second_body: serde_json::Value = second.json().await.unwrap();

    app.wait_for_terminal(first_body["workflow_id"].as_str().unwrap())
        .await;
    app.wait_for_terminal(second_body["workflow_id"].as_str().unwrap())
        .await;

    let postings = app.erp.postings();
    assert_eq!(postings.len(), 2);
    assert_eq!(postings[0].transaction_id, "TXN-ORD-1");
    assert_eq!(postings[1].transaction_id, "TXN-ORD-2");
}

#[tokio::test]
async fn cancellation_stops_the_workflow_before_posting() {
    let app = TestApp::spawn().await;
    app.erp
        .insert_invoice(invoice("INV-C1", "1000.00", None, "ACME"));
    app.erp.set_latency(Duration::from_millis(500));

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-CANCEL",
            "source_account_ref": "ACC-1",
            "amount": "1000.00",
            "currency": "EUR",
            "raw_remittance_data": "INV-C1",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let cancel = app
        .client
        .post(format!("{}/workflows/{}/cancel", app.address, workflow_id))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(cancel.status(), 202);

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "error");
    assert_eq!(status["error"]["kind"], "Cancelled");
    assert_eq!(app.erp.posted_count(), 0);

    // A second cancel hits a terminal workflow.
    let again = app
        .client
        .post(format!("{}/workflows/{}/cancel", app.address, workflow_id))
        .send()
        .await
        .expect("Failed to execute request");
    assert_eq!(again.status(), 409);
}

#[tokio::test]
async fn read_only_mode_holds_postings_for_review() {
    let app = TestApp::spawn_with(|config| {
        config.orchestrator.enable_autonomous_erp_updates = false;
    })
    .await;
    app.erp
        .insert_invoice(invoice("INV-RO", "1000.00", None, "ACME"));

    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-RO",
            "source_account_ref": "ACC-1",
            "amount": "1000.00",
            "currency": "EUR",
            "raw_remittance_data": "Payment for INV-RO",
        }))
        .await;
    assert_eq!(response.status(), 202);
    let body: serde_json::Value = response.json().await.unwrap();
    let workflow_id = body["workflow_id"].as_str().unwrap().to_string();

    let status = app.wait_for_terminal(&workflow_id).await;
    assert_eq!(status["state"], "requires_review");
    assert_eq!(app.erp.posted_count(), 0);

    let sent = app.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].kind, CommunicationKind::InternalAlert);
}

#[tokio::test]
async fn unknown_workflow_id_returns_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .get_workflow("00000000-0000-0000-0000-000000000000")
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn invalid_submissions_are_rejected() {
    let app = TestApp::spawn().await;

    // Bad amount precision.
    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-BAD-1",
            "source_account_ref": "ACC-1",
            "amount": "10.123",
            "currency": "EUR",
        }))
        .await;
    assert_eq!(response.status(), 400);

    // Bad currency code.
    let response = app
        .start_transaction(json!({
            "transaction_id": "TXN-BAD-2",
            "source_account_ref": "ACC-1",
            "amount": "10.00",
            "currency": "eur",
        }))
        .await;
    assert_eq!(response.status(), 422);

    // Empty transaction id.
    let response = app
        .start_transaction(json!({
            "transaction_id": "",
            "source_account_ref": "ACC-1",
            "amount": "10.00",
            "currency": "EUR",
        }))
        .await;
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn startup_recovery_finishes_workflows_left_in_flight() {
    use cash_application_service::models::NewTransaction;
    use cash_application_service::services::communicator::MockTransport;
    use cash_application_service::services::erp::MockErpConnector;
    use cash_application_service::services::extractor::StaticDocumentSource;
    use cash_application_service::services::store::MemoryStore;

    let store = Arc::new(MemoryStore::new());
    let erp = Arc::new(MockErpConnector::new("mock"));
    erp.insert_invoice(invoice("INV-REC", "250.00", None, "ACME"));

    // A previous instance claimed this transaction and crashed before
    // extracting anything.
    let registered = store
        .register_transaction(&NewTransaction {
            transaction_id: "TXN-REC".to_string(),
            source_account_ref: "ACC-REC".to_string(),
            amount: common::dec("250.00"),
            currency: "EUR".to_string(),
            value_date: None,
            raw_remittance_data: "Payment for INV-REC".to_string(),
            customer_identifier: None,
            associated_document_uris: vec![],
            erp_system: "mock".to_string(),
        })
        .await
        .unwrap();
    store.claim_transaction("TXN-REC").await.unwrap();

    let app = Application::build_with(
        common::test_config(),
        Components {
            store: store.clone(),
            connectors: vec![erp.clone()],
            transport: Arc::new(MockTransport::new(true)),
            documents: Arc::new(StaticDocumentSource::new()),
        },
    )
    .await
    .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.port());
    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    let client = reqwest::Client::new();
    let url = format!("{}/workflows/{}", address, registered.workflow_id);
    let mut state = String::new();
    for _ in 0..200 {
        if let Ok(response) = client.get(&url).send().await {
            if response.status().is_success() {
                let body: serde_json::Value = response.json().await.unwrap();
                state = body["state"].as_str().unwrap_or_default().to_string();
                if !matches!(state.as_str(), "pending" | "processing") {
                    break;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(state, "matched");
    assert_eq!(erp.posted_count(), 1);
}
