#![allow(dead_code)]

use cash_application_service::config::{
    CashAppConfig, CommunicatorConfig, DatabaseConfig, ErpConfig, ErpSystemConfig,
    ExtractorConfig, MatchingConfig, OrchestratorConfig,
};
use cash_application_service::models::Invoice;
use cash_application_service::services::communicator::MockTransport;
use cash_application_service::services::erp::MockErpConnector;
use cash_application_service::services::extractor::StaticDocumentSource;
use cash_application_service::services::store::MemoryStore;
use cash_application_service::startup::{Application, Components};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::config::Config as CoreConfig;
use std::str::FromStr;
use std::sync::Arc;

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).expect("invalid decimal literal")
}

pub fn test_config() -> CashAppConfig {
    CashAppConfig {
        common: CoreConfig { port: 0 },
        service_name: "cash-application-service".to_string(),
        log_level: "warn".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: None,
            max_connections: 2,
            min_connections: 1,
        },
        orchestrator: OrchestratorConfig {
            max_concurrent_transactions: 10,
            workflow_timeout_secs: 30,
            extract_timeout_secs: 5,
            fetch_timeout_secs: 5,
            post_timeout_secs: 5,
            communicate_timeout_secs: 5,
            busy_policy: "block".to_string(),
            enable_autonomous_erp_updates: true,
            notify_in_read_only: true,
            send_confirmations: false,
            ar_team_recipient: "ar-team".to_string(),
        },
        matching: MatchingConfig {
            amount_tolerance_pct: Decimal::ZERO,
            short_write_off_threshold: Decimal::ZERO,
            auto_apply_ceiling: None,
            require_customer_match: false,
            allow_partial_allocation: true,
            perfect_match_only: false,
        },
        extractor: ExtractorConfig {
            tier_preference: "auto".to_string(),
            confidence_threshold: 0.85,
            tier_timeout_secs: 5,
            layout_enabled: false,
            layout_cost: dec("0.01"),
            cloud_endpoint: None,
            cloud_api_key: None,
            cloud_cost: dec("0.10"),
            document_fetch_timeout_secs: 5,
        },
        erp: ErpConfig {
            systems: vec![ErpSystemConfig {
                name: "mock".to_string(),
                system_type: "mock".to_string(),
                base_url: String::new(),
                client_id: String::new(),
                client_secret: String::new(),
                api_key: String::new(),
                certificate_pem_path: String::new(),
            }],
            default_system: "mock".to_string(),
            max_connections_per_system: 8,
            request_timeout_secs: 5,
        },
        communicator: CommunicatorConfig {
            webhook_url: None,
            notification_rate_per_recipient: 50,
            delivery_retry_cap_secs: 1,
            transport_timeout_secs: 5,
        },
    }
}

pub fn invoice(id: &str, amount_due: &str, due_date: Option<&str>, customer: &str) -> Invoice {
    Invoice {
        invoice_id: id.to_string(),
        erp_system: "mock".to_string(),
        customer_id: customer.to_string(),
        original_amount: dec(amount_due),
        amount_due: dec(amount_due),
        currency: "EUR".to_string(),
        status: "open".to_string(),
        due_date: due_date.map(|d| NaiveDate::from_str(d).expect("invalid date literal")),
        erp_record_id: format!("erp-{}", id),
        fetched_utc: Utc::now(),
    }
}

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub store: Arc<MemoryStore>,
    pub erp: Arc<MockErpConnector>,
    pub transport: Arc<MockTransport>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    pub async fn spawn_with<F>(tweak: F) -> Self
    where
        F: FnOnce(&mut CashAppConfig),
    {
        let mut config = test_config();
        tweak(&mut config);

        let store = Arc::new(MemoryStore::new());
        let erp = Arc::new(MockErpConnector::new("mock"));
        let transport = Arc::new(MockTransport::new(true));

        let app = Application::build_with(
            config,
            Components {
                store: store.clone(),
                connectors: vec![erp.clone()],
                transport: transport.clone(),
                documents: Arc::new(StaticDocumentSource::new()),
            },
        )
        .await
        .expect("Failed to build test application");

        let port = app.port();
        let address = format!("http://127.0.0.1:{}", port);

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to accept requests.
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            client,
            store,
            erp,
            transport,
        }
    }

    pub async fn start_transaction(&self, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/workflows/cash-application/start", self.address))
            .json(&body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> reqwest::Response {
        self.client
            .get(format!("{}/workflows/{}", self.address, workflow_id))
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Poll until the workflow reaches a terminal state; returns the final
    /// status body.
    pub async fn wait_for_terminal(&self, workflow_id: &str) -> serde_json::Value {
        for _ in 0..200 {
            let response = self.get_workflow(workflow_id).await;
            if response.status().is_success() {
                let body: serde_json::Value =
                    response.json().await.expect("Failed to parse response");
                let state = body["state"].as_str().unwrap_or_default();
                if !matches!(state, "pending" | "processing") {
                    return body;
                }
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(25)).await;
        }
        panic!("workflow {} did not reach a terminal state", workflow_id);
    }
}
