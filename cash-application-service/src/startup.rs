use crate::config::CashAppConfig;
use crate::handlers;
use crate::services::communicator::{
    Communicator, MessageTransport, MockTransport, TemplateRegistry, WebhookTransport,
};
use crate::services::erp::{
    ErpConnector, ErpFacade, GenericConnector, MockErpConnector, NetSuiteConnector,
    QuickBooksConnector, SapConnector,
};
use crate::services::extractor::{
    CloudTier, DocumentSource, Extractor, HttpDocumentSource, LayoutTier, TierPreference,
};
use crate::services::matcher::MatchPolicy;
use crate::services::orchestrator::{BusyPolicy, OrchestratorSettings, WorkflowEngine};
use crate::services::store::{AuditStore, MemoryStore, PostgresStore};
use axum::{
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: CashAppConfig,
    pub store: Arc<dyn AuditStore>,
    pub engine: Arc<WorkflowEngine>,
    pub extractor: Arc<Extractor>,
    pub erp: Arc<ErpFacade>,
    pub communicator: Arc<Communicator>,
}

/// External collaborators injected into the application. Tests swap in
/// mocks; `Application::build` selects production implementations from
/// configuration.
pub struct Components {
    pub store: Arc<dyn AuditStore>,
    pub connectors: Vec<Arc<dyn ErpConnector>>,
    pub transport: Arc<dyn MessageTransport>,
    pub documents: Arc<dyn DocumentSource>,
}

pub struct Application {
    port: u16,
    server: Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + Unpin>,
    state: AppState,
}

impl Application {
    pub async fn build(config: CashAppConfig) -> Result<Self, AppError> {
        let store: Arc<dyn AuditStore> = match &config.database.url {
            Some(url) => {
                let store = PostgresStore::connect(
                    url,
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await?;
                store.run_migrations().await?;
                Arc::new(store)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };

        let erp_timeout = Duration::from_secs(config.erp.request_timeout_secs);
        let mut connectors: Vec<Arc<dyn ErpConnector>> = Vec::new();
        for system in &config.erp.systems {
            let connector: Arc<dyn ErpConnector> = match system.system_type.as_str() {
                "netsuite" => Arc::new(NetSuiteConnector::new(
                    system.name.clone(),
                    system.base_url.clone(),
                    system.client_id.clone(),
                    system.client_secret.clone(),
                    erp_timeout,
                )),
                "sap" => {
                    let pem = std::fs::read(&system.certificate_pem_path).map_err(|e| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "cannot read SAP certificate for '{}': {}",
                            system.name,
                            e
                        ))
                    })?;
                    Arc::new(SapConnector::new(
                        system.name.clone(),
                        system.base_url.clone(),
                        &pem,
                        erp_timeout,
                    )?)
                }
                "quickbooks" => Arc::new(QuickBooksConnector::new(
                    system.name.clone(),
                    system.base_url.clone(),
                    system.api_key.clone(),
                    erp_timeout,
                )),
                "generic" => Arc::new(GenericConnector::new(
                    system.name.clone(),
                    system.base_url.clone(),
                    Some(system.api_key.clone()).filter(|k| !k.is_empty()),
                    erp_timeout,
                )),
                "mock" => {
                    tracing::info!(system = %system.name, "Using mock ERP connector");
                    Arc::new(MockErpConnector::new(&system.name))
                }
                other => {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "unknown ERP system type: {}",
                        other
                    )));
                }
            };
            connectors.push(connector);
        }

        let transport: Arc<dyn MessageTransport> = match &config.communicator.webhook_url {
            Some(url) => {
                tracing::info!("Webhook transport initialized");
                Arc::new(WebhookTransport::new(
                    url.clone(),
                    Duration::from_secs(config.communicator.transport_timeout_secs),
                ))
            }
            None => {
                tracing::info!("No transport configured, using mock transport");
                Arc::new(MockTransport::new(true))
            }
        };

        let documents: Arc<dyn DocumentSource> = Arc::new(HttpDocumentSource::new(
            Duration::from_secs(config.extractor.document_fetch_timeout_secs),
        ));

        Self::build_with(
            config,
            Components {
                store,
                connectors,
                transport,
                documents,
            },
        )
        .await
    }

    pub async fn build_with(
        config: CashAppConfig,
        components: Components,
    ) -> Result<Self, AppError> {
        let store = components.store;

        let layout = config
            .extractor
            .layout_enabled
            .then(|| LayoutTier::new(config.extractor.layout_cost));
        let cloud = config.extractor.cloud_endpoint.as_ref().map(|endpoint| {
            CloudTier::new(
                endpoint.clone(),
                config.extractor.cloud_api_key.clone(),
                config.extractor.cloud_cost,
                Duration::from_secs(config.extractor.tier_timeout_secs),
            )
        });
        let extractor = Arc::new(Extractor::new(
            layout,
            cloud,
            components.documents,
            config.extractor.confidence_threshold,
            Duration::from_secs(config.extractor.tier_timeout_secs),
        ));

        let erp = Arc::new(ErpFacade::new(
            components.connectors,
            config.erp.max_connections_per_system,
        ));

        let communicator = Arc::new(Communicator::new(
            TemplateRegistry::with_defaults(),
            components.transport,
            store.clone(),
            config.communicator.notification_rate_per_recipient,
            Duration::from_secs(config.communicator.delivery_retry_cap_secs),
        ));

        let policy = MatchPolicy {
            amount_tolerance_pct: config.matching.amount_tolerance_pct,
            short_write_off_threshold: config.matching.short_write_off_threshold,
            auto_apply_ceiling: config.matching.auto_apply_ceiling,
            require_customer_match: config.matching.require_customer_match,
            allow_partial_allocation: config.matching.allow_partial_allocation,
            perfect_match_only: config.matching.perfect_match_only,
        };
        let settings = OrchestratorSettings {
            max_concurrent_transactions: config.orchestrator.max_concurrent_transactions,
            workflow_timeout: Duration::from_secs(config.orchestrator.workflow_timeout_secs),
            extract_timeout: Duration::from_secs(config.orchestrator.extract_timeout_secs),
            fetch_timeout: Duration::from_secs(config.orchestrator.fetch_timeout_secs),
            post_timeout: Duration::from_secs(config.orchestrator.post_timeout_secs),
            communicate_timeout: Duration::from_secs(config.orchestrator.communicate_timeout_secs),
            busy_policy: BusyPolicy::from_str(&config.orchestrator.busy_policy),
            enable_autonomous_erp_updates: config.orchestrator.enable_autonomous_erp_updates,
            notify_in_read_only: config.orchestrator.notify_in_read_only,
            send_confirmations: config.orchestrator.send_confirmations,
            ar_team_recipient: config.orchestrator.ar_team_recipient.clone(),
        };

        let engine = WorkflowEngine::new(
            store.clone(),
            extractor.clone(),
            erp.clone(),
            communicator.clone(),
            policy,
            settings,
            TierPreference::from_str(&config.extractor.tier_preference),
        );

        // Reconcile workflows left in flight by a previous instance.
        engine.recover().await?;

        let state = AppState {
            config: config.clone(),
            store,
            engine,
            extractor,
            erp,
            communicator,
        };

        let app = Router::new()
            .route("/health", get(handlers::health_check))
            .route("/metrics", get(handlers::metrics_endpoint))
            .route(
                "/workflows/cash-application/start",
                post(handlers::start_workflow),
            )
            .route("/workflows/:id", get(handlers::get_workflow))
            .route("/workflows/:id/cancel", post(handlers::cancel_workflow))
            .route("/extract", post(handlers::extract))
            .route("/invoices/fetch", post(handlers::fetch_invoices))
            .route("/applications", post(handlers::post_application))
            .route("/erp/:system/test", get(handlers::test_erp_connection))
            .route("/notifications", post(handlers::dispatch_notification))
            .layer(TraceLayer::new_for_http())
            .with_state(state.clone());

        let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind TCP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Cash application service listening on port {}", port);

        let server = axum::serve(listener, app);

        Ok(Self {
            port,
            server: Box::new(server.into_future()),
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.server.await
    }
}
