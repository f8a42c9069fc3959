use rust_decimal::Decimal;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct CashAppConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub matching: MatchingConfig,
    pub extractor: ExtractorConfig,
    pub erp: ErpConfig,
    pub communicator: CommunicatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// When unset the service runs on the in-memory store.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    pub max_concurrent_transactions: usize,
    pub workflow_timeout_secs: u64,
    pub extract_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub post_timeout_secs: u64,
    pub communicate_timeout_secs: u64,
    /// "block" queues submissions at capacity; "reject" returns Busy.
    pub busy_policy: String,
    /// Master switch. When false no ERP writes happen and matched work
    /// lands in review.
    pub enable_autonomous_erp_updates: bool,
    /// Whether communications still go out in read-only mode.
    pub notify_in_read_only: bool,
    pub send_confirmations: bool,
    pub ar_team_recipient: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MatchingConfig {
    pub amount_tolerance_pct: Decimal,
    pub short_write_off_threshold: Decimal,
    pub auto_apply_ceiling: Option<Decimal>,
    pub require_customer_match: bool,
    pub allow_partial_allocation: bool,
    pub perfect_match_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractorConfig {
    /// "auto", "pattern", "layout" or "cloud".
    pub tier_preference: String,
    pub confidence_threshold: f64,
    pub tier_timeout_secs: u64,
    pub layout_enabled: bool,
    pub layout_cost: Decimal,
    pub cloud_endpoint: Option<String>,
    pub cloud_api_key: Option<String>,
    pub cloud_cost: Decimal,
    pub document_fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErpConfig {
    pub systems: Vec<ErpSystemConfig>,
    pub default_system: String,
    pub max_connections_per_system: usize,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErpSystemConfig {
    pub name: String,
    /// "netsuite", "sap", "quickbooks", "generic" or "mock".
    pub system_type: String,
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub api_key: String,
    pub certificate_pem_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommunicatorConfig {
    /// Relay endpoint; unset selects the mock transport.
    pub webhook_url: Option<String>,
    pub notification_rate_per_recipient: u32,
    pub delivery_retry_cap_secs: u64,
    pub transport_timeout_secs: u64,
}

impl CashAppConfig {
    pub fn load() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let erp_names = get_env("ERP_SYSTEMS", Some("mock"), is_prod)?;
        let systems = erp_names
            .split(',')
            .map(|raw| raw.trim())
            .filter(|name| !name.is_empty())
            .map(|name| load_erp_system(name, is_prod))
            .collect::<Result<Vec<_>, _>>()?;
        let default_system = get_env(
            "ERP_DEFAULT_SYSTEM",
            systems.first().map(|s| s.name.as_str()),
            is_prod,
        )?;

        Ok(CashAppConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some("cash-application-service"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").ok(),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 1)?,
            },
            orchestrator: OrchestratorConfig {
                max_concurrent_transactions: parse_env("MAX_CONCURRENT_TRANSACTIONS", 10)?,
                workflow_timeout_secs: parse_env("WORKFLOW_TIMEOUT_SECS", 600)?,
                extract_timeout_secs: parse_env("EXTRACT_TIMEOUT_SECS", 30)?,
                fetch_timeout_secs: parse_env("FETCH_TIMEOUT_SECS", 15)?,
                post_timeout_secs: parse_env("POST_TIMEOUT_SECS", 30)?,
                communicate_timeout_secs: parse_env("COMMUNICATE_TIMEOUT_SECS", 20)?,
                busy_policy: get_env("BUSY_POLICY", Some("block"), is_prod)?,
                enable_autonomous_erp_updates: parse_env("ENABLE_AUTONOMOUS_ERP_UPDATES", true)?,
                notify_in_read_only: parse_env("NOTIFY_IN_READ_ONLY", true)?,
                send_confirmations: parse_env("SEND_CONFIRMATIONS", false)?,
                ar_team_recipient: get_env("AR_TEAM_RECIPIENT", Some("ar-team"), is_prod)?,
            },
            matching: MatchingConfig {
                amount_tolerance_pct: parse_decimal_env("AMOUNT_TOLERANCE_PCT", "0")?,
                short_write_off_threshold: parse_decimal_env("SHORT_WRITE_OFF_THRESHOLD", "0")?,
                auto_apply_ceiling: optional_decimal_env("AUTO_APPLY_CEILING")?,
                require_customer_match: parse_env("REQUIRE_CUSTOMER_MATCH", false)?,
                allow_partial_allocation: parse_env("ALLOW_PARTIAL_ALLOCATION", true)?,
                perfect_match_only: parse_env("PERFECT_MATCH_ONLY", false)?,
            },
            extractor: ExtractorConfig {
                tier_preference: get_env("EXTRACTOR_TIER_PREFERENCE", Some("auto"), is_prod)?,
                confidence_threshold: parse_env("EXTRACTOR_CONFIDENCE_THRESHOLD", 0.85)?,
                tier_timeout_secs: parse_env("EXTRACTOR_TIER_TIMEOUT_SECS", 30)?,
                layout_enabled: parse_env("EXTRACTOR_LAYOUT_ENABLED", true)?,
                layout_cost: parse_decimal_env("EXTRACTOR_LAYOUT_COST", "0.01")?,
                cloud_endpoint: env::var("EXTRACTOR_CLOUD_ENDPOINT").ok(),
                cloud_api_key: env::var("EXTRACTOR_CLOUD_API_KEY").ok(),
                cloud_cost: parse_decimal_env("EXTRACTOR_CLOUD_COST", "0.10")?,
                document_fetch_timeout_secs: parse_env("DOCUMENT_FETCH_TIMEOUT_SECS", 10)?,
            },
            erp: ErpConfig {
                systems,
                default_system,
                max_connections_per_system: parse_env("ERP_MAX_CONNECTIONS_PER_SYSTEM", 8)?,
                request_timeout_secs: parse_env("ERP_REQUEST_TIMEOUT_SECS", 15)?,
            },
            communicator: CommunicatorConfig {
                webhook_url: env::var("NOTIFICATION_WEBHOOK_URL").ok(),
                notification_rate_per_recipient: parse_env("NOTIFICATION_RATE_PER_RECIPIENT", 10)?,
                delivery_retry_cap_secs: parse_env("DELIVERY_RETRY_CAP_SECS", 30)?,
                transport_timeout_secs: parse_env("TRANSPORT_TIMEOUT_SECS", 20)?,
            },
        })
    }
}

fn load_erp_system(name: &str, is_prod: bool) -> Result<ErpSystemConfig, AppError> {
    let key = |suffix: &str| format!("ERP_{}_{}", name.to_uppercase().replace('-', "_"), suffix);
    Ok(ErpSystemConfig {
        name: name.to_string(),
        system_type: get_env(&key("TYPE"), Some(name), is_prod)?,
        base_url: get_env(&key("BASE_URL"), Some(""), is_prod)?,
        client_id: get_env(&key("CLIENT_ID"), Some(""), is_prod)?,
        client_secret: get_env(&key("CLIENT_SECRET"), Some(""), is_prod)?,
        api_key: get_env(&key("API_KEY"), Some(""), is_prod)?,
        certificate_pem_path: get_env(&key("CERT_PATH"), Some(""), is_prod)?,
    })
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(val) => val.parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, val))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_decimal_env(key: &str, default: &str) -> Result<Decimal, AppError> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    Decimal::from_str(&raw)
        .map_err(|_| AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, raw)))
}

fn optional_decimal_env(key: &str) -> Result<Option<Decimal>, AppError> {
    match env::var(key) {
        Ok(raw) => Decimal::from_str(&raw).map(Some).map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, raw))
        }),
        Err(_) => Ok(None),
    }
}
