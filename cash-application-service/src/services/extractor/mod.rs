//! Invoice-id extraction from remittance text and attached documents.
//!
//! Three cost-tiered implementations behind one capability: a free regex
//! pattern tier, a local layout-scoring tier, and a remote form-recognition
//! tier. With `Auto` preference the cascade stops at the first tier whose
//! confidence clears the threshold.

mod cloud;
mod layout;
mod pattern;

pub use cloud::CloudTier;
pub use layout::LayoutTier;
pub use pattern::{normalize_id, PatternTier};

use crate::services::metrics;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::{retry_call, RetryClass, RetryConfig};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Pattern-tier results at or above this confidence stop the cascade
/// without consulting the paid tiers.
const PATTERN_SHORT_CIRCUIT_CONFIDENCE: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionTier {
    Pattern,
    Layout,
    Cloud,
}

impl ExtractionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Layout => "layout",
            Self::Cloud => "cloud",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierPreference {
    #[default]
    Auto,
    Pattern,
    Layout,
    Cloud,
}

impl TierPreference {
    pub fn from_str(s: &str) -> Self {
        match s {
            "pattern" => Self::Pattern,
            "layout" => Self::Layout,
            "cloud" => Self::Cloud,
            _ => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractRequest {
    pub document_uris: Vec<String>,
    pub remittance_text: String,
    pub client_id: Option<String>,
    pub tier_preference: TierPreference,
    pub confidence_threshold: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentExtraction {
    pub uri: String,
    pub invoice_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResult {
    pub invoice_ids: Vec<String>,
    pub confidence: f64,
    pub tier_used: ExtractionTier,
    #[serde(with = "rust_decimal::serde::str")]
    pub cost_estimate: Decimal,
    pub processing_time_ms: u64,
    pub per_document: Vec<DocumentExtraction>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    /// The requested tiers failed; `partial` carries whatever the earlier
    /// tiers produced so the caller can still attempt a match.
    #[error("extractor unavailable: {message}")]
    Unavailable {
        message: String,
        partial: Option<ExtractResult>,
    },

    #[error("extraction tier not configured: {0}")]
    TierNotConfigured(String),
}

/// Transient failure classification for the remote tiers.
#[derive(Debug, Error)]
pub enum TierError {
    #[error("tier timeout")]
    Timeout,
    #[error("tier call failed: {0}")]
    Failed(String),
    #[error("tier rejected request: {0}")]
    Rejected(String),
}

impl RetryClass for TierError {
    fn is_transient(&self) -> bool {
        matches!(self, TierError::Timeout | TierError::Failed(_))
    }
}

/// Source of raw text for a document URI. OCR and blob storage live behind
/// this capability; the extractor only sees text.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_text(&self, uri: &str) -> Result<String, AppError>;
}

/// Fetches document text over HTTP.
pub struct HttpDocumentSource {
    client: reqwest::Client,
}

impl HttpDocumentSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl DocumentSource for HttpDocumentSource {
    async fn fetch_text(&self, uri: &str) -> Result<String, AppError> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| AppError::BadGateway(format!("document fetch failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AppError::BadGateway(format!(
                "document fetch returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| AppError::BadGateway(format!("document read failed: {}", e)))
    }
}

/// In-memory document source for tests and demos.
#[derive(Default)]
pub struct StaticDocumentSource {
    documents: std::collections::HashMap<String, String>,
}

impl StaticDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, uri: &str, text: &str) -> Self {
        self.documents.insert(uri.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl DocumentSource for StaticDocumentSource {
    async fn fetch_text(&self, uri: &str) -> Result<String, AppError> {
        self.documents
            .get(uri)
            .cloned()
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("unknown document: {}", uri)))
    }
}

pub struct Extractor {
    pattern: PatternTier,
    layout: Option<LayoutTier>,
    cloud: Option<CloudTier>,
    documents: Arc<dyn DocumentSource>,
    default_threshold: f64,
    tier_timeout: Duration,
    retry: RetryConfig,
}

impl Extractor {
    pub fn new(
        layout: Option<LayoutTier>,
        cloud: Option<CloudTier>,
        documents: Arc<dyn DocumentSource>,
        default_threshold: f64,
        tier_timeout: Duration,
    ) -> Self {
        Self {
            pattern: PatternTier::new(),
            layout,
            cloud,
            documents,
            default_threshold,
            tier_timeout,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff: Duration::from_millis(200),
                ..RetryConfig::default()
            },
        }
    }

    pub async fn extract(&self, req: &ExtractRequest) -> Result<ExtractResult, ExtractError> {
        let started = Instant::now();
        let threshold = req.confidence_threshold.unwrap_or(self.default_threshold);

        // Gather text up front; per-document failures degrade, not abort.
        let mut corpus: Vec<(String, String)> = Vec::new();
        if !req.remittance_text.trim().is_empty() {
            corpus.push(("remittance".to_string(), req.remittance_text.clone()));
        }
        let mut per_document: Vec<DocumentExtraction> = Vec::new();
        for uri in &req.document_uris {
            match self.documents.fetch_text(uri).await {
                Ok(text) => {
                    corpus.push((uri.clone(), text));
                    per_document.push(DocumentExtraction {
                        uri: uri.clone(),
                        invoice_ids: Vec::new(),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(uri = %uri, error = %e, "Document fetch failed");
                    per_document.push(DocumentExtraction {
                        uri: uri.clone(),
                        invoice_ids: Vec::new(),
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let result = match req.tier_preference {
            TierPreference::Pattern => {
                Ok(self.run_pattern(&corpus, &mut per_document, started))
            }
            TierPreference::Layout => self.run_layout(&corpus, started, None).await,
            TierPreference::Cloud => self.run_cloud(req, &corpus, started, None).await,
            TierPreference::Auto => {
                let pattern = self.run_pattern(&corpus, &mut per_document, started);
                if pattern.confidence >= PATTERN_SHORT_CIRCUIT_CONFIDENCE {
                    Ok(pattern)
                } else {
                    self.cascade_beyond_pattern(req, &corpus, started, threshold, pattern)
                        .await
                }
            }
        };

        match result {
            Ok(mut result) => {
                result.processing_time_ms = started.elapsed().as_millis() as u64;
                if result.per_document.is_empty() {
                    result.per_document = per_document;
                }
                metrics::record_extraction(result.tier_used.as_str(), !result.invoice_ids.is_empty());
                info!(
                    tier = result.tier_used.as_str(),
                    ids = result.invoice_ids.len(),
                    confidence = result.confidence,
                    "Extraction completed"
                );
                Ok(result)
            }
            Err(e) => {
                metrics::record_extraction("none", false);
                Err(e)
            }
        }
    }

    async fn cascade_beyond_pattern(
        &self,
        req: &ExtractRequest,
        corpus: &[(String, String)],
        started: Instant,
        threshold: f64,
        pattern: ExtractResult,
    ) -> Result<ExtractResult, ExtractError> {
        let mut best = pattern;

        if self.layout.is_some() {
            match self.run_layout(corpus, started, Some(best.clone())).await {
                Ok(layout) => {
                    if layout.confidence >= threshold {
                        return Ok(layout);
                    }
                    if layout.confidence > best.confidence {
                        best = layout;
                    }
                }
                Err(ExtractError::Unavailable { message, .. }) => {
                    warn!(error = %message, "Layout tier unavailable, continuing cascade");
                }
                Err(e) => return Err(e),
            }
        }

        if self.cloud.is_some() {
            // The cloud tier is terminal: its answer is returned as-is.
            return self.run_cloud(req, corpus, started, Some(best)).await;
        }

        // A pattern-only deployment reports its own tier and confidence.
        Ok(best)
    }

    fn run_pattern(
        &self,
        corpus: &[(String, String)],
        per_document: &mut [DocumentExtraction],
        started: Instant,
    ) -> ExtractResult {
        let mut all_ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut matches_found = 0usize;
        let mut max_strictness = 0.0f64;

        for (source, text) in corpus {
            let hit = self.pattern.extract(text);
            matches_found += hit.matches_found;
            max_strictness = max_strictness.max(hit.format_strictness);
            if let Some(doc) = per_document.iter_mut().find(|d| &d.uri == source) {
                doc.invoice_ids = hit.invoice_ids.clone();
            }
            for id in hit.invoice_ids {
                if seen.insert(id.clone()) {
                    all_ids.push(id);
                }
            }
        }

        let confidence = if all_ids.is_empty() {
            0.0
        } else {
            (0.5 + 0.1 * matches_found as f64 + 0.2 * max_strictness).min(1.0)
        };

        ExtractResult {
            invoice_ids: all_ids,
            confidence,
            tier_used: ExtractionTier::Pattern,
            cost_estimate: Decimal::ZERO,
            processing_time_ms: started.elapsed().as_millis() as u64,
            per_document: Vec::new(),
        }
    }

    async fn run_layout(
        &self,
        corpus: &[(String, String)],
        started: Instant,
        partial: Option<ExtractResult>,
    ) -> Result<ExtractResult, ExtractError> {
        let Some(layout) = &self.layout else {
            return Err(ExtractError::TierNotConfigured("layout".to_string()));
        };

        let outcome = retry_call(&self.retry, "layout_extract", || async {
            tokio::time::timeout(self.tier_timeout, layout.extract(corpus))
                .await
                .map_err(|_| TierError::Timeout)?
        })
        .await;

        match outcome {
            Ok(mut result) => {
                result.processing_time_ms = started.elapsed().as_millis() as u64;
                Ok(result)
            }
            Err(e) => Err(ExtractError::Unavailable {
                message: e.to_string(),
                partial,
            }),
        }
    }

    async fn run_cloud(
        &self,
        req: &ExtractRequest,
        corpus: &[(String, String)],
        started: Instant,
        partial: Option<ExtractResult>,
    ) -> Result<ExtractResult, ExtractError> {
        let Some(cloud) = &self.cloud else {
            return Err(ExtractError::TierNotConfigured("cloud".to_string()));
        };

        let outcome = retry_call(&self.retry, "cloud_extract", || async {
            tokio::time::timeout(
                self.tier_timeout,
                cloud.extract(&req.document_uris, corpus, req.client_id.as_deref()),
            )
            .await
            .map_err(|_| TierError::Timeout)?
        })
        .await;

        match outcome {
            Ok(mut result) => {
                result.processing_time_ms = started.elapsed().as_millis() as u64;
                Ok(result)
            }
            Err(e) => Err(ExtractError::Unavailable {
                message: e.to_string(),
                partial,
            }),
        }
    }
}
