//! Tier 3: remote form-recognition service.

use super::pattern::normalize_id;
use super::{ExtractResult, ExtractionTier, TierError};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct CloudExtractBody<'a> {
    document_uris: &'a [String],
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct CloudExtractResponse {
    invoice_ids: Vec<String>,
    confidence: f64,
}

pub struct CloudTier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    cost_per_call: Decimal,
}

impl CloudTier {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        cost_per_call: Decimal,
        timeout: Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            endpoint,
            api_key,
            cost_per_call,
        }
    }

    pub async fn extract(
        &self,
        document_uris: &[String],
        corpus: &[(String, String)],
        client_id: Option<&str>,
    ) -> Result<ExtractResult, TierError> {
        let text = corpus
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut request = self.client.post(&self.endpoint).json(&CloudExtractBody {
            document_uris,
            text,
            client_id,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TierError::Failed(format!("cloud extractor unreachable: {}", e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TierError::Failed(format!(
                "cloud extractor returned {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(TierError::Rejected(format!(
                "cloud extractor returned {}",
                status
            )));
        }

        let body: CloudExtractResponse = response
            .json()
            .await
            .map_err(|e| TierError::Failed(format!("cloud extractor bad response: {}", e)))?;

        let mut seen = HashSet::new();
        let invoice_ids: Vec<String> = body
            .invoice_ids
            .iter()
            .map(|id| normalize_id(id))
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();

        Ok(ExtractResult {
            invoice_ids,
            confidence: body.confidence.clamp(0.0, 1.0),
            tier_used: ExtractionTier::Cloud,
            cost_estimate: self.cost_per_call,
            processing_time_ms: 0,
            per_document: Vec::new(),
        })
    }
}
