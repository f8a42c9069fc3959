//! Tier 2: layout-aware extraction.
//!
//! A local rule-and-layout engine: candidate tokens are scored by their
//! proximity to labelling keywords and their vertical position on the
//! page. Carries a small per-call cost.

use super::pattern::normalize_id;
use super::{DocumentExtraction, ExtractResult, ExtractionTier, TierError};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::collections::HashSet;

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z]{2,4}[-_]?\d[A-Z0-9-]{1,15}\b").expect("invalid token pattern"));

const KEYWORDS: &[&str] = &["INVOICE", "BILL", "REFERENCE", "REF", "PO", "DOCUMENT"];

pub struct LayoutTier {
    cost_per_call: Decimal,
}

impl LayoutTier {
    pub fn new(cost_per_call: Decimal) -> Self {
        Self { cost_per_call }
    }

    pub async fn extract(
        &self,
        corpus: &[(String, String)],
    ) -> Result<ExtractResult, TierError> {
        let mut ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut per_document = Vec::new();
        let mut hits = 0usize;

        for (source, text) in corpus {
            let mut doc_ids = Vec::new();
            let upper = text.to_uppercase();
            let lines: Vec<&str> = upper.lines().collect();
            let header_cutoff = (lines.len() / 3).max(1);

            for (line_no, line) in lines.iter().enumerate() {
                let labelled = KEYWORDS.iter().any(|k| line.contains(k));
                // Tokens in the header third count even without a label.
                if !labelled && line_no >= header_cutoff {
                    continue;
                }
                for m in TOKEN.find_iter(line) {
                    let id = normalize_id(m.as_str());
                    if id.len() < 4 || KEYWORDS.contains(&id.as_str()) {
                        continue;
                    }
                    hits += 1;
                    if seen.insert(id.clone()) {
                        ids.push(id.clone());
                        doc_ids.push(id);
                    }
                }
            }

            per_document.push(DocumentExtraction {
                uri: source.clone(),
                invoice_ids: doc_ids,
                error: None,
            });
        }

        let confidence = if ids.is_empty() {
            0.0
        } else {
            (0.55 + 0.15 * hits.min(3) as f64).min(1.0)
        };

        Ok(ExtractResult {
            invoice_ids: ids,
            confidence,
            tier_used: ExtractionTier::Layout,
            cost_estimate: self.cost_per_call,
            processing_time_ms: 0,
            per_document,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[tokio::test]
    async fn scores_labelled_lines() {
        let tier = LayoutTier::new(Decimal::from_str("0.01").unwrap());
        let corpus = vec![(
            "doc-1".to_string(),
            "ACME Corp\nInvoice: INV-4411\n\nline items follow\ntotal 99".to_string(),
        )];

        let result = tier.extract(&corpus).await.unwrap();
        assert!(result.invoice_ids.contains(&"INV-4411".to_string()));
        assert!(result.confidence > 0.5);
    }

    #[tokio::test]
    async fn unlabelled_body_lines_are_ignored() {
        let tier = LayoutTier::new(Decimal::ZERO);
        let corpus = vec![(
            "doc-1".to_string(),
            "header\nrow\nrow\nrow\nrow\nrow\nsomething ACC-99999 deep in the body".to_string(),
        )];

        let result = tier.extract(&corpus).await.unwrap();
        assert!(result.invoice_ids.is_empty());
        assert_eq!(result.confidence, 0.0);
    }
}
