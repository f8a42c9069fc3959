//! Tier 1: regex pattern extraction. Fast, free, never fails.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Ordered pattern set with a strictness weight per format. Stricter
/// formats carry more confidence when they hit.
static PATTERNS: Lazy<Vec<(Regex, f64)>> = Lazy::new(|| {
    vec![
        // INV-2024-0042
        (
            Regex::new(r"\bINV-\d{4}-\d{3,6}\b").expect("invalid invoice pattern"),
            1.0,
        ),
        // INV-12345, INV_12345, INV 12345, INV-A
        (
            Regex::new(r"\bINV[-_ ][A-Z0-9][A-Z0-9-]{0,15}\b").expect("invalid invoice pattern"),
            0.8,
        ),
        // INV12345
        (
            Regex::new(r"\bINV\d{3,8}\b").expect("invalid invoice pattern"),
            0.8,
        ),
        // Invoice #: X / Invoice no X / Invoice number: X
        (
            Regex::new(r"\bINVOICE\s*(?:#|NO\.?|NUMBER)?\s*[:#]?\s*([A-Z0-9][A-Z0-9/_-]{2,18})\b")
                .expect("invalid invoice pattern"),
            0.6,
        ),
        // Bill #: X
        (
            Regex::new(r"\bBILL\s*(?:#|NO\.?|NUMBER)?\s*[:#]?\s*([A-Z0-9][A-Z0-9/_-]{2,18})\b")
                .expect("invalid invoice pattern"),
            0.6,
        ),
        // PO-12345 and variants
        (
            Regex::new(r"\bPO[-_ ]?\d{3,10}\b").expect("invalid invoice pattern"),
            0.5,
        ),
    ]
});

/// Tokens the looser patterns sometimes capture that are never ids.
const STOPWORDS: &[&str] = &["INVOICE", "NUMBER", "TOTAL", "AMOUNT", "PAYMENT", "DATE"];

#[derive(Debug, Clone)]
pub struct PatternHit {
    pub invoice_ids: Vec<String>,
    pub matches_found: usize,
    pub format_strictness: f64,
}

#[derive(Default)]
pub struct PatternTier;

impl PatternTier {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str) -> PatternHit {
        let cleaned = clean_text(text);

        let mut ids: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut matches_found = 0usize;
        let mut format_strictness = 0.0f64;

        for (pattern, strictness) in PATTERNS.iter() {
            for caps in pattern.captures_iter(&cleaned) {
                let raw = caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                let id = normalize_id(raw);
                if !is_valid_id(&id) {
                    continue;
                }
                matches_found += 1;
                format_strictness = format_strictness.max(*strictness);
                if seen.insert(id.clone()) {
                    ids.push(id);
                }
            }
        }

        PatternHit {
            invoice_ids: ids,
            matches_found,
            format_strictness,
        }
    }
}

fn clean_text(text: &str) -> String {
    let collapsed: String = text
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || "-_#:./ ".contains(c) {
                c
            } else {
                ' '
            }
        })
        .collect();
    collapsed
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Canonical form of an extracted id: trimmed, uppercased, surrounding
/// punctuation stripped. Idempotent.
pub fn normalize_id(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_uppercase()
}

fn is_valid_id(id: &str) -> bool {
    if id.len() < 4 || id.len() > 20 {
        return false;
    }
    let distinct: HashSet<char> = id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if distinct.len() < 2 {
        return false;
    }
    !STOPWORDS.contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_dashed_invoice_reference() {
        let hit = PatternTier::new().extract("Payment for INV-12345, thanks");
        assert_eq!(hit.invoice_ids, vec!["INV-12345"]);
        assert!(hit.matches_found >= 1);
    }

    #[test]
    fn extracts_year_format_with_high_strictness() {
        let hit = PatternTier::new().extract("settles INV-2024-0042 in full");
        assert!(hit.invoice_ids.contains(&"INV-2024-0042".to_string()));
        assert_eq!(hit.format_strictness, 1.0);
    }

    #[test]
    fn extracts_labelled_reference() {
        let hit = PatternTier::new().extract("Invoice #: AB-9981");
        assert!(hit.invoice_ids.contains(&"AB-9981".to_string()));
    }

    #[test]
    fn extracts_multiple_ids_preserving_first_seen_order() {
        let hit = PatternTier::new().extract("covers INV-1A and INV-2B plus INV-1A again");
        assert_eq!(hit.invoice_ids, vec!["INV-1A", "INV-2B"]);
    }

    #[test]
    fn lowercase_input_is_uppercased() {
        let hit = PatternTier::new().extract("payment for inv-777x");
        assert_eq!(hit.invoice_ids, vec!["INV-777X"]);
    }

    #[test]
    fn plain_prose_yields_nothing() {
        let hit = PatternTier::new().extract("wire from ACME Corp, no reference given");
        assert!(hit.invoice_ids.is_empty());
    }

    #[test]
    fn rejects_degenerate_ids() {
        assert!(!is_valid_id("INV"));
        assert!(!is_valid_id("11111"));
        assert!(!is_valid_id("INVOICE"));
        assert!(is_valid_id("INV-12345"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = ["  inv-123. ", "(INV-99)", "inv_77:", "INV-2024-0042"];
        for s in samples {
            let once = normalize_id(s);
            assert_eq!(normalize_id(&once), once);
        }
    }
}
