//! Cascading payment-to-invoice allocation.
//!
//! Pure and deterministic: no I/O, no clock reads, lexicographic
//! tie-breaks. The orchestrator supplies fetched invoices and the policy;
//! the matcher returns an allocation plus the recommended next action.

use crate::models::{DiscrepancyCode, Invoice, MatchStatus};
use rust_decimal::Decimal;
use std::collections::HashSet;

/// Emitted on every result so the active cascade can be A/B'd and rolled
/// back by version.
pub const ALGORITHM_VERSION: &str = "cascade-v2";

#[derive(Debug, Clone)]
pub struct MatchPolicy {
    /// Tolerance on exact-match comparisons, as a percentage of the
    /// payment amount.
    pub amount_tolerance_pct: Decimal,
    /// Over-payment remainders at or below this amount are written off.
    /// Zero disables write-offs.
    pub short_write_off_threshold: Decimal,
    /// Payments above this amount always require human review.
    pub auto_apply_ceiling: Option<Decimal>,
    /// Require the payer to be identified and to own every allocated
    /// invoice.
    pub require_customer_match: bool,
    /// When false, allocations spanning several invoices must sum exactly.
    pub allow_partial_allocation: bool,
    /// When true, only perfect 1:1 and 1:N matches qualify for autonomous
    /// posting.
    pub perfect_match_only: bool,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            amount_tolerance_pct: Decimal::ZERO,
            short_write_off_threshold: Decimal::ZERO,
            auto_apply_ceiling: None,
            require_customer_match: false,
            allow_partial_allocation: true,
            perfect_match_only: false,
        }
    }
}

/// The slice of a payment the matcher operates on.
#[derive(Debug, Clone)]
pub struct PaymentView {
    pub transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub invoice_id: String,
    pub erp_system: String,
    pub amount_applied: Decimal,
}

/// What the orchestrator should do with a completed match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Post to ERP; send a confirmation if policy enables it.
    PostAndConfirm,
    /// Post partial applications and ask the customer to clarify.
    PostAndClarify,
    /// Post the allocated portion and alert the AR team.
    PostAndAlert,
    /// Post; the written-off remainder needs no communication.
    PostOnly,
    /// No ERP write; alert the AR team.
    AlertOnly,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PostAndConfirm => "post_and_confirm",
            Self::PostAndClarify => "post_and_clarify",
            Self::PostAndAlert => "post_and_alert",
            Self::PostOnly => "post_only",
            Self::AlertOnly => "alert_only",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "post_and_confirm" => Self::PostAndConfirm,
            "post_and_clarify" => Self::PostAndClarify,
            "post_and_alert" => Self::PostAndAlert,
            "post_only" => Self::PostOnly,
            _ => Self::AlertOnly,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub status: MatchStatus,
    pub discrepancy: DiscrepancyCode,
    pub confidence: f64,
    pub unapplied_amount: Decimal,
    pub allocations: Vec<Allocation>,
    pub log_entry: String,
    pub requires_human_review: bool,
    pub next_action: NextAction,
}

/// Run the cascade: the first rule whose preconditions hold wins.
pub fn match_payment(
    payment: &PaymentView,
    candidate_ids: &[String],
    invoices: &[Invoice],
    policy: &MatchPolicy,
) -> MatchOutcome {
    let mut outcome = run_cascade(payment, candidate_ids, invoices, policy);
    apply_review_gates(payment, invoices, policy, &mut outcome);

    if let Err(violation) = verify_allocation(payment, invoices, policy, &outcome) {
        return MatchOutcome {
            status: MatchStatus::Error,
            discrepancy: DiscrepancyCode::None,
            confidence: 0.0,
            unapplied_amount: payment.amount,
            allocations: Vec::new(),
            log_entry: format!("allocation invariant violated: {}", violation),
            requires_human_review: true,
            next_action: NextAction::AlertOnly,
        };
    }

    outcome
}

fn run_cascade(
    payment: &PaymentView,
    candidate_ids: &[String],
    invoices: &[Invoice],
    policy: &MatchPolicy,
) -> MatchOutcome {
    // Rule 1: currency guard over every candidate invoice.
    if invoices.iter().any(|inv| inv.currency != payment.currency) {
        let offending: Vec<&str> = invoices
            .iter()
            .filter(|inv| inv.currency != payment.currency)
            .map(|inv| inv.invoice_id.as_str())
            .collect();
        return unmatched(
            payment,
            DiscrepancyCode::CurrencyMismatch,
            format!(
                "currency mismatch: payment in {}, invoices {} differ",
                payment.currency,
                offending.join(", ")
            ),
        );
    }

    let mut payable = dedup_payable(invoices);

    // Rule 6: nothing to allocate against.
    if payable.is_empty() {
        return if candidate_ids.is_empty() {
            unmatched(
                payment,
                DiscrepancyCode::None,
                "no invoice references extracted from remittance data".to_string(),
            )
        } else {
            unmatched(
                payment,
                DiscrepancyCode::InvalidInvoice,
                format!(
                    "no open invoices found for candidates: {}",
                    candidate_ids.join(", ")
                ),
            )
        };
    }

    // Oldest first, nulls last, invoice_id as the deterministic tie-break.
    payable.sort_by(|a, b| match (a.due_date, b.due_date) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.invoice_id.cmp(&b.invoice_id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.invoice_id.cmp(&b.invoice_id),
    });

    let tolerance = payment.amount * policy.amount_tolerance_pct / Decimal::from(100);
    let eq_within = |a: Decimal, b: Decimal| (a - b).abs() <= tolerance;

    // Rule 2: perfect 1:1.
    let exact: Vec<&Invoice> = payable
        .iter()
        .filter(|inv| eq_within(inv.amount_due, payment.amount))
        .copied()
        .collect();
    if exact.len() == 1 {
        let inv = exact[0];
        let applied = payment.amount.min(inv.amount_due);
        return MatchOutcome {
            status: MatchStatus::Matched,
            discrepancy: DiscrepancyCode::None,
            confidence: 0.99,
            unapplied_amount: payment.amount - applied,
            allocations: vec![allocation(inv, applied)],
            log_entry: format!(
                "perfect 1:1 match against {} for {}",
                inv.invoice_id, applied
            ),
            requires_human_review: false,
            next_action: NextAction::PostAndConfirm,
        };
    }

    let total_due: Decimal = payable.iter().map(|inv| inv.amount_due).sum();

    // Rule 3: perfect 1:N, the candidate set sums to the payment. The
    // fill is capped at the remaining payment so a tolerance-admitted
    // near-match never applies more than was paid.
    if eq_within(total_due, payment.amount) {
        let mut remaining = payment.amount;
        let mut allocations: Vec<Allocation> = Vec::new();
        for inv in &payable {
            if remaining <= Decimal::ZERO {
                break;
            }
            let applied = remaining.min(inv.amount_due);
            allocations.push(allocation(inv, applied));
            remaining -= applied;
        }
        let applied: Decimal = allocations.iter().map(|a| a.amount_applied).sum();
        return MatchOutcome {
            status: MatchStatus::Matched,
            discrepancy: DiscrepancyCode::None,
            confidence: 0.95,
            unapplied_amount: payment.amount - applied,
            log_entry: format!(
                "perfect 1:{} match, {} invoices sum to {}",
                allocations.len(),
                allocations.len(),
                applied
            ),
            allocations,
            requires_human_review: false,
            next_action: NextAction::PostAndConfirm,
        };
    }

    // Rule 4: short payment, sequential oldest-first fill.
    if total_due > payment.amount {
        if !policy.allow_partial_allocation && payable.len() > 1 {
            return MatchOutcome {
                status: MatchStatus::RequiresReview,
                discrepancy: DiscrepancyCode::ShortPayment,
                confidence: 0.0,
                unapplied_amount: payment.amount,
                allocations: Vec::new(),
                log_entry: format!(
                    "payment {} short of {} across {} invoices; partial allocation disabled",
                    payment.amount,
                    total_due,
                    payable.len()
                ),
                requires_human_review: true,
                next_action: NextAction::AlertOnly,
            };
        }

        let mut remaining = payment.amount;
        let mut allocations = Vec::new();
        for inv in &payable {
            if remaining <= Decimal::ZERO {
                break;
            }
            let applied = remaining.min(inv.amount_due);
            allocations.push(allocation(inv, applied));
            remaining -= applied;
        }
        return MatchOutcome {
            status: MatchStatus::PartiallyMatched,
            discrepancy: DiscrepancyCode::ShortPayment,
            confidence: 0.85,
            unapplied_amount: Decimal::ZERO,
            log_entry: format!(
                "short payment: {} applied oldest-first against {} due",
                payment.amount, total_due
            ),
            allocations,
            requires_human_review: false,
            next_action: NextAction::PostAndClarify,
        };
    }

    // Rule 5: over-payment.
    let remainder = payment.amount - total_due;
    let allocations: Vec<Allocation> = payable
        .iter()
        .map(|inv| allocation(inv, inv.amount_due))
        .collect();

    if policy.short_write_off_threshold > Decimal::ZERO
        && remainder <= policy.short_write_off_threshold
    {
        MatchOutcome {
            status: MatchStatus::Matched,
            discrepancy: DiscrepancyCode::OverPayment,
            confidence: 0.80,
            unapplied_amount: Decimal::ZERO,
            log_entry: format!(
                "over-payment of {} written off under threshold {}",
                remainder, policy.short_write_off_threshold
            ),
            allocations,
            requires_human_review: false,
            next_action: NextAction::PostOnly,
        }
    } else {
        MatchOutcome {
            status: MatchStatus::PartiallyMatched,
            discrepancy: DiscrepancyCode::OverPayment,
            confidence: 0.70,
            unapplied_amount: remainder,
            log_entry: format!(
                "over-payment: {} exceeds total due {} by {}",
                payment.amount, total_due, remainder
            ),
            allocations,
            requires_human_review: false,
            next_action: NextAction::PostAndAlert,
        }
    }
}

fn apply_review_gates(
    payment: &PaymentView,
    invoices: &[Invoice],
    policy: &MatchPolicy,
    outcome: &mut MatchOutcome,
) {
    if outcome.allocations.is_empty() {
        return;
    }

    if let Some(ceiling) = policy.auto_apply_ceiling {
        if payment.amount > ceiling {
            outcome.requires_human_review = true;
            outcome.log_entry = format!(
                "{}; amount exceeds auto-apply ceiling {}",
                outcome.log_entry, ceiling
            );
        }
    }

    if policy.require_customer_match {
        let verified = payment
            .customer_identifier
            .as_deref()
            .map(|customer| {
                outcome.allocations.iter().all(|a| {
                    invoices
                        .iter()
                        .find(|inv| inv.invoice_id == a.invoice_id)
                        .map(|inv| inv.customer_id == customer)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        if !verified {
            outcome.requires_human_review = true;
            outcome.log_entry = format!("{}; customer verification failed", outcome.log_entry);
        }
    }

    if policy.perfect_match_only
        && !(outcome.status == MatchStatus::Matched
            && outcome.discrepancy == DiscrepancyCode::None)
    {
        outcome.requires_human_review = true;
        outcome.log_entry = format!(
            "{}; only perfect matches qualify for autonomous posting",
            outcome.log_entry
        );
    }

    if outcome.requires_human_review {
        outcome.next_action = NextAction::AlertOnly;
    }
}

/// Post-allocation invariants. A violation downgrades the whole result to
/// `Error` with no allocations.
fn verify_allocation(
    payment: &PaymentView,
    invoices: &[Invoice],
    policy: &MatchPolicy,
    outcome: &MatchOutcome,
) -> Result<(), String> {
    let applied: Decimal = outcome.allocations.iter().map(|a| a.amount_applied).sum();

    let written_off = outcome.status == MatchStatus::Matched
        && outcome.discrepancy == DiscrepancyCode::OverPayment;
    if written_off {
        let remainder = payment.amount - applied;
        if remainder < Decimal::ZERO || remainder > policy.short_write_off_threshold {
            return Err(format!(
                "written-off remainder {} outside threshold {}",
                remainder, policy.short_write_off_threshold
            ));
        }
    } else if !outcome.allocations.is_empty()
        && applied + outcome.unapplied_amount != payment.amount
    {
        return Err(format!(
            "applied {} + unapplied {} != payment {}",
            applied, outcome.unapplied_amount, payment.amount
        ));
    }

    let mut seen = HashSet::new();
    for a in &outcome.allocations {
        if a.amount_applied <= Decimal::ZERO {
            return Err(format!("non-positive application to {}", a.invoice_id));
        }
        if !seen.insert((a.invoice_id.clone(), a.erp_system.clone())) {
            return Err(format!("invoice {} allocated twice", a.invoice_id));
        }
        let due = invoices
            .iter()
            .find(|inv| inv.invoice_id == a.invoice_id && inv.erp_system == a.erp_system)
            .map(|inv| inv.amount_due)
            .unwrap_or(Decimal::ZERO);
        if a.amount_applied > due {
            return Err(format!(
                "application {} to {} exceeds amount due {}",
                a.amount_applied, a.invoice_id, due
            ));
        }
    }

    Ok(())
}

fn dedup_payable(invoices: &[Invoice]) -> Vec<&Invoice> {
    let mut seen = HashSet::new();
    invoices
        .iter()
        .filter(|inv| inv.is_payable())
        .filter(|inv| seen.insert((inv.invoice_id.clone(), inv.erp_system.clone())))
        .collect()
}

fn allocation(inv: &Invoice, amount: Decimal) -> Allocation {
    Allocation {
        invoice_id: inv.invoice_id.clone(),
        erp_system: inv.erp_system.clone(),
        amount_applied: amount,
    }
}

fn unmatched(payment: &PaymentView, code: DiscrepancyCode, log_entry: String) -> MatchOutcome {
    MatchOutcome {
        status: MatchStatus::Unmatched,
        discrepancy: code,
        confidence: 0.0,
        unapplied_amount: payment.amount,
        allocations: Vec::new(),
        log_entry,
        requires_human_review: false,
        next_action: NextAction::AlertOnly,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn invoice(id: &str, due: &str, due_date: Option<&str>) -> Invoice {
        Invoice {
            invoice_id: id.to_string(),
            erp_system: "mock".to_string(),
            customer_id: "CUST-1".to_string(),
            original_amount: dec(due),
            amount_due: dec(due),
            currency: "EUR".to_string(),
            status: "open".to_string(),
            due_date: due_date.map(|d| NaiveDate::from_str(d).unwrap()),
            erp_record_id: format!("erp-{}", id),
            fetched_utc: Utc::now(),
        }
    }

    fn payment(amount: &str) -> PaymentView {
        PaymentView {
            transaction_id: "TXN-1".to_string(),
            amount: dec(amount),
            currency: "EUR".to_string(),
            customer_identifier: Some("CUST-1".to_string()),
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn perfect_one_to_one_match() {
        let invoices = vec![invoice("INV-12345", "1000.00", None)];
        let outcome = match_payment(
            &payment("1000.00"),
            &ids(&["INV-12345"]),
            &invoices,
            &MatchPolicy::default(),
        );

        assert_eq!(outcome.status, MatchStatus::Matched);
        assert_eq!(outcome.discrepancy, DiscrepancyCode::None);
        assert_eq!(outcome.allocations.len(), 1);
        assert_eq!(outcome.allocations[0].amount_applied, dec("1000.00"));
        assert_eq!(outcome.unapplied_amount, Decimal::ZERO);
        assert_eq!(outcome.next_action, NextAction::PostAndConfirm);
    }

    #[test]
    fn perfect_one_to_n_match() {
        let invoices = vec![
            invoice("INV-1", "600.00", None),
            invoice("INV-2", "900.00", None),
        ];
        let outcome = match_payment(
            &payment("1500.00"),
            &ids(&["INV-1", "INV-2"]),
            &invoices,
            &MatchPolicy::default(),
        );

        assert_eq!(outcome.status, MatchStatus::Matched);
        assert_eq!(outcome.allocations.len(), 2);
        assert_eq!(outcome.unapplied_amount, Decimal::ZERO);
    }

    #[test]
    fn short_payment_fills_oldest_first() {
        let invoices = vec![
            invoice("INV-B", "500.00", Some("2024-02-01")),
            invoice("INV-A", "500.00", Some("2024-01-01")),
        ];
        let outcome = match_payment(
            &payment("800.00"),
            &ids(&["INV-A", "INV-B"]),
            &invoices,
            &MatchPolicy::default(),
        );

        assert_eq!(outcome.status, MatchStatus::PartiallyMatched);
        assert_eq!(outcome.discrepancy, DiscrepancyCode::ShortPayment);
        assert_eq!(outcome.unapplied_amount, Decimal::ZERO);
        assert_eq!(outcome.allocations[0].invoice_id, "INV-A");
        assert_eq!(outcome.allocations[0].amount_applied, dec("500.00"));
        assert_eq!(outcome.allocations[1].invoice_id, "INV-B");
        assert_eq!(outcome.allocations[1].amount_applied, dec("300.00"));
        assert_eq!(outcome.next_action, NextAction::PostAndClarify);
    }

    #[test]
    fn missing_due_dates_sort_last_then_by_id() {
        let invoices = vec![
            invoice("INV-Z", "400.00", None),
            invoice("INV-A", "400.00", None),
            invoice("INV-M", "400.00", Some("2024-03-01")),
        ];
        let outcome = match_payment(
            &payment("600.00"),
            &ids(&["INV-Z", "INV-A", "INV-M"]),
            &invoices,
            &MatchPolicy::default(),
        );

        assert_eq!(outcome.allocations[0].invoice_id, "INV-M");
        assert_eq!(outcome.allocations[1].invoice_id, "INV-A");
    }

    #[test]
    fn over_payment_below_threshold_is_written_off() {
        let policy = MatchPolicy {
            short_write_off_threshold: dec("10.00"),
            ..MatchPolicy::default()
        };
        let invoices = vec![invoice("INV-1", "1000.00", None)];
        let outcome = match_payment(&payment("1005.00"), &ids(&["INV-1"]), &invoices, &policy);

        assert_eq!(outcome.status, MatchStatus::Matched);
        assert_eq!(outcome.discrepancy, DiscrepancyCode::OverPayment);
        assert_eq!(outcome.unapplied_amount, Decimal::ZERO);
        assert_eq!(outcome.allocations[0].amount_applied, dec("1000.00"));
        assert_eq!(outcome.next_action, NextAction::PostOnly);
    }

    #[test]
    fn over_payment_above_threshold_leaves_remainder() {
        let policy = MatchPolicy {
            short_write_off_threshold: dec("10.00"),
            ..MatchPolicy::default()
        };
        let invoices = vec![invoice("INV-1", "1000.00", None)];
        let outcome = match_payment(&payment("1200.00"), &ids(&["INV-1"]), &invoices, &policy);

        assert_eq!(outcome.status, MatchStatus::PartiallyMatched);
        assert_eq!(outcome.discrepancy, DiscrepancyCode::OverPayment);
        assert_eq!(outcome.unapplied_amount, dec("200.00"));
        assert_eq!(outcome.next_action, NextAction::PostAndAlert);
    }

    #[test]
    fn currency_mismatch_short_circuits() {
        let mut eur = invoice("INV-EU", "1000.00", None);
        eur.currency = "EUR".to_string();
        let mut usd_payment = payment("1000.00");
        usd_payment.currency = "USD".to_string();

        let outcome = match_payment(
            &usd_payment,
            &ids(&["INV-EU"]),
            &[eur],
            &MatchPolicy::default(),
        );

        assert_eq!(outcome.status, MatchStatus::Unmatched);
        assert_eq!(outcome.discrepancy, DiscrepancyCode::CurrencyMismatch);
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(outcome.unapplied_amount, dec("1000.00"));
        assert!(outcome.allocations.is_empty());
    }

    #[test]
    fn no_candidates_is_unmatched_none() {
        let outcome = match_payment(&payment("500.00"), &[], &[], &MatchPolicy::default());
        assert_eq!(outcome.status, MatchStatus::Unmatched);
        assert_eq!(outcome.discrepancy, DiscrepancyCode::None);
    }

    #[test]
    fn candidates_not_found_is_invalid_invoice() {
        let outcome = match_payment(
            &payment("500.00"),
            &ids(&["INV-GHOST"]),
            &[],
            &MatchPolicy::default(),
        );
        assert_eq!(outcome.status, MatchStatus::Unmatched);
        assert_eq!(outcome.discrepancy, DiscrepancyCode::InvalidInvoice);
    }

    #[test]
    fn closed_invoices_are_not_payable() {
        let mut closed = invoice("INV-1", "500.00", None);
        closed.status = "closed".to_string();
        let outcome = match_payment(
            &payment("500.00"),
            &ids(&["INV-1"]),
            &[closed],
            &MatchPolicy::default(),
        );
        assert_eq!(outcome.discrepancy, DiscrepancyCode::InvalidInvoice);
    }

    #[test]
    fn zero_tolerance_requires_exact_equality() {
        let invoices = vec![invoice("INV-1", "1000.01", None)];
        let outcome = match_payment(
            &payment("1000.00"),
            &ids(&["INV-1"]),
            &invoices,
            &MatchPolicy::default(),
        );
        // One cent short: falls through to the sequential fill.
        assert_eq!(outcome.status, MatchStatus::PartiallyMatched);
        assert_eq!(outcome.discrepancy, DiscrepancyCode::ShortPayment);
    }

    #[test]
    fn tolerance_admits_near_match() {
        let policy = MatchPolicy {
            amount_tolerance_pct: dec("0.1"),
            ..MatchPolicy::default()
        };
        let invoices = vec![invoice("INV-1", "1000.50", None)];
        let outcome = match_payment(&payment("1000.00"), &ids(&["INV-1"]), &invoices, &policy);
        assert_eq!(outcome.status, MatchStatus::Matched);
        assert_eq!(outcome.allocations[0].amount_applied, dec("1000.00"));
    }

    #[test]
    fn auto_apply_ceiling_forces_review() {
        let policy = MatchPolicy {
            auto_apply_ceiling: Some(dec("500.00")),
            ..MatchPolicy::default()
        };
        let invoices = vec![invoice("INV-1", "1000.00", None)];
        let outcome = match_payment(&payment("1000.00"), &ids(&["INV-1"]), &invoices, &policy);

        assert_eq!(outcome.status, MatchStatus::Matched);
        assert!(outcome.requires_human_review);
        assert_eq!(outcome.next_action, NextAction::AlertOnly);
    }

    #[test]
    fn customer_mismatch_forces_review() {
        let policy = MatchPolicy {
            require_customer_match: true,
            ..MatchPolicy::default()
        };
        let invoices = vec![invoice("INV-1", "1000.00", None)];
        let mut pay = payment("1000.00");
        pay.customer_identifier = Some("CUST-OTHER".to_string());

        let outcome = match_payment(&pay, &ids(&["INV-1"]), &invoices, &policy);
        assert!(outcome.requires_human_review);
    }

    #[test]
    fn perfect_match_only_downgrades_partial_fills() {
        let policy = MatchPolicy {
            perfect_match_only: true,
            ..MatchPolicy::default()
        };
        let invoices = vec![
            invoice("INV-A", "500.00", Some("2024-01-01")),
            invoice("INV-B", "500.00", Some("2024-02-01")),
        ];
        let outcome = match_payment(
            &payment("800.00"),
            &ids(&["INV-A", "INV-B"]),
            &invoices,
            &policy,
        );

        assert!(outcome.requires_human_review);
        assert_eq!(outcome.next_action, NextAction::AlertOnly);
    }

    #[test]
    fn disallowed_partial_allocation_goes_to_review() {
        let policy = MatchPolicy {
            allow_partial_allocation: false,
            ..MatchPolicy::default()
        };
        let invoices = vec![
            invoice("INV-A", "500.00", None),
            invoice("INV-B", "500.00", None),
        ];
        let outcome = match_payment(
            &payment("800.00"),
            &ids(&["INV-A", "INV-B"]),
            &invoices,
            &policy,
        );

        assert_eq!(outcome.status, MatchStatus::RequiresReview);
        assert!(outcome.allocations.is_empty());
        assert_eq!(outcome.unapplied_amount, dec("800.00"));
    }

    #[test]
    fn amounts_are_conserved_across_rules() {
        let cases = vec![
            ("1000.00", vec![("INV-1", "1000.00")]),
            ("1500.00", vec![("INV-1", "600.00"), ("INV-2", "900.00")]),
            ("800.00", vec![("INV-1", "500.00"), ("INV-2", "500.00")]),
            ("1200.00", vec![("INV-1", "1000.00")]),
        ];
        for (amount, due) in cases {
            let invoices: Vec<Invoice> =
                due.iter().map(|(id, d)| invoice(id, d, None)).collect();
            let candidate_ids: Vec<String> =
                due.iter().map(|(id, _)| id.to_string()).collect();
            let outcome = match_payment(
                &payment(amount),
                &candidate_ids,
                &invoices,
                &MatchPolicy::default(),
            );
            let applied: Decimal = outcome.allocations.iter().map(|a| a.amount_applied).sum();
            assert_eq!(
                applied + outcome.unapplied_amount,
                dec(amount),
                "conservation failed for payment {}",
                amount
            );
        }
    }

    #[test]
    fn identical_inputs_produce_identical_output() {
        let invoices = vec![
            invoice("INV-A", "500.00", Some("2024-01-01")),
            invoice("INV-B", "700.00", Some("2024-01-01")),
        ];
        let first = match_payment(
            &payment("900.00"),
            &ids(&["INV-A", "INV-B"]),
            &invoices,
            &MatchPolicy::default(),
        );
        let second = match_payment(
            &payment("900.00"),
            &ids(&["INV-A", "INV-B"]),
            &invoices,
            &MatchPolicy::default(),
        );

        assert_eq!(first.allocations, second.allocations);
        assert_eq!(first.log_entry, second.log_entry);
        assert_eq!(first.confidence, second.confidence);
    }

    #[test]
    fn confidence_orders_match_classes() {
        let perfect = match_payment(
            &payment("1000.00"),
            &ids(&["INV-1"]),
            &[invoice("INV-1", "1000.00", None)],
            &MatchPolicy::default(),
        );
        let partial = match_payment(
            &payment("800.00"),
            &ids(&["INV-1"]),
            &[invoice("INV-1", "1000.00", None)],
            &MatchPolicy::default(),
        );
        let unmatched = match_payment(&payment("800.00"), &[], &[], &MatchPolicy::default());

        assert!(perfect.confidence > partial.confidence);
        assert!(partial.confidence > unmatched.confidence);
    }
}
