//! Provider status vocabularies mapped onto local payment statuses.

use crate::entities::payment::PaymentStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// Whether a provider-side success still needs a capture call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    CaptureRequired,
    Settled,
}

/// Local view of a provider status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedStatus {
    pub status: PaymentStatus,
    pub settlement: Settlement,
}

impl MappedStatus {
    const fn new(status: PaymentStatus, settlement: Settlement) -> Self {
        Self { status, settlement }
    }
}

/// Installment lender payment statuses, matched case-insensitively.
pub fn map_tabby_status(raw: &str) -> MappedStatus {
    match raw.trim().to_ascii_uppercase().as_str() {
        "AUTHORIZED" => MappedStatus::new(PaymentStatus::Paid, Settlement::CaptureRequired),
        "CLOSED" => MappedStatus::new(PaymentStatus::Paid, Settlement::Settled),
        "REJECTED" => MappedStatus::new(PaymentStatus::Failed, Settlement::Settled),
        "EXPIRED" => MappedStatus::new(PaymentStatus::Cancelled, Settlement::Settled),
        _ => MappedStatus::new(PaymentStatus::Pending, Settlement::CaptureRequired),
    }
}

struct ResultCodeRule {
    pattern: Regex,
    status: PaymentStatus,
}

fn rule(pattern: &str, status: PaymentStatus) -> ResultCodeRule {
    ResultCodeRule {
        pattern: Regex::new(pattern).expect("valid result code pattern"),
        status,
    }
}

/// Evaluated top to bottom; the first match wins.
static HYPERPAY_RULES: Lazy<Vec<ResultCodeRule>> = Lazy::new(|| {
    vec![
        // successful and successful-but-review-advised transactions
        rule(r"^(000\.000\.|000\.100\.1|000\.[36])", PaymentStatus::Paid),
        // checkout created, shopper has not paid yet
        rule(r"^000\.200", PaymentStatus::Pending),
        // held for manual review
        rule(r"^(000\.400\.0[^3]|000\.400\.100)", PaymentStatus::Pending),
    ]
});

/// Card processor result codes. A debit settles in one step, so `paid` is
/// always `Settled`.
pub fn classify_result_code(code: &str) -> MappedStatus {
    let code = code.trim();
    let status = HYPERPAY_RULES
        .iter()
        .find(|rule| rule.pattern.is_match(code))
        .map(|rule| rule.status)
        .unwrap_or(PaymentStatus::Failed);
    MappedStatus::new(status, Settlement::Settled)
}

/// Whether a checkout-preparation result code means the session was created.
pub fn is_checkout_created(code: &str) -> bool {
    code.trim().starts_with("000.200")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("AUTHORIZED", PaymentStatus::Paid, Settlement::CaptureRequired)]
    #[case("authorized", PaymentStatus::Paid, Settlement::CaptureRequired)]
    #[case("CLOSED", PaymentStatus::Paid, Settlement::Settled)]
    #[case("Closed", PaymentStatus::Paid, Settlement::Settled)]
    #[case("REJECTED", PaymentStatus::Failed, Settlement::Settled)]
    #[case("EXPIRED", PaymentStatus::Cancelled, Settlement::Settled)]
    #[case("CREATED", PaymentStatus::Pending, Settlement::CaptureRequired)]
    #[case("", PaymentStatus::Pending, Settlement::CaptureRequired)]
    fn tabby_vocabulary(
        #[case] raw: &str,
        #[case] status: PaymentStatus,
        #[case] settlement: Settlement,
    ) {
        assert_eq!(map_tabby_status(raw), MappedStatus::new(status, settlement));
    }

    #[rstest]
    #[case("000.000.000", PaymentStatus::Paid)]
    #[case("000.100.110", PaymentStatus::Paid)]
    #[case("000.300.000", PaymentStatus::Paid)]
    #[case("000.600.000", PaymentStatus::Paid)]
    #[case("000.200.100", PaymentStatus::Pending)]
    #[case("000.400.000", PaymentStatus::Pending)]
    #[case("000.400.020", PaymentStatus::Pending)]
    #[case("000.400.100", PaymentStatus::Pending)]
    #[case("000.400.030", PaymentStatus::Failed)]
    #[case("000.100.200", PaymentStatus::Failed)]
    #[case("800.100.151", PaymentStatus::Failed)]
    #[case("100.396.101", PaymentStatus::Failed)]
    #[case("", PaymentStatus::Failed)]
    fn hyperpay_result_codes(#[case] code: &str, #[case] status: PaymentStatus) {
        let mapped = classify_result_code(code);
        assert_eq!(mapped.status, status);
        assert_eq!(mapped.settlement, Settlement::Settled);
    }

    #[test]
    fn checkout_created_prefix() {
        assert!(is_checkout_created("000.200.100"));
        assert!(!is_checkout_created("200.300.404"));
    }
}
