//! Ledger metrics.
//!
//! Claim outcomes and lost compare-and-set races. These complement the
//! structured logs emitted on every transition.

use metrics::{counter, describe_counter};

/// Claim outcome counter.
pub const LEDGER_CLAIMS: &str = "lakeshare_ledger_claims_total";

/// Lost CAS race counter.
pub const LEDGER_CAS_CONFLICTS: &str = "lakeshare_ledger_cas_conflicts_total";

/// Registers all ledger metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(LEDGER_CLAIMS, "Grant ledger claim attempts by outcome");
    describe_counter!(
        LEDGER_CAS_CONFLICTS,
        "Conditional ledger writes that lost to a concurrent writer"
    );
}

/// Records the outcome of a claim attempt.
pub fn record_claim(outcome: &str) {
    counter!(LEDGER_CLAIMS, "outcome" => outcome.to_string()).increment(1);
}

/// Records a lost compare-and-set race.
pub fn record_cas_conflict(operation: &str) {
    counter!(LEDGER_CAS_CONFLICTS, "op" => operation.to_string()).increment(1);
}
