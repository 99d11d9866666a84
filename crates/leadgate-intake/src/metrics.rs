//! Intake metrics.
//!
//! Provides metrics for the claim protocol and the run ledger.
//! These metrics complement the structured logging approach already in place.

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Claim check counter, labeled by outcome.
pub const CLAIM_CHECKS: &str = "leadgate_claim_checks_total";

/// Stale-claim takeover counter, labeled by result.
pub const CLAIM_TAKEOVERS: &str = "leadgate_claim_takeovers_total";

/// Claim finalize counter, labeled by result.
pub const CLAIM_FINALIZES: &str = "leadgate_claim_finalizes_total";

/// Recorded run counter, labeled by status.
pub const RUNS_RECORDED: &str = "leadgate_runs_recorded_total";

/// Enrichment invocation duration histogram, labeled by outcome.
pub const ENRICH_DURATION: &str = "leadgate_enrich_duration_seconds";

/// Registers all intake metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(CLAIM_CHECKS, "Total claim checks by outcome");
    describe_counter!(CLAIM_TAKEOVERS, "Total stale-claim takeover attempts by result");
    describe_counter!(CLAIM_FINALIZES, "Total claim finalize attempts by result");
    describe_counter!(RUNS_RECORDED, "Total ledger runs recorded by status");
    describe_histogram!(
        ENRICH_DURATION,
        "Duration of enrichment invocations in seconds"
    );
}

/// Records a claim check outcome (`claimed`, `cached`, `in_progress`).
pub fn record_claim_check(outcome: &str) {
    counter!(CLAIM_CHECKS, "outcome" => outcome.to_string()).increment(1);
}

/// Records a stale-claim takeover attempt (`success`, `race_lost`).
pub fn record_claim_takeover(result: &str) {
    counter!(CLAIM_TAKEOVERS, "result" => result.to_string()).increment(1);
}

/// Records a claim finalize attempt (`finalized`, `superseded`).
pub fn record_claim_finalize(result: &str) {
    counter!(CLAIM_FINALIZES, "result" => result.to_string()).increment(1);
}

/// Records a ledger run write (`success`, `failed`).
pub fn record_run_recorded(status: &str) {
    counter!(RUNS_RECORDED, "status" => status.to_string()).increment(1);
}

/// Records an enrichment invocation duration (`ok`, `error`, `timeout`).
pub fn record_enrich_duration(outcome: &str, duration_secs: f64) {
    histogram!(ENRICH_DURATION, "outcome" => outcome.to_string()).record(duration_secs);
}
