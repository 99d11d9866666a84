//! # leadgate-intake
//!
//! The intake protocol for leadgate: durable claims, the append-only run
//! ledger, the enrichment result contract, and the coordinator that sequences
//! a submission through all of them.
//!
//! ## Protocol
//!
//! 1. Derive the dedup key from the payload's identity fields
//! 2. Replay the cached result if a success run already exists
//! 3. Claim the key via a `DoesNotExist` conditional write
//! 4. Invoke enrichment under a deadline
//! 5. Finalize the claim via CAS, then record the run in the ledger
//!
//! Failed enrichments release the claim so later submissions can retry;
//! successful ones finalize it as the permanent completion marker for the
//! key. The finalize CAS fails for a worker whose stale claim was taken
//! over mid-flight, so it cannot record a duplicate success run.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod claim;
pub mod coordinator;
pub mod enricher;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod result;

pub use claim::{
    Claim, ClaimOutcome, ClaimStore, DEFAULT_STALE_TIMEOUT, DurableClaimStore, FinalizeOutcome,
    ObjectVersion, TakeoverOutcome, calculate_retry_after,
};
pub use coordinator::{Coordinator, CoordinatorSettings, Outcome};
pub use enricher::Enricher;
pub use error::{EnrichError, IntakeError, Result};
pub use ledger::{DurableRunLedger, Run, RunFilter, RunLedger, RunStatus};
pub use metrics::register_metrics;
pub use result::{EnrichmentResult, LeadProfile, Urgency, validate_result};
