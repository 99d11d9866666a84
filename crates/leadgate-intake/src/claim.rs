//! Durable claim protocol for in-flight enrichment.
//!
//! A claim is a small JSON object written with a `DoesNotExist` precondition.
//! Whoever lands the write owns enrichment for that dedup key until they
//! release the claim (on failure) or finalize it as the permanent record of a
//! completed run (on success). Claims are only ever updated via CAS: stale
//! takeover refreshes the timestamp, and finalization marks completion
//! against the version the worker claimed. A worker whose claim was taken
//! over while it was enriching fails the finalize CAS and must discard its
//! result, so at most one success is ever recorded per key.
//!
//! ## Storage Layout
//!
//! ```text
//! claims/{key_prefix}/{dedup_key}.json
//! ```
//!
//! Where `key_prefix` is the first 2 characters of the dedup key, so no
//! single directory accumulates every claim.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use leadgate_core::dedup::DedupKey;
use leadgate_core::storage::{StorageBackend, WritePrecondition, WriteResult};

use crate::error::{IntakeError, Result};

/// Prefix for claim objects in the durable store.
pub const CLAIM_PREFIX: &str = "claims";

/// Default timeout after which an in-flight claim is considered abandoned
/// (5 minutes).
pub const DEFAULT_STALE_TIMEOUT: chrono::Duration = chrono::Duration::minutes(5);

/// Calculates a Retry-After value with jitter to prevent thundering herd.
///
/// Returns remaining time until the claim becomes stale, with +0% to +20%
/// jitter, clamped to `[1, 300]` seconds. Jitter is non-negative so clients
/// retry at or after the stale deadline, avoiding wasted 409 responses.
#[must_use]
pub fn calculate_retry_after(claimed_at: DateTime<Utc>, stale_timeout: chrono::Duration) -> u64 {
    calculate_retry_after_at(Utc::now(), claimed_at, stale_timeout)
}

#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn calculate_retry_after_at(
    now: DateTime<Utc>,
    claimed_at: DateTime<Utc>,
    stale_timeout: chrono::Duration,
) -> u64 {
    let elapsed = now.signed_duration_since(claimed_at);
    let remaining_secs = (stale_timeout - elapsed).num_seconds().max(0) as f64;

    let nanos = f64::from(now.timestamp_subsec_nanos());
    let jitter_factor = nanos.mul_add(0.2 / 1_000_000_000.0, 1.0);
    let with_jitter = (remaining_secs * jitter_factor) as u64;

    with_jitter.clamp(1, 300)
}

/// A durable claim on a dedup key.
///
/// Path: `claims/{key_prefix}/{dedup_key}.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// The dedup key this claim covers.
    pub dedup_key: DedupKey,

    /// When this claim was written (or refreshed by takeover).
    pub claimed_at: DateTime<Utc>,

    /// When enrichment completed successfully, if it has.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Claim {
    /// Creates a new claim timestamped now.
    #[must_use]
    pub fn new(dedup_key: DedupKey) -> Self {
        Self {
            dedup_key,
            claimed_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Creates a completion marker timestamped now.
    #[must_use]
    pub fn completed(dedup_key: DedupKey) -> Self {
        let now = Utc::now();
        Self {
            dedup_key,
            claimed_at: now,
            completed_at: Some(now),
        }
    }

    /// Returns the storage path for a claim on the given key.
    #[must_use]
    pub fn storage_path(dedup_key: &DedupKey) -> String {
        format!(
            "{}/{}/{}.json",
            CLAIM_PREFIX,
            dedup_key.shard_prefix(),
            dedup_key
        )
    }

    /// Returns the path for this claim.
    #[must_use]
    pub fn path(&self) -> String {
        Self::storage_path(&self.dedup_key)
    }

    /// Returns whether this claim can be taken over (in-flight too long).
    #[must_use]
    pub fn is_stale(&self, timeout: chrono::Duration) -> bool {
        self.claimed_at + timeout < Utc::now()
    }
}

/// Object version for CAS operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion(String);

impl ObjectVersion {
    /// Creates a new object version.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Returns the version as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Result of attempting to claim a dedup key.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The key was unclaimed; the caller now owns enrichment for it.
    Claimed {
        /// Version of the written claim.
        version: ObjectVersion,
    },
    /// A claim already exists for the key.
    AlreadyClaimed {
        /// The existing claim.
        claim: Claim,
        /// Version of the existing claim.
        version: ObjectVersion,
    },
}

/// Result of finalizing a claim after successful enrichment.
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    /// The claim was still ours; it now records completion.
    Finalized {
        /// New version after finalization.
        version: ObjectVersion,
    },
    /// CAS failed - the claim was taken over while enrichment was running.
    /// The new owner's run is authoritative; the caller must not record a
    /// success.
    Superseded,
}

/// Result of a stale-claim takeover attempt.
#[derive(Debug, Clone)]
pub enum TakeoverOutcome {
    /// Successfully took over the stale claim.
    Success {
        /// The refreshed claim.
        claim: Claim,
        /// New version after takeover.
        version: ObjectVersion,
    },
    /// CAS failed - the claim was modified concurrently. The winner of the
    /// race owns enrichment now; callers should report in-progress.
    RaceLost,
}

/// Trait for durable claim operations.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Attempts to claim a dedup key (write with `DoesNotExist` precondition).
    async fn try_claim(&self, dedup_key: &DedupKey) -> Result<ClaimOutcome>;

    /// Releases a claim so a later request can retry.
    ///
    /// Idempotent: releasing an already-released claim succeeds.
    async fn release(&self, dedup_key: &DedupKey) -> Result<()>;

    /// Marks a claim completed using CAS against the version the caller
    /// claimed (or took over) at.
    ///
    /// Guards the success record: a worker whose claim was reassigned by a
    /// stale takeover loses here instead of writing a duplicate success run.
    async fn finalize(
        &self,
        dedup_key: &DedupKey,
        expected_version: &ObjectVersion,
    ) -> Result<FinalizeOutcome>;

    /// Takes over a stale claim using CAS against its observed version.
    async fn take_over(
        &self,
        stale_claim: &Claim,
        expected_version: &ObjectVersion,
    ) -> Result<TakeoverOutcome>;
}

/// Implementation of `ClaimStore` on top of a `StorageBackend`.
pub struct DurableClaimStore {
    storage: Arc<dyn StorageBackend>,
}

impl DurableClaimStore {
    /// Creates a new claim store.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    async fn load(&self, dedup_key: &DedupKey) -> Result<Option<Claim>> {
        let path = Claim::storage_path(dedup_key);
        let bytes = match self.storage.get(&path).await {
            Ok(bytes) => bytes,
            Err(leadgate_core::Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let claim: Claim =
            serde_json::from_slice(&bytes).map_err(|e| IntakeError::Internal {
                message: format!("failed to parse claim at {path}: {e}"),
            })?;
        Ok(Some(claim))
    }
}

#[async_trait]
impl ClaimStore for DurableClaimStore {
    async fn try_claim(&self, dedup_key: &DedupKey) -> Result<ClaimOutcome> {
        let claim = Claim::new(dedup_key.clone());
        let path = claim.path();
        let bytes = serde_json::to_vec(&claim).map_err(|e| IntakeError::Internal {
            message: format!("failed to serialize claim: {e}"),
        })?;

        match self
            .storage
            .put(&path, Bytes::from(bytes), WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { version } => Ok(ClaimOutcome::Claimed {
                version: ObjectVersion::new(version),
            }),
            WriteResult::PreconditionFailed { current_version } => {
                // Claim exists - load it to return
                match self.load(dedup_key).await? {
                    Some(existing) => Ok(ClaimOutcome::AlreadyClaimed {
                        claim: existing,
                        version: ObjectVersion::new(current_version),
                    }),
                    None => {
                        // Race: claim was released between precondition fail and load.
                        // Retryable for the caller.
                        Err(IntakeError::Internal {
                            message: "claim disappeared during try_claim".to_string(),
                        })
                    }
                }
            }
        }
    }

    async fn release(&self, dedup_key: &DedupKey) -> Result<()> {
        let path = Claim::storage_path(dedup_key);
        self.storage.delete(&path).await?;
        Ok(())
    }

    async fn finalize(
        &self,
        dedup_key: &DedupKey,
        expected_version: &ObjectVersion,
    ) -> Result<FinalizeOutcome> {
        let marker = Claim::completed(dedup_key.clone());
        let path = marker.path();
        let bytes = serde_json::to_vec(&marker).map_err(|e| IntakeError::Internal {
            message: format!("failed to serialize claim: {e}"),
        })?;

        let precondition = WritePrecondition::MatchesVersion(expected_version.as_str().to_string());

        match self.storage.put(&path, Bytes::from(bytes), precondition).await? {
            WriteResult::Success { version } => Ok(FinalizeOutcome::Finalized {
                version: ObjectVersion::new(version),
            }),
            WriteResult::PreconditionFailed { .. } => Ok(FinalizeOutcome::Superseded),
        }
    }

    async fn take_over(
        &self,
        stale_claim: &Claim,
        expected_version: &ObjectVersion,
    ) -> Result<TakeoverOutcome> {
        let refreshed = Claim::new(stale_claim.dedup_key.clone());
        let path = refreshed.path();
        let bytes = serde_json::to_vec(&refreshed).map_err(|e| IntakeError::Internal {
            message: format!("failed to serialize claim: {e}"),
        })?;

        let precondition = WritePrecondition::MatchesVersion(expected_version.as_str().to_string());

        match self.storage.put(&path, Bytes::from(bytes), precondition).await? {
            WriteResult::Success { version } => Ok(TakeoverOutcome::Success {
                claim: refreshed,
                version: ObjectVersion::new(version),
            }),
            WriteResult::PreconditionFailed { .. } => Ok(TakeoverOutcome::RaceLost),
        }
    }
}
