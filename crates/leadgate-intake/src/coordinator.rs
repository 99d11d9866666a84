//! The intake coordinator.
//!
//! Sequences one lead submission through the full protocol: derive the dedup
//! key, consult the ledger for a cached result, claim the key, invoke
//! enrichment, and record the run. The coordinator owns the ordering
//! guarantees; the claim store and ledger only provide the primitives.
//!
//! ## Claim lifecycle
//!
//! A claim written here is released only when enrichment fails. A successful
//! run first finalizes its claim with a CAS against the version it claimed
//! at, then records the run; the finalized claim stays in place as the
//! permanent record that the key is done, which is what routes later
//! duplicates onto the cached-replay path. The finalize CAS is what makes
//! "at most one success per key" hold under stale takeover: a worker whose
//! claim was reassigned while it was enriching fails the CAS and discards
//! its result instead of recording a second success. If recording a success
//! run fails after finalize, the claim is kept: returning a retryable store
//! error with the claim intact is safer than releasing and risking a second
//! successful enrichment for the same key.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::Instrument;

use leadgate_core::dedup::{DedupKey, derive_key, extract_source};
use leadgate_core::id::RunId;
use leadgate_core::observability::intake_span;

use crate::claim::{
    ClaimOutcome, ClaimStore, DEFAULT_STALE_TIMEOUT, FinalizeOutcome, ObjectVersion,
    TakeoverOutcome, calculate_retry_after,
};
use crate::enricher::Enricher;
use crate::error::{EnrichError, IntakeError, Result};
use crate::ledger::{Run, RunLedger};
use crate::metrics::{
    record_claim_check, record_claim_finalize, record_claim_takeover, record_enrich_duration,
    record_run_recorded,
};
use crate::result::EnrichmentResult;

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Hard deadline for a single enrichment invocation.
    pub invoke_timeout: Duration,
    /// Age past which an in-flight claim is considered abandoned.
    pub claim_stale_timeout: chrono::Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            invoke_timeout: Duration::from_secs(30),
            claim_stale_timeout: DEFAULT_STALE_TIMEOUT,
        }
    }
}

/// Terminal outcome of processing one submission.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Enrichment ran and succeeded.
    Completed {
        /// The recorded run.
        run_id: RunId,
        /// The validated result.
        result: EnrichmentResult,
    },
    /// A prior success for the same dedup key was replayed; enrichment was
    /// not invoked.
    Cached {
        /// The stored result from the original run.
        result: EnrichmentResult,
    },
    /// Another request holds the claim for this key.
    InProgress {
        /// Seconds the caller should wait before retrying.
        retry_after_secs: u64,
    },
    /// Enrichment ran and failed; the claim was released and the failure
    /// recorded.
    Failed {
        /// The recorded run.
        run_id: RunId,
        /// Description of the failure.
        error: String,
    },
}

/// Drives lead submissions through claim, enrichment, and ledger.
pub struct Coordinator {
    claims: Arc<dyn ClaimStore>,
    ledger: Arc<dyn RunLedger>,
    enricher: Arc<dyn Enricher>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    /// Creates a new coordinator.
    #[must_use]
    pub fn new(
        claims: Arc<dyn ClaimStore>,
        ledger: Arc<dyn RunLedger>,
        enricher: Arc<dyn Enricher>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            claims,
            ledger,
            enricher,
            settings,
        }
    }

    /// Returns the ledger this coordinator records into.
    #[must_use]
    pub fn ledger(&self) -> Arc<dyn RunLedger> {
        Arc::clone(&self.ledger)
    }

    /// Processes one lead submission to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns `IntakeError::IdentityMissing` when the payload has no usable
    /// identity fields, and store errors when the durable store cannot make
    /// progress. Enrichment failures are not errors; they surface as
    /// [`Outcome::Failed`].
    pub async fn process(&self, payload: Value) -> Result<Outcome> {
        let dedup_key = derive_key(&payload).map_err(|_| IntakeError::IdentityMissing)?;
        let source = extract_source(&payload);

        let span = intake_span("process", &source, dedup_key.as_str());
        self.process_claimed(dedup_key, source, payload)
            .instrument(span)
            .await
    }

    async fn process_claimed(
        &self,
        dedup_key: DedupKey,
        source: String,
        payload: Value,
    ) -> Result<Outcome> {
        // Replay check before claiming: a completed key answers from the
        // ledger without touching the claim at all.
        if let Some(result) = self.cached_result(&dedup_key).await? {
            record_claim_check("cached");
            tracing::info!("replaying cached enrichment result");
            return Ok(Outcome::Cached { result });
        }

        match self.claims.try_claim(&dedup_key).await? {
            ClaimOutcome::Claimed { version } => {
                record_claim_check("claimed");
                self.invoke_and_record(dedup_key, source, payload, version)
                    .await
            }
            ClaimOutcome::AlreadyClaimed { claim, version } => {
                // Lost the race, or the key completed since the replay
                // check. Re-check the ledger before reporting in-progress.
                if let Some(result) = self.cached_result(&dedup_key).await? {
                    record_claim_check("cached");
                    tracing::info!("replaying cached enrichment result");
                    return Ok(Outcome::Cached { result });
                }

                if claim.is_stale(self.settings.claim_stale_timeout) {
                    tracing::warn!(
                        claimed_at = %claim.claimed_at,
                        "taking over stale in-flight claim"
                    );
                    match self.claims.take_over(&claim, &version).await? {
                        TakeoverOutcome::Success { version, .. } => {
                            record_claim_takeover("success");
                            record_claim_check("claimed");
                            self.invoke_and_record(dedup_key, source, payload, version)
                                .await
                        }
                        TakeoverOutcome::RaceLost => {
                            record_claim_takeover("race_lost");
                            record_claim_check("in_progress");
                            Ok(Outcome::InProgress {
                                retry_after_secs: calculate_retry_after(
                                    claim.claimed_at,
                                    self.settings.claim_stale_timeout,
                                ),
                            })
                        }
                    }
                } else {
                    record_claim_check("in_progress");
                    Ok(Outcome::InProgress {
                        retry_after_secs: calculate_retry_after(
                            claim.claimed_at,
                            self.settings.claim_stale_timeout,
                        ),
                    })
                }
            }
        }
    }

    async fn cached_result(&self, dedup_key: &DedupKey) -> Result<Option<EnrichmentResult>> {
        let Some(run) = self.ledger.find_latest_success(dedup_key).await? else {
            return Ok(None);
        };
        run.result
            .map(Some)
            .ok_or_else(|| IntakeError::Internal {
                message: format!("success run {} has no stored result", run.id),
            })
    }

    /// Runs enrichment under the claim and records the terminal run.
    ///
    /// `claim_version` is the version this worker claimed (or took over) at;
    /// a success is recorded only after the claim finalizes against it.
    async fn invoke_and_record(
        &self,
        dedup_key: DedupKey,
        source: String,
        payload: Value,
        claim_version: ObjectVersion,
    ) -> Result<Outcome> {
        let started = Instant::now();
        let invoked = match tokio::time::timeout(
            self.settings.invoke_timeout,
            self.enricher.enrich(&payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EnrichError::Upstream {
                message: format!(
                    "enrichment timed out after {}s",
                    self.settings.invoke_timeout.as_secs()
                ),
            }),
        };
        let elapsed = started.elapsed().as_secs_f64();

        match invoked {
            Ok(result) => {
                record_enrich_duration("ok", elapsed);
                match self.claims.finalize(&dedup_key, &claim_version).await? {
                    FinalizeOutcome::Finalized { .. } => {
                        record_claim_finalize("finalized");
                        let run = Run::success(dedup_key, source, payload, result.clone());
                        // On ledger failure the claim stays in place; see
                        // module docs.
                        let run_id = self.ledger.record(&run).await?;
                        record_run_recorded("success");
                        tracing::info!(
                            run_id = %run_id,
                            score = result.score,
                            "enrichment completed"
                        );
                        Ok(Outcome::Completed { run_id, result })
                    }
                    FinalizeOutcome::Superseded => {
                        record_claim_finalize("superseded");
                        tracing::warn!(
                            "claim was taken over during enrichment; discarding result"
                        );
                        // The new owner may have finished already
                        if let Some(result) = self.cached_result(&dedup_key).await? {
                            return Ok(Outcome::Cached { result });
                        }
                        Ok(Outcome::InProgress {
                            retry_after_secs: calculate_retry_after(
                                chrono::Utc::now(),
                                self.settings.claim_stale_timeout,
                            ),
                        })
                    }
                }
            }
            Err(err) => {
                let outcome_label = match &err {
                    EnrichError::Upstream { message } if message.contains("timed out") => {
                        "timeout"
                    }
                    _ => "error",
                };
                record_enrich_duration(outcome_label, elapsed);

                self.claims.release(&dedup_key).await?;
                let run = Run::failed(dedup_key, source, payload, err.to_string());
                let run_id = self.ledger.record(&run).await?;
                record_run_recorded("failed");
                tracing::warn!(run_id = %run_id, error = %err, "enrichment failed");
                Ok(Outcome::Failed {
                    run_id,
                    error: err.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claim::{Claim, DurableClaimStore};
    use crate::ledger::{DurableRunLedger, RunFilter, RunStatus};
    use crate::result::validate_result;
    use async_trait::async_trait;
    use bytes::Bytes;
    use leadgate_core::storage::{MemoryBackend, StorageBackend, WritePrecondition};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn test_result(score: u8) -> EnrichmentResult {
        validate_result(&json!({
            "qualified": score >= 50,
            "score": score,
            "reasons": ["test"],
            "lead": {}
        }))
        .unwrap()
    }

    fn lead_payload() -> Value {
        json!({"email": "jane@example.com", "phone": "555-0100", "source": "webform"})
    }

    /// Pops one scripted response per call and counts invocations.
    struct ScriptedEnricher {
        responses: Mutex<VecDeque<std::result::Result<EnrichmentResult, EnrichError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedEnricher {
        fn new(
            responses: Vec<std::result::Result<EnrichmentResult, EnrichError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Enricher for ScriptedEnricher {
        async fn enrich(&self, _payload: &Value) -> std::result::Result<EnrichmentResult, EnrichError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(EnrichError::Upstream {
                        message: "no scripted response left".into(),
                    })
                })
        }
    }

    /// Blocks every invocation until the gate is opened.
    struct GatedEnricher {
        gate: Notify,
    }

    #[async_trait]
    impl Enricher for GatedEnricher {
        async fn enrich(&self, _payload: &Value) -> std::result::Result<EnrichmentResult, EnrichError> {
            self.gate.notified().await;
            Ok(test_result(75))
        }
    }

    /// Parks the first invocation on a gate; later calls return immediately
    /// with a distinct score.
    struct FirstCallParkedEnricher {
        gate: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Enricher for FirstCallParkedEnricher {
        async fn enrich(&self, _payload: &Value) -> std::result::Result<EnrichmentResult, EnrichError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.gate.notified().await;
                Ok(test_result(55))
            } else {
                Ok(test_result(90))
            }
        }
    }

    /// Sleeps long enough for the coordinator deadline to fire.
    struct SlowEnricher;

    #[async_trait]
    impl Enricher for SlowEnricher {
        async fn enrich(&self, _payload: &Value) -> std::result::Result<EnrichmentResult, EnrichError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(test_result(75))
        }
    }

    /// Delegates to a real ledger but fails the next record on demand.
    struct FlakyLedger {
        inner: DurableRunLedger,
        fail_next_record: AtomicBool,
    }

    #[async_trait]
    impl RunLedger for FlakyLedger {
        async fn record(&self, run: &Run) -> Result<RunId> {
            if self.fail_next_record.swap(false, Ordering::SeqCst) {
                return Err(IntakeError::store("simulated ledger outage"));
            }
            self.inner.record(run).await
        }

        async fn find_latest_success(&self, dedup_key: &DedupKey) -> Result<Option<Run>> {
            self.inner.find_latest_success(dedup_key).await
        }

        async fn get(&self, run_id: &RunId) -> Result<Option<Run>> {
            self.inner.get(run_id).await
        }

        async fn list(&self, filter: &RunFilter) -> Result<(Vec<Run>, usize)> {
            self.inner.list(filter).await
        }
    }

    struct Harness {
        storage: Arc<MemoryBackend>,
        coordinator: Arc<Coordinator>,
    }

    fn harness(enricher: Arc<dyn Enricher>, settings: CoordinatorSettings) -> Harness {
        let storage: Arc<MemoryBackend> = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn StorageBackend> = storage.clone();
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(DurableClaimStore::new(backend.clone())),
            Arc::new(DurableRunLedger::new(backend)),
            enricher,
            settings,
        ));
        Harness {
            storage,
            coordinator,
        }
    }

    #[tokio::test]
    async fn test_first_submission_completes() {
        let enricher = ScriptedEnricher::new(vec![Ok(test_result(80))]);
        let h = harness(enricher.clone(), CoordinatorSettings::default());

        let outcome = h.coordinator.process(lead_payload()).await.expect("process");
        match outcome {
            Outcome::Completed { result, .. } => assert_eq!(result.score, 80),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(enricher.call_count(), 1);

        // Run recorded as success, claim retained
        let (runs, total) = h
            .coordinator
            .ledger()
            .list(&RunFilter::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(runs[0].source, "webform");

        let key = derive_key(&lead_payload()).unwrap();
        assert!(h
            .storage
            .head(&Claim::storage_path(&key))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_duplicate_replays_cached_result_without_invoking() {
        let enricher = ScriptedEnricher::new(vec![Ok(test_result(80))]);
        let h = harness(enricher.clone(), CoordinatorSettings::default());

        let first = h.coordinator.process(lead_payload()).await.unwrap();
        let Outcome::Completed { result: original, .. } = first else {
            panic!("expected Completed");
        };

        // Same identity through a different channel and field casing
        let duplicate = json!({
            "Email": " JANE@example.com ",
            "mobile": "555-0100",
            "channel": "crm",
            "notes": "second touch"
        });
        let second = h.coordinator.process(duplicate).await.unwrap();
        match second {
            Outcome::Cached { result } => {
                assert_eq!(
                    serde_json::to_vec(&result).unwrap(),
                    serde_json::to_vec(&original).unwrap()
                );
            }
            other => panic!("expected Cached, got {other:?}"),
        }
        assert_eq!(enricher.call_count(), 1, "enrichment must run exactly once");

        // Replay must not add ledger entries
        let (_, total) = h
            .coordinator
            .ledger()
            .list(&RunFilter::default())
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_reports_in_progress() {
        let gated = Arc::new(GatedEnricher {
            gate: Notify::new(),
        });
        let h = harness(gated.clone(), CoordinatorSettings::default());

        let coordinator = Arc::clone(&h.coordinator);
        let winner = tokio::spawn(async move { coordinator.process(lead_payload()).await });

        // Let the winner claim and park inside enrichment
        tokio::time::sleep(Duration::from_millis(50)).await;

        let loser = h.coordinator.process(lead_payload()).await.unwrap();
        match loser {
            Outcome::InProgress { retry_after_secs } => {
                assert!((1..=300).contains(&retry_after_secs));
            }
            other => panic!("expected InProgress, got {other:?}"),
        }

        gated.gate.notify_one();
        let winner_outcome = winner.await.unwrap().unwrap();
        assert!(matches!(winner_outcome, Outcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_failure_releases_claim_and_records_failed_run() {
        let enricher = ScriptedEnricher::new(vec![
            Err(EnrichError::SchemaInvalid {
                detail: "missing field `score`".into(),
            }),
            Ok(test_result(60)),
        ]);
        let h = harness(enricher.clone(), CoordinatorSettings::default());

        let first = h.coordinator.process(lead_payload()).await.unwrap();
        match first {
            Outcome::Failed { error, .. } => assert!(error.contains("score")),
            other => panic!("expected Failed, got {other:?}"),
        }

        // Claim was released, so a retry goes straight back to enrichment
        let second = h.coordinator.process(lead_payload()).await.unwrap();
        assert!(matches!(second, Outcome::Completed { .. }));
        assert_eq!(enricher.call_count(), 2);

        // Both attempts are in the ledger
        let (runs, total) = h
            .coordinator
            .ledger()
            .list(&RunFilter::default())
            .await
            .unwrap();
        assert_eq!(total, 2);
        let statuses: Vec<RunStatus> = runs.iter().map(|r| r.status).collect();
        assert!(statuses.contains(&RunStatus::Success));
        assert!(statuses.contains(&RunStatus::Failed));
    }

    #[tokio::test]
    async fn test_invoke_timeout_surfaces_as_failed_run() {
        let h = harness(
            Arc::new(SlowEnricher),
            CoordinatorSettings {
                invoke_timeout: Duration::from_millis(50),
                ..CoordinatorSettings::default()
            },
        );

        let outcome = h.coordinator.process(lead_payload()).await.unwrap();
        match outcome {
            Outcome::Failed { error, .. } => assert!(error.contains("timed out")),
            other => panic!("expected Failed, got {other:?}"),
        }

        // Timeout released the claim
        let key = derive_key(&lead_payload()).unwrap();
        assert!(h
            .storage
            .head(&Claim::storage_path(&key))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over() {
        let enricher = ScriptedEnricher::new(vec![Ok(test_result(70))]);
        let h = harness(enricher.clone(), CoordinatorSettings::default());

        // Plant a claim from a worker that died ten minutes ago
        let key = derive_key(&lead_payload()).unwrap();
        let abandoned = Claim {
            dedup_key: key.clone(),
            claimed_at: chrono::Utc::now() - chrono::Duration::minutes(10),
            completed_at: None,
        };
        h.storage
            .put(
                &abandoned.path(),
                Bytes::from(serde_json::to_vec(&abandoned).unwrap()),
                WritePrecondition::DoesNotExist,
            )
            .await
            .unwrap();

        let outcome = h.coordinator.process(lead_payload()).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed { .. }));
        assert_eq!(enricher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_taken_over_worker_records_no_second_success() {
        let enricher = Arc::new(FirstCallParkedEnricher {
            gate: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let h = harness(
            enricher.clone(),
            CoordinatorSettings {
                claim_stale_timeout: chrono::Duration::milliseconds(50),
                ..CoordinatorSettings::default()
            },
        );

        // The first worker claims, then parks inside enrichment until its
        // claim has gone stale.
        let coordinator = Arc::clone(&h.coordinator);
        let parked = tokio::spawn(async move { coordinator.process(lead_payload()).await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A second worker takes over the stale claim and completes.
        let takeover = h.coordinator.process(lead_payload()).await.unwrap();
        match takeover {
            Outcome::Completed { result, .. } => assert_eq!(result.score, 90),
            other => panic!("expected takeover to complete, got {other:?}"),
        }

        // When the first worker finally returns, its finalize CAS fails and
        // it replays the winner's run instead of recording its own.
        enricher.gate.notify_one();
        let parked_outcome = parked.await.unwrap().unwrap();
        match parked_outcome {
            Outcome::Cached { result } => assert_eq!(result.score, 90),
            other => panic!("expected superseded worker to replay, got {other:?}"),
        }

        let (runs, total) = h
            .coordinator
            .ledger()
            .list(&RunFilter::default())
            .await
            .unwrap();
        assert_eq!(total, 1, "exactly one run may be recorded for the key");
        assert_eq!(runs[0].status, RunStatus::Success);
        assert_eq!(
            runs[0].result.as_ref().map(|r| r.score),
            Some(90),
            "the recorded run must be the takeover winner's"
        );
    }

    #[tokio::test]
    async fn test_fresh_claim_is_not_taken_over() {
        let enricher = ScriptedEnricher::new(vec![Ok(test_result(70))]);
        let h = harness(enricher.clone(), CoordinatorSettings::default());

        let key = derive_key(&lead_payload()).unwrap();
        let fresh = Claim::new(key);
        h.storage
            .put(
                &fresh.path(),
                Bytes::from(serde_json::to_vec(&fresh).unwrap()),
                WritePrecondition::DoesNotExist,
            )
            .await
            .unwrap();

        let outcome = h.coordinator.process(lead_payload()).await.unwrap();
        assert!(matches!(outcome, Outcome::InProgress { .. }));
        assert_eq!(enricher.call_count(), 0);
    }

    #[tokio::test]
    async fn test_identity_missing_is_rejected_before_any_write() {
        let enricher = ScriptedEnricher::new(vec![]);
        let h = harness(enricher.clone(), CoordinatorSettings::default());

        let err = h
            .coordinator
            .process(json!({"name": "Anonymous", "budget": "10k"}))
            .await
            .expect_err("no identity");
        assert!(matches!(err, IntakeError::IdentityMissing));

        assert!(h.storage.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_outage_after_success_keeps_claim() {
        let storage: Arc<MemoryBackend> = Arc::new(MemoryBackend::new());
        let backend: Arc<dyn StorageBackend> = storage.clone();
        let ledger = Arc::new(FlakyLedger {
            inner: DurableRunLedger::new(backend.clone()),
            fail_next_record: AtomicBool::new(true),
        });
        let enricher = ScriptedEnricher::new(vec![Ok(test_result(80))]);
        let coordinator = Coordinator::new(
            Arc::new(DurableClaimStore::new(backend)),
            ledger,
            enricher,
            CoordinatorSettings::default(),
        );

        let err = coordinator
            .process(lead_payload())
            .await
            .expect_err("ledger outage");
        assert!(matches!(err, IntakeError::Store { .. }));

        // The claim survives so nothing re-runs enrichment behind our back
        let key = derive_key(&lead_payload()).unwrap();
        assert!(storage
            .head(&Claim::storage_path(&key))
            .await
            .unwrap()
            .is_some());
    }
}
