//! Append-only run ledger.
//!
//! Every enrichment attempt, successful or failed, is written exactly once
//! and never updated or deleted. The ledger is the audit trail: given a
//! dedup key you can reconstruct every attempt against it, and given a run
//! ID you can see exactly what was submitted and what came back.
//!
//! ## Storage Layout
//!
//! ```text
//! runs/{dedup_key}/{run_id}.json
//! ```
//!
//! Run IDs are ULIDs, so lexicographic order within a key's directory is
//! creation order.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use leadgate_core::dedup::DedupKey;
use leadgate_core::id::RunId;
use leadgate_core::storage::{StorageBackend, WritePrecondition, WriteResult};

use crate::error::{IntakeError, Result};
use crate::result::EnrichmentResult;

/// Prefix for run records in the durable store.
pub const RUNS_PREFIX: &str = "runs";

/// Terminal status of an enrichment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Enrichment completed and the result passed validation.
    Success,
    /// Enrichment failed; the error field says why.
    Failed,
}

impl RunStatus {
    /// Returns the status as a label string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = IntakeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(IntakeError::Internal {
                message: format!("unknown run status: {other}"),
            }),
        }
    }
}

/// A single recorded enrichment run.
///
/// Path: `runs/{dedup_key}/{run_id}.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Unique run identifier.
    pub id: RunId,

    /// The dedup key this run was executed under.
    pub dedup_key: DedupKey,

    /// Source attribution extracted from the payload.
    pub source: String,

    /// The raw payload exactly as submitted.
    pub payload: Value,

    /// The validated enrichment result (success runs only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EnrichmentResult>,

    /// Terminal status.
    pub status: RunStatus,

    /// Failure description (failed runs only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the run was recorded.
    pub created_at: DateTime<Utc>,
}

impl Run {
    /// Creates a success run record.
    #[must_use]
    pub fn success(
        dedup_key: DedupKey,
        source: String,
        payload: Value,
        result: EnrichmentResult,
    ) -> Self {
        Self {
            id: RunId::generate(),
            dedup_key,
            source,
            payload,
            result: Some(result),
            status: RunStatus::Success,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Creates a failed run record.
    #[must_use]
    pub fn failed(dedup_key: DedupKey, source: String, payload: Value, error: String) -> Self {
        Self {
            id: RunId::generate(),
            dedup_key,
            source,
            payload,
            result: None,
            status: RunStatus::Failed,
            error: Some(error),
            created_at: Utc::now(),
        }
    }

    /// Returns the storage prefix holding every run for a dedup key.
    #[must_use]
    pub fn key_prefix(dedup_key: &DedupKey) -> String {
        format!("{RUNS_PREFIX}/{dedup_key}/")
    }

    /// Returns the path for this run.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}/{}.json", RUNS_PREFIX, self.dedup_key, self.id)
    }
}

/// Filter for listing runs.
#[derive(Debug, Clone)]
pub struct RunFilter {
    /// Only runs with this status.
    pub status: Option<RunStatus>,
    /// Only success runs with this qualification verdict.
    pub qualified: Option<bool>,
    /// Maximum number of runs to return.
    pub limit: usize,
    /// Number of runs to skip (after sorting, newest first).
    pub offset: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            qualified: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Trait for append-only run ledger operations.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Records a run (write with `DoesNotExist` precondition; runs are
    /// immutable once written).
    async fn record(&self, run: &Run) -> Result<RunId>;

    /// Returns the most recent success run for a dedup key, if any.
    async fn find_latest_success(&self, dedup_key: &DedupKey) -> Result<Option<Run>>;

    /// Fetches a single run by ID.
    async fn get(&self, run_id: &RunId) -> Result<Option<Run>>;

    /// Lists runs newest-first, with the total count before pagination.
    async fn list(&self, filter: &RunFilter) -> Result<(Vec<Run>, usize)>;
}

/// Implementation of `RunLedger` on top of a `StorageBackend`.
pub struct DurableRunLedger {
    storage: Arc<dyn StorageBackend>,
}

impl DurableRunLedger {
    /// Creates a new ledger.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    async fn load(&self, path: &str) -> Result<Run> {
        let bytes = self.storage.get(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| IntakeError::Internal {
            message: format!("failed to parse run at {path}: {e}"),
        })
    }

    async fn load_prefix(&self, prefix: &str) -> Result<Vec<Run>> {
        let metas = self.storage.list(prefix).await?;
        let mut runs = Vec::with_capacity(metas.len());
        for meta in metas {
            runs.push(self.load(&meta.path).await?);
        }
        Ok(runs)
    }
}

#[async_trait]
impl RunLedger for DurableRunLedger {
    async fn record(&self, run: &Run) -> Result<RunId> {
        let path = run.path();
        let bytes = serde_json::to_vec(run).map_err(|e| IntakeError::Internal {
            message: format!("failed to serialize run: {e}"),
        })?;

        match self
            .storage
            .put(&path, Bytes::from(bytes), WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => Ok(run.id),
            WriteResult::PreconditionFailed { .. } => {
                // ULIDs don't collide; an existing object means the path
                // was reused, which breaks the append-only discipline.
                Err(IntakeError::Internal {
                    message: format!("run record already exists at {path}"),
                })
            }
        }
    }

    async fn find_latest_success(&self, dedup_key: &DedupKey) -> Result<Option<Run>> {
        let runs = self.load_prefix(&Run::key_prefix(dedup_key)).await?;
        Ok(runs
            .into_iter()
            .filter(|r| r.status == RunStatus::Success)
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
            }))
    }

    async fn get(&self, run_id: &RunId) -> Result<Option<Run>> {
        let suffix = format!("/{run_id}.json");
        let metas = self.storage.list(&format!("{RUNS_PREFIX}/")).await?;
        let Some(meta) = metas.iter().find(|m| m.path.ends_with(&suffix)) else {
            return Ok(None);
        };
        Ok(Some(self.load(&meta.path).await?))
    }

    async fn list(&self, filter: &RunFilter) -> Result<(Vec<Run>, usize)> {
        let mut runs = self.load_prefix(&format!("{RUNS_PREFIX}/")).await?;

        runs.retain(|run| {
            if let Some(status) = filter.status {
                if run.status != status {
                    return false;
                }
            }
            if let Some(qualified) = filter.qualified {
                if run.result.as_ref().map(|r| r.qualified) != Some(qualified) {
                    return false;
                }
            }
            true
        });

        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.to_string().cmp(&a.id.to_string()))
        });

        let total = runs.len();
        let page = runs
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit)
            .collect();
        Ok((page, total))
    }
}
