//! Per-stage run summaries.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Ingest,
    Classify,
    Annotate,
    Filter,
}

/// Error attached to records a halted run never reached.
pub const NOT_PROCESSED: &str = "not processed: run aborted";

/// A batch that could not be processed after its retry budget was spent.
#[derive(Debug, Clone, Serialize)]
pub struct FailedBatch {
    pub record_ids: Vec<String>,
    pub error: String,
    pub attempts: u32,
}

/// Summary of one stage run: records processed, skipped and failed, plus
/// the identifiers needed for a targeted retry.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stage: Stage,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failed_ids: Vec<String>,
    pub failed_batches: Vec<FailedBatch>,
    /// Set when the run stopped early because a store write could not be
    /// committed; `failed_ids` then also lists every unresolved record.
    pub aborted: Option<String>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RunSummary {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            processed: 0,
            skipped: 0,
            failed: 0,
            failed_ids: Vec::new(),
            failed_batches: Vec::new(),
            aborted: None,
            cancelled: false,
            duration_ms: 0,
        }
    }

    pub fn record_failed_batch(&mut self, batch: FailedBatch) {
        self.failed += batch.record_ids.len();
        self.failed_ids.extend(batch.record_ids.iter().cloned());
        self.failed_batches.push(batch);
    }

    /// Records left unresolved because the run halted before reaching them.
    pub fn record_unprocessed(&mut self, record_ids: Vec<String>) {
        if record_ids.is_empty() {
            return;
        }
        self.record_failed_batch(FailedBatch { record_ids, error: NOT_PROCESSED.to_string(), attempts: 0 });
    }

    pub fn record_failed(&mut self, record_id: impl Into<String>) {
        self.failed += 1;
        self.failed_ids.push(record_id.into());
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.failed_ids.extend(other.failed_ids);
        self.failed_batches.extend(other.failed_batches);
        self.cancelled |= other.cancelled;
        if self.aborted.is_none() {
            self.aborted = other.aborted;
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.aborted.is_none() && !self.cancelled
    }
}
