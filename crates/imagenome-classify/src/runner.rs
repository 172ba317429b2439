//! Classification stage: archive → classifier → staging store.
//!
//! Per batch:
//!   1. drop records already staged at this model version or newer
//!   2. short-circuit empty abstracts to (irrelevant, 0.0)
//!   3. one classifier call for the rest, retried on transient errors;
//!      a malformed-input rejection degrades to one call per record
//!   4. upsert the batch in a single transaction, retried; exhaustion
//!      stops the run

use std::sync::Arc;
use std::time::Instant;

use imagenome_common::config::ClassifierConfig;
use imagenome_common::{
    Cancellation, CanonicalRecord, CapabilityError, ClassificationResult, FailedBatch, Label,
    ModelVersion, RetryPolicy, RunSummary, Stage,
};
use imagenome_db::StagingStore;
use imagenome_ingestion::{ColumnarArchive, ShardEntry};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::classifier::Classifier;
use crate::preprocess::preprocess_text;

#[derive(Debug, Clone)]
pub struct ClassifyOptions {
    pub threshold: f64,
    pub batch_size: usize,
    pub min_abstract_chars: usize,
    pub max_concurrent_batches: usize,
    pub retry: RetryPolicy,
}

impl ClassifyOptions {
    pub fn from_config(cfg: &ClassifierConfig, retry: &RetryPolicy) -> Self {
        Self {
            threshold: cfg.threshold,
            batch_size: cfg.batch_size.max(1),
            min_abstract_chars: cfg.min_abstract_chars,
            max_concurrent_batches: cfg.max_concurrent_batches.max(1),
            retry: retry.clone(),
        }
    }
}

impl Default for ClassifyOptions {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default(), &RetryPolicy::default())
    }
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub written: usize,
    /// Already staged at an equal-or-newer version.
    pub skipped: usize,
    pub short_circuited: usize,
    pub model_calls: usize,
    pub failed: Vec<FailedBatch>,
    /// Set when the staging write could not be committed.
    pub store_failure: Option<FailedBatch>,
    /// Records of a batch that was never started because the run halted.
    pub not_started: Vec<String>,
}

impl BatchReport {
    fn merge_into(self, summary: &mut RunSummary) {
        summary.processed += self.written;
        summary.skipped += self.skipped;
        for batch in self.failed {
            summary.record_failed_batch(batch);
        }
        if let Some(batch) = self.store_failure {
            if summary.aborted.is_none() {
                summary.aborted = Some(format!("staging write failed: {}", batch.error));
            }
            summary.record_failed_batch(batch);
        }
        summary.record_unprocessed(self.not_started);
    }
}

/// Drives the classification stage. Clones share one halt flag: after a
/// staging write is abandoned the runner starts no further batches, so a
/// retry needs a fresh runner.
#[derive(Clone)]
pub struct ClassificationRunner {
    classifier: Arc<dyn Classifier>,
    staging: StagingStore,
    options: ClassifyOptions,
    halt: Cancellation,
}

impl ClassificationRunner {
    pub fn new(classifier: Arc<dyn Classifier>, staging: StagingStore, options: ClassifyOptions) -> Self {
        Self { classifier, staging, options, halt: Cancellation::new() }
    }

    fn model_version(&self) -> &ModelVersion {
        self.classifier.model_version()
    }

    fn is_empty_text(&self, text: &str) -> bool {
        text.trim().chars().count() < self.options.min_abstract_chars.max(1)
    }

    fn label_for(&self, score: f64) -> Label {
        if score > self.options.threshold {
            Label::Relevant
        } else {
            Label::Irrelevant
        }
    }

    /// Classify every archived record. Batches run concurrently up to
    /// `max_concurrent_batches`; cancellation is honoured between batches.
    #[instrument(skip_all, fields(model_version = %self.model_version()))]
    pub async fn run(&self, archive: Arc<ColumnarArchive>, cancel: &Cancellation) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::new(Stage::Classify);
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_batches));
        let mut tasks: JoinSet<BatchReport> = JoinSet::new();
        let mut shards = archive.shard_entries().into_iter();
        // Ids of the shard being split when the loop stopped early.
        let mut unreached: Vec<String> = Vec::new();

        'shards: for entry in shards.by_ref() {
            if cancel.is_cancelled() || self.halt.is_cancelled() {
                break;
            }
            let shard_id = entry.shard_id;
            let record_count = entry.record_count;
            let records = match read_shard(&archive, entry).await {
                Ok(records) => records,
                Err(e) => {
                    error!(shard_id, error = %e, "Shard unreadable; skipping");
                    // The ids are inside the unreadable file; count its records.
                    summary.failed += record_count;
                    summary.failed_batches.push(FailedBatch {
                        record_ids: Vec::new(),
                        error: format!("shard {shard_id}: {e}"),
                        attempts: 1,
                    });
                    continue;
                }
            };

            for (i, chunk) in records.chunks(self.options.batch_size).enumerate() {
                if cancel.is_cancelled() || self.halt.is_cancelled() {
                    unreached.extend(records[i * self.options.batch_size..].iter().map(|r| r.id.clone()));
                    break 'shards;
                }
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break 'shards;
                };
                let runner = self.clone();
                let batch = chunk.to_vec();
                tasks.spawn(async move {
                    let _permit = permit;
                    runner.classify_batch(batch).await
                });

                while let Some(done) = tasks.try_join_next() {
                    collect(done, &mut summary);
                }
            }
        }

        while let Some(done) = tasks.join_next().await {
            collect(done, &mut summary);
        }

        if self.halt.is_cancelled() {
            summary.record_unprocessed(unreached);
            for entry in shards {
                let shard_id = entry.shard_id;
                let record_count = entry.record_count;
                match read_shard(&archive, entry).await {
                    Ok(records) => summary.record_unprocessed(records.into_iter().map(|r| r.id).collect()),
                    Err(e) => {
                        warn!(shard_id, error = %e, "Unreached shard unreadable; ids not listed");
                        summary.failed += record_count;
                    }
                }
            }
        }

        summary.cancelled = cancel.is_cancelled();
        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            aborted = summary.aborted.is_some(),
            cancelled = summary.cancelled,
            "Classification run finished"
        );
        summary
    }

    /// Classify and stage one batch.
    pub async fn classify_batch(&self, records: Vec<CanonicalRecord>) -> BatchReport {
        let mut report = BatchReport::default();
        if self.halt.is_cancelled() {
            report.not_started = records.into_iter().map(|r| r.id).collect();
            return report;
        }
        let version = self.model_version().clone();

        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let staged = match self.staging.versions_for(&ids).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Could not read staged versions; classifying whole batch");
                Default::default()
            }
        };

        let mut results = Vec::with_capacity(records.len());
        let mut pending: Vec<(String, String)> = Vec::new();
        for record in records {
            if staged.get(&record.id).is_some_and(|v| *v >= version) {
                report.skipped += 1;
            } else if self.is_empty_text(&record.abstract_text) {
                report.short_circuited += 1;
                results.push(ClassificationResult::empty_text(record.id, version.clone()));
            } else {
                pending.push((record.id, preprocess_text(&record.abstract_text)));
            }
        }

        if !pending.is_empty() {
            self.infer(pending, &version, &mut results, &mut report).await;
        }
        self.stage(results, &mut report).await;
        report
    }

    async fn call(&self, texts: &[String]) -> Result<Vec<f64>, (CapabilityError, u32)> {
        let out = self
            .options
            .retry
            .run("classifier", CapabilityError::is_transient, || self.classifier.classify(texts))
            .await
            .map_err(|e| (e.error, e.attempts))?;
        if out.len() != texts.len() {
            return Err((CapabilityError::OutputMismatch { expected: texts.len(), actual: out.len() }, 1));
        }
        Ok(out)
    }

    async fn infer(
        &self,
        pending: Vec<(String, String)>,
        version: &ModelVersion,
        results: &mut Vec<ClassificationResult>,
        report: &mut BatchReport,
    ) {
        let (ids, texts): (Vec<String>, Vec<String>) = pending.into_iter().unzip();
        report.model_calls += 1;

        match self.call(&texts).await {
            Ok(scores) => {
                for (id, score) in ids.into_iter().zip(scores) {
                    self.push_scored(id, score, version, results, report);
                }
            }
            Err((CapabilityError::MalformedInput(msg), _)) => {
                debug!(records = ids.len(), error = %msg, "Batch rejected; classifying records individually");
                for (id, text) in ids.into_iter().zip(texts) {
                    report.model_calls += 1;
                    match self.call(std::slice::from_ref(&text)).await {
                        Ok(scores) => self.push_scored(id, scores[0], version, results, report),
                        Err((e, attempts)) => {
                            warn!(record_id = %id, error = %e, "Record failed classification");
                            report.failed.push(FailedBatch { record_ids: vec![id], error: e.to_string(), attempts });
                        }
                    }
                }
            }
            Err((e, attempts)) => {
                warn!(records = ids.len(), attempts, error = %e, "Classifier batch failed");
                report.failed.push(FailedBatch { record_ids: ids, error: e.to_string(), attempts });
            }
        }
    }

    fn push_scored(
        &self,
        id: String,
        score: f64,
        version: &ModelVersion,
        results: &mut Vec<ClassificationResult>,
        report: &mut BatchReport,
    ) {
        if !score.is_finite() {
            report.failed.push(FailedBatch {
                record_ids: vec![id],
                error: format!("classifier returned non-finite score {score}"),
                attempts: 1,
            });
            return;
        }
        let score = score.clamp(0.0, 1.0);
        results.push(ClassificationResult {
            record_id: id,
            label: self.label_for(score),
            score,
            model_version: version.clone(),
        });
    }

    async fn stage(&self, results: Vec<ClassificationResult>, report: &mut BatchReport) {
        if results.is_empty() {
            return;
        }
        let outcome = self
            .options
            .retry
            .run("staging upsert", |_| true, || self.staging.upsert_batch(&results))
            .await;

        match outcome {
            Ok(stats) => {
                report.written += stats.written;
                report.skipped += stats.unchanged;
            }
            Err(e) => {
                error!(records = results.len(), attempts = e.attempts, error = %e.error, "Staging write failed; halting run");
                self.halt.cancel();
                report.store_failure = Some(FailedBatch {
                    record_ids: results.into_iter().map(|r| r.record_id).collect(),
                    error: e.error.to_string(),
                    attempts: e.attempts,
                });
            }
        }
    }
}

async fn read_shard(archive: &Arc<ColumnarArchive>, entry: ShardEntry) -> Result<Vec<CanonicalRecord>, String> {
    let reader = Arc::clone(archive);
    match tokio::task::spawn_blocking(move || reader.read_shard(&entry)).await {
        Ok(Ok(records)) => Ok(records),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("shard reader panicked: {e}")),
    }
}

fn collect(done: Result<BatchReport, tokio::task::JoinError>, summary: &mut RunSummary) {
    match done {
        Ok(report) => report.merge_into(summary),
        Err(e) => error!(error = %e, "Classification batch task panicked"),
    }
}
