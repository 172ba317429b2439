//! Annotation stage: staging (relevant rows) → annotator → annotated store.
//!
//! Selection is an explicit query: relevant staged records with no complete
//! annotation at the current annotator version derived from their current
//! classification. Title and abstract are separate annotation units. Retry
//! and idempotence follow the classification stage.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use imagenome_common::config::AnnotatorConfig;
use imagenome_common::{
    AnnotationResult, Cancellation, CanonicalRecord, CapabilityError, FailedBatch, Field,
    ModelVersion, RetryPolicy, RunSummary, Stage,
};
use imagenome_db::{AnnotatedStore, StagedRecord, StagingStore};
use imagenome_ingestion::ColumnarArchive;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::annotator::{Annotator, RawSpan};
use crate::merge::{merge_spans, MergeStats};

const FIELDS: [Field; 2] = [Field::Title, Field::Abstract];

#[derive(Debug, Clone)]
pub struct AnnotateOptions {
    pub batch_size: usize,
    pub max_concurrent_batches: usize,
    pub retry: RetryPolicy,
}

impl AnnotateOptions {
    pub fn from_config(cfg: &AnnotatorConfig, retry: &RetryPolicy) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            max_concurrent_batches: cfg.max_concurrent_batches.max(1),
            retry: retry.clone(),
        }
    }
}

impl Default for AnnotateOptions {
    fn default() -> Self {
        Self::from_config(&AnnotatorConfig::default(), &RetryPolicy::default())
    }
}

/// A record selected for annotation together with the classification
/// version it was selected under.
#[derive(Debug, Clone)]
pub struct AnnotationInput {
    pub record: CanonicalRecord,
    pub classification_version: ModelVersion,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Records whose annotation units were committed.
    pub written: usize,
    /// Records the store refused because their classification changed.
    pub rejected: usize,
    /// Units with empty text, stored without a model call.
    pub short_circuited: usize,
    pub model_calls: usize,
    pub dropped_spans: MergeStats,
    pub failed: Vec<FailedBatch>,
    pub store_failure: Option<FailedBatch>,
    /// Records of a batch that was never started because the run halted.
    pub not_started: Vec<String>,
}

impl BatchReport {
    fn merge_into(self, summary: &mut RunSummary) {
        summary.processed += self.written;
        summary.skipped += self.rejected;
        for batch in self.failed {
            summary.record_failed_batch(batch);
        }
        if let Some(batch) = self.store_failure {
            if summary.aborted.is_none() {
                summary.aborted = Some(format!("annotation write failed: {}", batch.error));
            }
            summary.record_failed_batch(batch);
        }
        summary.record_unprocessed(self.not_started);
    }
}

/// Drives the annotation stage. Clones share one halt flag, as with the
/// classification runner.
#[derive(Clone)]
pub struct AnnotationRunner {
    annotator: Arc<dyn Annotator>,
    staging: StagingStore,
    annotated: AnnotatedStore,
    options: AnnotateOptions,
    halt: Cancellation,
}

impl AnnotationRunner {
    pub fn new(
        annotator: Arc<dyn Annotator>,
        staging: StagingStore,
        annotated: AnnotatedStore,
        options: AnnotateOptions,
    ) -> Self {
        Self { annotator, staging, annotated, options, halt: Cancellation::new() }
    }

    fn model_version(&self) -> &ModelVersion {
        self.annotator.model_version()
    }

    /// Annotate every pending relevant record. Stale annotations are
    /// invalidated first so reclassified records are selected again.
    #[instrument(skip_all, fields(model_version = %self.model_version()))]
    pub async fn run(&self, archive: Arc<ColumnarArchive>, cancel: &Cancellation) -> RunSummary {
        let started = Instant::now();
        let mut summary = RunSummary::new(Stage::Annotate);

        match self.annotated.invalidate_stale().await {
            Ok(removed) => debug!(removed, "Stale annotations checked"),
            Err(e) => {
                error!(error = %e, "Could not invalidate stale annotations");
                summary.aborted = Some(format!("invalidation failed: {e}"));
                summary.duration_ms = started.elapsed().as_millis() as u64;
                return summary;
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_batches));
        let mut tasks: JoinSet<BatchReport> = JoinSet::new();
        let mut cursor: Option<String> = None;

        loop {
            if cancel.is_cancelled() || self.halt.is_cancelled() {
                break;
            }
            let page = match self
                .staging
                .pending_annotation(self.model_version(), cursor.as_deref(), self.options.batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, "Could not select pending records");
                    summary.aborted = Some(format!("selection failed: {e}"));
                    break;
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.record_id.clone());

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let runner = self.clone();
            let archive = Arc::clone(&archive);
            tasks.spawn(async move {
                let _permit = permit;
                runner.annotate_staged(archive, page).await
            });

            while let Some(done) = tasks.try_join_next() {
                collect(done, &mut summary);
            }
        }

        while let Some(done) = tasks.join_next().await {
            collect(done, &mut summary);
        }

        if self.halt.is_cancelled() {
            self.list_unreached(cursor, &mut summary).await;
        }

        summary.cancelled = cancel.is_cancelled();
        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            aborted = summary.aborted.is_some(),
            cancelled = summary.cancelled,
            "Annotation run finished"
        );
        summary
    }

    /// Pending records past `cursor`, reported as unresolved after a halt.
    async fn list_unreached(&self, mut cursor: Option<String>, summary: &mut RunSummary) {
        loop {
            let page = match self
                .staging
                .pending_annotation(self.model_version(), cursor.as_deref(), self.options.batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Could not list records left unannotated");
                    return;
                }
            };
            let Some(last) = page.last() else {
                return;
            };
            cursor = Some(last.record_id.clone());
            summary.record_unprocessed(page.into_iter().map(|s| s.record_id).collect());
        }
    }

    /// Fetch the text of a page of staged records and annotate it.
    pub async fn annotate_staged(&self, archive: Arc<ColumnarArchive>, staged: Vec<StagedRecord>) -> BatchReport {
        if self.halt.is_cancelled() {
            return BatchReport {
                not_started: staged.into_iter().map(|s| s.record_id).collect(),
                ..Default::default()
            };
        }
        let ids: Vec<String> = staged.iter().map(|s| s.record_id.clone()).collect();
        let lookup = tokio::task::spawn_blocking(move || archive.find_records(&ids)).await;

        let mut found = match lookup {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                error!(records = staged.len(), error = %e, "Archive lookup failed");
                return lookup_failure(staged, e.to_string());
            }
            Err(e) => {
                error!(error = %e, "Archive lookup panicked");
                return lookup_failure(staged, e.to_string());
            }
        };

        let mut missing = Vec::new();
        let mut inputs = Vec::with_capacity(staged.len());
        for s in staged {
            match found.remove(&s.record_id) {
                Some(record) => inputs.push(AnnotationInput { record, classification_version: s.classification_version }),
                None => missing.push(s.record_id),
            }
        }

        let mut report = self.annotate_records(inputs).await;
        if !missing.is_empty() {
            warn!(records = missing.len(), "Staged records missing from the archive");
            report.failed.push(FailedBatch {
                record_ids: missing,
                error: "record not found in archive".to_string(),
                attempts: 1,
            });
        }
        report
    }

    /// Annotate and store a batch of records.
    pub async fn annotate_records(&self, inputs: Vec<AnnotationInput>) -> BatchReport {
        let mut report = BatchReport::default();
        if self.halt.is_cancelled() {
            report.not_started = inputs.into_iter().map(|i| i.record.id).collect();
            return report;
        }
        let version = self.model_version().clone();

        // Per record: the units still needing a model call.
        let mut results: Vec<AnnotationResult> = Vec::new();
        let mut pending: Vec<(AnnotationInput, Vec<Field>)> = Vec::new();
        for input in inputs {
            let mut needs_model = Vec::new();
            for field in FIELDS {
                if input.record.field_text(field).trim().is_empty() {
                    report.short_circuited += 1;
                } else {
                    needs_model.push(field);
                }
            }
            pending.push((input, needs_model));
        }

        let mut tagged: HashMap<String, Vec<(Field, Vec<RawSpan>)>> = HashMap::new();
        let units: Vec<(String, Field, String)> = pending
            .iter()
            .flat_map(|(input, fields)| {
                fields.iter().map(move |f| (input.record.id.clone(), *f, input.record.field_text(*f).to_string()))
            })
            .collect();

        if !units.is_empty() {
            self.infer(units, &mut tagged, &mut report).await;
        }

        let failed_ids: BTreeSet<String> =
            report.failed.iter().flat_map(|b| b.record_ids.iter().cloned()).collect();

        for (input, fields) in pending {
            if failed_ids.contains(&input.record.id) {
                continue;
            }
            let mut raw_by_field = tagged.remove(&input.record.id).unwrap_or_default();
            for field in FIELDS {
                let text = input.record.field_text(field);
                let spans = if fields.contains(&field) {
                    let raw = raw_by_field
                        .iter()
                        .position(|(f, _)| *f == field)
                        .map(|i| raw_by_field.swap_remove(i).1)
                        .unwrap_or_default();
                    let (spans, stats) = merge_spans(text, &raw);
                    report.dropped_spans.add(stats);
                    spans
                } else {
                    Vec::new()
                };
                results.push(AnnotationResult {
                    record_id: input.record.id.clone(),
                    field,
                    spans,
                    model_version: version.clone(),
                    classification_version: input.classification_version.clone(),
                });
            }
        }

        if report.dropped_spans.dropped() > 0 {
            debug!(
                unknown_label = report.dropped_spans.unknown_label,
                invalid_offsets = report.dropped_spans.invalid_offsets,
                "Raw spans dropped"
            );
        }
        self.store(results, &mut report).await;
        report
    }

    async fn call(&self, texts: &[String]) -> Result<Vec<Vec<RawSpan>>, (CapabilityError, u32)> {
        let out = self
            .options
            .retry
            .run("annotator", CapabilityError::is_transient, || self.annotator.annotate(texts))
            .await
            .map_err(|e| (e.error, e.attempts))?;
        if out.len() != texts.len() {
            return Err((CapabilityError::OutputMismatch { expected: texts.len(), actual: out.len() }, 1));
        }
        Ok(out)
    }

    /// One call for every unit in the batch. A malformed-input rejection
    /// degrades to one call per record so a bad record fails alone.
    async fn infer(
        &self,
        units: Vec<(String, Field, String)>,
        tagged: &mut HashMap<String, Vec<(Field, Vec<RawSpan>)>>,
        report: &mut BatchReport,
    ) {
        let texts: Vec<String> = units.iter().map(|(_, _, t)| t.clone()).collect();
        report.model_calls += 1;

        match self.call(&texts).await {
            Ok(spans) => {
                for ((id, field, _), raw) in units.into_iter().zip(spans) {
                    tagged.entry(id).or_default().push((field, raw));
                }
            }
            Err((CapabilityError::MalformedInput(msg), _)) => {
                debug!(units = units.len(), error = %msg, "Batch rejected; annotating records individually");
                let mut by_record: Vec<(String, Vec<(Field, String)>)> = Vec::new();
                for (id, field, text) in units {
                    match by_record.last_mut() {
                        Some((last, group)) if *last == id => group.push((field, text)),
                        _ => by_record.push((id, vec![(field, text)])),
                    }
                }
                for (id, group) in by_record {
                    report.model_calls += 1;
                    let texts: Vec<String> = group.iter().map(|(_, t)| t.clone()).collect();
                    match self.call(&texts).await {
                        Ok(spans) => {
                            let entry = tagged.entry(id).or_default();
                            for ((field, _), raw) in group.into_iter().zip(spans) {
                                entry.push((field, raw));
                            }
                        }
                        Err((e, attempts)) => {
                            warn!(record_id = %id, error = %e, "Record failed annotation");
                            report.failed.push(FailedBatch { record_ids: vec![id], error: e.to_string(), attempts });
                        }
                    }
                }
            }
            Err((e, attempts)) => {
                let mut ids: Vec<String> = units.into_iter().map(|(id, _, _)| id).collect();
                ids.dedup();
                warn!(records = ids.len(), attempts, error = %e, "Annotator batch failed");
                report.failed.push(FailedBatch { record_ids: ids, error: e.to_string(), attempts });
            }
        }
    }

    async fn store(&self, results: Vec<AnnotationResult>, report: &mut BatchReport) {
        if results.is_empty() {
            return;
        }
        let outcome = self
            .options
            .retry
            .run("annotation upsert", |_| true, || self.annotated.upsert_batch(&results))
            .await;

        match outcome {
            Ok(write) => {
                let records: BTreeSet<&str> = results.iter().map(|r| r.record_id.as_str()).collect();
                report.rejected += write.rejected.len();
                report.written += records.len() - write.rejected.len();
                if !write.rejected.is_empty() {
                    warn!(records = write.rejected.len(), "Annotations rejected; classification changed");
                }
            }
            Err(e) => {
                error!(units = results.len(), attempts = e.attempts, error = %e.error, "Annotation write failed; halting run");
                self.halt.cancel();
                let mut ids: Vec<String> = results.into_iter().map(|r| r.record_id).collect();
                ids.dedup();
                report.store_failure = Some(FailedBatch {
                    record_ids: ids,
                    error: e.error.to_string(),
                    attempts: e.attempts,
                });
            }
        }
    }
}

fn lookup_failure(staged: Vec<StagedRecord>, error: String) -> BatchReport {
    BatchReport {
        failed: vec![FailedBatch {
            record_ids: staged.into_iter().map(|s| s.record_id).collect(),
            error,
            attempts: 1,
        }],
        ..Default::default()
    }
}

fn collect(done: Result<BatchReport, tokio::task::JoinError>, summary: &mut RunSummary) {
    match done {
        Ok(report) => report.merge_into(summary),
        Err(e) => error!(error = %e, "Annotation batch task panicked"),
    }
}
