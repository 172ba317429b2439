//! Classification runner against a fake classifier and an in-memory store.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use imagenome_classify::{ClassificationRunner, Classifier, ClassifyOptions};
use imagenome_common::summary::NOT_PROCESSED;
use imagenome_common::{
    Cancellation, CanonicalRecord, CapabilityError, Label, ModelVersion, RetryPolicy,
};
use imagenome_db::{Database, StagingStore};
use imagenome_ingestion::{ColumnarArchive, ShardLimits};

struct FakeClassifier {
    version: ModelVersion,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
    transient_failures: AtomicUsize,
}

impl FakeClassifier {
    fn new(version: &str) -> Self {
        Self {
            version: ModelVersion::from(version),
            calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
            transient_failures: AtomicUsize::new(0),
        }
    }

    fn failing_first(self, n: usize) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn classify(&self, texts: &[String]) -> Result<Vec<f64>, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(texts.len());

        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CapabilityError::Timeout("model busy".into()));
        }
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(CapabilityError::MalformedInput("unsupported token".into()));
        }
        Ok(texts
            .iter()
            .map(|t| if t.contains("pet") { 0.9 } else { 0.1 })
            .collect())
    }

    fn model_version(&self) -> &ModelVersion {
        &self.version
    }
}

fn options() -> ClassifyOptions {
    ClassifyOptions {
        threshold: 0.5,
        batch_size: 8,
        min_abstract_chars: 1,
        max_concurrent_batches: 2,
        retry: RetryPolicy::immediate(3),
    }
}

async fn staging() -> StagingStore {
    StagingStore::new(Arc::new(Database::open_in_memory().await.unwrap()))
}

/// Make every insert into `table` fail, as a full disk would.
async fn reject_inserts(db_path: &Path, table: &str) {
    let db = libsql::Builder::new_local(db_path).build().await.unwrap();
    let conn = db.connect().unwrap();
    conn.execute_batch(&format!(
        "CREATE TRIGGER reject_{table} BEFORE INSERT ON {table} BEGIN SELECT RAISE(ABORT, 'disk full'); END;"
    ))
    .await
    .unwrap();
}

fn rec(id: &str, abstract_text: &str) -> CanonicalRecord {
    CanonicalRecord::new(id).with_title(format!("Title {id}")).with_abstract(abstract_text)
}

fn five_with_one_empty() -> Vec<CanonicalRecord> {
    vec![
        rec("1", "FDG PET in lymphoma."),
        rec("2", "Knee surgery outcomes."),
        rec("3", "   "),
        rec("4", "PET/CT staging."),
        rec("5", "Dietary fibre intake."),
    ]
}

#[tokio::test]
async fn test_empty_abstract_short_circuits_without_model_call() {
    let classifier = Arc::new(FakeClassifier::new("1"));
    let store = staging().await;
    let runner = ClassificationRunner::new(classifier.clone(), store.clone(), options());

    let report = runner.classify_batch(five_with_one_empty()).await;

    assert_eq!(report.written, 5);
    assert_eq!(report.short_circuited, 1);
    assert_eq!(classifier.calls(), 1);
    assert_eq!(*classifier.batch_sizes.lock().unwrap(), vec![4]);

    let empty = store.get("3").await.unwrap().unwrap();
    assert_eq!(empty.label, Label::Irrelevant);
    assert_eq!(empty.score, 0.0);
    assert_eq!(store.get("1").await.unwrap().unwrap().label, Label::Relevant);
    assert_eq!(store.get("2").await.unwrap().unwrap().label, Label::Irrelevant);
}

#[tokio::test]
async fn test_rerun_at_same_version_is_idempotent() {
    let classifier = Arc::new(FakeClassifier::new("1"));
    let store = staging().await;
    let runner = ClassificationRunner::new(classifier.clone(), store.clone(), options());

    runner.classify_batch(five_with_one_empty()).await;
    let before = store.get("1").await.unwrap();
    let second = runner.classify_batch(five_with_one_empty()).await;

    assert_eq!(second.written, 0);
    assert_eq!(second.skipped, 5);
    assert_eq!(classifier.calls(), 1);
    assert_eq!(store.get("1").await.unwrap(), before);
}

#[tokio::test]
async fn test_newer_model_supersedes() {
    let store = staging().await;
    let v1 = ClassificationRunner::new(Arc::new(FakeClassifier::new("1")), store.clone(), options());
    v1.classify_batch(vec![rec("1", "PET study")]).await;

    let v2_classifier = Arc::new(FakeClassifier::new("2"));
    let v2 = ClassificationRunner::new(v2_classifier.clone(), store.clone(), options());
    let report = v2.classify_batch(vec![rec("1", "PET study")]).await;

    assert_eq!(report.written, 1);
    assert_eq!(v2_classifier.calls(), 1);
    assert_eq!(store.get("1").await.unwrap().unwrap().model_version, ModelVersion::from("2"));
}

#[tokio::test]
async fn test_malformed_input_isolates_offending_record() {
    let classifier = Arc::new(FakeClassifier::new("1"));
    let store = staging().await;
    let runner = ClassificationRunner::new(classifier.clone(), store.clone(), options());

    let report = runner
        .classify_batch(vec![rec("1", "PET study"), rec("2", "poison pill"), rec("3", "other")])
        .await;

    assert_eq!(report.written, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].record_ids, vec!["2"]);
    // one batch call, then one call per record
    assert_eq!(classifier.calls(), 4);
    assert!(store.get("2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let classifier = Arc::new(FakeClassifier::new("1").failing_first(2));
    let store = staging().await;
    let runner = ClassificationRunner::new(classifier.clone(), store, options());

    let report = runner.classify_batch(vec![rec("1", "PET"), rec("2", "CT")]).await;
    assert_eq!(report.written, 2);
    assert!(report.failed.is_empty());
    assert_eq!(classifier.calls(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_report_failed_batch() {
    let classifier = Arc::new(FakeClassifier::new("1").failing_first(100));
    let store = staging().await;
    let runner = ClassificationRunner::new(classifier.clone(), store.clone(), options());

    let report = runner.classify_batch(vec![rec("1", "PET"), rec("2", "  ")]).await;
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].record_ids, vec!["1"]);
    assert_eq!(report.failed[0].attempts, 4);
    // the short-circuited record is still staged
    assert_eq!(report.written, 1);
    assert!(store.get("2").await.unwrap().is_some());
}

#[tokio::test]
async fn test_run_over_archive() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Arc::new(
        ColumnarArchive::open(dir.path(), ShardLimits { max_records: 3, max_bytes: usize::MAX }).unwrap(),
    );
    let mut writer = archive.writer("unit-1");
    for i in 0..10 {
        let text = if i % 2 == 0 { "PET tracer uptake" } else { "orthopaedic follow-up" };
        writer.push(rec(&i.to_string(), text)).unwrap();
    }
    writer.commit(0).unwrap();

    let classifier = Arc::new(FakeClassifier::new("1"));
    let store = staging().await;
    let runner = ClassificationRunner::new(classifier.clone(), store.clone(), options());

    let summary = runner.run(Arc::clone(&archive), &Cancellation::new()).await;
    assert_eq!(summary.processed, 10);
    assert!(summary.is_clean());
    let counts = store.label_counts().await.unwrap();
    assert_eq!((counts.relevant, counts.irrelevant), (5, 5));

    let again = runner.run(archive, &Cancellation::new()).await;
    assert_eq!(again.processed, 0);
    assert_eq!(again.skipped, 10);
}

#[tokio::test]
async fn test_cancelled_run_reports_partial_summary() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Arc::new(ColumnarArchive::open(dir.path(), ShardLimits { max_records: 2, max_bytes: usize::MAX }).unwrap());
    let mut writer = archive.writer("unit-1");
    writer.push(rec("1", "PET")).unwrap();
    writer.commit(0).unwrap();

    let cancel = Cancellation::new();
    cancel.cancel();
    let classifier = Arc::new(FakeClassifier::new("1"));
    let runner = ClassificationRunner::new(classifier.clone(), staging().await, options());

    let summary = runner.run(archive, &cancel).await;
    assert!(summary.cancelled);
    assert_eq!(summary.processed, 0);
    assert_eq!(classifier.calls(), 0);
}

#[tokio::test]
async fn test_store_failure_halts_run_and_lists_unresolved() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Arc::new(
        ColumnarArchive::open(dir.path().join("archive"), ShardLimits { max_records: 2, max_bytes: usize::MAX })
            .unwrap(),
    );
    let mut writer = archive.writer("unit-1");
    for i in 1..=6 {
        writer.push(rec(&i.to_string(), "PET tracer uptake")).unwrap();
    }
    writer.commit(0).unwrap();

    let db_path = dir.path().join("imagenome.db");
    let store = StagingStore::new(Arc::new(Database::open(&db_path).await.unwrap()));
    reject_inserts(&db_path, "staging").await;

    let classifier = Arc::new(FakeClassifier::new("1"));
    let options = ClassifyOptions {
        batch_size: 2,
        max_concurrent_batches: 1,
        retry: RetryPolicy::immediate(1),
        ..options()
    };
    let runner = ClassificationRunner::new(classifier.clone(), store.clone(), options);
    let summary = runner.run(archive, &Cancellation::new()).await;

    assert!(summary.aborted.as_deref().unwrap().starts_with("staging write failed"));
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 6);
    let mut ids = summary.failed_ids.clone();
    ids.sort();
    assert_eq!(ids, vec!["1", "2", "3", "4", "5", "6"]);

    let write = summary.failed_batches.iter().find(|b| b.error != NOT_PROCESSED).unwrap();
    assert_eq!(write.attempts, 2);
    assert_eq!(write.record_ids, vec!["1", "2"]);
    // no batch after the failed one reached the classifier or the store
    assert_eq!(classifier.calls(), 1);
    assert_eq!(store.label_counts().await.unwrap(), Default::default());
}

#[tokio::test]
async fn test_unreadable_shard_counts_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let archive = Arc::new(ColumnarArchive::open(dir.path(), ShardLimits { max_records: 2, max_bytes: usize::MAX }).unwrap());
    let mut writer = archive.writer("unit-1");
    for i in 1..=3 {
        writer.push(rec(&i.to_string(), "PET")).unwrap();
    }
    writer.commit(0).unwrap();
    let first = archive.shard_entries().into_iter().next().unwrap();
    std::fs::remove_file(archive.shard_dir().join(&first.file)).unwrap();

    let runner = ClassificationRunner::new(Arc::new(FakeClassifier::new("1")), staging().await, options());
    let summary = runner.run(archive, &Cancellation::new()).await;
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 2);
    assert!(!summary.is_clean());
}

#[tokio::test]
async fn test_default_options_treat_short_abstracts_as_empty() {
    let classifier = Arc::new(FakeClassifier::new("1"));
    let store = staging().await;
    let runner = ClassificationRunner::new(classifier.clone(), store.clone(), ClassifyOptions::default());

    // ten characters after trimming, then eleven
    let report = runner.classify_batch(vec![rec("1", "  PET scan 1 "), rec("2", "PET imaging")]).await;
    assert_eq!(report.short_circuited, 1);
    assert_eq!(*classifier.batch_sizes.lock().unwrap(), vec![1]);
    assert_eq!(store.get("1").await.unwrap().unwrap().score, 0.0);
    assert_eq!(store.get("2").await.unwrap().unwrap().label, Label::Relevant);
}
