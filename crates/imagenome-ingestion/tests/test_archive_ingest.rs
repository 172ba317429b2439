//! End-to-end ingestion: bulk units on disk → archive manifest and shards.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use imagenome_common::Cancellation;
use imagenome_ingestion::{
    archive_unit, discover_units, ingest_units, parse_unit, ColumnarArchive, ShardLimits,
};

fn article(pmid: &str, title: &str, abstract_text: &str) -> String {
    format!(
        "<PubmedArticle><MedlineCitation Status=\"MEDLINE\"><PMID Version=\"1\">{pmid}</PMID>\
         <Article><Journal><Title>Eur J Nucl Med</Title></Journal>\
         <ArticleTitle>{title}</ArticleTitle>\
         <Abstract><AbstractText>{abstract_text}</AbstractText></Abstract></Article>\
         </MedlineCitation></PubmedArticle>"
    )
}

const MALFORMED: &str = "<PubmedArticle><MedlineCitation><PMID>2</PMID><Article>\
    <ArticleTitle>broken</Journal></Article></MedlineCitation></PubmedArticle>";

fn write_gz(path: &Path, articles: &[String]) {
    let file = std::fs::File::create(path).unwrap();
    let mut gz = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
    write!(gz, "<?xml version=\"1.0\"?>\n<PubmedArticleSet>\n").unwrap();
    for a in articles {
        writeln!(gz, "{a}").unwrap();
    }
    write!(gz, "</PubmedArticleSet>\n").unwrap();
    gz.finish().unwrap();
}

fn limits() -> ShardLimits {
    ShardLimits { max_records: 2, max_bytes: 1 << 20 }
}

#[test]
fn test_malformed_article_skipped_and_unit_committed() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = input.path().join("pubmed24n0001.xml.gz");
    write_gz(
        &path,
        &[
            article("1", "FDG PET", "Uptake in tumours."),
            MALFORMED.to_string(),
            article("3", "SPECT imaging", "Perfusion study."),
        ],
    );

    let archive = Arc::new(ColumnarArchive::open(root.path(), limits()).unwrap());
    let outcome = archive_unit(&archive, &path).unwrap();
    assert_eq!(outcome.records, 2);
    assert_eq!(outcome.skipped, 1);

    let units = archive.units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].source_unit, "pubmed24n0001");
    assert_eq!(units[0].record_count, 2);
    assert_eq!(units[0].skipped, 1);
}

#[test]
fn test_reingest_is_noop() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = input.path().join("pubmed24n0002.xml.gz");
    write_gz(&path, &[article("10", "a", "b")]);

    let archive = Arc::new(ColumnarArchive::open(root.path(), limits()).unwrap());
    assert!(!archive_unit(&archive, &path).unwrap().already_archived);
    assert!(archive_unit(&archive, &path).unwrap().already_archived);
    drop(archive);

    let reopened = Arc::new(ColumnarArchive::open(root.path(), limits()).unwrap());
    assert!(archive_unit(&reopened, &path).unwrap().already_archived);
    assert_eq!(reopened.record_count(), 1);
}

#[test]
fn test_truncated_gzip_unit_is_not_committed() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = input.path().join("pubmed24n0004.xml.gz");
    let articles: Vec<String> = (1..=400)
        .map(|i| article(&i.to_string(), &format!("Tracer study {i}"), &format!("Uptake measured in cohort {i}.")))
        .collect();
    write_gz(&path, &articles);

    let full = std::fs::read(&path).unwrap();
    std::fs::write(&path, &full[..full.len() / 2]).unwrap();

    let archive = Arc::new(ColumnarArchive::open(root.path(), limits()).unwrap());
    assert!(archive_unit(&archive, &path).is_err());
    assert!(!archive.is_ingested("pubmed24n0004"));
    assert_eq!(archive.record_count(), 0);

    // Once the download is complete the unit is archived in full.
    std::fs::write(&path, &full).unwrap();
    let outcome = archive_unit(&archive, &path).unwrap();
    assert!(!outcome.already_archived);
    assert_eq!(outcome.records, 400);
    assert_eq!(outcome.skipped, 0);
    drop(archive);

    let reopened = ColumnarArchive::open(root.path(), limits()).unwrap();
    assert_eq!(reopened.record_count(), 400);
}

#[tokio::test]
async fn test_unreadable_unit_reported_as_failed() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = input.path().join("pubmed24n0005.xml.gz");
    let articles: Vec<String> = (1..=200).map(|i| article(&i.to_string(), "t", "a")).collect();
    write_gz(&path, &articles);
    let full = std::fs::read(&path).unwrap();
    std::fs::write(&path, &full[..full.len() / 2]).unwrap();

    let archive = Arc::new(ColumnarArchive::open(root.path(), limits()).unwrap());
    let report = ingest_units(archive, vec![path], 1, &Cancellation::new()).await;
    assert_eq!(report.units_committed, 0);
    assert_eq!(report.summary.failed_ids, vec!["pubmed24n0005".to_string()]);
    assert!(!report.summary.is_clean());
}

#[test]
fn test_round_trip_matches_parser_output() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = input.path().join("pubmed24n0003.xml.gz");
    let articles: Vec<String> = (100..105)
        .map(|i| article(&i.to_string(), &format!("Title {i} – ¹⁸F"), &format!("Abstract {i}")))
        .collect();
    write_gz(&path, &articles);

    let parsed: Vec<_> = parse_unit(&path).unwrap().collect();
    let archive = Arc::new(ColumnarArchive::open(root.path(), limits()).unwrap());
    archive_unit(&archive, &path).unwrap();

    for record in &parsed {
        let stored = archive.find_record(&record.id).unwrap().unwrap();
        assert_eq!(&stored, record);
        assert_eq!(
            serde_json::to_vec(&stored).unwrap(),
            serde_json::to_vec(record).unwrap()
        );
    }
    let streamed: Vec<_> = archive.records().map(Result::unwrap).collect();
    assert_eq!(streamed, parsed);
}

#[tokio::test]
async fn test_ingest_units_counts_records_and_skips() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_gz(
        &input.path().join("pubmed24n0001.xml.gz"),
        &[article("1", "a", "x"), article("2", "b", "y")],
    );
    write_gz(
        &input.path().join("pubmed24n0002.xml.gz"),
        &[article("3", "c", "z"), MALFORMED.to_string()],
    );
    std::fs::write(input.path().join("README.txt"), "ignored").unwrap();

    let units = discover_units(input.path()).unwrap();
    assert_eq!(units.len(), 2);

    let archive = Arc::new(ColumnarArchive::open(root.path(), limits()).unwrap());
    let report = ingest_units(Arc::clone(&archive), units.clone(), 2, &Cancellation::new()).await;
    assert_eq!(report.units_committed, 2);
    assert_eq!(report.summary.processed, 3);
    assert_eq!(report.summary.skipped, 1);
    assert!(report.summary.is_clean());

    let again = ingest_units(archive, units, 2, &Cancellation::new()).await;
    assert_eq!(again.units_committed, 0);
    assert_eq!(again.units_already_archived, 2);
}

#[tokio::test]
async fn test_cancelled_run_starts_no_units() {
    let input = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    write_gz(&input.path().join("pubmed24n0001.xml.gz"), &[article("1", "a", "x")]);

    let cancel = Cancellation::new();
    cancel.cancel();
    let archive = Arc::new(ColumnarArchive::open(root.path(), limits()).unwrap());
    let report = ingest_units(archive.clone(), discover_units(input.path()).unwrap(), 1, &cancel).await;
    assert!(report.summary.cancelled);
    assert_eq!(archive.record_count(), 0);
}
