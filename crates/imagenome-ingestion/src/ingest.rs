//! Bulk ingestion driver: raw units → archive, one blocking worker per unit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use imagenome_common::{Cancellation, PipelineError, RunSummary, Stage};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::archive::ColumnarArchive;
use crate::error::ArchiveError;
use crate::parser::{parse_unit, unit_id};

/// Result of archiving one source unit.
#[derive(Debug, Clone, Serialize)]
pub struct UnitOutcome {
    pub source_unit: String,
    pub records: usize,
    pub skipped: usize,
    pub shards: usize,
    pub already_archived: bool,
}

impl UnitOutcome {
    fn already(source_unit: String) -> Self {
        Self { source_unit, records: 0, skipped: 0, shards: 0, already_archived: true }
    }
}

/// Summary of an ingestion run. `summary.failed_ids` lists source units
/// that could not be archived.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub units_committed: usize,
    pub units_already_archived: usize,
}

/// Bulk units in `dir` (`*.xml`, `*.xml.gz`), sorted by name.
pub fn discover_units(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut units = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        if path.is_file() && (name.ends_with(".xml") || name.ends_with(".xml.gz")) {
            units.push(path);
        }
    }
    units.sort();
    Ok(units)
}

/// Parse one unit and commit it to the archive. Blocking; re-archiving a
/// committed unit is a no-op.
pub fn archive_unit(archive: &Arc<ColumnarArchive>, path: &Path) -> Result<UnitOutcome, PipelineError> {
    let unit = unit_id(path);
    if archive.is_ingested(&unit) {
        debug!(unit = %unit, "Unit already archived");
        return Ok(UnitOutcome::already(unit));
    }

    let mut parser = parse_unit(path).map_err(|e| PipelineError::Parse {
        unit: unit.clone(),
        message: e.to_string(),
    })?;
    let mut writer = archive.writer(unit.clone());
    for record in parser.by_ref() {
        writer.push(record)?;
    }
    // A unit that could not be read to the end stays un-ingested; the shards
    // sealed so far are orphans and are removed on the next open.
    if let Some(e) = parser.io_error() {
        return Err(PipelineError::Parse { unit, message: format!("unit not fully read: {e}") });
    }
    let skipped = parser.skipped();

    match writer.commit(skipped) {
        Ok(entry) => {
            info!(
                unit = %unit,
                records = entry.record_count,
                skipped,
                shards = entry.shards.len(),
                "Unit archived"
            );
            Ok(UnitOutcome {
                source_unit: unit,
                records: entry.record_count,
                skipped,
                shards: entry.shards.len(),
                already_archived: false,
            })
        }
        Err(ArchiveError::AlreadyIngested(_)) => Ok(UnitOutcome::already(unit)),
        Err(e) => Err(e.into()),
    }
}

/// Archive `units` with up to `max_workers` units in flight. Cancellation
/// stops new units from starting; units already running finish and commit.
#[instrument(skip(archive, units, cancel), fields(units = units.len()))]
pub async fn ingest_units(
    archive: Arc<ColumnarArchive>,
    units: Vec<PathBuf>,
    max_workers: usize,
    cancel: &Cancellation,
) -> IngestReport {
    let started = Instant::now();
    let mut report = IngestReport {
        summary: RunSummary::new(Stage::Ingest),
        units_committed: 0,
        units_already_archived: 0,
    };

    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut tasks = JoinSet::new();

    for path in units {
        if cancel.is_cancelled() {
            report.summary.cancelled = true;
            break;
        }
        let unit = unit_id(&path);
        if archive.is_ingested(&unit) {
            report.units_already_archived += 1;
            continue;
        }
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        let archive = Arc::clone(&archive);
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let result = archive_unit(&archive, &path);
            (unit, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(outcome))) if outcome.already_archived => {
                report.units_already_archived += 1;
            }
            Ok((_, Ok(outcome))) => {
                report.units_committed += 1;
                report.summary.processed += outcome.records;
                report.summary.skipped += outcome.skipped;
            }
            Ok((unit, Err(e))) => {
                error!(unit = %unit, error = %e, "Unit failed to archive");
                report.summary.record_failed(unit);
            }
            Err(e) => {
                error!(error = %e, "Ingestion worker panicked");
                report.summary.failed += 1;
            }
        }
    }

    report.summary.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        committed = report.units_committed,
        already = report.units_already_archived,
        records = report.summary.processed,
        skipped = report.summary.skipped,
        failed = report.summary.failed,
        "Ingestion run finished"
    );
    report
}
