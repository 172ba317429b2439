//! Columnar archive: immutable Parquet shards indexed by an append-only
//! manifest.
//!
//! Layout:
//!   <root>/manifest.jsonl
//!   <root>/shards/shard-<id:08>.parquet
//!
//! Shards are sealed (fsynced, checksummed, renamed) before the manifest
//! line naming them is appended. Anything on disk the manifest does not
//! reference is an orphan from an interrupted run and is removed on open.

pub mod manifest;
pub mod shard;
pub mod writer;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use imagenome_common::config::ArchiveConfig;
use imagenome_common::CanonicalRecord;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ArchiveError, Result};
pub use manifest::{ManifestLine, ShardEntry, UnitEntry};
use manifest::Manifest;
pub use writer::UnitWriter;

pub const MANIFEST_FILE: &str = "manifest.jsonl";
pub const SHARD_DIR: &str = "shards";

/// Seal thresholds; a shard is sealed when either is reached.
#[derive(Debug, Clone, Copy)]
pub struct ShardLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl From<&ArchiveConfig> for ShardLimits {
    fn from(cfg: &ArchiveConfig) -> Self {
        Self { max_records: cfg.shard_max_records.max(1), max_bytes: cfg.shard_max_bytes.max(1) }
    }
}

/// One shard that failed verification, with the units to re-ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityIssue {
    pub shard_id: u64,
    pub source_unit: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub shards_checked: usize,
    pub issues: Vec<IntegrityIssue>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }

    /// Source units affected by at least one bad shard.
    pub fn affected_units(&self) -> Vec<String> {
        let mut units: Vec<String> = self.issues.iter().map(|i| i.source_unit.clone()).collect();
        units.sort();
        units.dedup();
        units
    }
}

pub struct ColumnarArchive {
    root: PathBuf,
    shard_dir: PathBuf,
    limits: ShardLimits,
    manifest: Mutex<Manifest>,
    next_shard_id: AtomicU64,
}

impl ColumnarArchive {
    /// Open (or create) the archive at `root` and remove orphaned files.
    pub fn open(root: impl AsRef<Path>, limits: ShardLimits) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let shard_dir = root.join(SHARD_DIR);
        std::fs::create_dir_all(&shard_dir)?;

        let manifest = Manifest::open(&root.join(MANIFEST_FILE))?;
        let removed = remove_orphans(&shard_dir, &manifest)?;
        let next = manifest.max_shard_id().map_or(0, |id| id + 1);

        info!(
            root = %root.display(),
            units = manifest.units().len(),
            next_shard_id = next,
            orphans_removed = removed,
            "Archive opened"
        );

        Ok(Self {
            root,
            shard_dir,
            limits,
            manifest: Mutex::new(manifest),
            next_shard_id: AtomicU64::new(next),
        })
    }

    pub fn from_config(cfg: &ArchiveConfig) -> Result<Self> {
        Self::open(&cfg.root, ShardLimits::from(cfg))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn shard_dir(&self) -> &Path {
        &self.shard_dir
    }

    pub fn limits(&self) -> ShardLimits {
        self.limits
    }

    pub(crate) fn allocate_shard_id(&self) -> u64 {
        self.next_shard_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Whether `source_unit` already has a committed manifest entry.
    pub fn is_ingested(&self, source_unit: &str) -> bool {
        self.manifest.lock().contains(source_unit)
    }

    pub fn unit(&self, source_unit: &str) -> Option<UnitEntry> {
        self.manifest.lock().get(source_unit).cloned()
    }

    pub fn units(&self) -> Vec<UnitEntry> {
        self.manifest.lock().units().to_vec()
    }

    pub fn record_count(&self) -> usize {
        self.manifest.lock().units().iter().map(|u| u.record_count).sum()
    }

    /// Committed shards in manifest order.
    pub fn shard_entries(&self) -> Vec<ShardEntry> {
        self.manifest.lock().shards().map(|(_, s)| s.clone()).collect()
    }

    pub fn writer(self: &Arc<Self>, source_unit: impl Into<String>) -> UnitWriter {
        UnitWriter::new(Arc::clone(self), source_unit.into())
    }

    pub(crate) fn commit_unit(&self, entry: UnitEntry) -> Result<()> {
        let mut manifest = self.manifest.lock();
        if manifest.contains(&entry.source_unit) {
            return Err(ArchiveError::AlreadyIngested(entry.source_unit));
        }
        manifest.append(ManifestLine::Commit(entry))
    }

    /// Withdraw a unit so it can be ingested again. Its shard files are
    /// removed the next time the archive is opened.
    pub fn retract_unit(&self, source_unit: &str, reason: &str) -> Result<bool> {
        let mut manifest = self.manifest.lock();
        if !manifest.contains(source_unit) {
            return Ok(false);
        }
        manifest.append(ManifestLine::Retract {
            source_unit: source_unit.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        })?;
        warn!(unit = %source_unit, reason, "Unit retracted from archive");
        Ok(true)
    }

    pub fn read_shard(&self, entry: &ShardEntry) -> Result<Vec<CanonicalRecord>> {
        shard::read_shard(&self.shard_dir, entry)
    }

    /// Stream every committed record, one shard in memory at a time.
    pub fn records(&self) -> ArchiveRecords {
        ArchiveRecords {
            dir: self.shard_dir.clone(),
            shards: self.shard_entries().into_iter(),
            current: Vec::new().into_iter(),
        }
    }

    /// Look a record up by id, reading only shards whose id range covers it.
    pub fn find_record(&self, id: &str) -> Result<Option<CanonicalRecord>> {
        let candidates: Vec<ShardEntry> = self
            .manifest
            .lock()
            .shards()
            .filter(|(_, s)| s.may_contain(id))
            .map(|(_, s)| s.clone())
            .collect();

        for entry in &candidates {
            if let Some(record) = self.read_shard(entry)?.into_iter().find(|r| r.id == id) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Batch lookup; each candidate shard is read at most once. Ids not in
    /// the archive are absent from the result.
    pub fn find_records(&self, ids: &[String]) -> Result<HashMap<String, CanonicalRecord>> {
        let candidates: Vec<ShardEntry> = self
            .manifest
            .lock()
            .shards()
            .filter(|(_, s)| ids.iter().any(|id| s.may_contain(id)))
            .map(|(_, s)| s.clone())
            .collect();

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let mut found = HashMap::with_capacity(ids.len());
        for entry in &candidates {
            if found.len() == wanted.len() {
                break;
            }
            for record in self.read_shard(entry)? {
                if wanted.contains(record.id.as_str()) {
                    found.insert(record.id.clone(), record);
                }
            }
        }
        Ok(found)
    }

    /// Re-checksum every committed shard. A bad shard is reported and the
    /// remaining shards are still checked.
    pub fn verify(&self) -> VerifyReport {
        let shards: Vec<(String, ShardEntry)> = self
            .manifest
            .lock()
            .shards()
            .map(|(u, s)| (u.source_unit.clone(), s.clone()))
            .collect();

        let mut report = VerifyReport::default();
        for (source_unit, entry) in shards {
            report.shards_checked += 1;
            if let Err(e) = shard::verify_shard(&self.shard_dir, &entry) {
                warn!(shard_id = entry.shard_id, unit = %source_unit, error = %e, "Shard failed verification");
                report.issues.push(IntegrityIssue {
                    shard_id: entry.shard_id,
                    source_unit,
                    message: e.to_string(),
                });
            }
        }
        info!(checked = report.shards_checked, issues = report.issues.len(), "Archive verified");
        report
    }
}

/// Delete `*.tmp` files and shard files the manifest does not reference.
fn remove_orphans(shard_dir: &Path, manifest: &Manifest) -> Result<usize> {
    let referenced: HashSet<&str> = manifest.shards().map(|(_, s)| s.file.as_str()).collect();
    let mut removed = 0;

    for entry in std::fs::read_dir(shard_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let orphan = name.ends_with(shard::TMP_SUFFIX)
            || (name.starts_with("shard-") && name.ends_with(".parquet") && !referenced.contains(name.as_str()));
        if orphan {
            debug!(file = %name, "Removing orphaned shard file");
            std::fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Iterator over all archived records in manifest order.
pub struct ArchiveRecords {
    dir: PathBuf,
    shards: std::vec::IntoIter<ShardEntry>,
    current: std::vec::IntoIter<CanonicalRecord>,
}

impl Iterator for ArchiveRecords {
    type Item = Result<CanonicalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            let entry = self.shards.next()?;
            match shard::read_shard(&self.dir, &entry) {
                Ok(records) => self.current = records.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}
