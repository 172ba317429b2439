use std::sync::Arc;

use chrono::Utc;
use imagenome_common::CanonicalRecord;
use tracing::debug;

use super::manifest::{ShardEntry, UnitEntry};
use super::{shard, ColumnarArchive};
use crate::error::{ArchiveError, Result};

/// Accumulates the records of one source unit into sealed shards. Nothing
/// becomes visible in the archive until [`UnitWriter::commit`] appends the
/// unit's manifest line; dropping the writer early leaves only orphans.
pub struct UnitWriter {
    archive: Arc<ColumnarArchive>,
    source_unit: String,
    pending: Vec<CanonicalRecord>,
    pending_bytes: usize,
    sealed: Vec<ShardEntry>,
}

impl UnitWriter {
    pub(crate) fn new(archive: Arc<ColumnarArchive>, source_unit: String) -> Self {
        Self {
            archive,
            source_unit,
            pending: Vec::new(),
            pending_bytes: 0,
            sealed: Vec::new(),
        }
    }

    pub fn source_unit(&self) -> &str {
        &self.source_unit
    }

    pub fn push(&mut self, record: CanonicalRecord) -> Result<()> {
        self.pending_bytes += record.approx_bytes();
        self.pending.push(record);

        let limits = self.archive.limits();
        if self.pending.len() >= limits.max_records || self.pending_bytes >= limits.max_bytes {
            self.seal()?;
        }
        Ok(())
    }

    fn seal(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let shard_id = self.archive.allocate_shard_id();
        let entry = shard::seal_shard(self.archive.shard_dir(), shard_id, &self.pending)?;
        debug!(
            unit = %self.source_unit,
            shard_id,
            records = entry.record_count,
            bytes = entry.byte_len,
            "Shard sealed"
        );
        self.sealed.push(entry);
        self.pending.clear();
        self.pending_bytes = 0;
        Ok(())
    }

    /// Seal the remaining records and commit the unit to the manifest.
    pub fn commit(mut self, skipped: usize) -> Result<UnitEntry> {
        self.seal()?;

        let entry = UnitEntry {
            source_unit: self.source_unit.clone(),
            record_count: self.sealed.iter().map(|s| s.record_count).sum(),
            skipped,
            shards: std::mem::take(&mut self.sealed),
            committed_at: Utc::now(),
        };

        match self.archive.commit_unit(entry.clone()) {
            Ok(()) => Ok(entry),
            Err(e @ ArchiveError::AlreadyIngested(_)) => {
                // Another writer won the race; our shards are unreferenced.
                for s in &entry.shards {
                    let _ = std::fs::remove_file(shard::shard_path(self.archive.shard_dir(), s));
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
