//! Append-only JSON Lines manifest.
//!
//! Every committed source unit is one `commit` line listing its sealed
//! shards. A `retract` line withdraws a unit (its shards become orphans and
//! the unit can be ingested again). The manifest is the sole authority on
//! what the archive contains.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ArchiveError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardEntry {
    pub shard_id: u64,
    /// File name relative to the shard directory.
    pub file: String,
    pub record_count: usize,
    pub byte_len: u64,
    /// Hex SHA-256 of the sealed file.
    pub sha256: String,
    pub min_id: String,
    pub max_id: String,
}

impl ShardEntry {
    /// Whether `id` can fall inside this shard's id range.
    pub fn may_contain(&self, id: &str) -> bool {
        compare_ids(id, &self.min_id) != Ordering::Less
            && compare_ids(id, &self.max_id) != Ordering::Greater
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEntry {
    pub source_unit: String,
    pub record_count: usize,
    pub skipped: usize,
    pub shards: Vec<ShardEntry>,
    pub committed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManifestLine {
    Commit(UnitEntry),
    Retract {
        source_unit: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

/// Record ids are PMIDs: numeric ids order by value, anything else lexically.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    let numeric = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_digit());
    if numeric(a) && numeric(b) {
        let a = a.trim_start_matches('0');
        let b = b.trim_start_matches('0');
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    } else {
        a.cmp(b)
    }
}

/// In-memory view of the manifest plus its open append handle.
pub struct Manifest {
    units: Vec<UnitEntry>,
    index: HashMap<String, usize>,
    file: File,
}

impl Manifest {
    /// Load (or create) the manifest at `path`. An unterminated final line
    /// from an interrupted append is cut off; any other unreadable line is an
    /// error.
    pub fn open(path: &Path) -> Result<Self> {
        let content = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut lines: Vec<ManifestLine> = Vec::new();
        let mut valid_len = content.len();
        let mut offset = 0usize;
        let mut line_no = 0usize;

        while offset < content.len() {
            line_no += 1;
            let (end, terminated) = match content[offset..].iter().position(|&b| b == b'\n') {
                Some(i) => (offset + i, true),
                None => (content.len(), false),
            };
            // An append is complete only with its newline, even when the
            // bytes before it happen to parse.
            if !terminated {
                warn!(path = %path.display(), line = line_no, bytes = end - offset, "Discarding unterminated manifest tail");
                valid_len = offset;
                break;
            }
            let raw = &content[offset..end];
            if !raw.iter().all(u8::is_ascii_whitespace) {
                let line = serde_json::from_slice::<ManifestLine>(raw).map_err(|e| {
                    ArchiveError::ManifestCorrupt { line: line_no, message: e.to_string() }
                })?;
                lines.push(line);
            }
            offset = end + 1;
        }

        let file = OpenOptions::new().create(true).read(true).append(true).open(path)?;
        if valid_len < content.len() {
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        let mut manifest = Self { units: Vec::new(), index: HashMap::new(), file };
        for line in lines {
            manifest.apply(line);
        }
        Ok(manifest)
    }

    fn apply(&mut self, line: ManifestLine) {
        match line {
            ManifestLine::Commit(entry) => {
                if let Some(&i) = self.index.get(&entry.source_unit) {
                    self.units[i] = entry;
                } else {
                    self.index.insert(entry.source_unit.clone(), self.units.len());
                    self.units.push(entry);
                }
            }
            ManifestLine::Retract { source_unit, .. } => {
                if let Some(i) = self.index.remove(&source_unit) {
                    self.units.remove(i);
                    for idx in self.index.values_mut() {
                        if *idx > i {
                            *idx -= 1;
                        }
                    }
                }
            }
        }
    }

    /// Durably append one line, then apply it.
    pub fn append(&mut self, line: ManifestLine) -> Result<()> {
        let mut bytes = serde_json::to_vec(&line)?;
        bytes.push(b'\n');
        self.file.write_all(&bytes)?;
        self.file.sync_data()?;
        self.apply(line);
        Ok(())
    }

    pub fn units(&self) -> &[UnitEntry] {
        &self.units
    }

    pub fn get(&self, source_unit: &str) -> Option<&UnitEntry> {
        self.index.get(source_unit).map(|&i| &self.units[i])
    }

    pub fn contains(&self, source_unit: &str) -> bool {
        self.index.contains_key(source_unit)
    }

    pub fn shards(&self) -> impl Iterator<Item = (&UnitEntry, &ShardEntry)> {
        self.units.iter().flat_map(|u| u.shards.iter().map(move |s| (u, s)))
    }

    pub fn max_shard_id(&self) -> Option<u64> {
        self.shards().map(|(_, s)| s.shard_id).max()
    }
}
