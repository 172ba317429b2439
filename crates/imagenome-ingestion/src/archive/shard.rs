//! Parquet shard files: Arrow conversion, sealing and reading.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field, Schema};
use imagenome_common::CanonicalRecord;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use sha2::{Digest, Sha256};

use super::manifest::{compare_ids, ShardEntry};
use crate::error::{ArchiveError, Result};

pub const TMP_SUFFIX: &str = ".tmp";

pub fn shard_file_name(shard_id: u64) -> String {
    format!("shard-{shard_id:08}.parquet")
}

// =============================================================================
// Arrow conversion
// =============================================================================

pub fn record_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("title", DataType::Utf8, false),
        Field::new("abstract", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
    ]))
}

pub fn records_to_batch(records: &[CanonicalRecord]) -> Result<RecordBatch> {
    let ids = StringArray::from_iter_values(records.iter().map(|r| r.id.as_str()));
    let titles = StringArray::from_iter_values(records.iter().map(|r| r.title.as_str()));
    let abstracts = StringArray::from_iter_values(records.iter().map(|r| r.abstract_text.as_str()));
    let metadata = records
        .iter()
        .map(|r| serde_json::to_string(&r.metadata))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let metadata = StringArray::from(metadata);

    Ok(RecordBatch::try_new(
        record_schema(),
        vec![
            Arc::new(ids) as Arc<dyn Array>,
            Arc::new(titles),
            Arc::new(abstracts),
            Arc::new(metadata),
        ],
    )?)
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| ArchiveError::Arrow(format!("missing or mistyped column: {name}")))
}

pub fn batch_to_records(batch: &RecordBatch) -> Result<Vec<CanonicalRecord>> {
    let ids = string_column(batch, "id")?;
    let titles = string_column(batch, "title")?;
    let abstracts = string_column(batch, "abstract")?;
    let metadata = string_column(batch, "metadata")?;

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let meta: BTreeMap<String, String> = serde_json::from_str(metadata.value(i))?;
        out.push(CanonicalRecord {
            id: ids.value(i).to_string(),
            title: titles.value(i).to_string(),
            abstract_text: abstracts.value(i).to_string(),
            metadata: meta,
        });
    }
    Ok(out)
}

// =============================================================================
// Sealing
// =============================================================================

pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Write `records` as shard `shard_id`: write to a temp file, fsync,
/// checksum, rename into place and fsync the directory. The returned entry
/// is only valid for the manifest once this returns.
pub fn seal_shard(dir: &Path, shard_id: u64, records: &[CanonicalRecord]) -> Result<ShardEntry> {
    let (min_id, max_id) = id_range(records).ok_or_else(|| ArchiveError::Integrity {
        shard_id,
        message: "refusing to seal an empty shard".to_string(),
    })?;

    let file_name = shard_file_name(shard_id);
    let final_path = dir.join(&file_name);
    let tmp_path = dir.join(format!("{file_name}{TMP_SUFFIX}"));

    let batch = records_to_batch(records)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = File::create(&tmp_path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    let file = writer.into_inner()?;
    file.sync_all()?;
    drop(file);

    let sha256 = sha256_file(&tmp_path)?;
    let byte_len = std::fs::metadata(&tmp_path)?.len();
    std::fs::rename(&tmp_path, &final_path)?;
    sync_dir(dir)?;

    Ok(ShardEntry {
        shard_id,
        file: file_name,
        record_count: records.len(),
        byte_len,
        sha256,
        min_id,
        max_id,
    })
}

fn id_range(records: &[CanonicalRecord]) -> Option<(String, String)> {
    let min = records.iter().map(|r| r.id.as_str()).min_by(|a, b| compare_ids(a, b))?;
    let max = records.iter().map(|r| r.id.as_str()).max_by(|a, b| compare_ids(a, b))?;
    Some((min.to_string(), max.to_string()))
}

// =============================================================================
// Reading and verification
// =============================================================================

pub fn shard_path(dir: &Path, entry: &ShardEntry) -> PathBuf {
    dir.join(&entry.file)
}

/// Read every record of a shard in stored order.
pub fn read_shard(dir: &Path, entry: &ShardEntry) -> Result<Vec<CanonicalRecord>> {
    let file = File::open(shard_path(dir, entry))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut out = Vec::with_capacity(entry.record_count);
    for batch in reader {
        out.extend(batch_to_records(&batch?)?);
    }
    Ok(out)
}

/// Check presence, length and checksum of a sealed shard.
pub fn verify_shard(dir: &Path, entry: &ShardEntry) -> Result<()> {
    let path = shard_path(dir, entry);
    let integrity = |message: String| ArchiveError::Integrity { shard_id: entry.shard_id, message };

    let meta = match std::fs::metadata(&path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(integrity(format!("missing file {}", entry.file)));
        }
        Err(e) => return Err(e.into()),
    };
    if meta.len() != entry.byte_len {
        return Err(integrity(format!(
            "length {} does not match manifest {}",
            meta.len(),
            entry.byte_len
        )));
    }
    let actual = sha256_file(&path)?;
    if actual != entry.sha256 {
        return Err(integrity(format!("sha256 {actual} does not match manifest {}", entry.sha256)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<CanonicalRecord> {
        vec![
            CanonicalRecord::new("9").with_title("Nine").with_meta("journal", "J"),
            CanonicalRecord::new("10").with_abstract("Ten ünïcode ✓"),
        ]
    }

    #[test]
    fn test_seal_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let entry = seal_shard(dir.path(), 3, &sample()).unwrap();

        assert_eq!(entry.file, "shard-00000003.parquet");
        assert_eq!(entry.record_count, 2);
        assert_eq!(entry.min_id, "9");
        assert_eq!(entry.max_id, "10");
        assert!(!dir.path().join("shard-00000003.parquet.tmp").exists());

        assert_eq!(read_shard(dir.path(), &entry).unwrap(), sample());
        verify_shard(dir.path(), &entry).unwrap();
    }

    #[test]
    fn test_verify_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let entry = seal_shard(dir.path(), 0, &sample()).unwrap();
        let path = shard_path(dir.path(), &entry);

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            verify_shard(dir.path(), &entry),
            Err(ArchiveError::Integrity { shard_id: 0, .. })
        ));
    }

    #[test]
    fn test_empty_shard_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(seal_shard(dir.path(), 0, &[]).is_err());
    }
}
