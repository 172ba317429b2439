//! Staging store: one classification result per record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use imagenome_common::{ClassificationResult, Label, ModelVersion};
use libsql::params;
use tracing::debug;

use crate::database::Database;
use crate::error::{DbError, Result};

/// A relevant staged record waiting for annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRecord {
    pub record_id: String,
    /// Model version of the classification that selected it.
    pub classification_version: ModelVersion,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub written: usize,
    /// Rows left alone because an equal-or-newer version was stored.
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelCounts {
    pub relevant: usize,
    pub irrelevant: usize,
}

/// Title and abstract.
const ANNOTATED_FIELDS: usize = 2;

fn parse_label(value: String) -> Result<Label> {
    Label::parse(&value).ok_or(DbError::InvalidValue { table: "staging", column: "label", value })
}

#[derive(Clone)]
pub struct StagingStore {
    db: Arc<Database>,
}

impl StagingStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Upsert a batch in one transaction. A row whose stored model version
    /// is equal or newer is not touched.
    pub async fn upsert_batch(&self, results: &[ClassificationResult]) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();
        if results.is_empty() {
            return Ok(stats);
        }

        let conn = self.db.conn().await;
        let tx = conn.transaction().await?;
        let now = Utc::now().to_rfc3339();

        for result in results {
            let mut rows = tx
                .query(
                    "SELECT model_version FROM staging WHERE record_id = ?1",
                    params![result.record_id.as_str()],
                )
                .await?;
            let existing = match rows.next().await? {
                Some(row) => Some(ModelVersion::new(row.get::<String>(0)?)),
                None => None,
            };
            drop(rows);

            if existing.is_some_and(|v| v >= result.model_version) {
                stats.unchanged += 1;
                continue;
            }

            tx.execute(
                "INSERT INTO staging (record_id, label, score, model_version, classified_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(record_id) DO UPDATE SET
                    label = excluded.label,
                    score = excluded.score,
                    model_version = excluded.model_version,
                    classified_at = excluded.classified_at",
                params![
                    result.record_id.as_str(),
                    result.label.as_str(),
                    result.score,
                    result.model_version.as_str(),
                    now.as_str()
                ],
            )
            .await?;
            stats.written += 1;
        }

        tx.commit().await?;
        debug!(written = stats.written, unchanged = stats.unchanged, "Staging batch committed");
        Ok(stats)
    }

    pub async fn get(&self, record_id: &str) -> Result<Option<ClassificationResult>> {
        let conn = self.db.conn().await;
        let mut rows = conn
            .query(
                "SELECT record_id, label, score, model_version FROM staging WHERE record_id = ?1",
                params![record_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(ClassificationResult {
                record_id: row.get::<String>(0)?,
                label: parse_label(row.get::<String>(1)?)?,
                score: row.get::<f64>(2)?,
                model_version: ModelVersion::new(row.get::<String>(3)?),
            })),
            None => Ok(None),
        }
    }

    /// Stored model versions for the given ids; ids never classified are absent.
    pub async fn versions_for(&self, record_ids: &[String]) -> Result<HashMap<String, ModelVersion>> {
        let conn = self.db.conn().await;
        let mut out = HashMap::with_capacity(record_ids.len());
        for id in record_ids {
            let mut rows = conn
                .query("SELECT model_version FROM staging WHERE record_id = ?1", params![id.as_str()])
                .await?;
            if let Some(row) = rows.next().await? {
                out.insert(id.clone(), ModelVersion::new(row.get::<String>(0)?));
            }
        }
        Ok(out)
    }

    /// Relevant records with no complete annotation by `annotator_version`
    /// derived from their current classification, in record-id order after
    /// `after`. A field counts as annotated when its stored annotator
    /// version is equal or newer, the same rule the annotated store applies
    /// when it leaves a row unchanged.
    pub async fn pending_annotation(
        &self,
        annotator_version: &ModelVersion,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StagedRecord>> {
        let conn = self.db.conn().await;
        let mut out = Vec::new();
        let mut cursor = after.unwrap_or("").to_string();

        while out.len() < limit {
            let mut rows = conn
                .query(
                    "SELECT s.record_id, s.model_version,
                            COALESCE(a.model_version, ''), COALESCE(a.classification_version, '')
                     FROM (SELECT record_id, model_version FROM staging
                           WHERE label = 'relevant' AND record_id > ?1
                           ORDER BY record_id
                           LIMIT ?2) s
                     LEFT JOIN annotations a ON a.record_id = s.record_id
                     ORDER BY s.record_id",
                    params![cursor.as_str(), limit as i64],
                )
                .await?;

            // (record, classification version, fields annotated)
            let mut page: Vec<(String, ModelVersion, usize)> = Vec::new();
            while let Some(row) = rows.next().await? {
                let record_id = row.get::<String>(0)?;
                let annotated = row.get::<String>(2)?;
                let complete = !annotated.is_empty()
                    && ModelVersion::new(annotated) >= *annotator_version
                    && ModelVersion::new(row.get::<String>(3)?) == ModelVersion::new(row.get::<String>(1)?);

                match page.last_mut() {
                    Some((last, _, n)) if *last == record_id => *n += usize::from(complete),
                    _ => page.push((record_id, ModelVersion::new(row.get::<String>(1)?), usize::from(complete))),
                }
            }
            drop(rows);

            let Some((last, _, _)) = page.last() else {
                break;
            };
            cursor = last.clone();
            out.extend(
                page.into_iter()
                    .filter(|(_, _, n)| *n < ANNOTATED_FIELDS)
                    .map(|(record_id, classification_version, _)| StagedRecord { record_id, classification_version }),
            );
        }

        out.truncate(limit);
        Ok(out)
    }

    pub async fn label_counts(&self) -> Result<LabelCounts> {
        let conn = self.db.conn().await;
        let mut rows = conn
            .query("SELECT label, COUNT(*) FROM staging GROUP BY label", params![])
            .await?;

        let mut counts = LabelCounts::default();
        while let Some(row) = rows.next().await? {
            let n = row.get::<i64>(1)? as usize;
            match parse_label(row.get::<String>(0)?)? {
                Label::Relevant => counts.relevant = n,
                Label::Irrelevant => counts.irrelevant = n,
            }
        }
        Ok(counts)
    }
}
