//! Annotated store: merged entity spans per (record, field).
//!
//! Writes re-check inside the transaction that the record's staging row is
//! relevant and matches the classification the annotation was derived from,
//! so an annotation can never outlive or precede its classification.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use imagenome_common::{AnnotationResult, EntitySpan, EntityType, Field, ModelVersion};
use libsql::params;
use tracing::{debug, info};

use crate::database::Database;
use crate::error::{DbError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnotationWrite {
    pub written: usize,
    /// Already stored at an equal-or-newer annotator version.
    pub unchanged: usize,
    /// Record ids whose staging row is missing, irrelevant or reclassified.
    pub rejected: Vec<String>,
}

/// Merged-span counts per field and entity type for one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityProfile {
    pub record_id: String,
    pub counts: BTreeMap<(Field, EntityType), usize>,
}

impl EntityProfile {
    pub fn new(record_id: impl Into<String>) -> Self {
        Self { record_id: record_id.into(), counts: BTreeMap::new() }
    }

    pub fn count(&self, entity_type: EntityType, field: Option<Field>) -> usize {
        self.counts
            .iter()
            .filter(|((f, t), _)| *t == entity_type && field.map_or(true, |want| *f == want))
            .map(|(_, n)| *n)
            .sum()
    }
}

fn parse_field(value: String) -> Result<Field> {
    Field::parse(&value).ok_or(DbError::InvalidValue { table: "annotations", column: "field", value })
}

fn parse_entity_type(value: String) -> Result<EntityType> {
    EntityType::parse(&value).ok_or(DbError::InvalidValue {
        table: "annotation_spans",
        column: "entity_type",
        value,
    })
}

#[derive(Clone)]
pub struct AnnotatedStore {
    db: Arc<Database>,
}

impl AnnotatedStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Write a batch of annotation results in one transaction.
    pub async fn upsert_batch(&self, results: &[AnnotationResult]) -> Result<AnnotationWrite> {
        let mut outcome = AnnotationWrite::default();
        if results.is_empty() {
            return Ok(outcome);
        }

        let conn = self.db.conn().await;
        let tx = conn.transaction().await?;
        let now = Utc::now().to_rfc3339();

        for result in results {
            let record_id = result.record_id.as_str();
            let field = result.field.as_str();

            // Dependency check against the staging row.
            let mut rows = tx
                .query(
                    "SELECT model_version FROM staging WHERE record_id = ?1 AND label = 'relevant'",
                    params![record_id],
                )
                .await?;
            let staged = match rows.next().await? {
                Some(row) => Some(ModelVersion::new(row.get::<String>(0)?)),
                None => None,
            };
            drop(rows);
            if staged.as_ref() != Some(&result.classification_version) {
                if !outcome.rejected.iter().any(|id| id == record_id) {
                    outcome.rejected.push(result.record_id.clone());
                }
                continue;
            }

            let mut rows = tx
                .query(
                    "SELECT model_version, classification_version FROM annotations
                     WHERE record_id = ?1 AND field = ?2",
                    params![record_id, field],
                )
                .await?;
            let existing = match rows.next().await? {
                Some(row) => Some((
                    ModelVersion::new(row.get::<String>(0)?),
                    ModelVersion::new(row.get::<String>(1)?),
                )),
                None => None,
            };
            drop(rows);
            if let Some((model, classification)) = existing {
                if model >= result.model_version && classification == result.classification_version {
                    outcome.unchanged += 1;
                    continue;
                }
            }

            tx.execute(
                "DELETE FROM annotation_spans WHERE record_id = ?1 AND field = ?2",
                params![record_id, field],
            )
            .await?;
            tx.execute(
                "INSERT INTO annotations
                    (record_id, field, model_version, classification_version, span_count, annotated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(record_id, field) DO UPDATE SET
                    model_version = excluded.model_version,
                    classification_version = excluded.classification_version,
                    span_count = excluded.span_count,
                    annotated_at = excluded.annotated_at",
                params![
                    record_id,
                    field,
                    result.model_version.as_str(),
                    result.classification_version.as_str(),
                    result.spans.len() as i64,
                    now.as_str()
                ],
            )
            .await?;
            for (seq, span) in result.spans.iter().enumerate() {
                tx.execute(
                    "INSERT INTO annotation_spans
                        (record_id, field, seq, start_offset, end_offset, entity_type, surface, confidence)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        record_id,
                        field,
                        seq as i64,
                        span.start as i64,
                        span.end as i64,
                        span.entity_type.as_str(),
                        span.text.as_str(),
                        span.confidence as f64
                    ],
                )
                .await?;
            }
            outcome.written += 1;
        }

        tx.commit().await?;
        debug!(
            written = outcome.written,
            unchanged = outcome.unchanged,
            rejected = outcome.rejected.len(),
            "Annotation batch committed"
        );
        Ok(outcome)
    }

    /// Stored annotations for a record, title first.
    pub async fn get(&self, record_id: &str) -> Result<Vec<AnnotationResult>> {
        let conn = self.db.conn().await;
        let mut rows = conn
            .query(
                "SELECT field, model_version, classification_version FROM annotations
                 WHERE record_id = ?1",
                params![record_id],
            )
            .await?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            results.push(AnnotationResult {
                record_id: record_id.to_string(),
                field: parse_field(row.get::<String>(0)?)?,
                spans: Vec::new(),
                model_version: ModelVersion::new(row.get::<String>(1)?),
                classification_version: ModelVersion::new(row.get::<String>(2)?),
            });
        }
        drop(rows);
        results.sort_by_key(|r| r.field);

        for result in &mut results {
            let mut rows = conn
                .query(
                    "SELECT start_offset, end_offset, entity_type, surface, confidence
                     FROM annotation_spans WHERE record_id = ?1 AND field = ?2 ORDER BY seq",
                    params![record_id, result.field.as_str()],
                )
                .await?;
            while let Some(row) = rows.next().await? {
                result.spans.push(EntitySpan {
                    start: row.get::<i64>(0)? as usize,
                    end: row.get::<i64>(1)? as usize,
                    entity_type: parse_entity_type(row.get::<String>(2)?)?,
                    text: row.get::<String>(3)?,
                    confidence: row.get::<f64>(4)? as f32,
                });
            }
        }
        Ok(results)
    }

    /// Delete annotations whose staging row is gone, no longer relevant, or
    /// was reclassified by another model version. Returns rows removed.
    pub async fn invalidate_stale(&self) -> Result<u64> {
        let conn = self.db.conn().await;
        let tx = conn.transaction().await?;
        let removed = tx
            .execute(
                "DELETE FROM annotations WHERE NOT EXISTS (
                    SELECT 1 FROM staging s
                    WHERE s.record_id = annotations.record_id
                      AND s.label = 'relevant'
                      AND s.model_version = annotations.classification_version)",
                params![],
            )
            .await?;
        tx.execute(
            "DELETE FROM annotation_spans WHERE NOT EXISTS (
                SELECT 1 FROM annotations a
                WHERE a.record_id = annotation_spans.record_id AND a.field = annotation_spans.field)",
            params![],
        )
        .await?;
        tx.commit().await?;
        if removed > 0 {
            info!(removed, "Stale annotations invalidated");
        }
        Ok(removed)
    }

    /// Number of annotation rows whose staging row is not a matching
    /// relevant classification. Zero whenever the store is consistent.
    pub async fn orphan_count(&self) -> Result<usize> {
        let conn = self.db.conn().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM annotations a WHERE NOT EXISTS (
                    SELECT 1 FROM staging s
                    WHERE s.record_id = a.record_id
                      AND s.label = 'relevant'
                      AND s.model_version = a.classification_version)",
                params![],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(row.get::<i64>(0)? as usize),
            None => Ok(0),
        }
    }

    /// Entity profiles of annotated records that are still backed by a
    /// matching relevant classification, in record-id order after `after`.
    pub async fn profiles(&self, after: Option<&str>, limit: usize) -> Result<Vec<EntityProfile>> {
        let conn = self.db.conn().await;
        let mut rows = conn
            .query(
                "SELECT a.record_id, a.field, COALESCE(sp.entity_type, ''), COUNT(sp.seq)
                 FROM annotations a
                 JOIN staging s
                   ON s.record_id = a.record_id
                  AND s.label = 'relevant'
                  AND s.model_version = a.classification_version
                 LEFT JOIN annotation_spans sp
                   ON sp.record_id = a.record_id AND sp.field = a.field
                 WHERE a.record_id IN (
                    SELECT DISTINCT a2.record_id FROM annotations a2
                    JOIN staging s2
                      ON s2.record_id = a2.record_id
                     AND s2.label = 'relevant'
                     AND s2.model_version = a2.classification_version
                    WHERE a2.record_id > ?1
                    ORDER BY a2.record_id
                    LIMIT ?2)
                 GROUP BY a.record_id, a.field, sp.entity_type
                 ORDER BY a.record_id",
                params![after.unwrap_or(""), limit as i64],
            )
            .await?;

        let mut profiles: Vec<EntityProfile> = Vec::new();
        while let Some(row) = rows.next().await? {
            let record_id = row.get::<String>(0)?;
            if profiles.last().map(|p| p.record_id.as_str()) != Some(record_id.as_str()) {
                profiles.push(EntityProfile::new(record_id));
            }
            let entity_type = row.get::<String>(2)?;
            if entity_type.is_empty() {
                continue;
            }
            let field = parse_field(row.get::<String>(1)?)?;
            let entity_type = parse_entity_type(entity_type)?;
            let count = row.get::<i64>(3)? as usize;
            if let Some(profile) = profiles.last_mut() {
                profile.counts.insert((field, entity_type), count);
            }
        }
        Ok(profiles)
    }
}
