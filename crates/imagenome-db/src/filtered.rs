//! Materialized filter output and the rule-set version it was built from.

use std::sync::Arc;

use chrono::Utc;
use libsql::params;
use tracing::info;

use crate::database::Database;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialization {
    pub rule_version: String,
    pub record_ids: Vec<String>,
    pub materialized_at: String,
}

#[derive(Clone)]
pub struct FilteredStore {
    db: Arc<Database>,
}

impl FilteredStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Atomically replace the materialized ids and their rule-set version.
    pub async fn replace(&self, rule_version: &str, record_ids: &[String]) -> Result<()> {
        let conn = self.db.conn().await;
        let tx = conn.transaction().await?;

        tx.execute("DELETE FROM filtered_records", params![]).await?;
        for id in record_ids {
            tx.execute(
                "INSERT OR IGNORE INTO filtered_records (record_id) VALUES (?1)",
                params![id.as_str()],
            )
            .await?;
        }
        tx.execute(
            "INSERT INTO filter_state (id, rule_version, record_count, materialized_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                rule_version = excluded.rule_version,
                record_count = excluded.record_count,
                materialized_at = excluded.materialized_at",
            params![rule_version, record_ids.len() as i64, Utc::now().to_rfc3339()],
        )
        .await?;

        tx.commit().await?;
        info!(rule_version, records = record_ids.len(), "Filter output materialized");
        Ok(())
    }

    /// The current materialization, if any.
    pub async fn load(&self) -> Result<Option<Materialization>> {
        let conn = self.db.conn().await;
        let mut rows = conn
            .query("SELECT rule_version, materialized_at FROM filter_state WHERE id = 1", params![])
            .await?;
        let (rule_version, materialized_at) = match rows.next().await? {
            Some(row) => (row.get::<String>(0)?, row.get::<String>(1)?),
            None => return Ok(None),
        };
        drop(rows);

        let mut rows = conn
            .query("SELECT record_id FROM filtered_records ORDER BY record_id", params![])
            .await?;
        let mut record_ids = Vec::new();
        while let Some(row) = rows.next().await? {
            record_ids.push(row.get::<String>(0)?);
        }
        Ok(Some(Materialization { rule_version, record_ids, materialized_at }))
    }
}
