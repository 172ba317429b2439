//! Table names and schema migrations.
//!
//! Migrations are applied in ascending order on open; each records itself
//! in `schema_migrations`.

pub const TABLE_STAGING: &str = "staging";
pub const TABLE_ANNOTATIONS: &str = "annotations";
pub const TABLE_ANNOTATION_SPANS: &str = "annotation_spans";
pub const TABLE_FILTERED_RECORDS: &str = "filtered_records";
pub const TABLE_FILTER_STATE: &str = "filter_state";

pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "staging, annotations and annotation_spans",
            sql: r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One classification per record; superseded by newer model versions.
CREATE TABLE IF NOT EXISTS staging (
    record_id      TEXT PRIMARY KEY,
    label          TEXT NOT NULL CHECK (label IN ('relevant', 'irrelevant')),
    score          REAL NOT NULL,
    model_version  TEXT NOT NULL,
    classified_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_staging_label ON staging(label, record_id);

-- One row per annotated field; only for relevant staging rows.
CREATE TABLE IF NOT EXISTS annotations (
    record_id               TEXT NOT NULL,
    field                   TEXT NOT NULL CHECK (field IN ('title', 'abstract')),
    model_version           TEXT NOT NULL,
    classification_version  TEXT NOT NULL,
    span_count              INTEGER NOT NULL,
    annotated_at            TEXT NOT NULL,
    PRIMARY KEY (record_id, field)
);

-- Merged spans, ordered by seq within (record_id, field).
CREATE TABLE IF NOT EXISTS annotation_spans (
    record_id     TEXT NOT NULL,
    field         TEXT NOT NULL,
    seq           INTEGER NOT NULL,
    start_offset  INTEGER NOT NULL,
    end_offset    INTEGER NOT NULL,
    entity_type   TEXT NOT NULL,
    surface       TEXT NOT NULL,
    confidence    REAL NOT NULL,
    PRIMARY KEY (record_id, field, seq)
);

CREATE INDEX IF NOT EXISTS idx_spans_type ON annotation_spans(entity_type, record_id);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "filter materialization",
            sql: r#"
CREATE TABLE IF NOT EXISTS filtered_records (
    record_id  TEXT PRIMARY KEY
);

-- Single row describing what filtered_records was computed from.
CREATE TABLE IF NOT EXISTS filter_state (
    id               INTEGER PRIMARY KEY CHECK (id = 1),
    rule_version     TEXT NOT NULL,
    record_count     INTEGER NOT NULL,
    materialized_at  TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
