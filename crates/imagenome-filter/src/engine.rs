//! Rule evaluation over the annotated store.
//!
//! Evaluation is a read-only pass over entity profiles of records that are
//! still backed by a matching relevant classification. Materialization
//! replaces the stored output wholesale; output built from another
//! rule-set version is never patched, only rebuilt.

use std::time::Instant;

use imagenome_common::{RunSummary, Stage};
use imagenome_db::{AnnotatedStore, FilteredStore};
use serde::Serialize;
use tracing::{info, instrument};

use crate::error::{FilterError, Result};
use crate::rules::RuleSet;

const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Output of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterReport {
    pub rule_version: String,
    /// Records whose profiles were evaluated.
    pub evaluated: usize,
    pub record_ids: Vec<String>,
}

impl FilterReport {
    pub fn to_summary(&self, duration_ms: u64) -> RunSummary {
        let mut summary = RunSummary::new(Stage::Filter);
        summary.processed = self.record_ids.len();
        summary.skipped = self.evaluated - self.record_ids.len();
        summary.duration_ms = duration_ms;
        summary
    }
}

#[derive(Clone)]
pub struct FilterEngine {
    annotated: AnnotatedStore,
    filtered: FilteredStore,
    page_size: usize,
}

impl FilterEngine {
    pub fn new(annotated: AnnotatedStore, filtered: FilteredStore) -> Self {
        Self { annotated, filtered, page_size: DEFAULT_PAGE_SIZE }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Ids of records satisfying the rule set, in record-id order. No side
    /// effects.
    #[instrument(skip_all, fields(rule_version = %rules.version))]
    pub async fn evaluate(&self, rules: &RuleSet) -> Result<FilterReport> {
        rules.validate()?;
        let started = Instant::now();
        let mut report = FilterReport {
            rule_version: rules.version.clone(),
            evaluated: 0,
            record_ids: Vec::new(),
        };

        let mut cursor: Option<String> = None;
        loop {
            let page = self.annotated.profiles(cursor.as_deref(), self.page_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = Some(last.record_id.clone());
            report.evaluated += page.len();
            report
                .record_ids
                .extend(page.into_iter().filter(|p| rules.matches(p)).map(|p| p.record_id));
        }

        info!(
            evaluated = report.evaluated,
            matched = report.record_ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Rule set evaluated"
        );
        Ok(report)
    }

    /// Evaluate and atomically replace the stored output.
    pub async fn materialize(&self, rules: &RuleSet) -> Result<FilterReport> {
        let report = self.evaluate(rules).await?;
        self.filtered.replace(&rules.version, &report.record_ids).await?;
        Ok(report)
    }

    /// Stored output for this rule set; stale when it was built from any
    /// other version.
    pub async fn materialized(&self, rules: &RuleSet) -> Result<Vec<String>> {
        match self.filtered.load().await? {
            Some(m) if m.rule_version == rules.version => Ok(m.record_ids),
            other => Err(FilterError::Stale {
                stored: other.map(|m| m.rule_version),
                requested: rules.version.clone(),
            }),
        }
    }
}
