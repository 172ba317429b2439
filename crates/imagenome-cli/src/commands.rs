//! CLI command definitions and routing.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use imagenome_classify::{ClassificationRunner, ClassifyOptions, HttpClassifier};
use imagenome_common::{Cancellation, Config, RunSummary};
use imagenome_db::{AnnotatedStore, Database, FilteredStore, StagingStore};
use imagenome_filter::{FilterEngine, RuleSet};
use imagenome_ingestion::{discover_units, ingest_units, ColumnarArchive, IngestReport};
use imagenome_ner::{annotator_from_config, AnnotateOptions, AnnotationRunner};
use serde::Serialize;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Imagenome: bulk PubMed pipeline for imaging-relevant literature.
#[derive(Parser)]
#[command(name = "imagenome", version, long_about = None)]
pub(crate) struct Cli {
    /// Config file (defaults to ./imagenome.toml when present).
    #[arg(long, short, env = "IMAGENOME_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Parse bulk MEDLINE units into the columnar archive.
    Ingest {
        /// Directory of `.xml.gz` / `.xml` units (overrides ingestion.input_dir).
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Classify archived records into the staging store.
    Classify,

    /// Annotate relevant staged records.
    Annotate,

    /// Evaluate a rule set and materialize the matching record ids.
    Filter {
        /// Rule set file, TOML or JSON (overrides filter.rules_path).
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Evaluate only; leave the stored output untouched.
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-checksum every archived shard.
    Verify {
        /// Retract units with bad shards so the next ingest rebuilds them.
        #[arg(long)]
        retract: bool,
    },

    /// Run every stage in order: ingest, classify, annotate, filter.
    Run {
        #[arg(long)]
        input: Option<PathBuf>,

        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Shared handles
// ---------------------------------------------------------------------------

struct Pipeline {
    config: Config,
    cancel: Cancellation,
}

impl Pipeline {
    fn new(config: Config) -> Self {
        let cancel = Cancellation::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing in-flight batches");
                on_signal.cancel();
            }
        });
        Self { config, cancel }
    }

    fn archive(&self) -> anyhow::Result<Arc<ColumnarArchive>> {
        let archive = ColumnarArchive::from_config(&self.config.archive)
            .with_context(|| format!("opening archive at {}", self.config.archive.root.display()))?;
        Ok(Arc::new(archive))
    }

    async fn database(&self) -> anyhow::Result<Arc<Database>> {
        let db = Database::open(&self.config.database.path)
            .await
            .with_context(|| format!("opening database {}", self.config.database.path.display()))?;
        Ok(Arc::new(db))
    }

    async fn ingest(&self, input: Option<PathBuf>) -> anyhow::Result<IngestReport> {
        let dir = input.unwrap_or_else(|| self.config.ingestion.input_dir.clone());
        let units = discover_units(&dir).with_context(|| format!("listing {}", dir.display()))?;
        info!(dir = %dir.display(), units = units.len(), "Starting ingestion");
        Ok(ingest_units(self.archive()?, units, self.config.ingestion.max_workers, &self.cancel).await)
    }

    async fn classify(&self, db: &Arc<Database>) -> anyhow::Result<RunSummary> {
        let classifier = Arc::new(HttpClassifier::from_config(&self.config.classifier)?);
        let options = ClassifyOptions::from_config(&self.config.classifier, &self.config.retry);
        let runner = ClassificationRunner::new(classifier, StagingStore::new(db.clone()), options);
        Ok(runner.run(self.archive()?, &self.cancel).await)
    }

    async fn annotate(&self, db: &Arc<Database>) -> anyhow::Result<RunSummary> {
        let annotator = annotator_from_config(&self.config.annotator)?;
        let options = AnnotateOptions::from_config(&self.config.annotator, &self.config.retry);
        let runner = AnnotationRunner::new(
            annotator,
            StagingStore::new(db.clone()),
            AnnotatedStore::new(db.clone()),
            options,
        );
        Ok(runner.run(self.archive()?, &self.cancel).await)
    }

    async fn filter(&self, db: &Arc<Database>, rules: Option<PathBuf>, dry_run: bool) -> anyhow::Result<RunSummary> {
        let path = rules.unwrap_or_else(|| self.config.filter.rules_path.clone());
        let rules = RuleSet::load(&path).with_context(|| format!("loading rule set {}", path.display()))?;
        let engine = FilterEngine::new(AnnotatedStore::new(db.clone()), FilteredStore::new(db.clone()));

        let started = std::time::Instant::now();
        let report = if dry_run {
            engine.evaluate(&rules).await?
        } else {
            engine.materialize(&rules).await?
        };
        let summary = report.to_summary(started.elapsed().as_millis() as u64);
        info!(rule_version = %report.rule_version, matched = report.record_ids.len(), dry_run, "Filter finished");
        Ok(summary)
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(summary: &RunSummary) -> ExitCode {
    if summary.aborted.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

pub(crate) async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = Config::load(cli.config.as_deref())?;
    let pipeline = Pipeline::new(config);

    match cli.command {
        Command::Ingest { input } => {
            let report = pipeline.ingest(input).await?;
            print_json(&report)?;
            Ok(exit_code(&report.summary))
        }
        Command::Classify => {
            let db = pipeline.database().await?;
            let summary = pipeline.classify(&db).await?;
            print_json(&summary)?;
            Ok(exit_code(&summary))
        }
        Command::Annotate => {
            let db = pipeline.database().await?;
            let summary = pipeline.annotate(&db).await?;
            print_json(&summary)?;
            Ok(exit_code(&summary))
        }
        Command::Filter { rules, dry_run } => {
            let db = pipeline.database().await?;
            let summary = pipeline.filter(&db, rules, dry_run).await?;
            print_json(&summary)?;
            Ok(exit_code(&summary))
        }
        Command::Verify { retract } => {
            let archive = pipeline.archive()?;
            let report = tokio::task::spawn_blocking({
                let archive = Arc::clone(&archive);
                move || archive.verify()
            })
            .await?;
            if retract {
                for unit in report.affected_units() {
                    archive.retract_unit(&unit, "shard failed verification")?;
                }
            }
            print_json(&report)?;
            Ok(if report.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Run { input, rules } => {
            let ingest = pipeline.ingest(input).await?;
            let mut summaries = vec![ingest.summary];
            let db = pipeline.database().await?;

            // Each stage reads what the previous one committed; stop at the
            // first aborted or cancelled stage.
            let halted = |s: &RunSummary| s.aborted.is_some() || s.cancelled;
            if !summaries.iter().any(halted) {
                summaries.push(pipeline.classify(&db).await?);
            }
            if !summaries.iter().any(halted) {
                summaries.push(pipeline.annotate(&db).await?);
            }
            if !summaries.iter().any(halted) {
                summaries.push(pipeline.filter(&db, rules, false).await?);
            }

            print_json(&summaries)?;
            Ok(if summaries.iter().any(|s| s.aborted.is_some()) { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
    }
}
