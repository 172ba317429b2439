//! Configuration loading for Imagenome.
//! Reads imagenome.toml from the current directory or the path in the IMAGENOME_CONFIG env var.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::retry::RetryPolicy;

pub const CONFIG_ENV: &str = "IMAGENOME_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "imagenome.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub annotator: AnnotatorConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub filter: FilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_root")]
    pub root: PathBuf,
    #[serde(default = "default_shard_max_records")]
    pub shard_max_records: usize,
    #[serde(default = "default_shard_max_bytes")]
    pub shard_max_bytes: usize,
}

fn default_archive_root()      -> PathBuf { PathBuf::from("./data/archive") }
fn default_shard_max_records() -> usize   { 10_000 }
fn default_shard_max_bytes()   -> usize   { 64 * 1024 * 1024 }

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: default_archive_root(),
            shard_max_records: default_shard_max_records(),
            shard_max_bytes: default_shard_max_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_input_dir()   -> PathBuf { PathBuf::from("./data/baseline") }
fn default_max_workers() -> usize   { 4 }

impl Default for IngestionConfig {
    fn default() -> Self {
        Self { input_dir: default_input_dir(), max_workers: default_max_workers() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf { PathBuf::from("./data/imagenome.db") }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_classifier_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    /// Records scoring strictly above this are labelled relevant.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_classify_batch")]
    pub batch_size: usize,
    /// Abstracts shorter than this (after trimming) count as empty; the
    /// default keeps only abstracts longer than ten characters.
    #[serde(default = "default_min_abstract_chars")]
    pub min_abstract_chars: usize,
    #[serde(default = "default_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_classifier_endpoint() -> String { "http://localhost:8500/classify".to_string() }
fn default_model_version()       -> String { "1".to_string() }
fn default_threshold()           -> f64    { 0.5 }
fn default_classify_batch()      -> usize  { 64 }
fn default_min_abstract_chars()  -> usize  { 11 }
fn default_concurrent_batches()  -> usize  { 2 }
fn default_timeout_secs()        -> u64    { 60 }

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: default_classifier_endpoint(),
            model_version: default_model_version(),
            threshold: default_threshold(),
            batch_size: default_classify_batch(),
            min_abstract_chars: default_min_abstract_chars(),
            max_concurrent_batches: default_concurrent_batches(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotatorBackend {
    Http,
    Lexicon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatorConfig {
    #[serde(default = "default_annotator_backend")]
    pub backend: AnnotatorBackend,
    #[serde(default = "default_annotator_endpoint")]
    pub endpoint: String,
    /// TSV of `surface<TAB>entity_type` lines for the lexicon backend.
    pub lexicon_path: Option<PathBuf>,
    #[serde(default = "default_model_version")]
    pub model_version: String,
    #[serde(default = "default_annotate_batch")]
    pub batch_size: usize,
    #[serde(default = "default_concurrent_batches")]
    pub max_concurrent_batches: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_annotator_backend()  -> AnnotatorBackend { AnnotatorBackend::Http }
fn default_annotator_endpoint() -> String { "http://localhost:8500/annotate".to_string() }
fn default_annotate_batch()     -> usize  { 32 }

impl Default for AnnotatorConfig {
    fn default() -> Self {
        Self {
            backend: default_annotator_backend(),
            endpoint: default_annotator_endpoint(),
            lexicon_path: None,
            model_version: default_model_version(),
            batch_size: default_annotate_batch(),
            max_concurrent_batches: default_concurrent_batches(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,
}

fn default_rules_path() -> PathBuf { PathBuf::from("./rules.toml") }

impl Default for FilterConfig {
    fn default() -> Self {
        Self { rules_path: default_rules_path() }
    }
}

impl Config {
    /// Load configuration.
    /// An explicit path (argument or IMAGENOME_CONFIG) must exist; without
    /// one, ./imagenome.toml is used when present and defaults otherwise.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let explicit = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let path = match explicit {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p
            }
            None => {
                let p = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !p.exists() {
                    tracing::debug!("No {} found, using defaults", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                p
            }
        };

        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.archive.shard_max_records == 0 {
            anyhow::bail!("archive.shard_max_records must be at least 1");
        }
        if self.classifier.batch_size == 0 || self.annotator.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.classifier.threshold) {
            anyhow::bail!("classifier.threshold must be within [0, 1]");
        }
        if self.annotator.backend == AnnotatorBackend::Lexicon && self.annotator.lexicon_path.is_none() {
            anyhow::bail!("annotator.lexicon_path is required for the lexicon backend");
        }
        Ok(())
    }
}
