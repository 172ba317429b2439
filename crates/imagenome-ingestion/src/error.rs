//! Ingestion error types.

use thiserror::Error;

/// Why a single article (or the tail of a unit) was skipped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("XML error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("article has no PMID")]
    MissingId,

    #[error("unit ended inside an article")]
    Truncated,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ParseError {
    fn from(err: std::io::Error) -> Self {
        ParseError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("shard {shard_id} failed integrity check: {message}")]
    Integrity { shard_id: u64, message: String },

    #[error("manifest line {line} is corrupt: {message}")]
    ManifestCorrupt { line: usize, message: String },

    #[error("source unit already archived: {0}")]
    AlreadyIngested(String),
}

impl From<parquet::errors::ParquetError> for ArchiveError {
    fn from(err: parquet::errors::ParquetError) -> Self {
        ArchiveError::Parquet(err.to_string())
    }
}

impl From<arrow_schema::ArrowError> for ArchiveError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        ArchiveError::Arrow(err.to_string())
    }
}

impl From<ArchiveError> for imagenome_common::PipelineError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Integrity { shard_id, message } => {
                imagenome_common::PipelineError::ArchiveIntegrity { shard_id, message }
            }
            other => imagenome_common::PipelineError::Other(anyhow::Error::new(other)),
        }
    }
}
