use imagenome_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rule set parse error: {0}")]
    Parse(String),

    #[error("invalid rule set: {0}")]
    Invalid(String),

    #[error(transparent)]
    Db(#[from] DbError),

    /// The stored output was built from another rule-set version.
    #[error("materialized output is stale: stored {stored:?}, requested '{requested}'")]
    Stale { stored: Option<String>, requested: String },
}

impl From<toml::de::Error> for FilterError {
    fn from(e: toml::de::Error) -> Self {
        FilterError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for FilterError {
    fn from(e: serde_json::Error) -> Self {
        FilterError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FilterError>;
