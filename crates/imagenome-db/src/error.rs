//! Database error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("libSQL error: {0}")]
    Sql(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    #[error("Invalid stored value in {table}.{column}: {value}")]
    InvalidValue {
        table: &'static str,
        column: &'static str,
        value: String,
    },
}

impl From<libsql::Error> for DbError {
    fn from(err: libsql::Error) -> Self {
        DbError::Sql(err.to_string())
    }
}
