//! Imagenome relational stores.
//!
//! An embedded libSQL database holds the classification staging table, the
//! merged annotations and the materialized filter output.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use imagenome_db::{Database, StagingStore, AnnotatedStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Arc::new(Database::open("./data/imagenome.db").await?);
//!     let staging = StagingStore::new(db.clone());
//!     let annotated = AnnotatedStore::new(db);
//!     Ok(())
//! }
//! ```

pub mod annotations;
pub mod database;
pub mod error;
pub mod filtered;
pub mod schema;
pub mod staging;

pub use annotations::{AnnotatedStore, AnnotationWrite, EntityProfile};
pub use database::Database;
pub use error::{DbError, Result};
pub use filtered::{FilteredStore, Materialization};
pub use staging::{LabelCounts, StagedRecord, StagingStore, UpsertStats};
