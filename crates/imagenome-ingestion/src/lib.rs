//! imagenome-ingestion: MEDLINE bulk parsing and the columnar archive.
//!
//! Architecture:
//!   parser: streaming PubmedArticle parser (gzip or plain XML)
//!   archive: Parquet shards + append-only manifest
//!   ingest: concurrent unit → archive driver

pub mod archive;
pub mod error;
pub mod ingest;
pub mod parser;

pub use archive::{ColumnarArchive, ShardEntry, ShardLimits, UnitEntry, UnitWriter, VerifyReport};
pub use error::{ArchiveError, ParseError};
pub use ingest::{archive_unit, discover_units, ingest_units, IngestReport, UnitOutcome};
pub use parser::{parse_unit, unit_id, MedlineParser};
