//! imagenome-common: Shared types, errors, and configuration used across all Imagenome crates.

pub mod cancel;
pub mod config;
pub mod error;
pub mod record;
pub mod retry;
pub mod summary;
pub mod version;

// Re-export commonly used types
pub use cancel::Cancellation;
pub use config::Config;
pub use error::{CapabilityError, PipelineError};
pub use record::{
    AnnotationResult, CanonicalRecord, ClassificationResult, EntitySpan, EntityType, Field, Label,
};
pub use retry::RetryPolicy;
pub use summary::{FailedBatch, RunSummary, Stage};
pub use version::ModelVersion;
