//! imagenome-ner: Entity annotation of relevant records.
//!
//! Supports two annotator backends:
//! - HTTP tagger service returning raw labelled spans
//! - Aho-Corasick lexicon for offline runs
//!
//! Raw spans are normalised to `EntityType` and merged per field before
//! they reach the annotated store.

pub mod annotator;
pub mod error;
pub mod labels;
pub mod lexicon;
pub mod merge;
pub mod runner;

pub use annotator::{annotator_from_config, Annotator, HttpAnnotator, RawSpan};
pub use error::LexiconError;
pub use labels::normalize_label;
pub use lexicon::LexiconAnnotator;
pub use merge::{merge_spans, MergeStats};
pub use runner::{AnnotateOptions, AnnotationInput, AnnotationRunner, BatchReport};
