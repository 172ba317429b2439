//! imagenome-classify: Relevance classification of archived records.

pub mod classifier;
pub mod preprocess;
pub mod runner;

pub use classifier::{Classifier, HttpClassifier};
pub use preprocess::preprocess_text;
pub use runner::{BatchReport, ClassificationRunner, ClassifyOptions};
