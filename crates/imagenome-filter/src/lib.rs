//! imagenome-filter: Declarative entity rules over annotated records.

pub mod engine;
pub mod error;
pub mod rules;

pub use engine::{FilterEngine, FilterReport};
pub use error::{FilterError, Result};
pub use rules::{Predicate, RuleSet};
