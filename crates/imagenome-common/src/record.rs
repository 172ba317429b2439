/// Core record types flowing between the pipeline stages.
/// The archive owns `CanonicalRecord`s; the relational stores own the
/// classification and annotation results keyed by record id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::version::ModelVersion;

// ---------------------------------------------------------------------------
// Canonical record
// ---------------------------------------------------------------------------

/// Normalised representation of one bibliographic item after parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    /// PubMed identifier; unique within the corpus.
    pub id: String,
    pub title: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// Auxiliary fields (journal, authors, MeSH terms, ...). Ordered so the
    /// serialised form is deterministic.
    pub metadata: BTreeMap<String, String>,
}

impl CanonicalRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            abstract_text: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_abstract(mut self, abstract_text: impl Into<String>) -> Self {
        self.abstract_text = abstract_text.into();
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Text of the given annotation field.
    pub fn field_text(&self, field: Field) -> &str {
        match field {
            Field::Title => &self.title,
            Field::Abstract => &self.abstract_text,
        }
    }

    /// Approximate in-memory footprint, used for shard size thresholds.
    pub fn approx_bytes(&self) -> usize {
        self.id.len()
            + self.title.len()
            + self.abstract_text.len()
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Relevant,
    Irrelevant,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Relevant   => "relevant",
            Label::Irrelevant => "irrelevant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relevant"   => Some(Label::Relevant),
            "irrelevant" => Some(Label::Irrelevant),
            _ => None,
        }
    }
}

/// One row of the staging store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub record_id: String,
    pub label: Label,
    /// Positive-class score in [0, 1].
    pub score: f64,
    pub model_version: ModelVersion,
}

impl ClassificationResult {
    /// Default assigned to records with no abstract text.
    pub fn empty_text(record_id: impl Into<String>, model_version: ModelVersion) -> Self {
        Self {
            record_id: record_id.into(),
            label: Label::Irrelevant,
            score: 0.0,
            model_version,
        }
    }
}

// ---------------------------------------------------------------------------
// Annotation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Title,
    Abstract,
}

impl Field {
    pub const ALL: [Field; 2] = [Field::Title, Field::Abstract];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Title    => "title",
            Field::Abstract => "abstract",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "title"    => Some(Field::Title),
            "abstract" => Some(Field::Abstract),
            _ => None,
        }
    }
}

/// Entity types recognised by the annotator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Radiopharmaceutical,
    Gene,
    Protein,
    CellLine,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [
        EntityType::Radiopharmaceutical,
        EntityType::Gene,
        EntityType::Protein,
        EntityType::CellLine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Radiopharmaceutical => "radiopharmaceutical",
            EntityType::Gene                => "gene",
            EntityType::Protein             => "protein",
            EntityType::CellLine            => "cell_line",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        EntityType::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// A tagged substring occurrence inside one field. Offsets are byte offsets,
/// half-open `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpan {
    pub start: usize,
    pub end: usize,
    pub entity_type: EntityType,
    pub text: String,
    pub confidence: f32,
}

impl EntitySpan {
    pub fn overlaps(&self, other: &EntitySpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Merged spans for one (record, field) annotation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationResult {
    pub record_id: String,
    pub field: Field,
    pub spans: Vec<EntitySpan>,
    pub model_version: ModelVersion,
    /// Version of the classification row this annotation was derived from.
    pub classification_version: ModelVersion,
}
