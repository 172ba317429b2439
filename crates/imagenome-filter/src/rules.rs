//! Declarative rule sets over entity-type presence.
//!
//! ```toml
//! version = "radiopharm-gene-v1"
//!
//! [rule]
//! op = "all"
//!
//! [[rule.of]]
//! op = "has"
//! entity_type = "radiopharmaceutical"
//!
//! [[rule.of]]
//! op = "any"
//! of = [{ op = "has", entity_type = "gene" }, { op = "has", entity_type = "protein" }]
//! ```

use std::path::Path;

use imagenome_common::{EntityType, Field};
use imagenome_db::EntityProfile;
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// At least one span of the type in any field.
    Has { entity_type: EntityType },
    /// At least one span of the type in the given field.
    HasIn { entity_type: EntityType, field: Field },
    /// At least `count` merged spans of the type across fields.
    AtLeast { entity_type: EntityType, count: usize },
    All { of: Vec<Predicate> },
    Any { of: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn has(entity_type: EntityType) -> Self {
        Predicate::Has { entity_type }
    }

    pub fn all(of: Vec<Predicate>) -> Self {
        Predicate::All { of }
    }

    pub fn any(of: Vec<Predicate>) -> Self {
        Predicate::Any { of }
    }

    pub fn not(predicate: Predicate) -> Self {
        Predicate::Not { predicate: Box::new(predicate) }
    }

    pub fn matches(&self, profile: &EntityProfile) -> bool {
        match self {
            Predicate::Has { entity_type } => profile.count(*entity_type, None) > 0,
            Predicate::HasIn { entity_type, field } => profile.count(*entity_type, Some(*field)) > 0,
            Predicate::AtLeast { entity_type, count } => profile.count(*entity_type, None) >= *count,
            Predicate::All { of } => of.iter().all(|p| p.matches(profile)),
            Predicate::Any { of } => of.iter().any(|p| p.matches(profile)),
            Predicate::Not { predicate } => !predicate.matches(profile),
        }
    }

    fn validate(&self, path: &str) -> Result<()> {
        match self {
            Predicate::Has { .. } | Predicate::HasIn { .. } => Ok(()),
            Predicate::AtLeast { count, .. } => {
                if *count == 0 {
                    return Err(FilterError::Invalid(format!("{path}: at_least.count must be at least 1")));
                }
                Ok(())
            }
            Predicate::All { of } | Predicate::Any { of } => {
                if of.is_empty() {
                    return Err(FilterError::Invalid(format!("{path}: empty all/any")));
                }
                for (i, p) in of.iter().enumerate() {
                    p.validate(&format!("{path}.of[{i}]"))?;
                }
                Ok(())
            }
            Predicate::Not { predicate } => predicate.validate(&format!("{path}.predicate")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Any change to the rule must come with a new version; materialized
    /// output is keyed by it.
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    pub rule: Predicate,
}

impl RuleSet {
    pub fn new(version: impl Into<String>, rule: Predicate) -> Self {
        Self { version: version.into(), description: None, rule }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(FilterError::Invalid("version must not be empty".into()));
        }
        self.rule.validate("rule")
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let rules: RuleSet = toml::from_str(content)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let rules: RuleSet = serde_json::from_str(content)?;
        rules.validate()?;
        Ok(rules)
    }

    /// Load a rule set; `.json` files are JSON, anything else is TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_toml_str(&content),
        }
    }

    pub fn matches(&self, profile: &EntityProfile) -> bool {
        self.rule.matches(profile)
    }
}
