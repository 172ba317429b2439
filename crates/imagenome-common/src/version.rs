//! Model version ordering.
//!
//! Versions are compared component-wise on `.`/`-` separators: numeric
//! components compare as numbers, anything else lexically, and a numeric
//! component sorts before a non-numeric one.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelVersion(String);

impl ModelVersion {
    pub fn new(v: impl Into<String>) -> Self {
        Self(v.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split(['.', '-']).filter(|c| !c.is_empty())
    }

    /// True when `self` supersedes `other`.
    pub fn is_newer_than(&self, other: &ModelVersion) -> bool {
        self.cmp(other) == Ordering::Greater
    }
}

fn cmp_component(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

impl Ord for ModelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut a = self.components();
        let mut b = other.components();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return Ordering::Equal,
                (Some(_), None) => return Ordering::Greater,
                (None, Some(_)) => return Ordering::Less,
                (Some(x), Some(y)) => match cmp_component(x, y) {
                    Ordering::Equal => continue,
                    ord => return ord,
                },
            }
        }
    }
}

impl PartialOrd for ModelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ModelVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ModelVersion {}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ModelVersion {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_components_compare_as_numbers() {
        assert!(ModelVersion::new("1.10").is_newer_than(&ModelVersion::new("1.9")));
        assert!(ModelVersion::new("2").is_newer_than(&ModelVersion::new("1.9.9")));
    }

    #[test]
    fn test_equal_versions() {
        assert_eq!(ModelVersion::new("1.0"), ModelVersion::new("1.0"));
        assert!(!ModelVersion::new("1.0").is_newer_than(&ModelVersion::new("1.0")));
    }

    #[test]
    fn test_longer_version_wins_on_shared_prefix() {
        assert!(ModelVersion::new("1.0.1").is_newer_than(&ModelVersion::new("1.0")));
    }

    #[test]
    fn test_textual_components() {
        assert!(ModelVersion::new("tc-b").is_newer_than(&ModelVersion::new("tc-a")));
        assert!(ModelVersion::new("1.0-rc").is_newer_than(&ModelVersion::new("1.0-2")));
    }
}
