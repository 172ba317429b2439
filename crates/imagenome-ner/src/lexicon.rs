//! Dictionary annotator backed by an Aho-Corasick automaton.
//!
//! Offline alternative to the HTTP tagger. Matching is leftmost-longest and
//! ASCII case-insensitive, and a match only counts when it is not embedded
//! in a longer alphanumeric token.
//!
//! Lexicon file format, one entry per line:
//!
//! ```text
//! # surface<TAB>label
//! 18F-FDG	RADIOTRACER_S
//! EGFR	GGP
//! HeLa	cell_line
//! ```

use std::path::Path;

use aho_corasick::{AhoCorasick, MatchKind};
use async_trait::async_trait;
use imagenome_common::{CapabilityError, EntityType, ModelVersion};
use tracing::info;

use crate::annotator::{Annotator, RawSpan};
use crate::error::{LexiconError, Result};
use crate::labels::normalize_label;

const LEXICON_CONFIDENCE: f32 = 0.95;

pub struct LexiconAnnotator {
    automaton: AhoCorasick,
    /// Pattern index -> entity type
    pattern_types: Vec<EntityType>,
    model_version: ModelVersion,
}

impl LexiconAnnotator {
    pub fn from_entries<S: AsRef<str>>(
        entries: impl IntoIterator<Item = (S, EntityType)>,
        model_version: ModelVersion,
    ) -> Result<Self> {
        let mut patterns: Vec<String> = Vec::new();
        let mut pattern_types = Vec::new();
        for (surface, entity_type) in entries {
            let surface = surface.as_ref().trim();
            if surface.is_empty() {
                continue;
            }
            patterns.push(surface.to_string());
            pattern_types.push(entity_type);
        }
        if patterns.is_empty() {
            return Err(LexiconError::Empty);
        }

        let automaton = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .ascii_case_insensitive(true)
            .build(&patterns)?;

        info!(patterns = patterns.len(), model_version = %model_version, "Lexicon annotator loaded");
        Ok(Self { automaton, pattern_types, model_version })
    }

    /// Parse a `surface<TAB>label` lexicon. Blank lines and `#` comments are
    /// ignored; an unknown label is an error.
    pub fn parse(content: &str, model_version: ModelVersion) -> Result<Self> {
        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.trim_start().starts_with('#') {
                continue;
            }
            let Some((surface, label)) = line.split_once('\t') else {
                return Err(LexiconError::Parse { line: line_no, message: "expected surface<TAB>label".into() });
            };
            let entity_type = normalize_label(label).ok_or_else(|| LexiconError::Parse {
                line: line_no,
                message: format!("unknown label '{}'", label.trim()),
            })?;
            entries.push((surface.to_string(), entity_type));
        }
        Self::from_entries(entries, model_version)
    }

    pub fn load(path: &Path, model_version: ModelVersion) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, model_version)
    }

    pub fn pattern_count(&self) -> usize {
        self.pattern_types.len()
    }

    /// Tag one text.
    pub fn extract(&self, text: &str) -> Vec<RawSpan> {
        self.automaton
            .find_iter(text)
            .filter(|m| on_word_boundary(text, m.start(), m.end()))
            .map(|m| {
                let entity_type = self.pattern_types[m.pattern().as_usize()];
                RawSpan::new(m.start(), m.end(), entity_type.as_str(), LEXICON_CONFIDENCE)
            })
            .collect()
    }
}

fn on_word_boundary(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
}

#[async_trait]
impl Annotator for LexiconAnnotator {
    async fn annotate(&self, texts: &[String]) -> std::result::Result<Vec<Vec<RawSpan>>, CapabilityError> {
        Ok(texts.iter().map(|t| self.extract(t)).collect())
    }

    fn model_version(&self) -> &ModelVersion {
        &self.model_version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEXICON: &str = "# test lexicon\n\
        18F-FDG\tRADIOTRACER_S\n\
        FDG\tRADIOTRACER_S\n\
        EGFR\tGGP\n\
        \n\
        HeLa\tcell_line\n";

    fn annotator() -> LexiconAnnotator {
        LexiconAnnotator::parse(LEXICON, ModelVersion::from("lexicon-1")).unwrap()
    }

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        assert_eq!(annotator().pattern_count(), 4);
    }

    #[test]
    fn test_longest_match_and_case_insensitive() {
        let spans = annotator().extract("Uptake of 18f-fdg in egfr-mutant HeLa cells.");
        let found: Vec<(&str, usize, usize)> = spans.iter().map(|s| (s.label.as_str(), s.start, s.end)).collect();
        assert_eq!(
            found,
            vec![("radiopharmaceutical", 10, 17), ("gene", 21, 25), ("cell_line", 33, 37)]
        );
    }

    #[test]
    fn test_word_boundaries_respected() {
        assert!(annotator().extract("EGFRvIII and pEGFR").is_empty());
    }

    #[test]
    fn test_unknown_label_rejected() {
        let err = LexiconAnnotator::parse("foo\tCELL_TYPE\n", ModelVersion::from("1")).err().unwrap();
        assert!(matches!(err, LexiconError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_missing_tab_rejected() {
        let err = LexiconAnnotator::parse("EGFR GGP\n", ModelVersion::from("1")).err().unwrap();
        assert!(matches!(err, LexiconError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_empty_lexicon_rejected() {
        assert!(matches!(
            LexiconAnnotator::parse("# nothing\n", ModelVersion::from("1")),
            Err(LexiconError::Empty)
        ));
    }
}
