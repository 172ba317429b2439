//! Span normalisation and merging for one annotation unit.
//!
//! Spans of the same entity type whose offsets overlap collapse into one
//! span covering their union and keeping the highest confidence. Spans of
//! different types are never merged, and spans that only touch
//! (`a.end == b.start`) stay separate.

use imagenome_common::{EntitySpan, EntityType};

use crate::annotator::RawSpan;
use crate::labels::normalize_label;

/// Raw spans discarded while building merged spans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub unknown_label: usize,
    pub invalid_offsets: usize,
}

impl MergeStats {
    pub fn dropped(&self) -> usize {
        self.unknown_label + self.invalid_offsets
    }

    pub fn add(&mut self, other: MergeStats) {
        self.unknown_label += other.unknown_label;
        self.invalid_offsets += other.invalid_offsets;
    }
}

fn valid_offsets(text: &str, start: usize, end: usize) -> bool {
    start < end && end <= text.len() && text.is_char_boundary(start) && text.is_char_boundary(end)
}

/// Normalise, validate and merge the raw spans for `text`. The result is
/// sorted by `(start, end, entity_type)` and each span's surface text is
/// sliced from `text`.
pub fn merge_spans(text: &str, raw: &[RawSpan]) -> (Vec<EntitySpan>, MergeStats) {
    let mut stats = MergeStats::default();
    let mut spans: Vec<(EntityType, usize, usize, f32)> = Vec::with_capacity(raw.len());

    for span in raw {
        let Some(entity_type) = normalize_label(&span.label) else {
            stats.unknown_label += 1;
            continue;
        };
        if !valid_offsets(text, span.start, span.end) {
            stats.invalid_offsets += 1;
            continue;
        }
        let confidence = if span.score.is_finite() { span.score.clamp(0.0, 1.0) } else { 0.0 };
        spans.push((entity_type, span.start, span.end, confidence));
    }

    // Group by type, then sweep each group in start order.
    spans.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut merged: Vec<(EntityType, usize, usize, f32)> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if last.0 == span.0 && span.1 < last.2 => {
                last.2 = last.2.max(span.2);
                last.3 = last.3.max(span.3);
            }
            _ => merged.push(span),
        }
    }

    let mut out: Vec<EntitySpan> = merged
        .into_iter()
        .map(|(entity_type, start, end, confidence)| EntitySpan {
            start,
            end,
            entity_type,
            text: text[start..end].to_string(),
            confidence,
        })
        .collect();
    out.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)).then(a.entity_type.cmp(&b.entity_type)));
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = "The BRCA1 gene product interacts with p53 in HeLa cells after 18F-FDG uptake.";

    #[test]
    fn test_overlapping_same_type_merges_to_union() {
        let text = "x".repeat(40);
        let raw = vec![RawSpan::new(10, 20, "GGP", 0.6), RawSpan::new(15, 25, "DNA", 0.9)];
        let (spans, stats) = merge_spans(&text, &raw);

        assert_eq!(stats, MergeStats::default());
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].end), (10, 25));
        assert_eq!(spans[0].entity_type, EntityType::Gene);
        assert_eq!(spans[0].confidence, 0.9);
        assert_eq!(spans[0].text.len(), 15);
    }

    #[test]
    fn test_different_types_stay_distinct() {
        let raw = vec![RawSpan::new(4, 9, "GGP", 0.8), RawSpan::new(4, 22, "PROTEIN", 0.7)];
        let (spans, _) = merge_spans(TEXT, &raw);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].text, "BRCA1");
        assert_eq!(spans[1].text, "BRCA1 gene product");
    }

    #[test]
    fn test_touching_spans_are_not_merged() {
        let raw = vec![RawSpan::new(0, 4, "GENE", 0.5), RawSpan::new(4, 9, "GENE", 0.5)];
        let (spans, _) = merge_spans(TEXT, &raw);
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_chain_of_overlaps_collapses() {
        let text = "y".repeat(50);
        let raw = vec![
            RawSpan::new(30, 40, "GENE", 0.2),
            RawSpan::new(0, 10, "GENE", 0.3),
            RawSpan::new(5, 32, "GENE", 0.4),
        ];
        let (spans, _) = merge_spans(&text, &raw);
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].end), (0, 40));
        assert_eq!(spans[0].confidence, 0.4);
    }

    #[test]
    fn test_invalid_and_unknown_spans_are_dropped() {
        let text = "naïve 18F-FDG";
        let raw = vec![
            RawSpan::new(3, 3, "GENE", 0.5),
            RawSpan::new(5, 100, "GENE", 0.5),
            // inside the two-byte 'ï'
            RawSpan::new(3, 5, "GENE", 0.5),
            RawSpan::new(0, 5, "CELL_TYPE", 0.5),
            RawSpan::new(7, 14, "RADIOTRACER_S", 0.8),
        ];
        let (spans, stats) = merge_spans(text, &raw);
        assert_eq!(stats, MergeStats { unknown_label: 1, invalid_offsets: 3 });
        assert_eq!(stats.dropped(), 4);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].text, "18F-FDG");
        assert_eq!(spans[0].entity_type, EntityType::Radiopharmaceutical);
    }

    #[test]
    fn test_empty_input() {
        let (spans, stats) = merge_spans("", &[]);
        assert!(spans.is_empty());
        assert_eq!(stats.dropped(), 0);
    }
}
