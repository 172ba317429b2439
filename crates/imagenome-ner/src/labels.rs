//! Annotator label normalisation.
//!
//! Maps the raw labels emitted by the radiopharmaceutical and
//! JNLPBA-style biomedical taggers onto `EntityType`.

use std::collections::HashMap;
use std::sync::OnceLock;

use imagenome_common::EntityType;

static LABEL_MAP: OnceLock<HashMap<&'static str, EntityType>> = OnceLock::new();

fn get_label_map() -> &'static HashMap<&'static str, EntityType> {
    LABEL_MAP.get_or_init(|| {
        let mut m = HashMap::new();

        // Radiotracer model (short and long forms)
        m.insert("RADIOTRACER_S", EntityType::Radiopharmaceutical);
        m.insert("RADIOTRACER_L", EntityType::Radiopharmaceutical);
        m.insert("RADIOTRACER", EntityType::Radiopharmaceutical);
        m.insert("RADIOPHARMACEUTICAL", EntityType::Radiopharmaceutical);

        // JNLPBA / BioNLP labels
        m.insert("PROTEIN", EntityType::Protein);
        m.insert("DNA", EntityType::Gene);
        m.insert("RNA", EntityType::Gene);
        m.insert("GENE", EntityType::Gene);
        m.insert("GGP", EntityType::Gene);
        m.insert("CELL_LINE", EntityType::CellLine);

        m
    })
}

/// Normalise a raw annotator label. BIO prefixes are stripped and matching
/// is case-insensitive; `None` means the label is not one we keep.
pub fn normalize_label(label: &str) -> Option<EntityType> {
    let clean = label.trim();
    let clean = clean
        .strip_prefix("B-")
        .or_else(|| clean.strip_prefix("I-"))
        .unwrap_or(clean);

    if let Some(t) = EntityType::parse(clean) {
        return Some(t);
    }
    get_label_map().get(clean.to_ascii_uppercase().as_str()).copied()
}
