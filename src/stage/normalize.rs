//! Text normalization applied to message bodies and phrase lists alike.

use unicode_normalization::UnicodeNormalization;
use unicode_properties::{GeneralCategory, UnicodeGeneralCategory};

/// Lower-case, strip nonspacing marks (accents), collapse whitespace, trim.
///
/// Spacing and enclosing marks are kept; they carry meaning in scripts
/// such as Devanagari.
///
/// Total and idempotent; `None` normalizes to the empty string.
pub fn normalize(s: Option<&str>) -> String {
    let Some(s) = s else {
        return String::new();
    };

    let folded: String = s
        .to_lowercase()
        .nfd()
        .filter(|c| c.general_category() != GeneralCategory::NonspacingMark)
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}
