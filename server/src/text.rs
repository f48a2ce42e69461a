//! Accent- and case-insensitive comparison for free-text answers

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Folds a string to a canonical comparison form: NFKD decomposition,
/// combining marks stripped, lowercased, surrounding whitespace removed.
///
/// "Éléphant" and "elephant" fold to the same form, as do "œuf" and "oeuf"
/// (NFKD handles the compatibility ligatures the quiz files use).
pub fn fold(s: &str) -> String {
    s.trim()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// True when two answers are equal under [`fold`]
pub fn answers_match(a: &str, b: &str) -> bool {
    fold(a) == fold(b)
}
