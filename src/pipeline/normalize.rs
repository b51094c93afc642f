//! # Transcript Normalization
//!
//! Speech-to-text providers routinely mishear the product name "Klarvia"
//! ("Claria", "Glarvia", ...). The normalizer rewrites those known variants
//! to the canonical spelling before the transcript reaches the reply engine,
//! so the conversation model always sees the brand it was tuned for.
//!
//! ## Guarantees:
//! - Case-insensitive, whole-word replacement only (no partial-word rewrites:
//!   "clariaX" is left alone)
//! - Idempotent: normalizing already-normalized text is a no-op
//! - Empty input is returned unchanged

/// Canonical spelling of the brand token.
pub const CANONICAL_BRAND: &str = "Klarvia";

/// Known misrecognitions, all lowercase. Compared against lowercased word
/// tokens, so matching is case-insensitive.
const BRAND_VARIANTS: &[&str] = &[
    "claria", "glaria", "glarvia", "clarvia", "clavia", "klaria", "klavia",
];

/// Rewrite known misheard brand-name variants to the canonical spelling.
///
/// Word boundaries are any non-alphanumeric, non-apostrophe character, so
/// trailing punctuation ("Claria?") does not defeat the match while embedded
/// occurrences ("periclaria") are never rewritten.
pub fn normalize_transcript(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(text.len());
    let mut word = String::new();

    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '\'' {
            word.push(ch);
        } else {
            flush_word(&mut out, &mut word);
            out.push(ch);
        }
    }
    flush_word(&mut out, &mut word);

    out
}

fn flush_word(out: &mut String, word: &mut String) {
    if word.is_empty() {
        return;
    }
    let lower = word.to_lowercase();
    if BRAND_VARIANTS.iter().any(|v| *v == lower) {
        out.push_str(CANONICAL_BRAND);
    } else {
        out.push_str(word);
    }
    word.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replaces_known_variants() {
        assert_eq!(normalize_transcript("hello claria"), "hello Klarvia");
        assert_eq!(normalize_transcript("glarvia is here"), "Klarvia is here");
        assert_eq!(
            normalize_transcript("I asked clavia and klaria"),
            "I asked Klarvia and Klarvia"
        );
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(normalize_transcript("Hello CLARIA"), "Hello Klarvia");
        assert_eq!(normalize_transcript("GlArViA"), "Klarvia");
    }

    #[test]
    fn test_word_boundaries_only() {
        // Partial-word occurrences must not be rewritten
        assert_eq!(normalize_transcript("clariax"), "clariax");
        assert_eq!(normalize_transcript("preclaria"), "preclaria");
        // But adjacent punctuation is a boundary
        assert_eq!(normalize_transcript("Is claria? yes."), "Is Klarvia? yes.");
        assert_eq!(normalize_transcript("claria,claria"), "Klarvia,Klarvia");
    }

    #[test]
    fn test_idempotent() {
        let inputs = [
            "hello claria how are you",
            "Klarvia already canonical",
            "no brand mentioned at all",
            "",
        ];
        for input in inputs {
            let once = normalize_transcript(input);
            let twice = normalize_transcript(&once);
            assert_eq!(once, twice, "normalize must be idempotent for {input:?}");
        }
    }

    #[test]
    fn test_empty_input_unchanged() {
        assert_eq!(normalize_transcript(""), "");
    }

    #[test]
    fn test_other_text_untouched() {
        let text = "The quick brown fox, 42 times!";
        assert_eq!(normalize_transcript(text), text);
    }

    #[test]
    fn test_variant_at_string_edges() {
        assert_eq!(normalize_transcript("claria"), "Klarvia");
        assert_eq!(normalize_transcript("klavia."), "Klarvia.");
        assert_eq!(normalize_transcript("say klavia"), "say Klarvia");
    }
}
