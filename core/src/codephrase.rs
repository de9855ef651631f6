//! Code-phrase generation, validation, normalization, and hashing (C1).
//!
//! The word lists are process-wide immutable data loaded at first use,
//! memoized behind a `OnceLock` rather than kept as mutable global state.

use std::sync::OnceLock;

use rand::Rng;
use sha2::{Digest, Sha256};

/// Small embedded fallback word list, used when no richer externally-loaded
/// list has been supplied via [`generate_from`]. A future CLI/config layer
/// can inject a bigger word list without changing the pairing algorithm.
const FALLBACK_ADJECTIVES: &[&str] = &[
    "swift", "quiet", "amber", "bold", "calm", "dusty", "eager", "fuzzy", "gentle", "hollow",
    "icy", "jolly", "keen", "lively", "mellow", "nimble", "orange", "plain", "quick", "rustic",
    "silent", "tidy", "umber", "vivid", "warm", "young", "zesty", "bright", "cozy", "dapper",
];

const FALLBACK_NOUNS: &[&str] = &[
    "ocean", "forest", "river", "meadow", "canyon", "harbor", "desert", "glacier", "island",
    "valley", "prairie", "summit", "thicket", "lagoon", "orchard", "delta", "reef", "ridge",
    "marsh", "tundra", "cove", "grove", "plateau", "basin", "cliff", "dune", "fjord", "bayou",
    "hollow", "spire",
];

fn fallback_word_lists() -> &'static (Vec<&'static str>, Vec<&'static str>) {
    static LISTS: OnceLock<(Vec<&'static str>, Vec<&'static str>)> = OnceLock::new();
    LISTS.get_or_init(|| (FALLBACK_ADJECTIVES.to_vec(), FALLBACK_NOUNS.to_vec()))
}

/// Generates a canonical `<adjective>-<noun>` phrase from the embedded
/// fallback word lists using a cryptographically secure RNG.
pub fn generate() -> String {
    let (adjectives, nouns) = fallback_word_lists();
    generate_from(adjectives, nouns)
}

/// Same algorithm as [`generate`] but taking explicit word slices, so a
/// richer externally-loaded word list can be injected without changing the
/// pairing algorithm itself.
pub fn generate_from(adjectives: &[&str], nouns: &[&str]) -> String {
    let mut rng = rand::rng();
    let adjective = adjectives[rng.random_range(0..adjectives.len())];
    let noun = nouns[rng.random_range(0..nouns.len())];
    format!("{}-{}", adjective.to_lowercase(), noun.to_lowercase())
}

/// Trims outer whitespace and lowercases the phrase.
pub fn normalize(phrase: &str) -> String {
    phrase.trim().to_lowercase()
}

/// A phrase is valid iff normalization yields exactly two non-empty
/// segments joined by a single `-`.
pub fn validate(phrase: &str) -> bool {
    let normalized = normalize(phrase);
    if normalized.is_empty() {
        return false;
    }
    let segments: Vec<&str> = normalized.split('-').collect();
    segments.len() == 2 && segments.iter().all(|segment| !segment.is_empty())
}

/// Lowercase-hex SHA-256 of the canonical form of `phrase`.
pub fn hash(phrase: &str) -> String {
    let normalized = normalize(phrase);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_matches_adjective_noun_shape() {
        let phrase = generate();
        let re_shape: Vec<&str> = phrase.split('-').collect();
        assert_eq!(re_shape.len(), 2);
        assert!(phrase.chars().all(|c| c.is_ascii_lowercase() || c == '-'));
    }

    #[test]
    fn generate_is_always_valid() {
        for _ in 0..50 {
            assert!(validate(&generate()));
        }
    }

    #[test]
    fn hash_is_stable_and_normalization_invariant() {
        let a = hash("Swift-Ocean");
        let b = hash("  swift-ocean  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn validate_rejects_malformed_phrases() {
        assert!(!validate(""));
        assert!(!validate("onlyoneword"));
        assert!(!validate("-leading-dash"));
        assert!(!validate("trailing-dash-"));
        assert!(!validate("too-many-segments"));
    }

    #[test]
    fn generate_from_uses_supplied_lists_only() {
        let adjectives = ["alpha"];
        let nouns = ["beta"];
        let phrase = generate_from(&adjectives, &nouns);
        assert_eq!(phrase, "alpha-beta");
    }

    mod proptests {
        use super::super::hash;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn hash_is_invariant_to_surrounding_whitespace_and_case(
                adjective in "[a-zA-Z]{1,12}",
                noun in "[a-zA-Z]{1,12}",
                leading in " {0,4}",
                trailing in " {0,4}",
            ) {
                let canonical = format!("{}-{}", adjective.to_lowercase(), noun.to_lowercase());
                let decorated = format!("{leading}{adjective}-{noun}{trailing}");
                prop_assert_eq!(hash(&canonical), hash(&decorated));
                prop_assert_eq!(hash(&canonical).len(), 64);
            }
        }
    }
}
