//! ID generation utilities.

use nanoid::nanoid;

/// Alphabet used for entity IDs and share tokens: URL-safe, unambiguous,
/// no padding characters.
const ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
    'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z',
];

/// Entity IDs are opaque 16-character strings (§3).
const ENTITY_ID_LEN: usize = 16;

/// Share tokens are URL-safe and at least 8 characters (§3); 24 gives a
/// comfortable collision margin while staying compact in URLs.
const SHARE_TOKEN_LEN: usize = 24;

/// ID generator for entities and share tokens.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new opaque 16-character entity ID (users, files, share
    /// links, audit events all use this).
    #[must_use]
    pub fn generate(&self) -> String {
        nanoid!(ENTITY_ID_LEN, &ALPHABET)
    }

    /// Generate a URL-safe share-link token.
    #[must_use]
    pub fn generate_token(&self) -> String {
        nanoid!(SHARE_TOKEN_LEN, &ALPHABET)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_16_char_ids() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), ENTITY_ID_LEN);
        assert_eq!(id2.len(), ENTITY_ID_LEN);
        assert_ne!(id1, id2);
    }

    #[test]
    fn generate_token_is_url_safe_and_long_enough() {
        let id_gen = IdGenerator::new();
        let token = id_gen.generate_token();

        assert!(token.len() >= 8);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn tokens_are_not_predictable_across_calls() {
        let id_gen = IdGenerator::new();
        let tokens: std::collections::HashSet<String> =
            (0..100).map(|_| id_gen.generate_token()).collect();
        assert_eq!(tokens.len(), 100);
    }
}
