//! Identifier generation and short-id prefix lookup.
//!
//! Every row id is a v4 UUID in compact form (32 lowercase hex chars). The
//! user-facing "short id" is the first 8 characters; lookups accept any
//! prefix and must report ambiguity instead of guessing.

use uuid::Uuid;

pub const SHORT_ID_LEN: usize = 8;

/// Generate a new compact (32-hex) id.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// The user-facing short form of an id.
pub fn short_id(id: &str) -> &str {
    if id.len() > SHORT_ID_LEN {
        &id[..SHORT_ID_LEN]
    } else {
        id
    }
}

/// Whether `prefix` is usable for a prefix lookup: nonempty lowercase hex,
/// no longer than a full compact id.
pub fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix.len() <= 32
        && prefix
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Outcome of resolving an id prefix against a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdLookup {
    Unique(String),
    Ambiguous(Vec<String>),
    None,
}

impl IdLookup {
    /// Collapse a list of matching full ids into a lookup outcome.
    pub fn from_matches(mut matches: Vec<String>) -> Self {
        match matches.len() {
            0 => IdLookup::None,
            1 => IdLookup::Unique(matches.remove(0)),
            _ => {
                matches.sort();
                IdLookup::Ambiguous(matches)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_compact_hex() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(is_valid_prefix(&id));
    }

    #[test]
    fn short_id_is_first_eight() {
        assert_eq!(short_id("4b7c2d1affffffffffffffffffffffff"), "4b7c2d1a");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn prefix_validation() {
        assert!(is_valid_prefix("4b7c2d1a"));
        assert!(is_valid_prefix("4"));
        assert!(!is_valid_prefix(""));
        assert!(!is_valid_prefix("4B7C"));
        assert!(!is_valid_prefix("xyz"));
        assert!(!is_valid_prefix(&"a".repeat(33)));
    }

    #[test]
    fn lookup_collapse() {
        assert_eq!(IdLookup::from_matches(vec![]), IdLookup::None);
        assert_eq!(
            IdLookup::from_matches(vec!["a1".into()]),
            IdLookup::Unique("a1".into())
        );
        assert_eq!(
            IdLookup::from_matches(vec!["b2".into(), "a1".into()]),
            IdLookup::Ambiguous(vec!["a1".into(), "b2".into()])
        );
    }
}
