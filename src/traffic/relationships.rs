//! Co-occurrence pairs over the six logged attributes.
//!
//! Every unordered pair of attributes is a relationship type named
//! `{a}_{b}` in declaration order, e.g. `ip_email` or `country_charset`.

use super::model::AttributeTuple;

pub const ATTRIBUTE_FIELDS: [&str; 6] = ["ip", "email", "user_agent", "username", "country", "charset"];

/// All 15 `(type, a, b)` triples.
pub fn relationship_pairs() -> impl Iterator<Item = (String, &'static str, &'static str)> {
    ATTRIBUTE_FIELDS.iter().enumerate().flat_map(|(i, a)| {
        ATTRIBUTE_FIELDS[i + 1..]
            .iter()
            .map(move |b| (format!("{}_{}", a, b), *a, *b))
    })
}

/// Relationship types whose two attributes are both present in `tuple`.
pub fn present_relationships(tuple: &AttributeTuple) -> Vec<String> {
    relationship_pairs()
        .filter(|(_, a, b)| !tuple.get(a).is_empty() && !tuple.get(b).is_empty())
        .map(|(name, _, _)| name)
        .collect()
}
