//! RediSearch index definitions.
//!
//! Every rule kind gets one index over its JSON documents:
//!
//! ```text
//! FT.CREATE idx:ip-addresses
//!   ON JSON
//!   PREFIX 1 fw:ip-addresses:
//!   SCHEMA
//!     $.address AS address TAG SEPARATOR \x1f CASESENSITIVE
//!     $.status AS status TAG SEPARATOR \x1f
//!     $.is_cidr AS is_cidr TAG SEPARATOR \x1f
//! ```
//!
//! TAG fields give exact, unanalyzed matching, which is what the decision
//! path needs for addresses and user-agent strings. The default tag
//! separator is `,`, which would split user agents such as
//! `Mozilla/5.0 (KHTML, like Gecko)` into several tags; every TAG field uses
//! the unit separator instead, which rule validation keeps out of keys.

use std::collections::BTreeMap;

use crate::rule::EntityKind;

/// Namespace for index documents inside the cluster KV.
pub const DOC_NAMESPACE: &str = "fw:";

/// Separator for every TAG field (ASCII unit separator).
pub const TAG_SEPARATOR: &str = "\u{1f}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchFieldType {
    Text,
    Numeric,
    Tag,
}

impl std::fmt::Display for SearchFieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchFieldType::Text => write!(f, "TEXT"),
            SearchFieldType::Numeric => write!(f, "NUMERIC"),
            SearchFieldType::Tag => write!(f, "TAG"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchField {
    pub name: String,
    pub field_type: SearchFieldType,
    pub case_sensitive: bool,
}

impl SearchField {
    fn to_schema_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("$.{}", self.name),
            "AS".to_string(),
            self.name.clone(),
            self.field_type.to_string(),
        ];
        if self.field_type == SearchFieldType::Tag {
            args.push("SEPARATOR".to_string());
            args.push(TAG_SEPARATOR.to_string());
            if self.case_sensitive {
                args.push("CASESENSITIVE".to_string());
            }
        }
        args
    }
}

/// Index over the documents of one rule kind.
#[derive(Debug, Clone)]
pub struct SearchIndex {
    /// Index name without the `idx:` prefix, e.g. `ip-addresses`.
    pub name: String,
    /// Key prefix of the documents it covers.
    pub prefix: String,
    pub fields: Vec<SearchField>,
}

impl SearchIndex {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self { name: name.into(), prefix: prefix.into(), fields: Vec::new() }
    }

    pub fn tag(mut self, name: impl Into<String>) -> Self {
        self.fields.push(SearchField { name: name.into(), field_type: SearchFieldType::Tag, case_sensitive: false });
        self
    }

    /// Exact-match tag that keeps the original case (user agents, usernames).
    pub fn tag_exact(mut self, name: impl Into<String>) -> Self {
        self.fields.push(SearchField { name: name.into(), field_type: SearchFieldType::Tag, case_sensitive: true });
        self
    }

    pub fn text(mut self, name: impl Into<String>) -> Self {
        self.fields.push(SearchField { name: name.into(), field_type: SearchFieldType::Text, case_sensitive: false });
        self
    }

    /// Definition for a rule kind's documents under `redis_prefix`.
    #[must_use]
    pub fn for_kind(kind: EntityKind, redis_prefix: &str) -> Self {
        let index = Self::new(
            kind.index_name(),
            format!("{}{}{}:", redis_prefix, DOC_NAMESPACE, kind.index_name()),
        )
        .tag_exact(kind.key_field())
        .tag("status");

        match kind {
            EntityKind::Ip => index.tag("is_cidr").tag("source"),
            EntityKind::Email | EntityKind::UserAgent | EntityKind::Username => index.tag("is_regex"),
            EntityKind::Country => index.text("name"),
            EntityKind::Asn => index.tag("rir").tag("country").tag("source").text("name"),
            EntityKind::Charset => index,
        }
    }

    /// Full index name as registered with RediSearch.
    #[must_use]
    pub fn index_id(&self, redis_prefix: &str) -> String {
        format!("{}idx:{}", redis_prefix, self.name)
    }

    /// Arguments following `FT.CREATE`.
    #[must_use]
    pub fn to_ft_create_args(&self, redis_prefix: &str) -> Vec<String> {
        let mut args = vec![
            self.index_id(redis_prefix),
            "ON".to_string(),
            "JSON".to_string(),
            "PREFIX".to_string(),
            "1".to_string(),
            self.prefix.clone(),
            "SCHEMA".to_string(),
        ];
        for field in &self.fields {
            args.extend(field.to_schema_args());
        }
        args
    }
}

/// Registry of the per-kind index definitions.
pub struct IndexManager {
    redis_prefix: String,
    indexes: BTreeMap<String, SearchIndex>,
}

impl IndexManager {
    /// All rule-kind indexes under `redis_prefix`.
    #[must_use]
    pub fn for_rules(redis_prefix: &str) -> Self {
        let indexes = EntityKind::ALL
            .iter()
            .map(|kind| (kind.index_name().to_string(), SearchIndex::for_kind(*kind, redis_prefix)))
            .collect();
        Self { redis_prefix: redis_prefix.to_string(), indexes }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SearchIndex> {
        self.indexes.get(name)
    }

    pub fn all(&self) -> impl Iterator<Item = &SearchIndex> {
        self.indexes.values()
    }

    #[must_use]
    pub fn index_id(&self, name: &str) -> String {
        format!("{}idx:{}", self.redis_prefix, name)
    }

    /// Redis key of a document.
    #[must_use]
    pub fn doc_key(&self, index: &str, id: &str) -> String {
        format!("{}{}{}:{}", self.redis_prefix, DOC_NAMESPACE, index, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_index_args() {
        let index = SearchIndex::for_kind(EntityKind::Ip, "");
        let args = index.to_ft_create_args("");
        assert_eq!(args[0], "idx:ip-addresses");
        assert_eq!(args[5], "fw:ip-addresses:");
        assert_eq!(args[6], "SCHEMA");

        let cmd = format!("FT.CREATE {}", args.join(" "));
        assert!(cmd.contains("ON JSON"));
        assert!(cmd.contains("$.address AS address TAG SEPARATOR \u{1f} CASESENSITIVE"));
        assert!(cmd.contains("$.status AS status TAG SEPARATOR \u{1f}"));
        assert!(cmd.contains("$.is_cidr AS is_cidr TAG SEPARATOR \u{1f}"));
    }

    #[test]
    fn test_every_tag_field_overrides_comma_separator() {
        for kind in EntityKind::ALL {
            let args = SearchIndex::for_kind(kind, "").to_ft_create_args("");
            let tags = args.iter().filter(|a| *a == "TAG").count();
            let separators: Vec<usize> = args
                .iter()
                .enumerate()
                .filter(|(_, a)| *a == "SEPARATOR")
                .map(|(i, _)| i)
                .collect();
            assert_eq!(separators.len(), tags, "{}", kind);
            for i in separators {
                assert_eq!(args[i - 1], "TAG");
                assert_eq!(args[i + 1], TAG_SEPARATOR);
            }
        }
    }

    #[test]
    fn test_user_agent_key_is_one_tag() {
        let args = SearchIndex::for_kind(EntityKind::UserAgent, "").to_ft_create_args("");
        let key = args.iter().position(|a| a == "$.user_agent").unwrap();
        assert_eq!(
            &args[key..key + 7],
            &["$.user_agent", "AS", "user_agent", "TAG", "SEPARATOR", TAG_SEPARATOR, "CASESENSITIVE"]
        );
    }

    #[test]
    fn test_prefix_applied() {
        let index = SearchIndex::for_kind(EntityKind::UserAgent, "prod:");
        let args = index.to_ft_create_args("prod:");
        assert_eq!(args[0], "prod:idx:user-agents");
        assert_eq!(args[5], "prod:fw:user-agents:");
        assert!(args.contains(&"$.user_agent".to_string()));
    }

    #[test]
    fn test_manager_covers_every_kind() {
        let manager = IndexManager::for_rules("");
        assert_eq!(manager.all().count(), EntityKind::ALL.len());
        assert!(manager.get("asns").is_some());
        assert_eq!(manager.doc_key("emails", "a@b.com"), "fw:emails:a@b.com");
        assert_eq!(manager.index_id("countries"), "idx:countries");
    }
}
