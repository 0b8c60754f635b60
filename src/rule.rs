// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Rule data model.
//!
//! Every rule belongs to one [`EntityKind`], carries exactly one
//! [`RuleStatus`] and is identified by its natural key. The natural key is
//! also the document ID in the search index, so re-indexing the same rule
//! overwrites the previous document.
//!
//! # Example
//!
//! ```
//! use firewall_engine::{Rule, RuleStatus, EntityKind};
//!
//! let rule = Rule::email("T.E.S.T@GMAIL.COM", RuleStatus::Denied).normalized();
//! assert_eq!(rule.kind(), EntityKind::Email);
//! assert_eq!(rule.natural_key(), "test@gmail.com");
//!
//! let doc = rule.document();
//! assert_eq!(doc["status"], "denied");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::normalize;

/// The seven rule dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Ip,
    Email,
    UserAgent,
    Country,
    Charset,
    Username,
    Asn,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Ip,
        EntityKind::Email,
        EntityKind::UserAgent,
        EntityKind::Country,
        EntityKind::Charset,
        EntityKind::Username,
        EntityKind::Asn,
    ];

    /// Wire name, also the cache key prefix and watermark `data_type`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Email => "email",
            Self::UserAgent => "user_agent",
            Self::Country => "country",
            Self::Charset => "charset",
            Self::Username => "username",
            Self::Asn => "asn",
        }
    }

    /// Name of the search index holding this kind's documents.
    #[must_use]
    pub const fn index_name(self) -> &'static str {
        match self {
            Self::Ip => "ip-addresses",
            Self::Email => "emails",
            Self::UserAgent => "user-agents",
            Self::Country => "countries",
            Self::Charset => "charsets",
            Self::Username => "usernames",
            Self::Asn => "asns",
        }
    }

    /// Document field carrying the natural key.
    #[must_use]
    pub const fn key_field(self) -> &'static str {
        match self {
            Self::Ip | Self::Email => "address",
            Self::UserAgent => "user_agent",
            Self::Country => "code",
            Self::Charset => "charset",
            Self::Username => "username",
            Self::Asn => "asn",
        }
    }

    /// Authoritative store table.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Ip => "ip_addresses",
            Self::Email => "emails",
            Self::UserAgent => "user_agents",
            Self::Country => "countries",
            Self::Charset => "charsets",
            Self::Username => "usernames",
            Self::Asn => "asns",
        }
    }

    /// Label reported as the decision `type`.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Ip => "IP",
            Self::Email => "Email",
            Self::UserAgent => "UserAgent",
            Self::Country => "Country",
            Self::Charset => "Charset",
            Self::Username => "Username",
            Self::Asn => "ASN",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ip" => Ok(Self::Ip),
            "email" => Ok(Self::Email),
            "user_agent" => Ok(Self::UserAgent),
            "country" => Ok(Self::Country),
            "charset" => Ok(Self::Charset),
            "username" => Ok(Self::Username),
            "asn" => Ok(Self::Asn),
            other => Err(format!("unknown entity kind '{}'", other)),
        }
    }
}

/// Rule verdict. Absence from the index means `Allowed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Allowed,
    Denied,
    Whitelisted,
}

impl RuleStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Whitelisted => "whitelisted",
        }
    }
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "denied" => Ok(Self::Denied),
            "whitelisted" => Ok(Self::Whitelisted),
            other => Err(format!("unknown rule status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRule {
    pub address: String,
    pub status: RuleStatus,
    #[serde(default)]
    pub is_cidr: bool,
    #[serde(default)]
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRule {
    pub address: String,
    pub status: RuleStatus,
    #[serde(default)]
    pub is_regex: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgentRule {
    pub user_agent: String,
    pub status: RuleStatus,
    #[serde(default)]
    pub is_regex: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryRule {
    pub code: String,
    pub status: RuleStatus,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharsetRule {
    pub charset: String,
    pub status: RuleStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsernameRule {
    pub username: String,
    pub status: RuleStatus,
    #[serde(default)]
    pub is_regex: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsnRule {
    pub asn: String,
    pub status: RuleStatus,
    #[serde(default)]
    pub rir: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source: String,
}

/// A rule of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    Ip(IpRule),
    Email(EmailRule),
    UserAgent(UserAgentRule),
    Country(CountryRule),
    Charset(CharsetRule),
    Username(UsernameRule),
    Asn(AsnRule),
}

impl Rule {
    pub fn ip(address: impl Into<String>, status: RuleStatus) -> Self {
        let address = address.into();
        let is_cidr = address.contains('/');
        Self::Ip(IpRule { address, status, is_cidr, source: "manual".into() })
    }

    pub fn email(address: impl Into<String>, status: RuleStatus) -> Self {
        Self::Email(EmailRule { address: address.into(), status, is_regex: false })
    }

    pub fn user_agent(user_agent: impl Into<String>, status: RuleStatus) -> Self {
        Self::UserAgent(UserAgentRule { user_agent: user_agent.into(), status, is_regex: false })
    }

    pub fn country(code: impl Into<String>, status: RuleStatus) -> Self {
        Self::Country(CountryRule { code: code.into(), status, name: String::new() })
    }

    pub fn charset(charset: impl Into<String>, status: RuleStatus) -> Self {
        Self::Charset(CharsetRule { charset: charset.into(), status })
    }

    pub fn username(username: impl Into<String>, status: RuleStatus) -> Self {
        Self::Username(UsernameRule { username: username.into(), status, is_regex: false })
    }

    pub fn asn(asn: impl Into<String>, status: RuleStatus) -> Self {
        Self::Asn(AsnRule {
            asn: asn.into(),
            status,
            rir: String::new(),
            country: String::new(),
            domain: String::new(),
            name: String::new(),
            source: "manual".into(),
        })
    }

    /// Mark an email, user-agent or username rule as a regex pattern.
    #[must_use]
    pub fn as_regex(mut self) -> Self {
        match &mut self {
            Self::Email(r) => r.is_regex = true,
            Self::UserAgent(r) => r.is_regex = true,
            Self::Username(r) => r.is_regex = true,
            _ => {}
        }
        self
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Ip(_) => EntityKind::Ip,
            Self::Email(_) => EntityKind::Email,
            Self::UserAgent(_) => EntityKind::UserAgent,
            Self::Country(_) => EntityKind::Country,
            Self::Charset(_) => EntityKind::Charset,
            Self::Username(_) => EntityKind::Username,
            Self::Asn(_) => EntityKind::Asn,
        }
    }

    #[must_use]
    pub fn natural_key(&self) -> &str {
        match self {
            Self::Ip(r) => &r.address,
            Self::Email(r) => &r.address,
            Self::UserAgent(r) => &r.user_agent,
            Self::Country(r) => &r.code,
            Self::Charset(r) => &r.charset,
            Self::Username(r) => &r.username,
            Self::Asn(r) => &r.asn,
        }
    }

    #[must_use]
    pub fn status(&self) -> RuleStatus {
        match self {
            Self::Ip(r) => r.status,
            Self::Email(r) => r.status,
            Self::UserAgent(r) => r.status,
            Self::Country(r) => r.status,
            Self::Charset(r) => r.status,
            Self::Username(r) => r.status,
            Self::Asn(r) => r.status,
        }
    }

    /// CIDR blocks and regex rules cannot be answered by an exact term query.
    #[must_use]
    pub fn is_pattern(&self) -> bool {
        match self {
            Self::Ip(r) => r.is_cidr,
            Self::Email(r) => r.is_regex,
            Self::UserAgent(r) => r.is_regex,
            Self::Username(r) => r.is_regex,
            _ => false,
        }
    }

    /// Canonicalize the natural key so that lookups on normalized request
    /// values hit the same document.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        match &mut self {
            Self::Ip(r) => {
                let trimmed = r.address.trim();
                if let Ok(net) = trimmed.parse::<IpNetwork>() {
                    if trimmed.contains('/') {
                        r.is_cidr = true;
                        r.address = net.to_string();
                    } else {
                        r.address = net.ip().to_string();
                    }
                } else {
                    r.address = trimmed.to_string();
                }
            }
            Self::Email(r) if !r.is_regex => r.address = normalize::email(&r.address),
            Self::Country(r) => r.code = normalize::country(&r.code),
            Self::Asn(r) => {
                if let Some(asn) = normalize::asn(&r.asn) {
                    r.asn = asn;
                }
                r.country = normalize::country(&r.country);
            }
            _ => {}
        }
        self
    }

    /// Validate field bounds and pattern syntax before the rule is stored.
    pub fn validate(&self) -> Result<(), String> {
        let key = self.natural_key();
        if key.trim().is_empty() {
            return Err(format!("{} rule has an empty key", self.kind()));
        }
        if key.chars().any(char::is_control) {
            return Err(format!("{} rule key contains control characters", self.kind()));
        }
        match self {
            Self::Ip(r) => {
                if r.address.len() > 45 {
                    return Err("ip address exceeds 45 characters".into());
                }
                if r.is_cidr {
                    r.address
                        .parse::<IpNetwork>()
                        .map_err(|e| format!("invalid CIDR '{}': {}", r.address, e))?;
                } else {
                    r.address
                        .parse::<std::net::IpAddr>()
                        .map_err(|e| format!("invalid ip '{}': {}", r.address, e))?;
                }
            }
            Self::Email(r) => {
                if r.address.len() > 254 {
                    return Err("email exceeds 254 characters".into());
                }
                if r.is_regex {
                    validate_regex(&r.address)?;
                }
            }
            Self::UserAgent(r) => {
                if r.user_agent.len() > 500 {
                    return Err("user agent exceeds 500 characters".into());
                }
                if r.is_regex {
                    validate_regex(&r.user_agent)?;
                }
            }
            Self::Username(r) => {
                if r.username.len() > 100 {
                    return Err("username exceeds 100 characters".into());
                }
                if r.is_regex {
                    validate_regex(&r.username)?;
                }
            }
            Self::Country(r) => {
                if r.code.len() != 2 || !r.code.chars().all(|c| c.is_ascii_alphabetic()) {
                    return Err(format!("invalid country code '{}'", r.code));
                }
            }
            Self::Asn(r) => {
                if normalize::asn(&r.asn).is_none() {
                    return Err(format!("invalid ASN '{}'", r.asn));
                }
            }
            Self::Charset(_) => {}
        }
        Ok(())
    }

    /// Index document: natural key field, `status` and feature flags.
    #[must_use]
    pub fn document(&self) -> Value {
        let doc = match self {
            Self::Ip(r) => serde_json::to_value(r),
            Self::Email(r) => serde_json::to_value(r),
            Self::UserAgent(r) => serde_json::to_value(r),
            Self::Country(r) => serde_json::to_value(r),
            Self::Charset(r) => serde_json::to_value(r),
            Self::Username(r) => serde_json::to_value(r),
            Self::Asn(r) => serde_json::to_value(r),
        };
        // Plain structs of strings and bools always serialize
        doc.unwrap_or(Value::Null)
    }

    /// Rebuild a rule from an index document or stored attribute blob.
    pub fn from_document(kind: EntityKind, doc: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::Ip => Self::Ip(serde_json::from_value(doc)?),
            EntityKind::Email => Self::Email(serde_json::from_value(doc)?),
            EntityKind::UserAgent => Self::UserAgent(serde_json::from_value(doc)?),
            EntityKind::Country => Self::Country(serde_json::from_value(doc)?),
            EntityKind::Charset => Self::Charset(serde_json::from_value(doc)?),
            EntityKind::Username => Self::Username(serde_json::from_value(doc)?),
            EntityKind::Asn => Self::Asn(serde_json::from_value(doc)?),
        })
    }
}

fn validate_regex(pattern: &str) -> Result<(), String> {
    regex::Regex::new(pattern)
        .map(|_| ())
        .map_err(|e| format!("invalid regex '{}': {}", pattern, e))
}

/// A rule row as held by the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRule {
    pub rule: Rule,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        assert!("nope".parse::<EntityKind>().is_err());
    }

    #[test]
    fn test_index_names() {
        assert_eq!(EntityKind::Ip.index_name(), "ip-addresses");
        assert_eq!(EntityKind::UserAgent.index_name(), "user-agents");
        assert_eq!(EntityKind::Country.index_name(), "countries");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("denied".parse::<RuleStatus>().unwrap(), RuleStatus::Denied);
        assert_eq!(RuleStatus::Whitelisted.to_string(), "whitelisted");
        assert!("blocked".parse::<RuleStatus>().is_err());
    }

    #[test]
    fn test_control_characters_rejected_in_keys() {
        assert!(Rule::user_agent("Mozilla/5.0 (KHTML, like Gecko)", RuleStatus::Denied).validate().is_ok());
        assert!(Rule::user_agent("curl\u{1f}wget", RuleStatus::Denied).validate().is_err());
        assert!(Rule::username("eve\n", RuleStatus::Denied).validate().is_err());
    }

    #[test]
    fn test_ip_constructor_detects_cidr() {
        let rule = Rule::ip("10.0.0.0/8", RuleStatus::Denied);
        assert!(rule.is_pattern());
        let rule = Rule::ip("10.0.0.1", RuleStatus::Denied);
        assert!(!rule.is_pattern());
    }

    #[test]
    fn test_normalized_keys() {
        let r = Rule::country("de", RuleStatus::Denied).normalized();
        assert_eq!(r.natural_key(), "DE");

        let r = Rule::asn("as13335", RuleStatus::Denied).normalized();
        assert_eq!(r.natural_key(), "AS13335");

        let r = Rule::ip(" 10.1.2.3/8 ", RuleStatus::Denied).normalized();
        assert_eq!(r.natural_key(), "10.1.2.3/8");
        assert!(r.is_pattern());

        let r = Rule::email("^.*@spam\\.com$", RuleStatus::Denied).as_regex().normalized();
        assert_eq!(r.natural_key(), "^.*@spam\\.com$");
    }

    #[test]
    fn test_validate() {
        assert!(Rule::ip("1.2.3.4", RuleStatus::Denied).validate().is_ok());
        assert!(Rule::ip("1.2.3.999", RuleStatus::Denied).validate().is_err());
        assert!(Rule::ip("10.0.0.0/33", RuleStatus::Denied).validate().is_err());
        assert!(Rule::country("DEU", RuleStatus::Denied).validate().is_err());
        assert!(Rule::asn("ASX", RuleStatus::Denied).validate().is_err());
        assert!(Rule::user_agent("(", RuleStatus::Denied).as_regex().validate().is_err());
        assert!(Rule::username("", RuleStatus::Denied).validate().is_err());
        assert!(Rule::username("a".repeat(101), RuleStatus::Denied).validate().is_err());
    }

    #[test]
    fn test_document_round_trip() {
        let rule = Rule::ip("1.2.3.4", RuleStatus::Whitelisted);
        let doc = rule.document();
        assert_eq!(doc["address"], "1.2.3.4");
        assert_eq!(doc["status"], "whitelisted");
        assert_eq!(doc["is_cidr"], false);

        let back = Rule::from_document(EntityKind::Ip, doc).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_serde_tagged() {
        let rule = Rule::charset("Cyrillic", RuleStatus::Denied);
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["kind"], "charset");
        let back: Rule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }
}
