//! Spamhaus ASN-DROP import.
//!
//! The feed is JSON lines, one network per line, with a trailing metadata
//! record:
//!
//! ```text
//! {"asn":6939,"rir":"arin","domain":"he.net","cc":"US","asname":"HURRICANE"}
//! {"type":"metadata","timestamp":1700000000,"size":1234,"records":1}
//! ```
//!
//! Every network becomes a denied ASN rule with source `spamhaus`.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::rule::{AsnRule, Rule, RuleStatus};
use crate::storage::traits::StorageError;

pub const SPAMHAUS_SOURCE: &str = "spamhaus";

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("spamhaus.import_url is not configured")]
    NotConfigured,
    #[error("Feed request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Feed returned HTTP {0}")]
    Status(u16),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Deserialize)]
struct DropEntry {
    asn: Option<u64>,
    #[serde(default)]
    rir: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    cc: String,
    #[serde(default)]
    asname: String,
}

/// Rules parsed from a feed body plus the count of lines that were not
/// networks (metadata, blanks) or did not parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub rules: Vec<Rule>,
    pub skipped: usize,
}

/// Outcome of writing a batch of rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub rejected: usize,
    /// Rules stored whose event could not be queued; incremental sync picks
    /// them up.
    pub events_dropped: usize,
}

#[must_use]
pub fn parse_asn_drop(body: &str) -> ParsedFeed {
    let mut feed = ParsedFeed::default();
    for (line_no, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: DropEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "Skipping malformed ASN-DROP line");
                feed.skipped += 1;
                continue;
            }
        };
        let Some(asn) = entry.asn else {
            feed.skipped += 1;
            continue;
        };
        feed.rules.push(Rule::Asn(AsnRule {
            asn: format!("AS{}", asn),
            status: RuleStatus::Denied,
            rir: entry.rir,
            country: entry.cc,
            domain: entry.domain,
            name: entry.asname,
            source: SPAMHAUS_SOURCE.to_string(),
        }));
    }
    feed
}

pub struct AsnImporter {
    client: Client,
    url: Option<String>,
}

impl AsnImporter {
    pub fn new(url: Option<String>) -> Result<Self, ImportError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { client, url })
    }

    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// Download and parse the feed.
    pub async fn fetch(&self) -> Result<ParsedFeed, ImportError> {
        let url = self.url.as_deref().ok_or(ImportError::NotConfigured)?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ImportError::Status(response.status().as_u16()));
        }
        let body = response.text().await?;
        let feed = parse_asn_drop(&body);
        info!(url, networks = feed.rules.len(), skipped = feed.skipped, "Fetched ASN-DROP feed");
        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::EntityKind;

    const FEED: &str = r#"
{"asn":6939,"rir":"arin","domain":"he.net","cc":"US","asname":"HURRICANE"}
{"asn":64500,"rir":"ripencc","cc":"NL"}
not json
{"type":"metadata","timestamp":1700000000,"size":1234,"records":2}
"#;

    #[test]
    fn test_parse_feed() {
        let feed = parse_asn_drop(FEED);
        assert_eq!(feed.rules.len(), 2);
        assert_eq!(feed.skipped, 2);

        let rule = &feed.rules[0];
        assert_eq!(rule.kind(), EntityKind::Asn);
        assert_eq!(rule.natural_key(), "AS6939");
        assert_eq!(rule.status(), RuleStatus::Denied);
        let Rule::Asn(asn) = rule else { panic!("expected ASN rule") };
        assert_eq!(asn.source, SPAMHAUS_SOURCE);
        assert_eq!(asn.name, "HURRICANE");
        assert!(rule.validate().is_ok());
    }

    #[tokio::test]
    async fn test_fetch_without_url() {
        let importer = AsnImporter::new(None).unwrap();
        assert!(!importer.is_configured());
        assert!(matches!(importer.fetch().await, Err(ImportError::NotConfigured)));
    }
}
