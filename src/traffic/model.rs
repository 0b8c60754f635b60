//! Traffic log, relationship and rollup records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Final outcome recorded for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalResult {
    Allowed,
    Denied,
    Whitelisted,
    Timeout,
    Error,
}

impl FinalResult {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Whitelisted => "whitelisted",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FinalResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "denied" => Ok(Self::Denied),
            "whitelisted" => Ok(Self::Whitelisted),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown final result '{}'", other)),
        }
    }
}

/// Caller-supplied context stored alongside the decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    pub raw_user_agent: Option<String>,
}

/// The six attributes relationships are built over. Empty string = absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeTuple {
    pub ip: String,
    pub email: String,
    pub user_agent: String,
    pub username: String,
    pub country: String,
    pub charset: String,
}

impl AttributeTuple {
    /// Value for a relationship attribute name.
    #[must_use]
    pub fn get(&self, field: &str) -> &str {
        match field {
            "ip" => &self.ip,
            "email" => &self.email,
            "user_agent" => &self.user_agent,
            "username" => &self.username,
            "country" => &self.country,
            "charset" => &self.charset,
            _ => "",
        }
    }

    /// Hex SHA-256 over all six fields, used as a fixed-width unique key.
    #[must_use]
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for field in [&self.ip, &self.email, &self.user_agent, &self.username, &self.country, &self.charset] {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficLog {
    /// Store-assigned; `None` before insert.
    pub id: Option<i64>,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub attributes: AttributeTuple,
    pub asn: String,
    pub final_result: FinalResult,
    /// Per-dimension outcomes, `{"ip": "denied", ...}`.
    pub filter_results: Value,
    pub response_time_ms: u64,
    pub cache_hit: bool,
    pub metadata: RequestMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_type: String,
    pub attributes: AttributeTuple,
    pub frequency: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupType {
    Hourly,
    Daily,
    Minute,
}

impl RollupType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Minute => "minute",
        }
    }

    #[must_use]
    pub fn window(self) -> chrono::Duration {
        match self {
            Self::Hourly => chrono::Duration::hours(1),
            Self::Daily => chrono::Duration::days(1),
            Self::Minute => chrono::Duration::minutes(1),
        }
    }
}

impl fmt::Display for RollupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollupType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "minute" => Ok(Self::Minute),
            other => Err(format!("unknown aggregation type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopEntry {
    pub value: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopRelationship {
    pub relationship_type: String,
    pub attributes: AttributeTuple,
    pub frequency: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rollup {
    pub aggregation_date: DateTime<Utc>,
    pub aggregation_type: RollupType,
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub denied_requests: u64,
    pub whitelisted_requests: u64,
    pub timeout_requests: u64,
    pub error_requests: u64,
    pub avg_response_time_ms: f64,
    pub cache_hit_rate: f64,
    pub top_ips: Vec<TopEntry>,
    pub top_emails: Vec<TopEntry>,
    pub top_user_agents: Vec<TopEntry>,
    pub top_usernames: Vec<TopEntry>,
    pub top_countries: Vec<TopEntry>,
    pub top_charsets: Vec<TopEntry>,
    pub top_relationships: Vec<TopRelationship>,
    pub created_at: DateTime<Utc>,
}

/// One page of a list query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}
