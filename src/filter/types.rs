//! Decision request and response shapes.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::charset;
use crate::normalize;
use crate::rule::{EntityKind, RuleStatus};
use crate::traffic::model::{AttributeTuple, RequestMetadata};

/// Label used as the response `type` when no dimension triggered.
pub const NO_MATCH_LABEL: &str = "All";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("{0}")]
    Validation(String),
    #[error("request timed out")]
    DeadlineExceeded,
    #[error("backend error: {0}")]
    Backend(String),
}

impl FilterError {
    /// HTTP-equivalent status for the decision endpoint.
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::DeadlineExceeded => 504,
            Self::Backend(_) => 500,
        }
    }
}

/// Wire body of a failed decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl From<&FilterError> for ErrorResponse {
    fn from(e: &FilterError) -> Self {
        Self { error: e.to_string() }
    }
}

/// One decision request. Every attribute is optional; blank strings count
/// as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRequest {
    pub ip: Option<String>,
    pub email: Option<String>,
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub username: Option<String>,
    pub charset: Option<String>,
    pub asn: Option<String>,
    /// Free text whose script fills the charset dimension when `charset`
    /// is not given.
    pub content: Option<String>,
    pub metadata: RequestMetadata,
}

fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl FilterRequest {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    #[must_use]
    pub fn with_asn(mut self, asn: impl Into<String>) -> Self {
        self.asn = Some(asn.into());
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Reject malformed input before any lookup runs.
    pub fn validate(&self) -> Result<(), FilterError> {
        let fields = [
            &self.ip,
            &self.email,
            &self.user_agent,
            &self.country,
            &self.username,
            &self.charset,
            &self.asn,
            &self.content,
        ];
        if fields.iter().all(|f| present(f).is_none()) {
            return Err(FilterError::Validation("at least one attribute is required".into()));
        }

        if let Some(ip) = present(&self.ip) {
            ip.parse::<IpAddr>()
                .map_err(|_| FilterError::Validation(format!("invalid ip '{}'", ip)))?;
        }
        if let Some(country) = present(&self.country) {
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(FilterError::Validation(format!("invalid country code '{}'", country)));
            }
        }
        if let Some(asn) = present(&self.asn) {
            if normalize::asn(asn).is_none() {
                return Err(FilterError::Validation(format!("invalid ASN '{}'", asn)));
            }
        }
        let too_long = [(&self.email, 254, "email"), (&self.user_agent, 500, "user_agent"), (&self.username, 100, "username")]
            .into_iter()
            .find(|(v, max, _)| present(v).is_some_and(|s| s.len() > *max));
        if let Some((_, max, name)) = too_long {
            return Err(FilterError::Validation(format!("{} exceeds {} characters", name, max)));
        }
        Ok(())
    }

    fn charset_value(&self) -> Option<String> {
        present(&self.charset)
            .map(str::to_string)
            .or_else(|| present(&self.content).map(|text| charset::detect(text).to_string()))
    }

    /// Normalized `(kind, value)` pairs for every attribute present.
    #[must_use]
    pub fn dimensions(&self) -> Vec<(EntityKind, String)> {
        let mut dims = Vec::with_capacity(EntityKind::ALL.len());
        if let Some(ip) = present(&self.ip) {
            dims.push((EntityKind::Ip, normalize::ip(ip)));
        }
        if let Some(email) = present(&self.email) {
            dims.push((EntityKind::Email, normalize::email(email)));
        }
        if let Some(ua) = present(&self.user_agent) {
            dims.push((EntityKind::UserAgent, ua.to_string()));
        }
        if let Some(country) = present(&self.country) {
            dims.push((EntityKind::Country, normalize::country(country)));
        }
        if let Some(username) = present(&self.username) {
            dims.push((EntityKind::Username, username.to_string()));
        }
        if let Some(charset) = self.charset_value() {
            dims.push((EntityKind::Charset, charset));
        }
        if let Some(asn) = present(&self.asn).and_then(normalize::asn) {
            dims.push((EntityKind::Asn, asn));
        }
        dims
    }

    /// Normalized attribute snapshot for the traffic log.
    #[must_use]
    pub fn attributes(&self) -> AttributeTuple {
        AttributeTuple {
            ip: present(&self.ip).map(normalize::ip).unwrap_or_default(),
            email: present(&self.email).map(normalize::email).unwrap_or_default(),
            user_agent: present(&self.user_agent).unwrap_or_default().to_string(),
            username: present(&self.username).unwrap_or_default().to_string(),
            country: present(&self.country).map(normalize::country).unwrap_or_default(),
            charset: self.charset_value().unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn normalized_asn(&self) -> String {
        present(&self.asn).and_then(normalize::asn).unwrap_or_default()
    }
}

/// Result of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionOutcome {
    Allowed,
    Denied,
    Whitelisted,
    Error,
}

impl DimensionOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Whitelisted => "whitelisted",
            Self::Error => "error",
        }
    }
}

impl From<RuleStatus> for DimensionOutcome {
    fn from(status: RuleStatus) -> Self {
        match status {
            RuleStatus::Allowed => Self::Allowed,
            RuleStatus::Denied => Self::Denied,
            RuleStatus::Whitelisted => Self::Whitelisted,
        }
    }
}

impl fmt::Display for DimensionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DimensionResult {
    pub kind: EntityKind,
    pub value: String,
    pub outcome: DimensionOutcome,
    pub cache_hit: bool,
}

/// Aggregated decision, carrying the dimension that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(EntityKind),
    Whitelisted(EntityKind),
}

impl Verdict {
    #[must_use]
    pub const fn status(self) -> RuleStatus {
        match self {
            Self::Allowed => RuleStatus::Allowed,
            Self::Denied(_) => RuleStatus::Denied,
            Self::Whitelisted(_) => RuleStatus::Whitelisted,
        }
    }

    #[must_use]
    pub fn response(self) -> FilterResponse {
        let kind = match self {
            Self::Allowed => NO_MATCH_LABEL,
            Self::Denied(kind) | Self::Whitelisted(kind) => kind.label(),
        };
        FilterResponse { kind: kind.to_string(), status: self.status() }
    }
}

/// `{type, status}` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: RuleStatus,
}
