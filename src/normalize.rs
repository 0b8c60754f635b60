// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Canonical forms for request values and rule keys.
//!
//! Both the write path (rule keys) and the read path (request attributes)
//! run through the same functions, so an exact index lookup on the
//! normalized request value finds the normalized rule.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

/// Normalize an email address.
///
/// Gmail-family domains (`gmail.*`) have every `.` removed from the local
/// part. All well-formed addresses are lowercased. Addresses with zero or
/// multiple `@` pass through unchanged.
///
/// ```
/// use firewall_engine::normalize::email;
///
/// assert_eq!(email("T.E.S.T@GMAIL.COM"), "test@gmail.com");
/// assert_eq!(email("Test@Yahoo.com"), "test@yahoo.com");
/// assert_eq!(email("not-an-email"), "not-an-email");
/// ```
#[must_use]
pub fn email(raw: &str) -> String {
    let mut parts = raw.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return raw.to_string();
    };

    let local = local.to_lowercase();
    let domain = domain.to_lowercase();

    if domain.starts_with("gmail.") {
        format!("{}@{}", local.replace('.', ""), domain)
    } else {
        format!("{}@{}", local, domain)
    }
}

/// Uppercase alpha-2 country code.
#[must_use]
pub fn country(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Normalize an ASN to `AS<number>`. Accepts `13335`, `as13335`, `AS 13335`.
#[must_use]
pub fn asn(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let digits = match trimmed.get(..2) {
        Some(prefix) if prefix.eq_ignore_ascii_case("as") => trimmed[2..].trim_start(),
        _ => trimmed,
    };
    digits.parse::<u32>().ok().map(|n| format!("AS{}", n))
}

/// Canonical textual form of an address, or the trimmed input when it does
/// not parse (validation rejects it later).
#[must_use]
pub fn ip(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<IpAddr>() {
        Ok(addr) => addr.to_string(),
        Err(_) => match trimmed.parse::<IpNetwork>() {
            Ok(net) if trimmed.contains('/') => net.to_string(),
            _ => trimmed.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gmail_dots_removed() {
        assert_eq!(email("T.E.S.T@GMAIL.COM"), "test@gmail.com");
        assert_eq!(email("first.last@gmail.co.uk"), "firstlast@gmail.co.uk");
    }

    #[test]
    fn test_other_domains_lowercased_only() {
        assert_eq!(email("test@yahoo.com"), "test@yahoo.com");
        assert_eq!(email("First.Last@Example.ORG"), "first.last@example.org");
    }

    #[test]
    fn test_malformed_passthrough() {
        assert_eq!(email("NoAtSign"), "NoAtSign");
        assert_eq!(email("a@b@Gmail.com"), "a@b@Gmail.com");
    }

    #[test]
    fn test_email_idempotent() {
        for raw in ["T.E.S.T@GMAIL.COM", "x@y", "Foo.Bar@Outlook.com", "@", "a@@b"] {
            let once = email(raw);
            assert_eq!(email(&once), once);
        }
    }

    #[test]
    fn test_country() {
        assert_eq!(country(" de "), "DE");
    }

    #[test]
    fn test_asn() {
        assert_eq!(asn("13335").as_deref(), Some("AS13335"));
        assert_eq!(asn("as13335").as_deref(), Some("AS13335"));
        assert_eq!(asn("AS 0013335").as_deref(), Some("AS13335"));
        assert_eq!(asn("ASX"), None);
        assert_eq!(asn(""), None);
    }

    #[test]
    fn test_ip() {
        assert_eq!(ip(" 1.2.3.4 "), "1.2.3.4");
        assert_eq!(ip("2001:DB8::1"), "2001:db8::1");
        assert_eq!(ip("10.0.0.0/8"), "10.0.0.0/8");
        assert_eq!(ip("garbage"), "garbage");
    }
}
