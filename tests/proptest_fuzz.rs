//! Property-based tests (fuzzing) for the firewall decision path.
//!
//! Uses proptest to generate random and malformed inputs and verify that
//! normalization is stable, aggregation obeys its laws, and no parser or
//! validator ever panics.
//!
//! Run with: `cargo test --test proptest_fuzz`

use proptest::prelude::*;
use serde_json::Value;

use firewall_engine::charset::{self, MIXED, OTHER};
use firewall_engine::filter::{fold, DimensionOutcome, DimensionResult};
use firewall_engine::import::parse_asn_drop;
use firewall_engine::normalize;
use firewall_engine::traffic::AttributeTuple;
use firewall_engine::{EntityKind, FilterRequest, Rule, RuleStatus, Verdict};

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn kind_strategy() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(EntityKind::ALL.to_vec())
}

fn outcome_strategy() -> impl Strategy<Value = DimensionOutcome> {
    prop_oneof![
        4 => Just(DimensionOutcome::Allowed),
        2 => Just(DimensionOutcome::Denied),
        1 => Just(DimensionOutcome::Whitelisted),
        1 => Just(DimensionOutcome::Error),
    ]
}

fn result_strategy() -> impl Strategy<Value = DimensionResult> {
    (kind_strategy(), "[a-z0-9.@]{1,20}", outcome_strategy(), any::<bool>()).prop_map(
        |(kind, value, outcome, cache_hit)| DimensionResult { kind, value, outcome, cache_hit },
    )
}

/// Email-ish strings, including gmail variants, case noise and malformed ones
fn email_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        ("[A-Za-z0-9.]{1,20}", prop::sample::select(vec!["gmail.com", "GMAIL.COM", "Gmail.co.uk", "yahoo.com", "Ex.ORG"]))
            .prop_map(|(local, domain)| format!("{}@{}", local, domain)),
        "[A-Za-z0-9.@]{0,30}",
    ]
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(4, 64, 10, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..10).prop_map(Value::Array),
            prop::collection::hash_map("[a-z_]{1,12}", inner, 0..10)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

// =============================================================================
// Normalization
// =============================================================================

proptest! {
    #[test]
    fn prop_email_normalization_idempotent(email in email_strategy()) {
        let once = normalize::email(&email);
        prop_assert_eq!(normalize::email(&once), once);
    }

    #[test]
    fn prop_gmail_dots_and_case_ignored(local in "[a-z]{1,6}(\\.[a-z]{1,6}){0,3}") {
        let upper = format!("{}@GMAIL.COM", local.to_uppercase());
        let plain = format!("{}@gmail.com", local.replace('.', ""));
        prop_assert_eq!(normalize::email(&upper), plain);
    }

    #[test]
    fn prop_ip_normalization_idempotent(raw in "[0-9a-fA-F:./ ]{0,45}") {
        let once = normalize::ip(&raw);
        prop_assert_eq!(normalize::ip(&once), once);
    }

    #[test]
    fn prop_asn_normalization_idempotent(n in any::<u32>(), prefix in prop::sample::select(vec!["", "AS", "as", "As ", " AS"])) {
        let once = normalize::asn(&format!("{}{}", prefix, n));
        let expected = format!("AS{}", n);
        prop_assert_eq!(once.as_deref(), Some(expected.as_str()));
        let twice = once.as_deref().and_then(normalize::asn);
        prop_assert_eq!(twice, once);
    }

    #[test]
    fn prop_rule_normalization_idempotent(addr in "[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}\\.[0-9]{1,3}(/[0-9]{1,2})?") {
        let once = Rule::ip(addr, RuleStatus::Denied).normalized();
        prop_assert_eq!(once.clone().normalized(), once);
    }
}

// =============================================================================
// Aggregation Laws
// =============================================================================

proptest! {
    /// Any whitelisted dimension decides, whatever arrived before it.
    #[test]
    fn prop_whitelist_short_circuits(results in prop::collection::vec(result_strategy(), 1..10)) {
        if let Some(first) = results.iter().find(|r| r.outcome == DimensionOutcome::Whitelisted) {
            prop_assert_eq!(fold(&results), Ok(Verdict::Whitelisted(first.kind)));
        }
    }

    /// Without a whitelist, one deny is enough.
    #[test]
    fn prop_deny_dominates_allow(results in prop::collection::vec(result_strategy(), 1..10)) {
        let whitelisted = results.iter().any(|r| r.outcome == DimensionOutcome::Whitelisted);
        let denied = results.iter().any(|r| r.outcome == DimensionOutcome::Denied);
        if !whitelisted && denied {
            prop_assert!(matches!(fold(&results), Ok(Verdict::Denied(_))));
        }
    }

    /// Allowed iff every dimension allowed.
    #[test]
    fn prop_allow_is_unanimous(results in prop::collection::vec(result_strategy(), 0..10)) {
        let all_allowed = results.iter().all(|r| r.outcome == DimensionOutcome::Allowed);
        prop_assert_eq!(fold(&results) == Ok(Verdict::Allowed), all_allowed);
    }

    /// The verdict does not depend on arrival order, except for which
    /// dimension names it.
    #[test]
    fn prop_status_is_order_independent(
        results in prop::collection::vec(result_strategy(), 1..10)
            .prop_shuffle()
    ) {
        let mut reversed = results.clone();
        reversed.reverse();
        let status = |r: &Result<Verdict, _>| r.as_ref().map(|v| v.status()).map_err(|_| ());
        prop_assert_eq!(status(&fold(&results)), status(&fold(&reversed)));
    }
}

// =============================================================================
// Charset Detection
// =============================================================================

proptest! {
    /// Every string gets a label drawn from its own code points or a
    /// fallback bucket.
    #[test]
    fn prop_charset_total(text in "\\PC{0,64}") {
        let label = charset::detect(&text);
        let own = text.chars().any(|c| charset::classify(c) == label);
        prop_assert!(own || label == MIXED || label == OTHER || (text.is_empty() && label == "ASCII"));
    }

    #[test]
    fn prop_single_script_text_names_its_script(c in any::<char>(), n in 1usize..20) {
        let text: String = std::iter::repeat(c).take(n).collect();
        prop_assert_eq!(charset::detect(&text), charset::classify(c));
    }
}

// =============================================================================
// Parser and Validator Fuzz
// =============================================================================

proptest! {
    /// Request deserialization and validation never panic
    #[test]
    fn fuzz_filter_request_from_arbitrary_json(json in arbitrary_json_strategy()) {
        if let Ok(request) = serde_json::from_value::<FilterRequest>(json) {
            let _ = request.validate();
            let _ = request.dimensions();
            let _ = request.attributes();
        }
    }

    /// Valid requests only produce normalized dimensions
    #[test]
    fn prop_dimensions_are_normalized(
        email in email_strategy(),
        country in "[a-zA-Z]{2}",
    ) {
        let request = FilterRequest::new().with_email(email).with_country(country);
        for (kind, value) in request.dimensions() {
            match kind {
                EntityKind::Email => prop_assert_eq!(normalize::email(&value), value),
                EntityKind::Country => prop_assert_eq!(value.to_ascii_uppercase(), value),
                _ => {}
            }
        }
    }

    /// Rule documents from arbitrary JSON fail cleanly
    #[test]
    fn fuzz_rule_from_document(kind in kind_strategy(), json in arbitrary_json_strategy()) {
        if let Ok(rule) = Rule::from_document(kind, json) {
            let _ = rule.validate();
        }
    }

    /// Feed parsing never panics and accounts for every non-blank line
    #[test]
    fn fuzz_asn_drop_feed(lines in prop::collection::vec(".{0,80}", 0..20)) {
        let body = lines.join("\n");
        let feed = parse_asn_drop(&body);
        let non_blank = body.lines().filter(|l| !l.trim().is_empty()).count();
        prop_assert_eq!(feed.rules.len() + feed.skipped, non_blank);
    }

    /// Relationship keys are deterministic and field-separated
    #[test]
    fn prop_attribute_digest_deterministic(a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
        let first = AttributeTuple { ip: a.clone(), email: b.clone(), ..AttributeTuple::default() };
        let same = AttributeTuple { ip: a.clone(), email: b.clone(), ..AttributeTuple::default() };
        prop_assert_eq!(first.digest(), same.digest());
        prop_assert_eq!(first.digest().len(), 64);

        let shifted = AttributeTuple { ip: format!("{}{}", a, b), ..AttributeTuple::default() };
        if !b.is_empty() {
            prop_assert_ne!(first.digest(), shifted.digest());
        }
    }
}
