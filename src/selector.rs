//! Label selector matching
//!
//! Evaluates Kubernetes `LabelSelector`s (matchLabels + matchExpressions)
//! locally against a label set, and renders them into the string form the
//! API server accepts for list calls.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// Check if a label set matches a selector.
///
/// An empty selector matches everything. An expression with an unknown
/// operator matches nothing.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    // Check matchLabels (all must match)
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }

    // Check matchExpressions (all must match)
    selector
        .match_expressions
        .iter()
        .flatten()
        .all(|req| requirement_matches(req, labels))
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&req.key).map(|s| s.as_str());
    let values = req.values.as_deref().unwrap_or_default();
    match req.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|want| want == v)),
        "NotIn" => value.is_none_or(|v| !values.iter().any(|want| want == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

/// Render a selector as an API list selector string (`a=b,c in (d,e),!f`)
pub fn to_selector_string(selector: &LabelSelector) -> String {
    let mut parts = Vec::new();

    for (key, value) in selector.match_labels.iter().flatten() {
        parts.push(format!("{key}={value}"));
    }

    for req in selector.match_expressions.iter().flatten() {
        let values = req.values.as_deref().unwrap_or_default().join(",");
        match req.operator.as_str() {
            "In" => parts.push(format!("{} in ({})", req.key, values)),
            "NotIn" => parts.push(format!("{} notin ({})", req.key, values)),
            "Exists" => parts.push(req.key.clone()),
            "DoesNotExist" => parts.push(format!("!{}", req.key)),
            _ => {}
        }
    }

    parts.join(",")
}
