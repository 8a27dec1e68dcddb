//! Hostile runtime token-contract drift audit.
//!
//! The content-key manifest and the runtime contract must agree on the
//! canonical keys, compatibility aliases, deferred keys, and per-key token
//! sets. Every event-feed row must name a live key and carry exactly that
//! key's tokens.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TokenContract {
    pub canonical_keys: Vec<String>,
    /// Alias to canonical key.
    pub compatibility_aliases: BTreeMap<String, String>,
    pub deferred_keys: Vec<String>,
    pub tokens: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeedRow {
    pub key: String,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EventFeed {
    pub rows: Vec<FeedRow>,
}

fn set(values: &[String]) -> BTreeSet<&str> {
    values.iter().map(String::as_str).collect()
}

fn diff_sets(label: &str, manifest: &BTreeSet<&str>, contract: &BTreeSet<&str>, errors: &mut Vec<String>) {
    for key in manifest.difference(contract) {
        errors.push(format!("{label} '{key}' is in the content-key manifest but not the runtime contract"));
    }
    for key in contract.difference(manifest) {
        errors.push(format!("{label} '{key}' is in the runtime contract but not the content-key manifest"));
    }
}

/// Every mismatch between the three documents, in a stable order.
pub fn audit_contract_drift(manifest: &TokenContract, contract: &TokenContract, feed: &EventFeed) -> Vec<String> {
    let mut errors = Vec::new();

    diff_sets(
        "canonical key",
        &set(&manifest.canonical_keys),
        &set(&contract.canonical_keys),
        &mut errors,
    );
    diff_sets(
        "deferred key",
        &set(&manifest.deferred_keys),
        &set(&contract.deferred_keys),
        &mut errors,
    );

    let aliases: BTreeSet<&str> = manifest
        .compatibility_aliases
        .keys()
        .chain(contract.compatibility_aliases.keys())
        .map(String::as_str)
        .collect();
    for alias in aliases {
        let left = manifest.compatibility_aliases.get(alias);
        let right = contract.compatibility_aliases.get(alias);
        if left != right {
            errors.push(format!(
                "compatibility alias '{alias}' maps to {} in the manifest but {} in the runtime contract",
                describe(left),
                describe(right)
            ));
        }
    }

    let token_keys: BTreeSet<&str> = manifest
        .tokens
        .keys()
        .chain(contract.tokens.keys())
        .map(String::as_str)
        .collect();
    for key in token_keys {
        let left = manifest.tokens.get(key).map(|t| set(t)).unwrap_or_default();
        let right = contract.tokens.get(key).map(|t| set(t)).unwrap_or_default();
        if left != right {
            errors.push(format!(
                "token set for '{key}' differs: manifest {left:?}, runtime contract {right:?}"
            ));
        }
    }

    let canonical = set(&manifest.canonical_keys);
    let deferred = set(&manifest.deferred_keys);
    for (idx, row) in feed.rows.iter().enumerate() {
        let key = manifest
            .compatibility_aliases
            .get(&row.key)
            .map(String::as_str)
            .unwrap_or(row.key.as_str());
        if deferred.contains(key) {
            errors.push(format!("event feed row {idx} uses deferred key '{}'", row.key));
            continue;
        }
        if !canonical.contains(key) {
            errors.push(format!("event feed row {idx} uses unknown key '{}'", row.key));
            continue;
        }
        let expected = manifest.tokens.get(key).map(|t| set(t)).unwrap_or_default();
        let actual = set(&row.tokens);
        if expected != actual {
            errors.push(format!(
                "event feed row {idx} ('{}') tokens {actual:?} differ from canonical {expected:?}",
                row.key
            ));
        }
    }
    errors
}

fn describe(target: Option<&String>) -> String {
    target.map_or_else(|| "nothing".to_string(), |key| format!("'{key}'"))
}
