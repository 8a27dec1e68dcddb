//! Work-item shape validation.
//!
//! Shape (required keys, enum values, list and integer types) is checked
//! against the embedded JSON Schema; placeholder tokens and duplicate ids
//! are checked here because the schema cannot express them.

use std::collections::HashSet;
use std::sync::LazyLock;

use jsonschema::Validator;
use regex::Regex;
use serde_json::Value;

use crate::core::types::ItemStatus;

const WORK_ITEM_SCHEMA: &str = include_str!("../../schemas/work_item.schema.json");

static WORK_ITEM_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(WORK_ITEM_SCHEMA).expect("embedded work item schema should parse");
    jsonschema::validator_for(&schema).expect("embedded work item schema should compile")
});

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[A-Za-z_][^<>]*>").expect("placeholder regex"));

/// True if `command` still carries an unresolved `<angle>` placeholder.
pub fn has_placeholder(command: &str) -> bool {
    PLACEHOLDER_RE.is_match(command)
}

/// Validate one raw work-item record, returning every problem found.
pub fn validate_item(value: &Value) -> Vec<String> {
    let label = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| "<missing id>".to_string());

    let mut errors: Vec<String> = WORK_ITEM_VALIDATOR
        .iter_errors(value)
        .map(|err| format!("{label}: {err}"))
        .collect();

    if let Some(commands) = value.get("validation_commands").and_then(Value::as_array) {
        for (idx, command) in commands.iter().enumerate() {
            if let Some(command) = command.as_str()
                && has_placeholder(command)
            {
                errors.push(format!(
                    "{label}: validation_commands[{idx}] contains unresolved placeholder: {command}"
                ));
            }
        }
    }
    errors
}

/// Validate a list of raw records: per-item checks plus duplicate ids.
pub fn validate_items(values: &[Value]) -> Vec<String> {
    let mut errors: Vec<String> = values.iter().flat_map(validate_item).collect();
    errors.extend(duplicate_ids(values));
    errors
}

fn duplicate_ids(values: &[Value]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .filter_map(|value| value.get("id").and_then(Value::as_str))
        .filter(|id| !seen.insert(*id))
        .map(|id| format!("duplicate id '{id}'"))
        .collect()
}

/// Validate a backlog collection.
///
/// The active list (`expected == None`) must hold unique ids. Archives
/// (`expected` set) may repeat an id; the healing pass folds those copies
/// with [`crate::core::queue::Queue::repair_archive_duplicates`].
pub fn validate_collection(name: &str, values: &[Value], expected: Option<ItemStatus>) -> Vec<String> {
    let per_item = if expected.is_none() {
        validate_items(values)
    } else {
        values.iter().flat_map(validate_item).collect()
    };
    let mut errors: Vec<String> = per_item.into_iter().map(|err| format!("{name}: {err}")).collect();
    if let Some(expected) = expected {
        for value in values {
            let status = value.get("status").and_then(Value::as_str).unwrap_or("");
            if status != expected.as_str() {
                let id = value.get("id").and_then(Value::as_str).unwrap_or("<missing id>");
                errors.push(format!(
                    "{name}: {id}: status '{status}' does not match collection status '{}'",
                    expected.as_str()
                ));
            }
        }
    }
    errors
}
