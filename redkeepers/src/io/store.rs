//! Durable document store: JSON/YAML documents and JSON-Lines logs.
//!
//! Documents are replaced atomically (temp file + rename) so a crash leaves
//! either the old or the new version. Reads tolerate a UTF-8 BOM.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

/// Read a UTF-8 file, stripping a leading BOM. `None` when the file is missing.
pub fn read_text(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(
            contents
                .strip_prefix('\u{feff}')
                .map(str::to_string)
                .unwrap_or(contents),
        )),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// Load a JSON document, returning `default` when the file does not exist.
pub fn load_document<T: DeserializeOwned>(path: &Path, default: T) -> Result<T> {
    let Some(contents) = read_text(path)? else {
        debug!(path = %path.display(), "document missing; using default");
        return Ok(default);
    };
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Load a raw JSON value. `None` when the file does not exist.
pub fn load_value(path: &Path) -> Result<Option<Value>> {
    let Some(contents) = read_text(path)? else {
        return Ok(None);
    };
    serde_json::from_str(&contents)
        .map(Some)
        .with_context(|| format!("parse {}", path.display()))
}

/// Parse YAML, falling back to JSON. Returns `Value::Null` for an empty document.
pub fn parse_yaml_or_json(contents: &str) -> Result<Value> {
    if contents.trim().is_empty() {
        return Ok(Value::Null);
    }
    match serde_yaml::from_str::<Value>(contents) {
        Ok(value) => Ok(value),
        Err(yaml_err) => serde_json::from_str(contents)
            .map_err(|json_err| anyhow!("not valid YAML ({yaml_err}) or JSON ({json_err})")),
    }
}

/// Load a policy-style document. Missing or empty files deserialize from an
/// empty object so every key takes its default. Returns the typed value and
/// the raw document.
pub fn load_yaml_or_json<T: DeserializeOwned>(path: &Path) -> Result<(T, Value)> {
    let raw = match read_text(path)? {
        Some(contents) => {
            parse_yaml_or_json(&contents).with_context(|| format!("parse {}", path.display()))?
        }
        None => Value::Null,
    };
    let raw = if raw.is_null() {
        Value::Object(Default::default())
    } else {
        raw
    };
    let typed = serde_json::from_value(raw.clone())
        .with_context(|| format!("interpret {}", path.display()))?;
    Ok((typed, raw))
}

/// Serialize with 2-space indentation and a trailing newline, then replace atomically.
pub fn save_document<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("document"));
    name.push(".tmp");
    path.with_file_name(name)
}

pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("document path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = temp_sibling(path);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp document {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace document {}", path.display()))?;
    Ok(())
}

/// Append one JSON-encoded line.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record)
        .with_context(|| format!("serialize record for {}", path.display()))?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// Read every complete record. Lines that fail to parse (a torn trailing
/// write) are skipped.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let Some(contents) = read_text(path)? else {
        return Ok(Vec::new());
    };
    let mut records = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(err) => warn!(path = %path.display(), line = idx + 1, err = %err, "skipping unreadable record"),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_document_yields_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded: Vec<String> = load_document(&temp.path().join("none.json"), vec!["x".to_string()]).expect("load");
        assert_eq!(loaded, vec!["x".to_string()]);
    }

    #[test]
    fn bom_is_tolerated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("doc.json");
        fs::write(&path, "\u{feff}{\"a\": 1}").expect("write");
        let loaded: Value = load_document(&path, Value::Null).expect("load");
        assert_eq!(loaded, json!({"a": 1}));
    }

    #[test]
    fn parse_error_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("doc.json");
        fs::write(&path, "{oops").expect("write");
        let err = load_document::<Value>(&path, Value::Null).unwrap_err();
        assert!(err.to_string().contains("parse"));
    }

    #[test]
    fn save_uses_two_space_indent_and_newline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("doc.json");
        save_document(&path, &json!({"a": [1]})).expect("save");
        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\n  \"a\": [\n    1\n  ]\n}\n");
        assert!(!temp_sibling(&path).exists());
    }

    #[test]
    fn yaml_with_json_fallback() {
        assert_eq!(
            parse_yaml_or_json("fallback_agent: lead-1\nowner_role_map:\n  qa: qa-1\n").expect("yaml"),
            json!({"fallback_agent": "lead-1", "owner_role_map": {"qa": "qa-1"}})
        );
        assert_eq!(parse_yaml_or_json("{\"a\": true}").expect("json"), json!({"a": true}));
        assert_eq!(parse_yaml_or_json("  \n").expect("empty"), Value::Null);
    }

    #[test]
    fn records_skip_torn_trailing_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("log.jsonl");
        append_record(&path, &json!({"n": 1})).expect("append");
        append_record(&path, &json!({"n": 2})).expect("append");
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{\"n\": 3").expect("torn write");

        let records: Vec<Value> = read_records(&path).expect("read");
        assert_eq!(records, vec![json!({"n": 1}), json!({"n": 2})]);
    }
}
