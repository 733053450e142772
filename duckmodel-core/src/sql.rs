//! SQL text helpers: identifier/literal quoting, derived object names and
//! file readers.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::config::PropertyMap;
use crate::error::{DriverError, Result};

const STAGING_PREFIX: &str = "__duckmodel_staging_";

/// Quote an identifier: `my "table"` becomes `"my ""table"""`.
pub fn safe_name(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal.
pub fn safe_sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn staging_table_name_for(table: &str) -> String {
    format!("{STAGING_PREFIX}{table}")
}

/// Unique name for a short-lived object derived from `base`.
pub fn temp_name(base: &str) -> String {
    format!("__{base}_{}", uuid::Uuid::new_v4().simple())
}

/// Strip a trailing semicolon so the statement can be nested in parentheses.
pub fn trim_statement(sql: &str) -> &str {
    let sql = sql.trim();
    sql.strip_suffix(';').unwrap_or(sql).trim_end()
}

/// Resolve `path` against the repository root. Paths escaping the root are
/// refused unless host access is allowed.
pub fn resolve_local_path(path: &str, repo_root: &Path, allow_host_access: bool) -> Result<PathBuf> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        repo_root.join(candidate)
    };
    let normalized = normalize(&joined);
    if !allow_host_access && !normalized.starts_with(normalize(repo_root)) {
        return Err(DriverError::Validation(format!(
            "file {path:?} is outside the repository root"
        )));
    }
    Ok(normalized)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Extension of a file including compound suffixes such as `csv.gz`.
pub fn full_extension(path: &str) -> String {
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    match name.split_once('.') {
        Some((_, ext)) => ext.to_lowercase(),
        None => String::new(),
    }
}

/// Table function reading `paths` in the given `format` (an extension such as
/// `csv` or `parquet.gz`). Options in `properties` override the defaults.
pub fn source_reader(paths: &[String], format: &str, properties: &PropertyMap) -> Result<String> {
    let format = format.trim_start_matches('.').to_lowercase();
    let mut defaults = PropertyMap::new();
    let function = if contains_any(&format, &["csv", "tsv", "txt"]) {
        defaults.insert("auto_detect".to_string(), Value::Bool(true));
        defaults.insert("sample_size".to_string(), Value::from(200_000));
        "read_csv_auto"
    } else if format.contains("parquet") {
        defaults.insert("hive_partitioning".to_string(), Value::Bool(true));
        defaults.insert("union_by_name".to_string(), Value::Bool(true));
        "read_parquet"
    } else if contains_any(&format, &["json", "ndjson"]) {
        defaults.insert("auto_detect".to_string(), Value::Bool(true));
        defaults.insert("sample_size".to_string(), Value::from(200_000));
        defaults.insert("format".to_string(), Value::String("auto".to_string()));
        "read_json"
    } else {
        return Err(DriverError::Validation(format!(
            "file type not supported: {format:?}"
        )));
    };
    for (key, value) in properties {
        defaults.insert(key.clone(), value.clone());
    }
    Ok(format!(
        "{function}({})",
        reader_arguments(paths, &defaults)?
    ))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn reader_arguments(paths: &[String], options: &PropertyMap) -> Result<String> {
    let files = paths
        .iter()
        .map(|p| safe_sql_string(p))
        .collect::<Vec<_>>()
        .join(", ");
    let mut args = vec![format!("[{files}]")];
    for (key, value) in options {
        if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(DriverError::Validation(format!(
                "invalid reader option {key:?}"
            )));
        }
        args.push(format!("{key}={}", sql_literal(value)));
    }
    Ok(args.join(", "))
}

/// Render a JSON value as a SQL literal for reader options.
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => safe_sql_string(s),
        Value::Array(items) => format!(
            "[{}]",
            items.iter().map(sql_literal).collect::<Vec<_>>().join(", ")
        ),
        Value::Object(map) => format!(
            "{{{}}}",
            map.iter()
                .map(|(k, v)| format!("{}: {}", safe_sql_string(k), sql_literal(v)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}
