//! Typed model properties decoded from the runtime's untyped maps.
//!
//! Decoding is weak: booleans may arrive as strings or numbers and list
//! properties may arrive as a single string. Validation happens once, when
//! an executor is resolved.

use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::PropertyMap;
use crate::error::{DriverError, Result};
use crate::olap::IncrementalStrategy;

/// Decode `props` into `T`, reporting failures as validation errors.
pub fn decode<T: for<'de> Deserialize<'de>>(what: &str, props: &PropertyMap) -> Result<T> {
    serde_json::from_value(Value::Object(props.clone()))
        .map_err(|err| DriverError::Validation(format!("failed to parse {what} properties: {err}")))
}

pub fn encode<T: Serialize>(value: &T) -> Result<PropertyMap> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(DriverError::Internal(format!(
            "properties serialized to a non-object: {other}"
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInputProperties {
    pub sql: String,
    pub args: Vec<Value>,
    #[serde(deserialize_with = "string_or_list")]
    pub init_queries: Vec<String>,
    pub pre_exec: Option<String>,
    pub post_exec: Option<String>,
    #[serde(deserialize_with = "string_or_list")]
    pub create_secrets_from_connectors: Vec<String>,
    /// External DuckDB file attached read-only for the duration of the run.
    pub db: Option<String>,
}

impl ModelInputProperties {
    pub fn validate(&self, incremental: bool) -> Result<()> {
        if self.sql.trim().is_empty() {
            return Err(DriverError::Validation("missing property 'sql'".to_string()));
        }
        if incremental && self.db.as_deref().is_some_and(|db| !db.is_empty()) {
            return Err(DriverError::Validation(
                "property 'db' is not supported for incremental models".to_string(),
            ));
        }
        Ok(())
    }

    pub fn external_db(&self) -> Option<&str> {
        self.db.as_deref().filter(|db| !db.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOutputProperties {
    pub table: Option<String>,
    #[serde(deserialize_with = "weak_bool_opt")]
    pub materialize: Option<bool>,
    #[serde(deserialize_with = "string_or_list")]
    pub unique_key: Vec<String>,
    #[serde(deserialize_with = "weak_strategy")]
    pub incremental_strategy: IncrementalStrategy,
    pub partition_by: Option<String>,
}

impl ModelOutputProperties {
    /// Check companion fields and infer a strategy for incremental models
    /// that did not name one.
    pub fn validate(&mut self, incremental: bool) -> Result<()> {
        if self.table.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.table = None;
        }
        if self.partition_by.as_deref().is_some_and(|p| p.trim().is_empty()) {
            self.partition_by = None;
        }
        if incremental && self.materialize == Some(false) {
            return Err(DriverError::Validation(
                "incremental models must be materialized".to_string(),
            ));
        }
        if incremental && self.incremental_strategy == IncrementalStrategy::Unspecified {
            self.incremental_strategy = if !self.unique_key.is_empty() {
                IncrementalStrategy::Merge
            } else if self.partition_by.is_some() {
                IncrementalStrategy::PartitionOverwrite
            } else {
                IncrementalStrategy::Append
            };
        }
        match self.incremental_strategy {
            IncrementalStrategy::Merge if self.unique_key.is_empty() => Err(DriverError::Validation(
                "the 'merge' strategy requires 'unique_key'".to_string(),
            )),
            IncrementalStrategy::PartitionOverwrite if self.partition_by.is_none() => {
                Err(DriverError::Validation(
                    "the 'partition_overwrite' strategy requires 'partition_by'".to_string(),
                ))
            }
            IncrementalStrategy::Append if !self.unique_key.is_empty() => Err(DriverError::Validation(
                "'unique_key' is not supported with the 'append' strategy".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Properties persisted by the caller and handed back on the next run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelResultProperties {
    pub table: String,
    #[serde(deserialize_with = "weak_bool")]
    pub view: bool,
    /// The table name was derived from the model name.
    #[serde(deserialize_with = "weak_bool")]
    pub used_model_name: bool,
    pub size: u64,
    /// Milliseconds.
    pub exec_time: u64,
}

/// Input properties shared by executors reading files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileInputProperties {
    /// Extension-like format override such as `csv` or `parquet`.
    pub format: Option<String>,
    /// Extra options for the engine's reader function.
    pub duckdb: PropertyMap,
    #[serde(deserialize_with = "weak_bool")]
    pub allow_schema_relaxation: bool,
    /// Columns retyped as ENUM once a full build has loaded every file.
    #[serde(deserialize_with = "string_or_list")]
    pub cast_to_enum: Vec<String>,
}

impl FileInputProperties {
    /// Reader options with the relaxation requirement applied.
    pub fn reader_options(&self) -> Result<PropertyMap> {
        let mut options = self.duckdb.clone();
        if self.allow_schema_relaxation {
            match options.get("union_by_name") {
                Some(Value::Bool(false)) => {
                    return Err(DriverError::Validation(
                        "if 'union_by_name' is set to false, 'allow_schema_relaxation' must be false"
                            .to_string(),
                    ))
                }
                _ => {
                    options.insert("union_by_name".to_string(), Value::Bool(true));
                }
            }
        }
        Ok(options)
    }
}

/// Output properties of executors writing files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOutputProperties {
    pub path: String,
    pub format: FileFormat,
}

impl FileOutputProperties {
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(DriverError::Validation("missing property 'path'".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Parquet,
    Csv,
    Json,
}

impl FileFormat {
    pub fn copy_options(self) -> &'static str {
        match self {
            FileFormat::Parquet => "FORMAT PARQUET",
            FileFormat::Csv => "FORMAT CSV, HEADER true",
            FileFormat::Json => "FORMAT JSON",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Parquet => "parquet",
            FileFormat::Csv => "csv",
            FileFormat::Json => "json",
        }
    }
}

pub(crate) fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(de::Error::custom(format!("expected a string, got {other}"))),
            })
            .collect(),
        other => Err(de::Error::custom(format!(
            "expected a string or a list of strings, got {other}"
        ))),
    }
}

fn weak_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(weak_bool_opt(deserializer)?.unwrap_or(false))
}

fn weak_bool_opt<'de, D>(deserializer: D) -> std::result::Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(WeakBoolVisitor)
}

struct WeakBoolVisitor;

impl<'de> Visitor<'de> for WeakBoolVisitor {
    type Value = Option<bool>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a boolean, a number or a boolean-like string")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Self::Value, E> {
        Ok(Some(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
        Ok(Some(v != 0))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
        Ok(Some(v != 0))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
        match v.trim().to_lowercase().as_str() {
            "" => Ok(None),
            "1" | "t" | "true" | "yes" => Ok(Some(true)),
            "0" | "f" | "false" | "no" => Ok(Some(false)),
            other => Err(E::custom(format!("cannot parse {other:?} as a boolean"))),
        }
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
        Ok(None)
    }
}

fn weak_strategy<'de, D>(deserializer: D) -> std::result::Result<IncrementalStrategy, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(IncrementalStrategy::Unspecified),
        Some(s) => s.parse().map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> PropertyMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn weakly_typed_output_properties() {
        let out: ModelOutputProperties = decode(
            "output",
            &props(json!({
                "table": "orders",
                "materialize": "true",
                "unique_key": "id",
                "incremental_strategy": "merge",
            })),
        )
        .unwrap();
        assert_eq!(out.materialize, Some(true));
        assert_eq!(out.unique_key, vec!["id".to_string()]);
        assert_eq!(out.incremental_strategy, IncrementalStrategy::Merge);

        let out: ModelOutputProperties =
            decode("output", &props(json!({"materialize": 0, "unique_key": ["a", "b"]}))).unwrap();
        assert_eq!(out.materialize, Some(false));
        assert_eq!(out.unique_key.len(), 2);

        let err = decode::<ModelOutputProperties>("output", &props(json!({"incremental_strategy": "upsert"})))
            .unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
    }

    #[test]
    fn strategy_companion_fields() {
        let mut out = ModelOutputProperties {
            incremental_strategy: IncrementalStrategy::Merge,
            ..Default::default()
        };
        assert!(out.validate(true).is_err());

        let mut out = ModelOutputProperties {
            incremental_strategy: IncrementalStrategy::PartitionOverwrite,
            partition_by: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(out.validate(true).is_err());

        let mut out = ModelOutputProperties {
            materialize: Some(false),
            ..Default::default()
        };
        assert!(out.validate(true).is_err());
        assert!(out.validate(false).is_ok());
    }

    #[test]
    fn incremental_strategy_is_inferred() {
        let mut out = ModelOutputProperties {
            unique_key: vec!["id".to_string()],
            ..Default::default()
        };
        out.validate(true).unwrap();
        assert_eq!(out.incremental_strategy, IncrementalStrategy::Merge);

        let mut out = ModelOutputProperties {
            partition_by: Some("day".to_string()),
            ..Default::default()
        };
        out.validate(true).unwrap();
        assert_eq!(out.incremental_strategy, IncrementalStrategy::PartitionOverwrite);

        let mut out = ModelOutputProperties::default();
        out.validate(true).unwrap();
        assert_eq!(out.incremental_strategy, IncrementalStrategy::Append);

        let mut out = ModelOutputProperties::default();
        out.validate(false).unwrap();
        assert_eq!(out.incremental_strategy, IncrementalStrategy::Unspecified);
    }

    #[test]
    fn input_properties_require_sql() {
        let input: ModelInputProperties = decode("input", &props(json!({"sql": " "}))).unwrap();
        assert!(input.validate(false).is_err());

        let input: ModelInputProperties = decode(
            "input",
            &props(json!({"sql": "SELECT 1", "db": "other.db", "init_queries": "SET x = 1"})),
        )
        .unwrap();
        assert_eq!(input.init_queries, vec!["SET x = 1".to_string()]);
        assert!(input.validate(false).is_ok());
        assert!(input.validate(true).is_err());
    }

    #[test]
    fn result_properties_round_trip() {
        let result = ModelResultProperties {
            table: "orders".to_string(),
            view: false,
            used_model_name: true,
            size: 42,
            exec_time: 7,
        };
        let map = encode(&result).unwrap();
        assert_eq!(decode::<ModelResultProperties>("result", &map).unwrap(), result);

        let legacy: ModelResultProperties =
            decode("result", &props(json!({"table": "t", "view": "false"}))).unwrap();
        assert!(!legacy.view);
    }

    #[test]
    fn relaxation_forces_union_by_name() {
        let file = FileInputProperties {
            allow_schema_relaxation: true,
            ..Default::default()
        };
        assert_eq!(file.reader_options().unwrap().get("union_by_name"), Some(&Value::Bool(true)));

        let mut duckdb = PropertyMap::new();
        duckdb.insert("union_by_name".to_string(), Value::Bool(false));
        let file = FileInputProperties {
            duckdb,
            allow_schema_relaxation: true,
            ..Default::default()
        };
        assert!(file.reader_options().is_err());
    }

    #[test]
    fn enum_columns_accept_a_single_name() {
        let file: FileInputProperties = decode("input", &props(json!({"cast_to_enum": "country"}))).unwrap();
        assert_eq!(file.cast_to_enum, vec!["country".to_string()]);

        let file: FileInputProperties =
            decode("input", &props(json!({"cast_to_enum": ["a", "b"], "format": "csv"}))).unwrap();
        assert_eq!(file.cast_to_enum.len(), 2);
        assert!(decode::<FileInputProperties>("input", &props(json!({"cast_to_enum": 3}))).is_err());
    }
}
