use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{DriverError, Result};

/// Untyped key/value properties as handed over by the runtime.
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

pub const MIN_POOL_SIZE: usize = 2;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    /// Database file. Takes precedence over `data_dir`.
    pub path: Option<PathBuf>,
    /// Directory holding `main.db` when `path` is not set.
    pub data_dir: Option<PathBuf>,
    /// Number of pooled analytic connections (the catalog lane is extra).
    pub pool_size: usize,
    /// Engine worker threads.
    pub threads: Option<usize>,
    pub memory_limit_gb: Option<usize>,
    /// Extra engine settings applied with `SET key = 'value'`.
    pub settings: BTreeMap<String, String>,
    /// Extensions installed and loaded when the database is opened.
    pub extensions: Vec<String>,
    /// SQL executed once against the database when it is opened.
    pub init_sql: Option<String>,
    /// SQL executed on every physical connection.
    pub conn_init_sql: Option<String>,
    pub storage_limit_bytes: Option<u64>,
    pub log_queries: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            path: None,
            data_dir: None,
            pool_size: (cpus / 2).clamp(MIN_POOL_SIZE, 8),
            threads: None,
            memory_limit_gb: None,
            settings: BTreeMap::new(),
            extensions: Vec::new(),
            init_sql: None,
            conn_init_sql: None,
            storage_limit_bytes: None,
            log_queries: false,
        }
    }
}

impl DriverConfig {
    /// Load from defaults layered under `DUCKMODEL_*` environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let settings = config::Config::builder()
            .add_source(
                config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
            )
            .add_source(config::Environment::with_prefix("DUCKMODEL").try_parsing(true))
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: DriverConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        Ok(cfg.validated()?)
    }

    /// Decode the property map passed to `Driver::open`.
    pub fn from_properties(props: &PropertyMap) -> Result<Self> {
        let cfg: DriverConfig = serde_json::from_value(serde_json::Value::Object(props.clone()))
            .map_err(|err| DriverError::Validation(format!("driver properties: {err}")))?;
        cfg.validated()
    }

    pub fn validated(mut self) -> Result<Self> {
        if self.pool_size < MIN_POOL_SIZE {
            warn!(
                requested = self.pool_size,
                "pool_size below minimum, using {}", MIN_POOL_SIZE
            );
            self.pool_size = MIN_POOL_SIZE;
        }
        if self.threads == Some(0) {
            return Err(DriverError::Validation(
                "threads must be greater than 0".to_string(),
            ));
        }
        if self.memory_limit_gb == Some(0) {
            return Err(DriverError::Validation(
                "memory_limit_gb must be greater than 0".to_string(),
            ));
        }
        for key in self.settings.keys() {
            if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(DriverError::Validation(format!(
                    "invalid setting name {key:?}"
                )));
            }
        }
        Ok(self)
    }

    /// Resolved database file, `None` for an in-memory database.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.path
            .clone()
            .or_else(|| self.data_dir.as_ref().map(|dir| dir.join("main.db")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> PropertyMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn pool_size_is_raised_to_minimum() {
        let cfg = DriverConfig::from_properties(&props(json!({ "pool_size": 1 }))).unwrap();
        assert_eq!(cfg.pool_size, MIN_POOL_SIZE);
    }

    #[test]
    fn data_dir_resolves_main_db() {
        let cfg =
            DriverConfig::from_properties(&props(json!({ "data_dir": "/tmp/instance" }))).unwrap();
        assert_eq!(
            cfg.database_path(),
            Some(PathBuf::from("/tmp/instance/main.db"))
        );
        assert_eq!(DriverConfig::default().database_path(), None);
    }

    #[test]
    fn rejects_bad_settings() {
        let err = DriverConfig::from_properties(&props(json!({
            "settings": { "threads; DROP": "1" }
        })))
        .unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));

        let err = DriverConfig::from_properties(&props(json!({ "pool_size": "lots" }))).unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
    }
}
