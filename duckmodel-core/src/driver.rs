//! Driver entry points: the [`Driver`] trait, the DuckDB driver and its
//! [`Handle`], and the explicit [`DriverRegistry`] used to open handles by
//! driver name.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::catalog::CatalogStore;
use crate::config::{DriverConfig, PropertyMap};
use crate::connectors::Connector;
use crate::context::Context;
use crate::engine::{ConnectionPool, PoolStats};
use crate::error::{DriverError, Result};
use crate::executor::{self, ModelExecutor, ModelSpec};
use crate::information_schema::InformationSchema;
use crate::manager::ModelManager;
use crate::migrations;
use crate::olap::Olap;

pub const DUCKDB_DRIVER: &str = "duckdb";

pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Open a handle for one instance from its untyped configuration.
    fn open(&self, instance_id: &str, config: &PropertyMap) -> Result<Arc<dyn Handle>>;
}

/// An open connection to one database instance. Capabilities the driver does
/// not offer return `None`.
pub trait Handle: Send + Sync {
    fn driver(&self) -> &str;
    fn instance_id(&self) -> &str;
    fn config(&self) -> &DriverConfig;
    fn close(&self) -> Result<()>;

    /// Bring the internal catalog schema up to date, returning its version.
    fn migrate(&self, ctx: &Context) -> Result<i64>;

    /// Applied and latest known catalog versions.
    fn migration_status(&self, ctx: &Context) -> Result<(i64, i64)>;

    fn as_olap(&self) -> Option<Olap>;
    fn as_catalog_store(&self) -> Option<CatalogStore>;
    fn as_model_manager(&self) -> Option<ModelManager>;
    fn information_schema(&self) -> Option<InformationSchema>;

    /// Resolve and validate the executor moving `input` into `output`.
    fn as_model_executor(
        &self,
        input: &Connector,
        output: &Connector,
        spec: &ModelSpec,
    ) -> Result<Box<dyn ModelExecutor>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDriver;

impl Driver for DuckDbDriver {
    fn name(&self) -> &str {
        DUCKDB_DRIVER
    }

    fn open(&self, instance_id: &str, config: &PropertyMap) -> Result<Arc<dyn Handle>> {
        let config = DriverConfig::from_properties(config)?;
        Ok(Arc::new(DuckDbHandle::open(instance_id, config)?))
    }
}

pub struct DuckDbHandle {
    instance_id: String,
    config: DriverConfig,
    pool: ConnectionPool,
    olap: Olap,
}

impl DuckDbHandle {
    #[instrument(skip(config))]
    pub fn open(instance_id: &str, config: DriverConfig) -> Result<Self> {
        let config = config.validated()?;
        let pool = ConnectionPool::open(&config)?;
        let olap = Olap::new(pool.clone(), config.storage_limit_bytes);
        info!(
            instance_id,
            path = ?config.database_path(),
            pool_size = config.pool_size,
            "opened duckdb handle"
        );
        Ok(Self {
            instance_id: instance_id.to_string(),
            config,
            pool,
            olap,
        })
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl Handle for DuckDbHandle {
    fn driver(&self) -> &str {
        DUCKDB_DRIVER
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn config(&self) -> &DriverConfig {
        &self.config
    }

    fn close(&self) -> Result<()> {
        self.pool.close()
    }

    fn migrate(&self, ctx: &Context) -> Result<i64> {
        migrations::migrate(&self.pool, ctx)
    }

    fn migration_status(&self, ctx: &Context) -> Result<(i64, i64)> {
        let applied = match migrations::applied_version(&self.pool, ctx) {
            Ok(version) => version,
            Err(err) if err.is_not_found() => 0,
            Err(err) => return Err(err),
        };
        Ok((applied, migrations::latest_version()))
    }

    fn as_olap(&self) -> Option<Olap> {
        Some(self.olap.clone())
    }

    fn as_catalog_store(&self) -> Option<CatalogStore> {
        Some(CatalogStore::new(self.pool.clone()))
    }

    fn as_model_manager(&self) -> Option<ModelManager> {
        Some(ModelManager::new(self.olap.clone()))
    }

    fn information_schema(&self) -> Option<InformationSchema> {
        Some(self.olap.information_schema())
    }

    fn as_model_executor(
        &self,
        input: &Connector,
        output: &Connector,
        spec: &ModelSpec,
    ) -> Result<Box<dyn ModelExecutor>> {
        executor::resolve(&self.olap, input, output, spec)
    }
}

/// Drivers by name, built once at startup and passed to whatever opens
/// handles.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every driver of this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.drivers.insert(DUCKDB_DRIVER.to_string(), Arc::new(DuckDbDriver));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn Driver>) -> Result<()> {
        let name = driver.name().to_string();
        if self.drivers.contains_key(&name) {
            return Err(DriverError::ResourceExists {
                kind: "driver".to_string(),
                name,
            });
        }
        self.drivers.insert(name, driver);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("driver {name:?}")))
    }

    pub fn open(&self, name: &str, instance_id: &str, config: &PropertyMap) -> Result<Arc<dyn Handle>> {
        self.get(name)?.open(instance_id, config)
    }

    pub fn names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let mut registry = DriverRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["duckdb".to_string()]);
        assert!(registry.get("duckdb").is_ok());
        assert!(registry.get("sqlite").err().unwrap().is_not_found());

        let err = registry.register(Arc::new(DuckDbDriver)).unwrap_err();
        assert!(matches!(err, DriverError::ResourceExists { .. }));
    }

    #[test]
    fn open_in_memory_handle() {
        let registry = DriverRegistry::with_defaults();
        let mut props = PropertyMap::new();
        props.insert("pool_size".to_string(), serde_json::json!(2));
        let handle = registry.open("duckdb", "test", &props).unwrap();
        assert_eq!(handle.instance_id(), "test");
        assert_eq!(handle.driver(), "duckdb");

        let ctx = Context::background();
        assert_eq!(handle.migration_status(&ctx).unwrap(), (0, migrations::latest_version()));
        assert_eq!(handle.migrate(&ctx).unwrap(), migrations::latest_version());
        assert_eq!(handle.migrate(&ctx).unwrap(), migrations::latest_version());
        handle.close().unwrap();
    }
}
