//! DuckDB storage driver for an analytics runtime.
//!
//! The driver treats one embedded DuckDB database as a managed catalog of
//! materialized models: a priority-scheduled connection pool, an
//! optimistically versioned resource catalog, table primitives with
//! incremental strategies, schema-evolving ingestion and a family of model
//! executors dispatched on connector capabilities.

pub mod catalog;
pub mod config;
pub mod connectors;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod executor;
pub mod information_schema;
pub mod manager;
pub mod migrations;
pub mod olap;
pub mod sql;
pub mod types;

pub use catalog::{CatalogStore, Resource};
pub use config::{DriverConfig, PropertyMap};
pub use context::Context;
pub use driver::{Driver, DriverRegistry, DuckDbDriver, DuckDbHandle, Handle};
pub use error::{DriverError, Result};
pub use executor::{ModelEnv, ModelExecuteOptions, ModelExecutor, ModelResult, ModelSpec, ModelStats};
pub use information_schema::{InformationSchema, Table};
pub use manager::ModelManager;
pub use olap::{Olap, Statement};
pub use types::{native_type_to_canonical, CanonicalType, TypeKind};
