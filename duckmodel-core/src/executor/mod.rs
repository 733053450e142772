//! Model executors.
//!
//! An executor moves the result of a model's input (a query on this database
//! or files and rows from an external connector) into its output. Executors
//! are picked from a dispatch table keyed on the capabilities of the input
//! and output connectors, and their properties are decoded and validated once
//! when they are resolved.

pub mod export;
pub mod files;
pub mod materialize;
pub mod properties;
pub mod query;
pub mod rows;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PropertyMap;
use crate::connectors::{Capability, Connector};
use crate::context::Context;
use crate::error::{DriverError, Result};
use crate::olap::Olap;

pub use properties::{
    FileFormat, FileInputProperties, FileOutputProperties, ModelInputProperties,
    ModelOutputProperties, ModelResultProperties,
};

pub trait ModelExecutor: Send + Sync {
    /// Number of parallel executions allowed for a desired level, or `None`
    /// if the executor cannot run at that level.
    fn concurrency(&self, desired: usize) -> Option<usize>;

    fn execute(&self, ctx: &Context, opts: &ModelExecuteOptions) -> Result<ModelResult>;
}

/// Static configuration of a model, resolved into an executor once.
#[derive(Debug, Clone, Default)]
pub struct ModelSpec {
    pub input_properties: PropertyMap,
    pub output_properties: PropertyMap,
    pub incremental: bool,
}

/// Settings of the environment the model runs in.
#[derive(Debug, Clone)]
pub struct ModelEnv {
    /// Materialize models as tables when the output does not say.
    pub default_materialize: bool,
    /// Build full runs under a staging name and rename on success.
    pub stage_changes: bool,
    pub repo_root: PathBuf,
    pub allow_host_access: bool,
    /// Scratch directory for exports.
    pub temp_dir: PathBuf,
    /// Secret-creating SQL keyed by connector name.
    pub connector_secrets: BTreeMap<String, String>,
}

impl Default for ModelEnv {
    fn default() -> Self {
        Self {
            default_materialize: false,
            stage_changes: true,
            repo_root: PathBuf::from("."),
            allow_host_access: false,
            temp_dir: std::env::temp_dir(),
            connector_secrets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelExecuteOptions {
    pub model_name: String,
    pub env: ModelEnv,
    /// Name of the output connector, recorded in the result.
    pub output_connector: String,
    /// Fold new rows into the previous result instead of rebuilding.
    pub incremental_run: bool,
    pub previous_result: Option<ModelResult>,
    pub priority: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStats {
    pub rows: u64,
    pub bytes: u64,
}

impl ModelStats {
    pub fn merged(self, other: ModelStats) -> ModelStats {
        ModelStats {
            rows: self.rows.saturating_add(other.rows),
            bytes: self.bytes.saturating_add(other.bytes),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResult {
    pub connector: String,
    /// Round-tripped by the caller into the next run.
    pub properties: PropertyMap,
    /// Final table or view, empty for file outputs.
    pub table: String,
    pub exec_duration: Duration,
    pub stats: ModelStats,
}

impl ModelResult {
    pub fn result_properties(&self) -> Result<ModelResultProperties> {
        properties::decode("result", &self.properties)
    }
}

/// Everything a builder needs to construct an executor.
pub struct ExecutorParts<'a> {
    pub olap: &'a Olap,
    pub input: &'a Connector,
    pub output: &'a Connector,
    pub spec: &'a ModelSpec,
}

type Builder = fn(&ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>>;

const EXECUTORS: &[(Capability, Capability, Builder)] = &[
    (Capability::Local, Capability::Local, query::build_self_to_self),
    (Capability::MotherDuck, Capability::Local, query::build_motherduck_to_self),
    (Capability::FileStore, Capability::Local, files::build_file_store_to_self),
    (Capability::ObjectStore, Capability::Local, files::build_object_store_to_self),
    (Capability::Warehouse, Capability::Local, files::build_warehouse_to_self),
    (Capability::Https, Capability::Local, files::build_https_to_self),
    (Capability::SqlStore, Capability::Local, rows::build_sql_store_to_self),
    (Capability::Local, Capability::FileStore, export::build_self_to_file),
    (Capability::Local, Capability::ObjectStore, export::build_self_to_object_store),
];

/// Resolve the executor for an input/output pair and validate the model's
/// properties against it.
pub fn resolve(
    olap: &Olap,
    input: &Connector,
    output: &Connector,
    spec: &ModelSpec,
) -> Result<Box<dyn ModelExecutor>> {
    let key = (input.capability(), output.capability());
    let builder = EXECUTORS
        .iter()
        .find(|(i, o, _)| (*i, *o) == key)
        .map(|(_, _, builder)| *builder)
        .ok_or_else(|| {
            DriverError::Validation(format!(
                "no executor for {:?} to {:?}",
                key.0, key.1
            ))
        })?;
    debug!(input = ?key.0, output = ?key.1, "resolved model executor");
    builder(&ExecutorParts {
        olap,
        input,
        output,
        spec,
    })
}

/// Whether an input/output pair has an executor.
pub fn supports(input: Capability, output: Capability) -> bool {
    EXECUTORS.iter().any(|(i, o, _)| *i == input && *o == output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_has_unique_keys() {
        for (idx, (i, o, _)) in EXECUTORS.iter().enumerate() {
            assert!(
                EXECUTORS[idx + 1..].iter().all(|(i2, o2, _)| (i2, o2) != (i, o)),
                "duplicate executor for {i:?} -> {o:?}"
            );
        }
        assert!(supports(Capability::Local, Capability::Local));
        assert!(supports(Capability::ObjectStore, Capability::Local));
        assert!(!supports(Capability::FileStore, Capability::ObjectStore));
    }

    #[test]
    fn stats_merge_saturates() {
        let a = ModelStats { rows: 3, bytes: u64::MAX };
        let b = ModelStats { rows: 4, bytes: 1 };
        assert_eq!(a.merged(b), ModelStats { rows: 7, bytes: u64::MAX });
    }
}
