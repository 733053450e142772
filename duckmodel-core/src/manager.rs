//! Lifecycle of model results that were produced earlier: renaming with the
//! model, existence checks, deletion and merging of partitioned runs.

use std::path::Path;

use serde_json::Value;
use tracing::{info, instrument};

use crate::config::PropertyMap;
use crate::context::Context;
use crate::engine::Session;
use crate::error::{DriverError, Result};
use crate::executor::materialize::drop_if_exists;
use crate::executor::properties::{encode, ModelResultProperties};
use crate::executor::ModelResult;
use crate::olap::crud::rename_table;
use crate::olap::Olap;
use crate::sql::staging_table_name_for;

#[derive(Clone)]
pub struct ModelManager {
    olap: Olap,
}

impl ModelManager {
    pub fn new(olap: Olap) -> Self {
        Self { olap }
    }

    /// Follow a model rename. Results whose table was named explicitly stay
    /// where they are; results named after the model move together with
    /// their staging object.
    #[instrument(skip(self, ctx, result), fields(table = %result.table))]
    pub fn rename(&self, ctx: &Context, result: &ModelResult, new_model_name: &str) -> Result<ModelResult> {
        if result.table.is_empty() {
            return Ok(result.clone());
        }
        let mut props = result.result_properties()?;
        if !props.used_model_name || result.table == new_model_name {
            return Ok(result.clone());
        }
        if new_model_name.trim().is_empty() {
            return Err(DriverError::Validation("model name cannot be empty".to_string()));
        }
        self.olap.with_connection(ctx, 0, |session| {
            rename_table(session, &result.table, new_model_name)?;
            let old_staging = staging_table_name_for(&result.table);
            if session.object_kind(&old_staging)?.is_some() {
                rename_table(session, &old_staging, &staging_table_name_for(new_model_name))?;
            }
            Ok(())
        })?;
        info!(from = %result.table, to = new_model_name, "renamed model output");

        props.table = new_model_name.to_string();
        let mut renamed = result.clone();
        renamed.table = props.table.clone();
        renamed.properties = merged_properties(result, &props)?;
        Ok(renamed)
    }

    pub fn exists(&self, ctx: &Context, result: &ModelResult) -> Result<bool> {
        if result.table.is_empty() {
            return Ok(exported_path(result).is_some_and(|p| Path::new(p).exists()));
        }
        self.olap
            .with_connection(ctx, 0, |session| Ok(session.object_kind(&result.table)?.is_some()))
    }

    /// Drop the result and its staging object. Missing objects are ignored.
    #[instrument(skip(self, ctx, result), fields(table = %result.table))]
    pub fn delete(&self, ctx: &Context, result: &ModelResult) -> Result<()> {
        if result.table.is_empty() {
            if let Some(path) = exported_path(result) {
                match std::fs::remove_file(path) {
                    Err(err) if err.kind() != std::io::ErrorKind::NotFound => return Err(err.into()),
                    _ => {}
                }
            }
            return Ok(());
        }
        self.olap.with_connection(ctx, 0, |session| delete_table(session, &result.table))
    }

    /// Combine the results of two runs that wrote partitions of the same
    /// table.
    pub fn merge_partition_results(&self, a: &ModelResult, b: &ModelResult) -> Result<ModelResult> {
        if a.table != b.table {
            return Err(DriverError::Validation(format!(
                "cannot merge results of different tables {:?} and {:?}",
                a.table, b.table
            )));
        }
        let a_props = a.result_properties()?;
        let b_props = b.result_properties()?;
        let props = ModelResultProperties {
            size: a_props.size.saturating_add(b_props.size),
            exec_time: a_props.exec_time.saturating_add(b_props.exec_time),
            ..a_props
        };
        Ok(ModelResult {
            connector: a.connector.clone(),
            properties: merged_properties(a, &props)?,
            table: a.table.clone(),
            exec_duration: a.exec_duration + b.exec_duration,
            stats: a.stats.merged(b.stats),
        })
    }
}

fn delete_table(session: &Session<'_>, table: &str) -> Result<()> {
    drop_if_exists(session, &staging_table_name_for(table))?;
    drop_if_exists(session, table)
}

/// Result properties with the typed fields replaced, keeping extra keys.
fn merged_properties(result: &ModelResult, props: &ModelResultProperties) -> Result<PropertyMap> {
    let mut merged = result.properties.clone();
    merged.extend(encode(props)?);
    Ok(merged)
}

fn exported_path(result: &ModelResult) -> Option<&str> {
    match result.properties.get("path") {
        Some(Value::String(path)) if !path.contains("://") => Some(path.as_str()),
        _ => None,
    }
}
