//! Building blocks shared by executors writing into this database: output
//! naming, the staging build-then-rename sequence, incremental detection and
//! result assembly.

use std::time::Instant;

use duckdb::types::Value as SqlValue;
use serde_json::Value;
use tracing::{debug, info};

use crate::engine::{ObjectKind, Session};
use crate::error::{join_cleanup, DriverError, Result};
use crate::executor::properties::{encode, ModelInputProperties, ModelOutputProperties, ModelResultProperties};
use crate::executor::{ModelEnv, ModelExecuteOptions, ModelResult, ModelStats};
use crate::olap::crud::{self, create_table_as_select, CreateTableOptions};
use crate::olap::incremental::{insert_table_as_select, IncrementalStrategy, InsertTableOptions};
use crate::sql::{safe_name, staging_table_name_for};

/// Where a model's rows end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub table: String,
    /// Equal to `table` when changes are not staged.
    pub staging: String,
    pub used_model_name: bool,
    pub materialize: bool,
}

impl OutputTarget {
    pub fn resolve(
        output: &ModelOutputProperties,
        opts: &ModelExecuteOptions,
        incremental_model: bool,
    ) -> Result<Self> {
        let (table, used_model_name) = match output.table.as_deref() {
            Some(table) => (table.to_string(), false),
            None if !opts.model_name.trim().is_empty() => (opts.model_name.clone(), true),
            None => {
                return Err(DriverError::Validation(
                    "model has neither an output table nor a name".to_string(),
                ))
            }
        };
        let materialize = incremental_model || output.materialize.unwrap_or(opts.env.default_materialize);
        let staging = if opts.env.stage_changes {
            staging_table_name_for(&table)
        } else {
            table.clone()
        };
        Ok(Self {
            table,
            staging,
            used_model_name,
            materialize,
        })
    }

    pub fn is_staged(&self) -> bool {
        self.staging != self.table
    }
}

/// Secrets of the listed connectors, then `init_queries`, on `session`.
pub fn prepare_session(session: &Session<'_>, input: &ModelInputProperties, env: &ModelEnv) -> Result<()> {
    for connector in &input.create_secrets_from_connectors {
        let sql = env.connector_secrets.get(connector).ok_or_else(|| {
            DriverError::Validation(format!("no secret available for connector {connector:?}"))
        })?;
        session.exec_batch(sql)?;
    }
    for query in &input.init_queries {
        session.exec_batch(query)?;
    }
    Ok(())
}

/// The previous result when this run should fold into the existing table.
/// A missing table turns the run into a full build.
pub fn incremental_base<'o>(
    session: &Session<'_>,
    incremental_model: bool,
    opts: &'o ModelExecuteOptions,
    target: &OutputTarget,
) -> Result<Option<&'o ModelResult>> {
    if !incremental_model || !opts.incremental_run {
        return Ok(None);
    }
    let Some(previous) = opts.previous_result.as_ref() else {
        return Ok(None);
    };
    match session.object_kind(&target.table)? {
        Some(ObjectKind::Table) => Ok(Some(previous)),
        _ => {
            info!(table = %target.table, "previous output is gone, running a full build");
            Ok(None)
        }
    }
}

/// Drop a table or view, ignoring a missing one.
pub fn drop_if_exists(session: &Session<'_>, name: &str) -> Result<()> {
    match crud::drop_table(session, name) {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Build into the staging name with `build`, then rename over the final
/// name. A failed build drops the staging object and leaves the final one
/// untouched.
pub fn build_and_publish(
    session: &Session<'_>,
    target: &OutputTarget,
    build: impl FnOnce(&Session<'_>, &str) -> Result<u64>,
) -> Result<u64> {
    if !target.is_staged() {
        return build(session, &target.table);
    }
    drop_if_exists(session, &target.staging)?;
    match build(session, &target.staging) {
        Ok(rows) => {
            crud::rename_table(session, &target.staging, &target.table)?;
            debug!(staging = %target.staging, table = %target.table, "published staged build");
            Ok(rows)
        }
        Err(err) => join_cleanup(Err(err), drop_if_exists(session, &target.staging)),
    }
}

/// Materialize `select_sql` into the target: an incremental insert into the
/// existing table when possible, otherwise a staged full rebuild.
pub fn materialize_select(
    session: &Session<'_>,
    input: &ModelInputProperties,
    output: &ModelOutputProperties,
    target: &OutputTarget,
    opts: &ModelExecuteOptions,
    incremental_model: bool,
    select_sql: &str,
) -> Result<ModelStats> {
    let args = sql_args(&input.args)?;
    if let Some(previous) = incremental_base(session, incremental_model, opts, target)? {
        let metrics = insert_table_as_select(
            session,
            &target.table,
            select_sql,
            &InsertTableOptions {
                by_name: true,
                strategy: output.incremental_strategy,
                unique_key: output.unique_key.clone(),
                partition_by: output.partition_by.clone(),
                before_insert: input.pre_exec.clone(),
                after_insert: input.post_exec.clone(),
                args,
            },
        )?;
        return Ok(ModelStats {
            rows: metrics.rows,
            bytes: 0,
        }
        .merged(previous.stats));
    }

    let create = CreateTableOptions {
        view: !target.materialize,
        before_create: input.pre_exec.clone(),
        after_create: input.post_exec.clone(),
        args,
    };
    build_and_publish(session, target, |session, name| {
        create_table_as_select(session, name, select_sql, &create).map(|m| m.rows)
    })?;
    let rows = if target.materialize {
        count_rows(session, &target.table)?
    } else {
        0
    };
    Ok(ModelStats { rows, bytes: 0 })
}

/// Insert options for folding a batch into an existing table.
pub fn insert_options(output: &ModelOutputProperties) -> InsertTableOptions {
    InsertTableOptions {
        by_name: true,
        strategy: output.incremental_strategy,
        unique_key: output.unique_key.clone(),
        partition_by: output.partition_by.clone(),
        ..Default::default()
    }
}

/// Strategies that cannot go through the schema-evolving appender.
pub fn needs_strategy_insert(output: &ModelOutputProperties) -> bool {
    matches!(
        output.incremental_strategy,
        IncrementalStrategy::Merge | IncrementalStrategy::PartitionOverwrite
    )
}

pub fn count_rows(session: &Session<'_>, table: &str) -> Result<u64> {
    let count = session.query_i64(&format!("SELECT count(*) FROM {}", safe_name(table)), &[])?;
    Ok(count.unwrap_or(0).max(0) as u64)
}

/// Assemble the result of a run that wrote `target`.
pub fn table_result(
    opts: &ModelExecuteOptions,
    target: &OutputTarget,
    stats: ModelStats,
    started: Instant,
) -> Result<ModelResult> {
    let exec_duration = started.elapsed();
    let properties = encode(&ModelResultProperties {
        table: target.table.clone(),
        view: !target.materialize,
        used_model_name: target.used_model_name,
        size: stats.bytes,
        exec_time: exec_duration.as_millis() as u64,
    })?;
    Ok(ModelResult {
        connector: opts.output_connector.clone(),
        properties,
        table: target.table.clone(),
        exec_duration,
        stats,
    })
}

/// Convert model `args` into bound parameter values.
pub fn sql_args(args: &[Value]) -> Result<Vec<SqlValue>> {
    args.iter()
        .map(|arg| {
            Ok(match arg {
                Value::Null => SqlValue::Null,
                Value::Bool(b) => SqlValue::Boolean(*b),
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        SqlValue::BigInt(i)
                    } else if let Some(u) = n.as_u64() {
                        SqlValue::UBigInt(u)
                    } else {
                        SqlValue::Double(n.as_f64().ok_or_else(|| {
                            DriverError::Validation(format!("unsupported numeric argument {n}"))
                        })?)
                    }
                }
                Value::String(s) => SqlValue::Text(s.clone()),
                other => SqlValue::Text(other.to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(model_name: &str, stage_changes: bool) -> ModelExecuteOptions {
        ModelExecuteOptions {
            model_name: model_name.to_string(),
            env: ModelEnv {
                stage_changes,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn target_from_model_name() {
        let target = OutputTarget::resolve(&ModelOutputProperties::default(), &opts("orders", true), false).unwrap();
        assert_eq!(target.table, "orders");
        assert!(target.used_model_name);
        assert!(target.is_staged());
        assert!(!target.materialize);

        let output = ModelOutputProperties {
            table: Some("explicit".to_string()),
            ..Default::default()
        };
        let target = OutputTarget::resolve(&output, &opts("orders", false), true).unwrap();
        assert_eq!(target.table, "explicit");
        assert!(!target.used_model_name);
        assert!(!target.is_staged());
        assert!(target.materialize);

        assert!(OutputTarget::resolve(&ModelOutputProperties::default(), &opts(" ", true), false).is_err());
    }

    #[test]
    fn args_conversion() {
        let args = sql_args(&[json!(1), json!("a"), json!(null), json!(1.5), json!([1])]).unwrap();
        assert_eq!(args[0], SqlValue::BigInt(1));
        assert_eq!(args[1], SqlValue::Text("a".to_string()));
        assert_eq!(args[2], SqlValue::Null);
        assert_eq!(args[3], SqlValue::Double(1.5));
        assert_eq!(args[4], SqlValue::Text("[1]".to_string()));
    }
}
