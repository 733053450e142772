//! Incremental strategies folding new rows into an existing table.
//!
//! Merge and partition overwrite stage the new rows in a temporary table on
//! the session's connection, then delete and insert inside one transaction.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use duckdb::types::Value;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::engine::Session;
use crate::error::{join_cleanup, DriverError, Result};
use crate::olap::crud::{add_table_column, run_hook, TableWriteMetrics};
use crate::sql::{safe_name, temp_name, trim_statement};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalStrategy {
    #[default]
    #[serde(rename = "")]
    Unspecified,
    Append,
    Merge,
    PartitionOverwrite,
}

impl FromStr for IncrementalStrategy {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" => Ok(IncrementalStrategy::Unspecified),
            "append" => Ok(IncrementalStrategy::Append),
            "merge" => Ok(IncrementalStrategy::Merge),
            "partition_overwrite" => Ok(IncrementalStrategy::PartitionOverwrite),
            other => Err(DriverError::Validation(format!(
                "invalid incremental strategy {other:?}"
            ))),
        }
    }
}

impl fmt::Display for IncrementalStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IncrementalStrategy::Unspecified => "",
            IncrementalStrategy::Append => "append",
            IncrementalStrategy::Merge => "merge",
            IncrementalStrategy::PartitionOverwrite => "partition_overwrite",
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct InsertTableOptions {
    /// Match columns by name instead of position (append only).
    pub by_name: bool,
    pub strategy: IncrementalStrategy,
    /// Key columns for `merge`.
    pub unique_key: Vec<String>,
    /// Partition expression for `partition_overwrite`.
    pub partition_by: Option<String>,
    pub before_insert: Option<String>,
    /// Runs even if the insert failed; its error is joined with the insert's.
    pub after_insert: Option<String>,
    pub args: Vec<Value>,
}

#[instrument(skip(session, select_sql, opts), fields(strategy = %opts.strategy))]
pub fn insert_table_as_select(
    session: &Session<'_>,
    table: &str,
    select_sql: &str,
    opts: &InsertTableOptions,
) -> Result<TableWriteMetrics> {
    let start = Instant::now();
    let inserted = run_hook(session, opts.before_insert.as_deref()).and_then(|()| {
        match opts.strategy {
            IncrementalStrategy::Unspecified | IncrementalStrategy::Append => {
                append(session, table, select_sql, opts)
            }
            IncrementalStrategy::Merge => merge(session, table, select_sql, opts),
            IncrementalStrategy::PartitionOverwrite => {
                partition_overwrite(session, table, select_sql, opts)
            }
        }
    });
    let after = run_hook(session, opts.after_insert.as_deref());
    let rows = join_cleanup(inserted, after).map_err(|err| err.context("insert into", table))?;
    let metrics = TableWriteMetrics {
        duration: start.elapsed(),
        rows,
    };
    debug!(rows, elapsed_ms = metrics.duration.as_millis() as u64, "inserted");
    Ok(metrics)
}

fn append(session: &Session<'_>, table: &str, select_sql: &str, opts: &InsertTableOptions) -> Result<u64> {
    let by_name = if opts.by_name { " BY NAME" } else { "" };
    let sql = format!(
        "INSERT INTO {}{by_name} ({}\n)",
        safe_name(table),
        trim_statement(select_sql)
    );
    Ok(session.exec_with_args(&sql, &opts.args)? as u64)
}

fn merge(session: &Session<'_>, table: &str, select_sql: &str, opts: &InsertTableOptions) -> Result<u64> {
    if opts.unique_key.is_empty() {
        return Err(DriverError::Validation(
            "merge strategy requires unique_key".to_string(),
        ));
    }
    with_staged_rows(session, select_sql, &opts.args, "merge", |tx, staged| {
        add_missing_columns(tx, table, staged)?;
        let matches = opts
            .unique_key
            .iter()
            .map(|key| {
                format!(
                    "{target}.{col} IS NOT DISTINCT FROM {staged}.{col}",
                    target = safe_name(table),
                    staged = safe_name(staged),
                    col = safe_name(key)
                )
            })
            .collect::<Vec<_>>()
            .join(" AND ");
        let deleted = tx.exec(&format!(
            "DELETE FROM {} USING {} WHERE {matches}",
            safe_name(table),
            safe_name(staged)
        ))?;
        debug!(deleted, "merge removed matching rows");
        insert_staged(tx, table, staged)
    })
}

fn partition_overwrite(
    session: &Session<'_>,
    table: &str,
    select_sql: &str,
    opts: &InsertTableOptions,
) -> Result<u64> {
    let partition_by = opts
        .partition_by
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| {
            DriverError::Validation("partition_overwrite strategy requires partition_by".to_string())
        })?;
    with_staged_rows(session, select_sql, &opts.args, "partition", |tx, staged| {
        add_missing_columns(tx, table, staged)?;
        // Inside the EXISTS, unqualified columns of the partition expression
        // resolve against the target table.
        let deleted = tx.exec(&format!(
            "DELETE FROM {target} WHERE EXISTS (\
                SELECT 1 FROM (SELECT DISTINCT ({partition_by}) AS __partition FROM {staged}) AS __partitions \
                WHERE __partitions.__partition IS NOT DISTINCT FROM ({partition_by}))",
            target = safe_name(table),
            staged = safe_name(staged),
        ))?;
        debug!(deleted, "partition overwrite removed rows");
        insert_staged(tx, table, staged)
    })
}

/// Materialize `select_sql` into a temporary table, run `apply` in a
/// transaction unless it is empty, then drop the temporary table.
fn with_staged_rows(
    session: &Session<'_>,
    select_sql: &str,
    args: &[Value],
    label: &str,
    apply: impl FnOnce(&Session<'_>, &str) -> Result<u64>,
) -> Result<u64> {
    let staged = temp_name(label);
    session.exec_with_args(
        &format!(
            "CREATE TEMPORARY TABLE {} AS ({}\n)",
            safe_name(&staged),
            trim_statement(select_sql)
        ),
        args,
    )?;
    let applied = (|| {
        let count = session
            .query_i64(&format!("SELECT count(*) FROM {}", safe_name(&staged)), &[])?
            .unwrap_or(0);
        if count == 0 {
            debug!("no new rows, skipping");
            return Ok(0);
        }
        session.transaction(|tx| apply(tx, &staged))
    })();
    let cleanup = session
        .exec(&format!("DROP TABLE IF EXISTS temp.main.{}", safe_name(&staged)))
        .map(|_| ());
    join_cleanup(applied, cleanup)
}

/// Add columns present in the staged rows but missing from the target. Runs
/// before any row of the target is touched in the transaction.
fn add_missing_columns(tx: &Session<'_>, table: &str, staged: &str) -> Result<()> {
    let existing: HashSet<String> = tx
        .describe_table(table)?
        .into_iter()
        .map(|c| c.name.to_lowercase())
        .collect();
    for column in tx.describe(&format!("SELECT * FROM {}", safe_name(staged)))? {
        if !existing.contains(&column.name.to_lowercase()) {
            add_table_column(tx, table, &column.name, &column.native_type)?;
        }
    }
    Ok(())
}

fn insert_staged(tx: &Session<'_>, table: &str, staged: &str) -> Result<u64> {
    let inserted = tx.exec(&format!(
        "INSERT INTO {} BY NAME SELECT * FROM {}",
        safe_name(table),
        safe_name(staged)
    ))?;
    Ok(inserted as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "partition_overwrite".parse::<IncrementalStrategy>().unwrap(),
            IncrementalStrategy::PartitionOverwrite
        );
        assert_eq!(
            "".parse::<IncrementalStrategy>().unwrap(),
            IncrementalStrategy::Unspecified
        );
        assert!("upsert".parse::<IncrementalStrategy>().is_err());
        assert_eq!(IncrementalStrategy::Merge.to_string(), "merge");
    }
}
