//! Table and view DDL primitives. Each runs entirely on the session it is
//! given.

use std::time::{Duration, Instant};

use duckdb::types::Value;
use tracing::{debug, instrument};

use crate::engine::{ObjectKind, Session};
use crate::error::{join_cleanup, DriverError, Result};
use crate::sql::{safe_name, safe_sql_string, temp_name, trim_statement};

#[derive(Debug, Clone, Default)]
pub struct CreateTableOptions {
    pub view: bool,
    /// SQL run on the same connection before the create.
    pub before_create: Option<String>,
    /// SQL run on the same connection after the create, even if it failed.
    pub after_create: Option<String>,
    /// Bound parameters of the select. Not allowed for views.
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableWriteMetrics {
    pub duration: Duration,
    pub rows: u64,
}

/// `CREATE TABLE|VIEW <name> AS (<select>)`, replacing any existing table or
/// view of that name in one transaction.
#[instrument(skip(session, select_sql, opts), fields(view = opts.view))]
pub fn create_table_as_select(
    session: &Session<'_>,
    name: &str,
    select_sql: &str,
    opts: &CreateTableOptions,
) -> Result<TableWriteMetrics> {
    if opts.view && !opts.args.is_empty() {
        return Err(DriverError::Validation(
            "views cannot be created with bound arguments".to_string(),
        ));
    }
    let start = Instant::now();
    let created = run_hook(session, opts.before_create.as_deref()).and_then(|()| {
        session.transaction(|tx| {
            if let Some(existing) = tx.object_kind(name)? {
                tx.exec(&format!("DROP {} {}", existing.keyword(), safe_name(name)))?;
            }
            let kind = if opts.view {
                ObjectKind::View
            } else {
                ObjectKind::Table
            };
            let sql = format!(
                "CREATE {} {} AS ({}\n)",
                kind.keyword(),
                safe_name(name),
                trim_statement(select_sql)
            );
            tx.exec_with_args(&sql, &opts.args)
        })
    });
    let after = run_hook(session, opts.after_create.as_deref());
    let rows = join_cleanup(created, after).map_err(|err| err.context("create", name))?;
    let metrics = TableWriteMetrics {
        duration: start.elapsed(),
        rows: if opts.view { 0 } else { rows as u64 },
    };
    debug!(rows = metrics.rows, elapsed_ms = metrics.duration.as_millis() as u64, "created");
    Ok(metrics)
}

/// Drop a table or view. Fails with not-found when nothing has that name.
#[instrument(skip(session))]
pub fn drop_table(session: &Session<'_>, name: &str) -> Result<()> {
    let kind = session
        .object_kind(name)?
        .ok_or_else(|| DriverError::NotFound(format!("table {name:?}")))?;
    session
        .exec(&format!("DROP {} IF EXISTS {}", kind.keyword(), safe_name(name)))
        .map_err(|err| err.context("drop", name))?;
    Ok(())
}

/// Rename `old` to `new`. An existing object named `new` is first moved to a
/// temporary name, then dropped once the rename succeeded; the whole sequence
/// is one transaction. Case-only renames go through a temporary name as well.
#[instrument(skip(session))]
pub fn rename_table(session: &Session<'_>, old: &str, new: &str) -> Result<()> {
    if old == new {
        return Ok(());
    }
    let kind = session
        .object_kind(old)?
        .ok_or_else(|| DriverError::NotFound(format!("table {old:?}")))?;
    session
        .transaction(|tx| {
            if old.eq_ignore_ascii_case(new) {
                let tmp = temp_name("rename");
                rename_object(tx, kind, old, &tmp)?;
                return rename_object(tx, kind, &tmp, new);
            }
            match tx.object_kind(new)? {
                Some(existing) => {
                    let aside = temp_name("replaced");
                    rename_object(tx, existing, new, &aside)?;
                    rename_object(tx, kind, old, new)?;
                    tx.exec(&format!("DROP {} {}", existing.keyword(), safe_name(&aside)))?;
                    Ok(())
                }
                None => rename_object(tx, kind, old, new),
            }
        })
        .map_err(|err| err.context("rename", format!("{old} -> {new}")))
}

fn rename_object(session: &Session<'_>, kind: ObjectKind, from: &str, to: &str) -> Result<()> {
    session.exec(&format!(
        "ALTER {} {} RENAME TO {}",
        kind.keyword(),
        safe_name(from),
        safe_name(to)
    ))?;
    Ok(())
}

pub fn add_table_column(session: &Session<'_>, table: &str, column: &str, native_type: &str) -> Result<()> {
    session
        .exec(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            safe_name(table),
            safe_name(column),
            native_type
        ))
        .map_err(|err| err.context("add column", format!("{table}.{column}")))?;
    Ok(())
}

pub fn alter_table_column(session: &Session<'_>, table: &str, column: &str, native_type: &str) -> Result<()> {
    session
        .exec(&format!(
            "ALTER TABLE {} ALTER COLUMN {} SET DATA TYPE {}",
            safe_name(table),
            safe_name(column),
            native_type
        ))
        .map_err(|err| err.context("alter column", format!("{table}.{column}")))?;
    Ok(())
}

/// Retype each listed column as an ENUM of its distinct non-null values.
/// Columns without any value are left as they are.
pub fn convert_to_enum(session: &Session<'_>, table: &str, columns: &[String]) -> Result<()> {
    for column in columns {
        let sql = format!(
            "SELECT DISTINCT {col}::VARCHAR FROM {} WHERE {col} IS NOT NULL ORDER BY 1",
            safe_name(table),
            col = safe_name(column)
        );
        let mut stmt = session.connection().prepare(&sql)?;
        let mut values = Vec::new();
        for value in stmt.query_map([], |row| row.get::<_, String>(0))? {
            values.push(safe_sql_string(&value?));
        }
        if values.is_empty() {
            debug!(table, column = %column, "no values to build an enum from");
            continue;
        }
        alter_table_column(session, table, column, &format!("ENUM({})", values.join(", ")))
            .map_err(|err| err.context("cast to enum", format!("{table}.{column}")))?;
        debug!(table, column = %column, labels = values.len(), "converted column to enum");
    }
    Ok(())
}

pub(crate) fn run_hook(session: &Session<'_>, sql: Option<&str>) -> Result<()> {
    match sql {
        Some(sql) if !sql.trim().is_empty() => session.exec_batch(sql),
        _ => Ok(()),
    }
}
