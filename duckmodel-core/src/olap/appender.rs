//! Batch appender that lets a target table absorb batches with drifting
//! schemas.
//!
//! With relaxation allowed, every batch is inserted by name. A binder or
//! conversion failure triggers a schema diff against the union of the target
//! and the batch: missing columns are added, changed types are widened, and
//! the insert is retried once. Without relaxation, a batch whose columns or
//! types differ from the target is rejected before anything is written.

use std::collections::HashMap;
use std::path::Path;

use tracing::{info, instrument, warn};

use crate::context::Context;
use crate::engine::{ColumnSchema, Session};
use crate::error::{DriverError, Result};
use crate::olap::crud::{add_table_column, alter_table_column, TableWriteMetrics};
use crate::olap::incremental::{insert_table_as_select, IncrementalStrategy, InsertTableOptions};
use crate::olap::Olap;
use crate::sql::{safe_name, trim_statement};

pub struct SchemaEvolvingAppender<'a> {
    olap: &'a Olap,
    table: String,
    allow_schema_relaxation: bool,
    priority: i32,
    table_schema: Option<Vec<ColumnSchema>>,
}

impl<'a> SchemaEvolvingAppender<'a> {
    pub fn new(olap: &'a Olap, table: impl Into<String>, allow_schema_relaxation: bool) -> Self {
        Self {
            olap,
            table: table.into(),
            allow_schema_relaxation,
            priority: 0,
            table_schema: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Append the rows of `select_sql`, which reads `files`. The file names
    /// only appear in error messages.
    #[instrument(skip(self, ctx, select_sql), fields(table = %self.table, files = files.len()))]
    pub fn append(&mut self, ctx: &Context, select_sql: &str, files: &[String]) -> Result<TableWriteMetrics> {
        let olap = self.olap;
        olap.with_connection(ctx, self.priority, |session| {
            if self.allow_schema_relaxation {
                self.append_relaxed(session, select_sql)
            } else {
                self.append_strict(session, select_sql, files)
            }
        })
    }

    fn insert_options(&self, by_name: bool) -> InsertTableOptions {
        InsertTableOptions {
            by_name,
            strategy: IncrementalStrategy::Append,
            ..Default::default()
        }
    }

    fn append_relaxed(&mut self, session: &Session<'_>, select_sql: &str) -> Result<TableWriteMetrics> {
        let opts = self.insert_options(true);
        match insert_table_as_select(session, &self.table, select_sql, &opts) {
            Ok(metrics) => Ok(metrics),
            Err(err) if err.is_schema_mismatch() => {
                warn!(error = %err, "batch does not match table schema, relaxing");
                self.relax_schema(session, select_sql)?;
                insert_table_as_select(session, &self.table, select_sql, &opts)
            }
            Err(err) => Err(err),
        }
    }

    fn append_strict(
        &mut self,
        session: &Session<'_>,
        select_sql: &str,
        files: &[String],
    ) -> Result<TableWriteMetrics> {
        let source = session.describe(select_sql)?;
        let target = self.cached_table_schema(session)?.to_vec();
        check_compatible(&target, &source, files)?;
        insert_table_as_select(session, &self.table, select_sql, &self.insert_options(false))
    }

    fn cached_table_schema(&mut self, session: &Session<'_>) -> Result<&[ColumnSchema]> {
        if self.table_schema.is_none() {
            self.table_schema = Some(session.describe_table(&self.table)?);
        }
        Ok(self.table_schema.as_deref().unwrap_or_default())
    }

    fn relax_schema(&mut self, session: &Session<'_>, select_sql: &str) -> Result<()> {
        let union = session.describe(&format!(
            "(SELECT * FROM {} LIMIT 0) UNION ALL BY NAME ({})",
            safe_name(&self.table),
            trim_statement(select_sql)
        ))?;
        let current: HashMap<String, String> = self
            .cached_table_schema(session)?
            .iter()
            .map(|c| (c.name.to_lowercase(), c.native_type.clone()))
            .collect();

        let mut added = Vec::new();
        let mut widened = Vec::new();
        for column in &union {
            match current.get(&column.name.to_lowercase()) {
                None => {
                    add_table_column(session, &self.table, &column.name, &column.native_type)?;
                    added.push(column.name.clone());
                }
                Some(existing) if existing != &column.native_type => {
                    alter_table_column(session, &self.table, &column.name, &column.native_type)?;
                    widened.push(column.name.clone());
                }
                Some(_) => {}
            }
        }
        if added.is_empty() && widened.is_empty() {
            return Err(DriverError::SchemaIncompatible(format!(
                "batch cannot be inserted into {:?} and no schema change applies",
                self.table
            )));
        }
        info!(?added, ?widened, table = %self.table, "relaxed table schema");
        self.table_schema = Some(union);
        Ok(())
    }
}

/// Reject a batch whose columns differ from the target in count, name, order
/// or type.
fn check_compatible(target: &[ColumnSchema], source: &[ColumnSchema], files: &[String]) -> Result<()> {
    let files = file_names(files);
    let target_names: Vec<String> = target.iter().map(|c| c.name.to_lowercase()).collect();
    let source_names: Vec<String> = source.iter().map(|c| c.name.to_lowercase()).collect();

    let new_columns: Vec<&str> = source
        .iter()
        .filter(|c| !target_names.contains(&c.name.to_lowercase()))
        .map(|c| c.name.as_str())
        .collect();
    if !new_columns.is_empty() {
        return Err(DriverError::SchemaIncompatible(format!(
            "new files {files:?} have new columns {:?} and schema relaxation not allowed",
            new_columns.join(",")
        )));
    }
    let missing: Vec<&str> = target
        .iter()
        .filter(|c| !source_names.contains(&c.name.to_lowercase()))
        .map(|c| c.name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(DriverError::SchemaIncompatible(format!(
            "new files {files:?} are missing columns {:?} and schema relaxation not allowed",
            missing.join(",")
        )));
    }
    if target_names != source_names {
        return Err(DriverError::SchemaIncompatible(format!(
            "new files {files:?} change the column order to {:?} and schema relaxation not allowed",
            source_names.join(",")
        )));
    }
    let changed: Vec<&str> = target
        .iter()
        .zip(source)
        .filter(|(t, s)| t.native_type != s.native_type)
        .map(|(t, _)| t.name.as_str())
        .collect();
    if !changed.is_empty() {
        return Err(DriverError::SchemaIncompatible(format!(
            "new files {files:?} change datatypes of some columns {:?} and schema relaxation not allowed",
            changed.join(",")
        )));
    }
    Ok(())
}

fn file_names(files: &[String]) -> String {
    files
        .iter()
        .map(|f| {
            Path::new(f)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(f)
                .to_string()
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, native_type: &str) -> ColumnSchema {
        ColumnSchema {
            name: name.to_string(),
            native_type: native_type.to_string(),
            nullable: true,
        }
    }

    #[test]
    fn identical_schemas_are_compatible() {
        let schema = vec![col("a", "INTEGER"), col("b", "VARCHAR")];
        assert!(check_compatible(&schema, &schema, &[]).is_ok());
    }

    #[test]
    fn differences_name_files_and_columns() {
        let target = vec![col("a", "INTEGER"), col("b", "VARCHAR")];
        let files = vec!["/tmp/in/part-2.csv".to_string()];

        let err = check_compatible(&target, &[col("a", "INTEGER")], &files).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("part-2.csv") && msg.contains("missing columns") && msg.contains('b'));
        assert!(!msg.contains("/tmp/in"));

        let err = check_compatible(
            &target,
            &[col("a", "INTEGER"), col("b", "VARCHAR"), col("c", "DOUBLE")],
            &files,
        )
        .unwrap_err();
        assert!(err.to_string().contains("new columns \"c\""));

        let err = check_compatible(&target, &[col("b", "VARCHAR"), col("a", "INTEGER")], &files)
            .unwrap_err();
        assert!(err.to_string().contains("column order"));

        let err = check_compatible(&target, &[col("a", "BIGINT"), col("b", "VARCHAR")], &files)
            .unwrap_err();
        assert!(err.to_string().contains("change datatypes"));
        assert!(err.is_schema_mismatch());
    }
}
