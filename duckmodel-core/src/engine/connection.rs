//! Explicit session handle over one checked-out DuckDB connection.
//!
//! Every primitive that must run on a single connection (DDL sequences,
//! temp tables, hooks) takes a `&Session` instead of acquiring its own
//! connection, so nested calls never go back to the pool.

use arrow_array::RecordBatch;
use arrow_schema::Schema;
use duckdb::types::Value;
use duckdb::{params_from_iter, Connection};
use tracing::debug;

use crate::error::{DriverError, Result};
use crate::sql::{safe_name, trim_statement};

/// Result of a query execution
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub schema: Schema,
    pub batches: Vec<RecordBatch>,
    pub total_rows: usize,
    pub total_bytes: usize,
}

/// One column as reported by `DESCRIBE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    pub name: String,
    pub native_type: String,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Table,
    View,
}

impl ObjectKind {
    pub fn keyword(self) -> &'static str {
        match self {
            ObjectKind::Table => "TABLE",
            ObjectKind::View => "VIEW",
        }
    }
}

pub struct Session<'a> {
    conn: &'a Connection,
    log_queries: bool,
}

impl<'a> Session<'a> {
    pub fn new(conn: &'a Connection, log_queries: bool) -> Self {
        Self { conn, log_queries }
    }

    /// Underlying connection, for calls not covered here.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    fn log(&self, sql: &str) {
        if self.log_queries {
            debug!(sql = %sql, "executing");
        }
    }

    /// Execute a single statement and return the affected row count.
    pub fn exec(&self, sql: &str) -> Result<usize> {
        self.exec_with_args(sql, &[])
    }

    pub fn exec_with_args(&self, sql: &str, args: &[Value]) -> Result<usize> {
        reject_nul(sql)?;
        self.log(sql);
        let mut stmt = self.conn.prepare(sql)?;
        let affected = if args.is_empty() {
            stmt.execute([])?
        } else {
            stmt.execute(params_from_iter(args.iter()))?
        };
        Ok(affected)
    }

    /// Execute a script of one or more statements.
    pub fn exec_batch(&self, sql: &str) -> Result<()> {
        reject_nul(sql)?;
        if sql.trim().is_empty() {
            return Ok(());
        }
        self.log(sql);
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn query(&self, sql: &str, args: &[Value]) -> Result<QueryResult> {
        reject_nul(sql)?;
        self.log(sql);
        let mut stmt = self.conn.prepare(sql)?;
        let arrow = if args.is_empty() {
            stmt.query_arrow([])?
        } else {
            stmt.query_arrow(params_from_iter(args.iter()))?
        };
        let schema = arrow.get_schema();

        let mut total_rows = 0usize;
        let mut total_bytes = 0usize;
        let batches: Vec<RecordBatch> = arrow
            .inspect(|batch| {
                total_rows += batch.num_rows();
                total_bytes += batch.get_array_memory_size();
            })
            .collect();
        Ok(QueryResult {
            schema: schema.as_ref().clone(),
            batches,
            total_rows,
            total_bytes,
        })
    }

    /// First column of the first row as an integer, `None` when empty.
    pub fn query_i64(&self, sql: &str, args: &[Value]) -> Result<Option<i64>> {
        reject_nul(sql)?;
        self.log(sql);
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        match rows.next()? {
            Some(row) => Ok(row.get::<_, Option<i64>>(0)?),
            None => Ok(None),
        }
    }

    /// Schema of an arbitrary query, without running it to completion.
    pub fn describe(&self, query: &str) -> Result<Vec<ColumnSchema>> {
        self.describe_raw(&format!("DESCRIBE ({})", trim_statement(query)))
    }

    pub fn describe_table(&self, table: &str) -> Result<Vec<ColumnSchema>> {
        self.describe_raw(&format!("DESCRIBE {}", safe_name(table)))
    }

    fn describe_raw(&self, sql: &str) -> Result<Vec<ColumnSchema>> {
        self.log(sql);
        let mut stmt = self.conn.prepare(sql)?;
        let mapped = stmt.query_map([], |row| {
            Ok(ColumnSchema {
                name: row.get::<_, String>(0)?,
                native_type: row.get::<_, String>(1)?,
                nullable: row
                    .get::<_, Option<String>>(2)?
                    .map(|null| null == "YES")
                    .unwrap_or(true),
            })
        })?;
        let mut columns = Vec::new();
        for column in mapped {
            columns.push(column?);
        }
        Ok(columns)
    }

    /// Whether `name` is a table or a view in the current schema. Matching is
    /// case-insensitive like the engine's identifier resolution.
    pub fn object_kind(&self, name: &str) -> Result<Option<ObjectKind>> {
        let mut stmt = self.conn.prepare(
            "SELECT table_type FROM information_schema.tables \
             WHERE table_catalog = current_database() AND table_schema = current_schema() \
             AND lower(table_name) = lower(?) LIMIT 1",
        )?;
        let mut rows = stmt.query([name])?;
        match rows.next()? {
            Some(row) => {
                let table_type: String = row.get(0)?;
                Ok(Some(if table_type == "VIEW" {
                    ObjectKind::View
                } else {
                    ObjectKind::Table
                }))
            }
            None => Ok(None),
        }
    }

    /// Bulk insert Arrow batches into an existing table.
    pub fn append_batches(&self, table: &str, batches: Vec<RecordBatch>) -> Result<usize> {
        let total_rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        if total_rows == 0 {
            return Ok(0);
        }
        let mut appender = self.conn.appender(table)?;
        for batch in batches {
            appender.append_record_batch(batch)?;
        }
        appender.flush()?;
        debug!(rows = total_rows, table = %table, "appended record batches");
        Ok(total_rows)
    }

    /// Run `f` inside a transaction on this connection, rolling back on error.
    pub fn transaction<T>(&self, f: impl FnOnce(&Session<'a>) -> Result<T>) -> Result<T> {
        self.exec_batch("BEGIN TRANSACTION")?;
        match f(self) {
            Ok(value) => {
                self.exec_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.exec_batch("ROLLBACK") {
                    return Err(DriverError::Cleanup {
                        primary: Box::new(err),
                        cleanup: Box::new(rollback),
                    });
                }
                Err(err)
            }
        }
    }
}

fn reject_nul(sql: &str) -> Result<()> {
    if sql.contains('\0') {
        return Err(DriverError::Validation(
            "SQL contains null bytes".to_string(),
        ));
    }
    Ok(())
}
