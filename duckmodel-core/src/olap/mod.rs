//! OLAP surface of the driver: ad-hoc statements plus the table primitives,
//! each executed on one pooled connection.

pub mod appender;
pub mod crud;
pub mod incremental;

use arrow_array::RecordBatch;
use duckdb::types::Value;
use tracing::instrument;

use crate::context::Context;
use crate::engine::{ConnectionPool, QueryResult, Session};
use crate::error::Result;
use crate::information_schema::InformationSchema;

pub use appender::SchemaEvolvingAppender;
pub use crud::{CreateTableOptions, TableWriteMetrics};
pub use incremental::{IncrementalStrategy, InsertTableOptions};

#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub query: String,
    pub args: Vec<Value>,
    /// Higher values are served first when the pool is contended.
    pub priority: i32,
}

impl Statement {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Clone)]
pub struct Olap {
    pool: ConnectionPool,
    storage_limit_bytes: Option<u64>,
}

impl Olap {
    pub fn new(pool: ConnectionPool, storage_limit_bytes: Option<u64>) -> Self {
        Self {
            pool,
            storage_limit_bytes,
        }
    }

    /// Run `f` with an explicit session on one checked-out connection.
    /// Primitives called with that session reuse the connection.
    pub fn with_connection<T>(
        &self,
        ctx: &Context,
        priority: i32,
        f: impl FnOnce(&Session<'_>) -> Result<T>,
    ) -> Result<T> {
        self.pool.with_connection(ctx, priority, f)
    }

    #[instrument(skip(self, ctx, stmt), fields(sql = %stmt.query))]
    pub fn execute(&self, ctx: &Context, stmt: &Statement) -> Result<QueryResult> {
        self.with_connection(ctx, stmt.priority, |session| {
            session.query(&stmt.query, &stmt.args)
        })
    }

    /// Execute a statement and return the affected row count.
    pub fn exec(&self, ctx: &Context, stmt: &Statement) -> Result<usize> {
        self.with_connection(ctx, stmt.priority, |session| {
            session.exec_with_args(&stmt.query, &stmt.args)
        })
    }

    pub fn create_table_as_select(
        &self,
        ctx: &Context,
        name: &str,
        select_sql: &str,
        opts: &CreateTableOptions,
    ) -> Result<TableWriteMetrics> {
        self.with_connection(ctx, 0, |session| {
            crud::create_table_as_select(session, name, select_sql, opts)
        })
    }

    pub fn insert_table_as_select(
        &self,
        ctx: &Context,
        name: &str,
        select_sql: &str,
        opts: &InsertTableOptions,
    ) -> Result<TableWriteMetrics> {
        self.with_connection(ctx, 0, |session| {
            incremental::insert_table_as_select(session, name, select_sql, opts)
        })
    }

    pub fn drop_table(&self, ctx: &Context, name: &str) -> Result<()> {
        self.with_connection(ctx, 0, |session| crud::drop_table(session, name))
    }

    pub fn rename_table(&self, ctx: &Context, old: &str, new: &str) -> Result<()> {
        self.with_connection(ctx, 0, |session| crud::rename_table(session, old, new))
    }

    pub fn add_table_column(&self, ctx: &Context, table: &str, column: &str, native_type: &str) -> Result<()> {
        self.with_connection(ctx, 0, |session| {
            crud::add_table_column(session, table, column, native_type)
        })
    }

    pub fn alter_table_column(&self, ctx: &Context, table: &str, column: &str, native_type: &str) -> Result<()> {
        self.with_connection(ctx, 0, |session| {
            crud::alter_table_column(session, table, column, native_type)
        })
    }

    /// Bulk insert Arrow batches into an existing table.
    pub fn append_batches(&self, ctx: &Context, table: &str, batches: Vec<RecordBatch>) -> Result<usize> {
        self.with_connection(ctx, 0, |session| session.append_batches(table, batches))
    }

    /// Bytes used by the database file (zero for in-memory databases).
    pub fn database_size(&self, ctx: &Context) -> Result<u64> {
        self.with_connection(ctx, 0, |session| {
            let size = session.query_i64(
                "SELECT coalesce(sum(block_size * total_blocks), 0)::BIGINT \
                 FROM pragma_database_size() WHERE database_name = current_database()",
                &[],
            )?;
            Ok(size.unwrap_or(0).max(0) as u64)
        })
    }

    /// Whether `incoming` more bytes fit in the configured storage budget.
    pub fn within_storage_limit(&self, ctx: &Context, incoming: u64) -> Result<bool> {
        match self.storage_limit_bytes {
            None => Ok(true),
            Some(limit) => {
                let used = self.database_size(ctx)?;
                Ok(used.saturating_add(incoming) <= limit)
            }
        }
    }

    pub fn storage_limit_bytes(&self) -> Option<u64> {
        self.storage_limit_bytes
    }

    pub fn information_schema(&self) -> InformationSchema {
        InformationSchema::new(self.pool.clone())
    }
}
