//! Live reflection over physical tables and views.
//!
//! Nothing is cached: every call joins the engine's `information_schema`
//! views and maps each column type through the type bridge.

use tracing::instrument;

use crate::context::Context;
use crate::engine::{ConnectionPool, Session};
use crate::error::{DriverError, Result};
use crate::migrations::CATALOG_SCHEMA;
use crate::types::{native_type_to_canonical, CanonicalType};

/// Priority of reflection queries, above regular analytic work.
const REFLECTION_PRIORITY: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub database: String,
    pub schema: String,
    pub name: String,
    pub is_view: bool,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub data_type: CanonicalType,
}

impl Table {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

struct ColumnRow {
    database: String,
    schema: String,
    table: String,
    table_type: String,
    column: Option<String>,
    data_type: Option<String>,
    nullable: Option<String>,
}

#[derive(Clone)]
pub struct InformationSchema {
    pool: ConnectionPool,
}

impl InformationSchema {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Every user table and view in the current database.
    #[instrument(skip(self, ctx))]
    pub fn all(&self, ctx: &Context) -> Result<Vec<Table>> {
        self.pool
            .with_connection(ctx, REFLECTION_PRIORITY, |session| all_tables(session))
    }

    /// Case-insensitive lookup in the current schema.
    #[instrument(skip(self, ctx))]
    pub fn lookup(&self, ctx: &Context, name: &str) -> Result<Table> {
        self.pool
            .with_connection(ctx, REFLECTION_PRIORITY, |session| lookup_table(session, name))
    }
}

pub fn all_tables(session: &Session<'_>) -> Result<Vec<Table>> {
    let rows = query_columns(session, None)?;
    group_tables(rows)
}

pub fn lookup_table(session: &Session<'_>, name: &str) -> Result<Table> {
    let rows = query_columns(session, Some(name))?;
    group_tables(rows)?
        .into_iter()
        .next()
        .ok_or_else(|| DriverError::NotFound(format!("table {name:?}")))
}

fn query_columns(session: &Session<'_>, name: Option<&str>) -> Result<Vec<ColumnRow>> {
    let filter = if name.is_some() {
        "AND t.table_schema = current_schema() AND lower(t.table_name) = lower(?)"
    } else {
        ""
    };
    let sql = format!(
        "SELECT t.table_catalog, t.table_schema, t.table_name, t.table_type, \
                c.column_name, c.data_type, c.is_nullable \
         FROM information_schema.tables t \
         LEFT JOIN information_schema.columns c \
           ON t.table_catalog = c.table_catalog \
          AND t.table_schema = c.table_schema \
          AND t.table_name = c.table_name \
         WHERE t.table_catalog = current_database() \
           AND t.table_schema NOT IN ('information_schema', 'pg_catalog', '{CATALOG_SCHEMA}') \
           {filter} \
         ORDER BY t.table_schema, t.table_name, c.ordinal_position"
    );
    let mut stmt = session.connection().prepare(&sql)?;
    let map_row = |row: &duckdb::Row<'_>| -> duckdb::Result<ColumnRow> {
        Ok(ColumnRow {
            database: row.get(0)?,
            schema: row.get(1)?,
            table: row.get(2)?,
            table_type: row.get(3)?,
            column: row.get(4)?,
            data_type: row.get(5)?,
            nullable: row.get(6)?,
        })
    };
    let mapped = match name {
        Some(name) => stmt.query_map([name], map_row)?,
        None => stmt.query_map([], map_row)?,
    };
    let mut rows = Vec::new();
    for row in mapped {
        rows.push(row?);
    }
    Ok(rows)
}

/// Fold flat column rows (already ordered by table, then ordinal) into tables.
fn group_tables(rows: Vec<ColumnRow>) -> Result<Vec<Table>> {
    let mut tables: Vec<Table> = Vec::new();
    for row in rows {
        let same_table = tables.last().is_some_and(|t| {
            t.database == row.database && t.schema == row.schema && t.name == row.table
        });
        if !same_table {
            tables.push(Table {
                database: row.database.clone(),
                schema: row.schema.clone(),
                name: row.table.clone(),
                is_view: row.table_type == "VIEW",
                fields: Vec::new(),
            });
        }
        if let (Some(column), Some(data_type)) = (row.column, row.data_type) {
            let nullable = row.nullable.as_deref() != Some("NO");
            let canonical = native_type_to_canonical(&data_type, nullable).map_err(|err| {
                err.context("map column type", format!("{}.{}", row.table, column))
            })?;
            if let Some(table) = tables.last_mut() {
                table.fields.push(Field {
                    name: column,
                    data_type: canonical,
                });
            }
        }
    }
    Ok(tables)
}
