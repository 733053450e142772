//! Numbered schema migrations for the internal `_catalog` schema.

use tracing::info;

use crate::context::Context;
use crate::engine::{ConnectionPool, Session};
use crate::error::{DriverError, Result};

pub const CATALOG_SCHEMA: &str = "_catalog";

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS _catalog.controller_version (version BIGINT NOT NULL);
         INSERT INTO _catalog.controller_version
             SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM _catalog.controller_version);
         CREATE TABLE IF NOT EXISTS _catalog.resources (
             kind VARCHAR NOT NULL,
             name VARCHAR NOT NULL,
             data BLOB,
             created_on TIMESTAMP NOT NULL,
             updated_on TIMESTAMP NOT NULL
         );",
    ),
];

pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}

/// Apply every migration newer than the recorded version. Safe to call on
/// every open.
pub fn migrate(pool: &ConnectionPool, ctx: &Context) -> Result<i64> {
    pool.with_meta_connection(ctx, |session| {
        session.exec_batch(
            "CREATE SCHEMA IF NOT EXISTS _catalog;
             CREATE TABLE IF NOT EXISTS _catalog.migration_version (version BIGINT NOT NULL);",
        )?;
        let mut current = current_version(session)?;
        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            session
                .transaction(|tx| {
                    tx.exec_batch(sql)?;
                    tx.exec("DELETE FROM _catalog.migration_version")?;
                    tx.exec_with_args(
                        "INSERT INTO _catalog.migration_version VALUES (?)",
                        &[duckdb::types::Value::BigInt(*version)],
                    )?;
                    Ok(())
                })
                .map_err(|err| err.context("migrate", format!("version {version}")))?;
            info!(version, "applied catalog migration");
            current = *version;
        }
        Ok(current)
    })
}

pub fn current_version(session: &Session<'_>) -> Result<i64> {
    session
        .query_i64("SELECT max(version) FROM _catalog.migration_version", &[])
        .map(|v| v.unwrap_or(0))
}

/// Version recorded in the database, failing if migrations never ran.
pub fn applied_version(pool: &ConnectionPool, ctx: &Context) -> Result<i64> {
    pool.with_meta_connection(ctx, |session| {
        let tables = session.query_i64(
            "SELECT count(*) FROM information_schema.tables
             WHERE table_catalog = current_database()
               AND table_schema = ? AND table_name = 'migration_version'",
            &[duckdb::types::Value::Text(CATALOG_SCHEMA.to_string())],
        )?;
        if tables.unwrap_or(0) == 0 {
            return Err(DriverError::NotFound("catalog has not been migrated".to_string()));
        }
        current_version(session)
    })
}
