//! Versioned resource catalog with optimistic concurrency control.
//!
//! Every mutation presents the controller version it was computed against
//! and is rejected when the stored version moved on. All calls run on the
//! pool's reserved catalog connection, which serializes the version check
//! with the mutation that follows it.
//!
//! Resource identity is `(kind, lower(name))`. Uniqueness is enforced here
//! with an explicit existence query rather than an engine index.

use chrono::{DateTime, Utc};
use duckdb::params;
use tracing::{debug, instrument};

use crate::context::Context;
use crate::engine::{ConnectionPool, Session};
use crate::error::{DriverError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: String,
    pub name: String,
    pub data: Vec<u8>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl Resource {
    pub fn new(kind: impl Into<String>, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let now = now_millis();
        Self {
            kind: kind.into(),
            name: name.into(),
            data: data.into(),
            created_on: now,
            updated_on: now,
        }
    }
}

#[derive(Clone)]
pub struct CatalogStore {
    pool: ConnectionPool,
}

impl CatalogStore {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Atomically increment the controller version and return the new value.
    #[instrument(skip(self, ctx))]
    pub fn next_controller_version(&self, ctx: &Context) -> Result<i64> {
        self.pool.with_meta_connection(ctx, |session| {
            let version = session
                .query_i64(
                    "UPDATE _catalog.controller_version SET version = version + 1 RETURNING version",
                    &[],
                )?
                .ok_or_else(|| {
                    DriverError::Internal("controller version row is missing".to_string())
                })?;
            debug!(version, "advanced controller version");
            Ok(version)
        })
    }

    pub fn check_controller_version(&self, ctx: &Context, expected: i64) -> Result<()> {
        self.pool
            .with_meta_connection(ctx, |session| check_version(session, expected))
    }

    /// All resources ordered by kind, then case-insensitive name.
    pub fn find_resources(&self, ctx: &Context) -> Result<Vec<Resource>> {
        self.pool.with_meta_connection(ctx, |session| {
            let mut stmt = session.connection().prepare(
                "SELECT kind, name, data, epoch_ms(created_on), epoch_ms(updated_on) \
                 FROM _catalog.resources ORDER BY kind, lower(name)",
            )?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })?;
            let mut resources = Vec::new();
            for row in mapped {
                let (kind, name, data, created_ms, updated_ms) = row?;
                resources.push(Resource {
                    created_on: from_millis(created_ms, &kind, &name)?,
                    updated_on: from_millis(updated_ms, &kind, &name)?,
                    kind,
                    name,
                    data: data.unwrap_or_default(),
                });
            }
            Ok(resources)
        })
    }

    #[instrument(skip(self, ctx, resource), fields(kind = %resource.kind, name = %resource.name))]
    pub fn create_resource(&self, ctx: &Context, expected_version: i64, resource: &Resource) -> Result<()> {
        self.pool.with_meta_connection(ctx, |session| {
            check_version(session, expected_version)?;
            let existing = session.query_i64(
                "SELECT count(*) FROM _catalog.resources WHERE kind = ? AND lower(name) = lower(?)",
                &[
                    duckdb::types::Value::Text(resource.kind.clone()),
                    duckdb::types::Value::Text(resource.name.clone()),
                ],
            )?;
            if existing.unwrap_or(0) > 0 {
                return Err(DriverError::ResourceExists {
                    kind: resource.kind.clone(),
                    name: resource.name.clone(),
                });
            }
            session.connection().execute(
                "INSERT INTO _catalog.resources (kind, name, data, created_on, updated_on) \
                 VALUES (?, ?, ?, epoch_ms(?::BIGINT), epoch_ms(?::BIGINT))",
                params![
                    resource.kind,
                    resource.name,
                    resource.data,
                    resource.created_on.timestamp_millis(),
                    resource.updated_on.timestamp_millis()
                ],
            )?;
            Ok(())
        })
    }

    /// Replace `data` and `updated_on` of an existing resource.
    #[instrument(skip(self, ctx, resource), fields(kind = %resource.kind, name = %resource.name))]
    pub fn update_resource(&self, ctx: &Context, expected_version: i64, resource: &Resource) -> Result<()> {
        self.pool.with_meta_connection(ctx, |session| {
            check_version(session, expected_version)?;
            let affected = session.connection().execute(
                "UPDATE _catalog.resources SET data = ?, updated_on = epoch_ms(?::BIGINT) \
                 WHERE kind = ? AND lower(name) = lower(?)",
                params![
                    resource.data,
                    resource.updated_on.timestamp_millis(),
                    resource.kind,
                    resource.name
                ],
            )?;
            if affected == 0 {
                return Err(not_found(&resource.kind, &resource.name));
            }
            Ok(())
        })
    }

    #[instrument(skip(self, ctx))]
    pub fn delete_resource(&self, ctx: &Context, expected_version: i64, kind: &str, name: &str) -> Result<()> {
        self.pool.with_meta_connection(ctx, |session| {
            check_version(session, expected_version)?;
            let affected = session.connection().execute(
                "DELETE FROM _catalog.resources WHERE kind = ? AND lower(name) = lower(?)",
                params![kind, name],
            )?;
            if affected == 0 {
                return Err(not_found(kind, name));
            }
            Ok(())
        })
    }

    pub fn delete_all_resources(&self, ctx: &Context) -> Result<()> {
        self.pool.with_meta_connection(ctx, |session| {
            session.exec("DELETE FROM _catalog.resources")?;
            Ok(())
        })
    }
}

fn check_version(session: &Session<'_>, expected: i64) -> Result<()> {
    let actual = session
        .query_i64("SELECT version FROM _catalog.controller_version LIMIT 1", &[])?
        .ok_or_else(|| DriverError::Internal("controller version row is missing".to_string()))?;
    if actual != expected {
        return Err(DriverError::InconsistentControllerVersion { expected, actual });
    }
    Ok(())
}

fn not_found(kind: &str, name: &str) -> DriverError {
    DriverError::NotFound(format!("resource kind={kind} name={name}"))
}

fn from_millis(ms: i64, kind: &str, name: &str) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        DriverError::Internal(format!(
            "resource kind={kind} name={name} has an out of range timestamp {ms}"
        ))
    })
}

fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::<Utc>::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
