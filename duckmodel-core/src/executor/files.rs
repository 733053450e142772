//! Executors ingesting files into this database: local file stores, object
//! stores, warehouse exports and plain HTTPS URLs.
//!
//! Files arrive in batches. On a full run the first batch creates the staging
//! table and later batches go through the schema-evolving appender; on an
//! incremental run every batch is folded into the existing table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::config::PropertyMap;
use crate::connectors::{Connector, FileIterator, FileList, FileStore, ObjectStore, Warehouse};
use crate::context::Context;
use crate::error::{join_cleanup, DriverError, Result};
use crate::executor::materialize::{
    count_rows, drop_if_exists, incremental_base, insert_options, needs_strategy_insert, table_result,
    OutputTarget,
};
use crate::executor::properties::{decode, string_or_list, FileInputProperties, ModelOutputProperties};
use crate::executor::{ExecutorParts, ModelExecuteOptions, ModelExecutor, ModelResult, ModelStats};
use crate::olap::crud::convert_to_enum;
use crate::olap::{CreateTableOptions, Olap, SchemaEvolvingAppender, TableWriteMetrics};
use crate::sql::{full_extension, safe_name, safe_sql_string, source_reader, temp_name};

enum FileSource {
    Store(Arc<dyn FileStore>),
    Objects(Arc<dyn ObjectStore>),
    Warehouse(Arc<dyn Warehouse>),
    Https {
        urls: Vec<String>,
        headers: BTreeMap<String, String>,
    },
}

pub struct FilesToSelfExecutor {
    olap: Olap,
    source: FileSource,
    /// Raw input properties, handed to the connector.
    props: PropertyMap,
    file: FileInputProperties,
    output: ModelOutputProperties,
    incremental: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HttpsInputProperties {
    #[serde(deserialize_with = "string_or_list")]
    path: Vec<String>,
}

fn build(parts: &ExecutorParts<'_>, source: FileSource) -> Result<Box<dyn ModelExecutor>> {
    let file: FileInputProperties = decode("input", &parts.spec.input_properties)?;
    file.reader_options()?;
    let mut output: ModelOutputProperties = decode("output", &parts.spec.output_properties)?;
    output.validate(parts.spec.incremental)?;
    Ok(Box::new(FilesToSelfExecutor {
        olap: parts.olap.clone(),
        source,
        props: parts.spec.input_properties.clone(),
        file,
        output,
        incremental: parts.spec.incremental,
    }))
}

fn mismatched(parts: &ExecutorParts<'_>) -> DriverError {
    DriverError::Internal(format!("unexpected input connector {:?}", parts.input))
}

pub fn build_file_store_to_self(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    match parts.input {
        Connector::File(store) => build(parts, FileSource::Store(store.clone())),
        _ => Err(mismatched(parts)),
    }
}

pub fn build_object_store_to_self(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    match parts.input {
        Connector::ObjectStore(store) => build(parts, FileSource::Objects(store.clone())),
        _ => Err(mismatched(parts)),
    }
}

pub fn build_warehouse_to_self(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    match parts.input {
        Connector::Warehouse(warehouse) => build(parts, FileSource::Warehouse(warehouse.clone())),
        _ => Err(mismatched(parts)),
    }
}

pub fn build_https_to_self(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    let Connector::Https(config) = parts.input else {
        return Err(mismatched(parts));
    };
    let https: HttpsInputProperties = decode("input", &parts.spec.input_properties)?;
    if https.path.is_empty() {
        return Err(DriverError::Validation("missing property 'path'".to_string()));
    }
    if let Some(url) = https.path.iter().find(|u| !u.starts_with("https://") && !u.starts_with("http://")) {
        return Err(DriverError::Validation(format!("invalid URL {url:?}")));
    }
    build(
        parts,
        FileSource::Https {
            urls: https.path,
            headers: config.headers.clone(),
        },
    )
}

impl FilesToSelfExecutor {
    fn open(&self, ctx: &Context) -> Result<Box<dyn FileIterator>> {
        Ok(match &self.source {
            FileSource::Store(store) => Box::new(FileList::new(store.file_paths(ctx, &self.props)?)),
            FileSource::Objects(store) => store.download_files(ctx, &self.props)?,
            FileSource::Warehouse(warehouse) => warehouse.query_as_files(ctx, &self.props)?,
            FileSource::Https { urls, .. } => Box::new(FileList::new(urls.clone())),
        })
    }

    /// Downloads of known size must fit the storage budget.
    fn check_storage_limit(&self, ctx: &Context, files: &dyn FileIterator) -> Result<()> {
        if !matches!(self.source, FileSource::Objects(_) | FileSource::Warehouse(_)) {
            return Ok(());
        }
        match files.size_bytes() {
            Some(size) if !self.olap.within_storage_limit(ctx, size)? => {
                info!(size, limit = ?self.olap.storage_limit_bytes(), "ingestion exceeds storage limit");
                Err(DriverError::StorageLimitExceeded)
            }
            _ => Ok(()),
        }
    }

    fn ingest(
        &self,
        ctx: &Context,
        opts: &ModelExecuteOptions,
        target: &OutputTarget,
        files: &mut dyn FileIterator,
    ) -> Result<ModelStats> {
        let bytes = files.size_bytes().unwrap_or(0);
        let previous = self
            .olap
            .with_connection(ctx, opts.priority, |session| {
                incremental_base(session, self.incremental, opts, target)
            })?
            .cloned();
        if let Some(previous) = previous {
            let rows = self.load(ctx, opts, &target.table, files, true)?;
            return Ok(ModelStats { rows, bytes }.merged(previous.stats));
        }

        if target.is_staged() {
            self.olap
                .with_connection(ctx, opts.priority, |session| drop_if_exists(session, &target.staging))?;
        }
        let built = self.load(ctx, opts, &target.staging, files, false).and_then(|rows| {
            if !self.file.cast_to_enum.is_empty() {
                self.olap.with_connection(ctx, opts.priority, |session| {
                    convert_to_enum(session, &target.staging, &self.file.cast_to_enum)
                })?;
            }
            Ok(rows)
        });
        let rows = match built {
            Ok(rows) => rows,
            Err(err) if target.is_staged() => {
                let cleanup = self
                    .olap
                    .with_connection(ctx, opts.priority, |session| drop_if_exists(session, &target.staging));
                return join_cleanup(Err(err), cleanup);
            }
            Err(err) => return Err(err),
        };
        if target.is_staged() {
            self.olap.rename_table(ctx, &target.staging, &target.table)?;
        }
        Ok(ModelStats { rows, bytes })
    }

    /// Load every batch into `table`, creating it from the first batch unless
    /// it already exists.
    fn load(
        &self,
        ctx: &Context,
        opts: &ModelExecuteOptions,
        table: &str,
        files: &mut dyn FileIterator,
        existing: bool,
    ) -> Result<u64> {
        let options = self.file.reader_options()?;
        let mut appender =
            SchemaEvolvingAppender::new(&self.olap, table, self.file.allow_schema_relaxation).with_priority(opts.priority);
        let mut created = existing;
        let mut rows = 0u64;
        let mut batches = 0usize;
        while let Some(paths) = files.next_batch(ctx)? {
            ctx.check()?;
            let Some(first) = paths.first() else {
                continue;
            };
            let format = self.file.format.clone().unwrap_or_else(|| full_extension(first));
            let select = format!("SELECT * FROM {}", source_reader(&paths, &format, &options)?);
            let metrics = if !created {
                created = true;
                let metrics =
                    self.olap
                        .create_table_as_select(ctx, table, &select, &CreateTableOptions::default())?;
                let rows = self
                    .olap
                    .with_connection(ctx, opts.priority, |session| count_rows(session, table))?;
                TableWriteMetrics { rows, ..metrics }
            } else if existing && needs_strategy_insert(&self.output) {
                self.olap
                    .insert_table_as_select(ctx, table, &select, &insert_options(&self.output))?
            } else {
                appender.append(ctx, &select, &paths)?
            };
            rows += metrics.rows;
            batches += 1;
            debug!(batch = batches, files = paths.len(), rows = metrics.rows, "ingested file batch");
        }
        if !created {
            return Err(DriverError::NotFound("no files to ingest".to_string()));
        }
        Ok(rows)
    }

    fn create_http_secret(&self, ctx: &Context) -> Result<Option<String>> {
        let FileSource::Https { urls, headers } = &self.source else {
            return Ok(None);
        };
        if headers.is_empty() {
            return Ok(None);
        }
        let name = temp_name("http");
        let entries = headers
            .iter()
            .map(|(k, v)| format!("{}: {}", safe_sql_string(k), safe_sql_string(v)))
            .collect::<Vec<_>>()
            .join(", ");
        let scope = urls
            .iter()
            .map(|u| safe_sql_string(u))
            .collect::<Vec<_>>()
            .join(", ");
        self.olap.with_connection(ctx, 0, |session| {
            session.exec(&format!(
                "CREATE OR REPLACE TEMPORARY SECRET {} (TYPE HTTP, EXTRA_HTTP_HEADERS MAP {{{entries}}}, SCOPE [{scope}])",
                safe_name(&name)
            ))
        })?;
        Ok(Some(name))
    }

    fn drop_http_secret(&self, ctx: &Context, name: Option<String>) -> Result<()> {
        let Some(name) = name else {
            return Ok(());
        };
        self.olap.with_connection(ctx, 0, |session| {
            session
                .exec(&format!("DROP TEMPORARY SECRET IF EXISTS {}", safe_name(&name)))
                .map(|_| ())
        })
    }
}

impl ModelExecutor for FilesToSelfExecutor {
    fn concurrency(&self, desired: usize) -> Option<usize> {
        (desired <= 1).then_some(1)
    }

    #[instrument(skip(self, ctx, opts), fields(model = %opts.model_name, incremental_run = opts.incremental_run))]
    fn execute(&self, ctx: &Context, opts: &ModelExecuteOptions) -> Result<ModelResult> {
        let started = Instant::now();
        let target = OutputTarget::resolve(&self.output, opts, self.incremental)?;
        let target = OutputTarget {
            materialize: true,
            ..target
        };
        let mut files = self.open(ctx)?;
        let ingested = self.check_storage_limit(ctx, &*files).and_then(|()| {
            let secret = self.create_http_secret(ctx)?;
            let ingested = self.ingest(ctx, opts, &target, &mut *files);
            join_cleanup(ingested, self.drop_http_secret(ctx, secret))
        });
        let closed = files.close().map_err(DriverError::from);
        let stats = join_cleanup(ingested, closed)?;
        table_result(opts, &target, stats, started)
    }
}
