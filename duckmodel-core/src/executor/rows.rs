//! SQL store to self. Databases the engine can attach natively are queried
//! through its federation extensions; anything else is streamed as Arrow
//! batches through the appender.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::config::PropertyMap;
use crate::connectors::{Connector, Federation, RowIterator, SqlStore};
use crate::context::Context;
use crate::engine::Session;
use crate::error::{join_cleanup, DriverError, Result};
use crate::executor::materialize::{
    drop_if_exists, incremental_base, insert_options, materialize_select, prepare_session, table_result,
    OutputTarget,
};
use crate::executor::properties::{decode, ModelInputProperties, ModelOutputProperties};
use crate::executor::{ExecutorParts, ModelExecuteOptions, ModelExecutor, ModelResult, ModelStats};
use crate::olap::crud::rename_table;
use crate::olap::incremental::insert_table_as_select;
use crate::olap::Olap;
use crate::sql::{safe_name, safe_sql_string, temp_name, trim_statement};
use crate::types::arrow_type_to_native;

pub struct SqlStoreToSelfExecutor {
    olap: Olap,
    store: Arc<dyn SqlStore>,
    props: PropertyMap,
    input: ModelInputProperties,
    output: ModelOutputProperties,
    incremental: bool,
}

pub fn build_sql_store_to_self(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    let Connector::SqlStore(store) = parts.input else {
        return Err(DriverError::Internal(format!(
            "unexpected input connector {:?}",
            parts.input
        )));
    };
    let input: ModelInputProperties = decode("input", &parts.spec.input_properties)?;
    input.validate(parts.spec.incremental)?;
    if !input.args.is_empty() {
        return Err(DriverError::Validation(
            "'args' are not supported for SQL store sources".to_string(),
        ));
    }
    let mut output: ModelOutputProperties = decode("output", &parts.spec.output_properties)?;
    output.validate(parts.spec.incremental)?;
    Ok(Box::new(SqlStoreToSelfExecutor {
        olap: parts.olap.clone(),
        store: store.clone(),
        props: parts.spec.input_properties.clone(),
        input,
        output,
        incremental: parts.spec.incremental,
    }))
}

impl SqlStoreToSelfExecutor {
    fn federated(
        &self,
        session: &Session<'_>,
        opts: &ModelExecuteOptions,
        target: &OutputTarget,
        federation: &Federation,
    ) -> Result<ModelStats> {
        prepare_session(session, &self.input, &opts.env)?;
        let alias = temp_name("federated");
        session.exec(&format!(
            "ATTACH {} AS {} (TYPE {}, READ_ONLY)",
            safe_sql_string(&federation.dsn),
            safe_name(&alias),
            federation.kind.attach_type()
        ))?;
        debug!(kind = federation.kind.attach_type(), alias = %alias, "attached sql store");
        let select = format!(
            "SELECT * FROM {}({}, {})",
            federation.kind.query_function(),
            safe_sql_string(&alias),
            safe_sql_string(trim_statement(&self.input.sql))
        );
        let built = materialize_select(
            session,
            &self.input,
            &self.output,
            target,
            opts,
            self.incremental,
            &select,
        );
        let detached = session
            .exec(&format!("DETACH DATABASE IF EXISTS {}", safe_name(&alias)))
            .map(|_| ());
        join_cleanup(built, detached)
    }

    fn streamed(
        &self,
        ctx: &Context,
        session: &Session<'_>,
        opts: &ModelExecuteOptions,
        target: &OutputTarget,
        rows: &mut dyn RowIterator,
    ) -> Result<ModelStats> {
        let schema = rows.schema(ctx)?;
        let columns = schema
            .fields()
            .iter()
            .map(|field| -> Result<String> {
                Ok(format!("{} {}", safe_name(field.name()), arrow_type_to_native(field.data_type())?))
            })
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        let previous = incremental_base(session, self.incremental, opts, target)?;
        let scratch = match previous {
            Some(_) => temp_name("rows"),
            None => {
                drop_if_exists(session, &target.staging)?;
                target.staging.clone()
            }
        };
        session.exec(&format!("CREATE TABLE {} ({columns})", safe_name(&scratch)))?;
        let loaded = load_rows(ctx, session, &scratch, rows);

        match previous {
            Some(previous) => {
                let applied = loaded.and_then(|_| {
                    insert_table_as_select(
                        session,
                        &target.table,
                        &format!("SELECT * FROM {}", safe_name(&scratch)),
                        &insert_options(&self.output),
                    )
                });
                let metrics = join_cleanup(applied, drop_if_exists(session, &scratch))?;
                Ok(ModelStats {
                    rows: metrics.rows,
                    bytes: 0,
                }
                .merged(previous.stats))
            }
            None => {
                let loaded = match loaded {
                    Err(err) if target.is_staged() => {
                        return join_cleanup(Err(err), drop_if_exists(session, &target.staging))
                    }
                    other => other?,
                };
                if target.is_staged() {
                    rename_table(session, &target.staging, &target.table)?;
                }
                Ok(ModelStats {
                    rows: loaded,
                    bytes: 0,
                })
            }
        }
    }
}

fn load_rows(ctx: &Context, session: &Session<'_>, table: &str, rows: &mut dyn RowIterator) -> Result<u64> {
    let mut total = 0u64;
    while let Some(batch) = rows.next_batch(ctx)? {
        ctx.check()?;
        total += session.append_batches(table, vec![batch])? as u64;
    }
    if let Some(expected) = rows.row_count() {
        if expected != total {
            debug!(expected, total, "row count reported by the source differs");
        }
    }
    Ok(total)
}

impl ModelExecutor for SqlStoreToSelfExecutor {
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
        let stats = match self.store.federation() {
            Some(federation) => self.olap.with_connection(ctx, opts.priority, |session| {
                self.federated(session, opts, &target, &federation)
            })?,
            None => {
                let mut rows = self.store.query(ctx, &self.props)?;
                let streamed = self.olap.with_connection(ctx, opts.priority, |session| {
                    prepare_session(session, &self.input, &opts.env)?;
                    self.streamed(ctx, session, opts, &target, &mut *rows)
                });
                join_cleanup(streamed, rows.close().map_err(DriverError::from))?
            }
        };
        table_result(opts, &target, stats, started)
    }
}
