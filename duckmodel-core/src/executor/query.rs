//! Executors running the model's SQL on this database, optionally reading
//! from an attached DuckDB file or MotherDuck database.

use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::connectors::Connector;
use crate::context::Context;
use crate::engine::Session;
use crate::error::{join_cleanup, DriverError, Result};
use crate::executor::materialize::{materialize_select, prepare_session, table_result, OutputTarget};
use crate::executor::properties::{decode, ModelInputProperties, ModelOutputProperties};
use crate::executor::{ExecutorParts, ModelEnv, ModelExecuteOptions, ModelExecutor, ModelResult};
use crate::olap::Olap;
use crate::sql::{resolve_local_path, safe_name, safe_sql_string, temp_name};

#[derive(Debug, Clone, PartialEq, Eq)]
enum QuerySource {
    Local,
    /// Path of a DuckDB file, resolved against the repository root per run.
    DuckDbFile(String),
    MotherDuck {
        database: String,
        token: Option<String>,
    },
}

pub struct QueryToSelfExecutor {
    olap: Olap,
    source: QuerySource,
    input: ModelInputProperties,
    output: ModelOutputProperties,
    incremental: bool,
}

pub fn build_self_to_self(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    let input: ModelInputProperties = decode("input", &parts.spec.input_properties)?;
    input.validate(parts.spec.incremental)?;
    let mut output: ModelOutputProperties = decode("output", &parts.spec.output_properties)?;
    output.validate(parts.spec.incremental)?;
    let source = match input.external_db() {
        Some(db) => QuerySource::DuckDbFile(db.to_string()),
        None => QuerySource::Local,
    };
    Ok(Box::new(QueryToSelfExecutor {
        olap: parts.olap.clone(),
        source,
        input,
        output,
        incremental: parts.spec.incremental,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MotherDuckInputProperties {
    token: Option<String>,
}

pub fn build_motherduck_to_self(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    let input: ModelInputProperties = decode("input", &parts.spec.input_properties)?;
    // `db` names the MotherDuck database here, so incremental models keep it.
    input.validate(false)?;
    let database = input
        .external_db()
        .ok_or_else(|| DriverError::Validation("missing property 'db'".to_string()))?
        .trim_start_matches("md:")
        .to_string();
    let extra: MotherDuckInputProperties = decode("input", &parts.spec.input_properties)?;
    let token = extra.token.or_else(|| match parts.input {
        Connector::MotherDuck(config) => config.token.clone(),
        _ => None,
    });
    let mut output: ModelOutputProperties = decode("output", &parts.spec.output_properties)?;
    output.validate(parts.spec.incremental)?;
    Ok(Box::new(QueryToSelfExecutor {
        olap: parts.olap.clone(),
        source: QuerySource::MotherDuck { database, token },
        input,
        output,
        incremental: parts.spec.incremental,
    }))
}

impl ModelExecutor for QueryToSelfExecutor {
    fn concurrency(&self, desired: usize) -> Option<usize> {
        (desired <= 1).then_some(1)
    }

    #[instrument(skip(self, ctx, opts), fields(model = %opts.model_name, incremental_run = opts.incremental_run))]
    fn execute(&self, ctx: &Context, opts: &ModelExecuteOptions) -> Result<ModelResult> {
        let started = Instant::now();
        let mut target = OutputTarget::resolve(&self.output, opts, self.incremental)?;
        if self.source != QuerySource::Local && !target.materialize {
            debug!("attached source cannot back a view, materializing as table");
            target.materialize = true;
        }
        let stats = self.olap.with_connection(ctx, opts.priority, |session| {
            prepare_session(session, &self.input, &opts.env)?;
            let attached = attach(session, &self.source, &opts.env)?;
            let built = materialize_select(
                session,
                &self.input,
                &self.output,
                &target,
                opts,
                self.incremental,
                &self.input.sql,
            );
            join_cleanup(built, detach(session, attached.as_deref()))
        })?;
        table_result(opts, &target, stats, started)
    }
}

/// Attach the source database and put it on the search path after the local
/// one, so the model's unqualified names resolve against both while new
/// objects are still created locally.
fn attach(session: &Session<'_>, source: &QuerySource, env: &ModelEnv) -> Result<Option<String>> {
    let alias = temp_name("attached");
    match source {
        QuerySource::Local => return Ok(None),
        QuerySource::DuckDbFile(path) => {
            let resolved = resolve_local_path(path, &env.repo_root, env.allow_host_access)?;
            session.exec(&format!(
                "ATTACH {} AS {} (READ_ONLY)",
                safe_sql_string(&resolved.to_string_lossy()),
                safe_name(&alias)
            ))?;
        }
        QuerySource::MotherDuck { database, token } => {
            if let Some(token) = token {
                session.exec(&format!("SET motherduck_token = {}", safe_sql_string(token)))?;
            }
            session.exec(&format!(
                "ATTACH {} AS {}",
                safe_sql_string(&format!("md:{database}")),
                safe_name(&alias)
            ))?;
        }
    }
    let local: String = session
        .connection()
        .query_row("SELECT current_database()", [], |row| row.get(0))?;
    let search_path = session.exec(&format!(
        "SET search_path = {}",
        safe_sql_string(&format!("{local}.main,{alias}.main"))
    ));
    if let Err(err) = search_path {
        return join_cleanup(Err(err), detach(session, Some(&alias)));
    }
    debug!(alias = %alias, "attached model source");
    Ok(Some(alias))
}

fn detach(session: &Session<'_>, alias: Option<&str>) -> Result<()> {
    let Some(alias) = alias else {
        return Ok(());
    };
    let reset = session.exec("RESET search_path").map(|_| ());
    let detached = session
        .exec(&format!("DETACH DATABASE IF EXISTS {}", safe_name(alias)))
        .map(|_| ());
    join_cleanup(reset, detached)
}
