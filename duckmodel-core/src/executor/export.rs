//! Exports of a model query to files, locally or through an object store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{info, instrument};

use crate::config::PropertyMap;
use crate::connectors::{Connector, ObjectStore};
use crate::context::Context;
use crate::error::{join_cleanup, DriverError, Result};
use crate::executor::materialize::{prepare_session, sql_args};
use crate::executor::properties::{decode, FileOutputProperties, ModelInputProperties};
use crate::executor::{ExecutorParts, ModelExecuteOptions, ModelExecutor, ModelResult, ModelStats};
use crate::olap::crud::run_hook;
use crate::olap::Olap;
use crate::sql::{resolve_local_path, safe_sql_string, temp_name, trim_statement};

enum Sink {
    Local,
    ObjectStore {
        store: Arc<dyn ObjectStore>,
        props: PropertyMap,
    },
}

pub struct SelfToFilesExecutor {
    olap: Olap,
    sink: Sink,
    input: ModelInputProperties,
    output: FileOutputProperties,
}

fn build(parts: &ExecutorParts<'_>, sink: Sink) -> Result<Box<dyn ModelExecutor>> {
    if parts.spec.incremental {
        return Err(DriverError::Validation(
            "incremental models cannot be exported to files".to_string(),
        ));
    }
    let input: ModelInputProperties = decode("input", &parts.spec.input_properties)?;
    input.validate(false)?;
    let output: FileOutputProperties = decode("output", &parts.spec.output_properties)?;
    if matches!(sink, Sink::Local) {
        output.validate()?;
    }
    Ok(Box::new(SelfToFilesExecutor {
        olap: parts.olap.clone(),
        sink,
        input,
        output,
    }))
}

pub fn build_self_to_file(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    build(parts, Sink::Local)
}

pub fn build_self_to_object_store(parts: &ExecutorParts<'_>) -> Result<Box<dyn ModelExecutor>> {
    match parts.output {
        Connector::ObjectStore(store) => build(
            parts,
            Sink::ObjectStore {
                store: store.clone(),
                props: parts.spec.output_properties.clone(),
            },
        ),
        other => Err(DriverError::Internal(format!(
            "unexpected output connector {other:?}"
        ))),
    }
}

impl SelfToFilesExecutor {
    fn local_path(&self, opts: &ModelExecuteOptions) -> Result<PathBuf> {
        match self.sink {
            Sink::Local => resolve_local_path(&self.output.path, &opts.env.repo_root, opts.env.allow_host_access),
            Sink::ObjectStore { .. } => Ok(opts
                .env
                .temp_dir
                .join(format!("{}.{}", temp_name("export"), self.output.format.extension()))),
        }
    }

    fn copy(&self, ctx: &Context, opts: &ModelExecuteOptions, path: &Path) -> Result<u64> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let args = sql_args(&self.input.args)?;
        self.olap.with_connection(ctx, opts.priority, |session| {
            prepare_session(session, &self.input, &opts.env)?;
            let copied = run_hook(session, self.input.pre_exec.as_deref()).and_then(|()| {
                session.exec_with_args(
                    &format!(
                        "COPY ({}\n) TO {} ({})",
                        trim_statement(&self.input.sql),
                        safe_sql_string(&path.to_string_lossy()),
                        self.output.format.copy_options()
                    ),
                    &args,
                )
            });
            let after = run_hook(session, self.input.post_exec.as_deref());
            Ok(join_cleanup(copied, after)? as u64)
        })
    }
}

impl ModelExecutor for SelfToFilesExecutor {
    fn concurrency(&self, desired: usize) -> Option<usize> {
        Some(desired.max(1))
    }

    #[instrument(skip(self, ctx, opts), fields(model = %opts.model_name))]
    fn execute(&self, ctx: &Context, opts: &ModelExecuteOptions) -> Result<ModelResult> {
        let started = Instant::now();
        let path = self.local_path(opts)?;
        let rows = self.copy(ctx, opts, &path)?;
        let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        let location = match &self.sink {
            Sink::Local => path.to_string_lossy().into_owned(),
            Sink::ObjectStore { store, props } => {
                let uploaded = store.upload(ctx, &path, props).map_err(DriverError::from);
                let removed = std::fs::remove_file(&path).map_err(DriverError::from);
                join_cleanup(uploaded, removed)?
            }
        };
        info!(location = %location, rows, bytes, "exported model");

        let mut properties = PropertyMap::new();
        properties.insert("path".to_string(), Value::String(location));
        properties.insert(
            "format".to_string(),
            Value::String(self.output.format.extension().to_string()),
        );
        Ok(ModelResult {
            connector: opts.output_connector.clone(),
            properties,
            table: String::new(),
            exec_duration: started.elapsed(),
            stats: ModelStats { rows, bytes },
        })
    }
}
