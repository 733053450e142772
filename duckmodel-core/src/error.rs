use thiserror::Error;

pub type Result<T, E = DriverError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed properties: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connector error: {0}")]
    Connector(#[from] anyhow::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("resource already exists: kind={kind} name={name}")]
    ResourceExists { kind: String, name: String },
    #[error("inconsistent controller version: expected {expected}, found {actual}")]
    InconsistentControllerVersion { expected: i64, actual: i64 },
    #[error("unsupported type: {0}")]
    UnsupportedType(String),
    #[error("incompatible schema: {0}")]
    SchemaIncompatible(String),
    #[error("storage limit exceeded")]
    StorageLimitExceeded,
    #[error("invalid configuration: {0}")]
    Validation(String),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("{op} {target:?}: {source}")]
    Operation {
        op: &'static str,
        target: String,
        #[source]
        source: Box<DriverError>,
    },
    #[error("{primary} (cleanup also failed: {cleanup})")]
    Cleanup {
        primary: Box<DriverError>,
        cleanup: Box<DriverError>,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    /// Wrap this error with the operation and object it was raised for.
    pub fn context(self, op: &'static str, target: impl Into<String>) -> Self {
        DriverError::Operation {
            op,
            target: target.into(),
            source: Box::new(self),
        }
    }

    pub fn poisoned(what: &str) -> Self {
        DriverError::Internal(format!("{what} mutex poisoned"))
    }

    /// The innermost error, looking through operation and cleanup wrappers.
    pub fn root(&self) -> &DriverError {
        match self {
            DriverError::Operation { source, .. } => source.root(),
            DriverError::Cleanup { primary, .. } => primary.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), DriverError::NotFound(_))
    }

    /// Whether the engine reported a connection-level corruption that
    /// requires the database instance to be reopened.
    pub fn is_fatal(&self) -> bool {
        match self {
            DriverError::Cleanup { primary, cleanup } => primary.is_fatal() || cleanup.is_fatal(),
            DriverError::Operation { source, .. } => source.is_fatal(),
            DriverError::DuckDb(err) => is_fatal_message(&err.to_string()),
            _ => false,
        }
    }

    /// Binder or conversion failures, the errors schema relaxation can repair.
    pub fn is_schema_mismatch(&self) -> bool {
        match self.root() {
            DriverError::DuckDb(err) => {
                let msg = err.to_string().to_lowercase();
                msg.contains("binder error") || msg.contains("conversion error")
            }
            DriverError::SchemaIncompatible(_) => true,
            _ => false,
        }
    }
}

fn is_fatal_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("fatal error") || msg.contains("database has been invalidated")
}

/// Combine the outcome of an operation with the outcome of its best-effort
/// cleanup. The primary error always wins; a cleanup failure on an otherwise
/// successful operation is surfaced on its own.
pub fn join_cleanup<T>(primary: Result<T>, cleanup: Result<()>) -> Result<T> {
    match (primary, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(cleanup),
        (Err(primary), Ok(())) => Err(primary),
        (Err(primary), Err(cleanup)) => Err(DriverError::Cleanup {
            primary: Box::new(primary),
            cleanup: Box::new(cleanup),
        }),
    }
}
