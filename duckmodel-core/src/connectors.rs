//! Capability interfaces of external source and sink connectors.
//!
//! Implementations live outside this crate; executors only see these traits.
//! Errors from collaborators are plain `anyhow::Error`s and surface as
//! [`DriverError::Connector`](crate::error::DriverError::Connector).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

use crate::config::PropertyMap;
use crate::context::Context;

/// Batched access to local copies of remote files.
pub trait FileIterator: Send {
    /// Next batch of local file paths, `None` once exhausted.
    fn next_batch(&mut self, ctx: &Context) -> anyhow::Result<Option<Vec<String>>>;
    /// Total size of all files in bytes, when known up front.
    fn size_bytes(&self) -> Option<u64>;
    /// Release the local copies.
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Arrow batches produced by a remote SQL query.
pub trait RowIterator: Send {
    fn schema(&mut self, ctx: &Context) -> anyhow::Result<SchemaRef>;
    fn next_batch(&mut self, ctx: &Context) -> anyhow::Result<Option<RecordBatch>>;
    /// Total number of rows, when the source reports it.
    fn row_count(&self) -> Option<u64>;
    fn close(&mut self) -> anyhow::Result<()>;
}

pub trait FileStore: Send + Sync {
    fn file_paths(&self, ctx: &Context, props: &PropertyMap) -> anyhow::Result<Vec<String>>;
}

pub trait ObjectStore: Send + Sync {
    fn download_files(&self, ctx: &Context, props: &PropertyMap) -> anyhow::Result<Box<dyn FileIterator>>;
    /// Upload a local file to the location described by `props`, returning its URI.
    fn upload(&self, ctx: &Context, local_path: &Path, props: &PropertyMap) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FederationKind {
    MySql,
    Postgres,
}

impl FederationKind {
    pub fn attach_type(self) -> &'static str {
        match self {
            FederationKind::MySql => "mysql",
            FederationKind::Postgres => "postgres",
        }
    }

    /// Table function passing a query through to the attached database.
    pub fn query_function(self) -> &'static str {
        match self {
            FederationKind::MySql => "mysql_query",
            FederationKind::Postgres => "postgres_query",
        }
    }
}

/// Connection string for a database the engine can attach natively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Federation {
    pub kind: FederationKind,
    pub dsn: String,
}

pub trait SqlStore: Send + Sync {
    fn query(&self, ctx: &Context, props: &PropertyMap) -> anyhow::Result<Box<dyn RowIterator>>;

    /// When set, the engine attaches the database directly instead of
    /// streaming rows.
    fn federation(&self) -> Option<Federation> {
        None
    }
}

pub trait Warehouse: Send + Sync {
    fn query_as_files(&self, ctx: &Context, props: &PropertyMap) -> anyhow::Result<Box<dyn FileIterator>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MotherDuckConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpsConfig {
    pub headers: BTreeMap<String, String>,
}

/// A connector handle paired with the capability executors dispatch on.
#[derive(Clone)]
pub enum Connector {
    /// This driver's own database.
    Local,
    File(Arc<dyn FileStore>),
    ObjectStore(Arc<dyn ObjectStore>),
    SqlStore(Arc<dyn SqlStore>),
    Warehouse(Arc<dyn Warehouse>),
    MotherDuck(MotherDuckConfig),
    Https(HttpsConfig),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Local,
    FileStore,
    ObjectStore,
    SqlStore,
    Warehouse,
    MotherDuck,
    Https,
}

impl Connector {
    pub fn capability(&self) -> Capability {
        match self {
            Connector::Local => Capability::Local,
            Connector::File(_) => Capability::FileStore,
            Connector::ObjectStore(_) => Capability::ObjectStore,
            Connector::SqlStore(_) => Capability::SqlStore,
            Connector::Warehouse(_) => Capability::Warehouse,
            Connector::MotherDuck(_) => Capability::MotherDuck,
            Connector::Https(_) => Capability::Https,
        }
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connector({:?})", self.capability())
    }
}

/// File iterator over a fixed list of paths or URLs, yielded as one batch.
/// The size is known only when every entry is a readable local file.
pub struct FileList {
    paths: Option<Vec<String>>,
    size: Option<u64>,
}

impl FileList {
    pub fn new(paths: Vec<String>) -> Self {
        let size = paths
            .iter()
            .map(|p| std::fs::metadata(p).map(|m| m.len()).ok())
            .sum::<Option<u64>>();
        Self {
            paths: Some(paths),
            size,
        }
    }
}

impl FileIterator for FileList {
    fn next_batch(&mut self, _ctx: &Context) -> anyhow::Result<Option<Vec<String>>> {
        Ok(self.paths.take().filter(|p| !p.is_empty()))
    }

    fn size_bytes(&self) -> Option<u64> {
        self.size
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Combined size of local files, skipping unreadable entries.
pub fn files_size(paths: &[String]) -> u64 {
    paths
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}
