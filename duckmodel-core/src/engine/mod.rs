//! Physical connection management: the priority-scheduled pool and the
//! session handle primitives run on.

pub mod connection;
pub mod pool;
pub mod priority;

pub use connection::{ColumnSchema, ObjectKind, QueryResult, Session};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use priority::PrioritySemaphore;
