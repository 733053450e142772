//! Fixed-size DuckDB connection pool with priority scheduling.
//!
//! All connections are clones of one root database handle. Checkout first
//! takes a permit from a [`PrioritySemaphore`] sized to the pool, then pops an
//! idle connection. One extra connection is reserved for catalog bookkeeping
//! and never handed out through the analytic lane.
//!
//! When a connection reports a fatal engine error it is discarded and the pool
//! is flagged for reopen. The next checkout after every connection of the old
//! generation has come back reopens the database while holding the pool lock,
//! so new checkouts wait for it instead of failing. A fatal error on the
//! catalog connection replaces that connection immediately.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use duckdb::{Config, Connection};
use tracing::{debug, info, instrument, warn};

use crate::config::DriverConfig;
use crate::context::Context;
use crate::engine::connection::Session;
use crate::engine::priority::PrioritySemaphore;
use crate::error::{join_cleanup, DriverError, Result};
use crate::sql::{safe_name, safe_sql_string};

const WAIT_SLICE: Duration = Duration::from_millis(20);

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: DriverConfig,
    semaphore: PrioritySemaphore,
    state: Mutex<PoolState>,
    condvar: Condvar,
    meta: Mutex<Option<Connection>>,
}

struct PoolState {
    root: Option<Connection>,
    idle: Vec<Connection>,
    checked_out: usize,
    generation: u64,
    needs_reopen: bool,
    closed: bool,
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub idle: usize,
    pub checked_out: usize,
    pub generation: u64,
    pub queued: usize,
}

impl ConnectionPool {
    #[instrument(skip(config), fields(path = ?config.database_path(), size = config.pool_size))]
    pub fn open(config: &DriverConfig) -> Result<Self> {
        let inner = PoolInner {
            config: config.clone(),
            semaphore: PrioritySemaphore::new(config.pool_size),
            state: Mutex::new(PoolState {
                root: None,
                idle: Vec::new(),
                checked_out: 0,
                generation: 0,
                needs_reopen: false,
                closed: false,
            }),
            condvar: Condvar::new(),
            meta: Mutex::new(None),
        };
        {
            let mut state = inner.lock_state()?;
            inner.open_database(&mut state)?;
        }
        info!(size = config.pool_size, "connection pool ready");
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.config.pool_size
    }

    pub fn log_queries(&self) -> bool {
        self.inner.config.log_queries
    }

    /// Check out a connection, waiting behind higher-priority callers.
    pub fn acquire(&self, ctx: &Context, priority: i32) -> Result<PooledConnection> {
        self.inner.semaphore.acquire(ctx, priority)?;
        match self.inner.checkout(ctx) {
            Ok((conn, generation)) => Ok(PooledConnection {
                conn: Some(conn),
                generation,
                fatal: false,
                pool: Arc::clone(&self.inner),
            }),
            Err(err) => {
                self.inner.semaphore.release();
                Err(err)
            }
        }
    }

    /// Run `f` on one checked-out connection. A fatal engine error returned by
    /// `f` retires the connection and schedules a reopen.
    pub fn with_connection<T>(
        &self,
        ctx: &Context,
        priority: i32,
        f: impl FnOnce(&Session<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut pooled = self.acquire(ctx, priority)?;
        let result = {
            let session = Session::new(pooled.connection()?, self.inner.config.log_queries);
            f(&session)
        };
        if let Err(err) = &result {
            if err.is_fatal() {
                pooled.mark_fatal();
            }
        }
        result
    }

    /// Run `f` on the reserved catalog connection.
    pub fn with_meta_connection<T>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&Session<'_>) -> Result<T>,
    ) -> Result<T> {
        ctx.check()?;
        {
            let mut state = self.inner.lock_state()?;
            if state.closed {
                return Err(DriverError::PoolClosed);
            }
            if state.needs_reopen && state.checked_out == 0 {
                self.inner.open_database(&mut state)?;
            }
        }
        let (result, fatal) = {
            let meta = self.inner.lock_meta()?;
            let conn = meta.as_ref().ok_or(DriverError::PoolClosed)?;
            let result = f(&Session::new(conn, self.inner.config.log_queries));
            let fatal = matches!(&result, Err(err) if err.is_fatal());
            (result, fatal)
        };
        if fatal {
            return join_cleanup(result, self.inner.recover_meta());
        }
        result
    }

    /// Schedule a reopen of the database instance. It happens on the next
    /// checkout once no connection of the current generation is in use.
    pub fn request_reopen(&self) {
        if let Ok(mut state) = self.inner.state.lock() {
            if !state.closed {
                warn!(generation = state.generation, "database scheduled for reopen");
                state.needs_reopen = true;
            }
        }
        self.inner.condvar.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let (idle, checked_out, generation) = match self.inner.state.lock() {
            Ok(state) => (state.idle.len(), state.checked_out, state.generation),
            Err(_) => (0, 0, 0),
        };
        PoolStats {
            size: self.inner.config.pool_size,
            idle,
            checked_out,
            generation,
            queued: self.inner.semaphore.queued(),
        }
    }

    /// Close every idle connection and fail queued and future checkouts.
    /// Connections still checked out are closed when they are returned.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        self.inner.semaphore.close();
        let mut state = self.inner.lock_state()?;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.idle.clear();
        state.root = None;
        self.inner.lock_meta()?.take();
        self.inner.condvar.notify_all();
        info!(checked_out = state.checked_out, "connection pool closed");
        Ok(())
    }
}

impl PoolInner {
    fn lock_state(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state.lock().map_err(|_| DriverError::poisoned("pool"))
    }

    fn lock_meta(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.meta.lock().map_err(|_| DriverError::poisoned("catalog connection"))
    }

    fn checkout(&self, ctx: &Context) -> Result<(Connection, u64)> {
        let mut state = self.lock_state()?;
        loop {
            if state.closed {
                return Err(DriverError::PoolClosed);
            }
            if state.needs_reopen {
                if state.checked_out == 0 {
                    self.open_database(&mut state)?;
                    continue;
                }
            } else if let Some(conn) = state.idle.pop() {
                state.checked_out += 1;
                return Ok((conn, state.generation));
            }
            ctx.check()?;
            let (guard, _) = self
                .condvar
                .wait_timeout(state, ctx.wait_slice(WAIT_SLICE))
                .map_err(|_| DriverError::poisoned("pool"))?;
            state = guard;
        }
    }

    fn release(&self, conn: Connection, generation: u64, fatal: bool) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.checked_out = state.checked_out.saturating_sub(1);
        if fatal {
            drop(conn);
            if generation == state.generation && !state.closed {
                warn!(generation, "connection hit a fatal error, database will be reopened");
                state.needs_reopen = true;
            }
        } else if state.closed || state.needs_reopen || generation != state.generation {
            drop(conn);
        } else {
            state.idle.push(conn);
        }
        self.condvar.notify_all();
    }

    /// Replace the catalog connection after it hit a fatal error. With no
    /// analytic checkout outstanding the database is reopened right away;
    /// otherwise catalog calls move to a fresh clone of the root until the
    /// reopen can happen.
    fn recover_meta(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Ok(());
        }
        warn!(generation = state.generation, "catalog connection hit a fatal error");
        state.needs_reopen = true;
        if state.checked_out == 0 {
            return self.open_database(&mut state);
        }
        let replacement = match state.root.as_ref() {
            Some(root) => Some(self.prepare_connection(root.try_clone()?)?),
            None => None,
        };
        *self.lock_meta()? = replacement;
        self.condvar.notify_all();
        Ok(())
    }

    /// Drop every connection of the current generation (including the catalog
    /// connection) and open a fresh database instance. Callers hold the state
    /// lock and guarantee no analytic connection is checked out.
    fn open_database(&self, state: &mut PoolState) -> Result<()> {
        let mut meta = self.lock_meta()?;
        let reopening = state.root.is_some() || state.needs_reopen;
        meta.take();
        state.idle.clear();
        state.root = None;
        if reopening {
            warn!(generation = state.generation, "reopening database");
        }

        let root = self.open_root()?;
        let mut idle = Vec::with_capacity(self.config.pool_size);
        for _ in 0..self.config.pool_size {
            idle.push(self.prepare_connection(root.try_clone()?)?);
        }
        *meta = Some(self.prepare_connection(root.try_clone()?)?);
        state.root = Some(root);
        state.idle = idle;
        state.needs_reopen = false;
        if reopening {
            state.generation += 1;
            info!(generation = state.generation, "database reopened");
        }
        self.condvar.notify_all();
        Ok(())
    }

    fn open_root(&self) -> Result<Connection> {
        let flags = Config::default()
            .enable_autoload_extension(true)?
            .allow_unsigned_extensions()?;
        let conn = match self.config.database_path() {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Connection::open_with_flags(&path, flags)?
            }
            None => Connection::open_in_memory_with_flags(flags)?,
        };

        let mut init = Vec::new();
        for extension in &self.config.extensions {
            init.push(format!("INSTALL {0}; LOAD {0};", safe_name(extension)));
        }
        if let Some(threads) = self.config.threads {
            init.push(format!("SET threads = {threads};"));
        }
        if let Some(gb) = self.config.memory_limit_gb {
            init.push(format!("SET memory_limit = '{gb}GB';"));
        }
        for (key, value) in &self.config.settings {
            init.push(format!("SET {key} = {};", safe_sql_string(value)));
        }
        if let Some(sql) = self.config.init_sql.as_deref() {
            let trimmed = sql.trim();
            if !trimmed.is_empty() {
                init.push(trimmed.to_string());
            }
        }
        if !init.is_empty() {
            let init_sql = init.join("\n");
            debug!(init_sql = %init_sql, "initializing database");
            conn.execute_batch(&init_sql)?;
        }
        Ok(conn)
    }

    fn prepare_connection(&self, conn: Connection) -> Result<Connection> {
        if let Some(sql) = self.config.conn_init_sql.as_deref() {
            if !sql.trim().is_empty() {
                conn.execute_batch(sql)?;
            }
        }
        Ok(conn)
    }
}

/// RAII checkout that returns the connection and its permit on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    generation: u64,
    fatal: bool,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Retire this connection instead of returning it, and reopen the database.
    pub fn mark_fatal(&mut self) {
        self.fatal = true;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| DriverError::Internal("pooled connection already returned".to_string()))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.generation, self.fatal);
        }
        self.pool.semaphore.release();
    }
}
