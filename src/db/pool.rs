//! Pooled SQLite connections on deadpool-sqlite
//!
//! Every new connection goes through a post-create hook that sets the busy
//! timeout and, in read-only mode, `PRAGMA query_only`. Statements run on
//! the blocking pool through [`SqlitePool::interact`]; one that outlives the
//! query timeout is interrupted on its connection.

use super::DbError;
use crate::config::Settings;
use deadpool_sqlite::{Config, Hook, HookError, Pool, PoolError, Runtime};
use rusqlite::Connection;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How connections are opened and bounded
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub read_only: bool,
    pub max_size: usize,
    /// Wait for a free connection, and busy timeout on locked files
    pub connection_timeout: Duration,
    /// Longest a single statement may run before it is interrupted
    pub query_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            read_only: true,
            max_size: 5,
            connection_timeout: Duration::from_secs(30),
            query_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            read_only: settings.database.read_only,
            max_size: settings.database.pool_size,
            connection_timeout: settings.database.connection_timeout(),
            query_timeout: settings.security.query_timeout(),
        }
    }
}

/// Pool status plus the counters deadpool does not keep
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub size: usize,
    pub available: usize,
    pub max_size: usize,
    pub failed_connections: u64,
    pub queries_executed: u64,
    pub failed_queries: u64,
    pub timed_out_queries: u64,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct Counters {
    failed_connections: AtomicU64,
    queries: AtomicU64,
    failed_queries: AtomicU64,
    timeouts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

pub struct SqlitePool {
    pool: Pool,
    path: PathBuf,
    query_timeout: Duration,
    counters: Counters,
}

/// `file:` URI that opens an existing database without creating it
fn open_uri(path: &Path, read_only: bool) -> String {
    let mut escaped = String::new();
    for ch in path.to_string_lossy().chars() {
        match ch {
            '%' => escaped.push_str("%25"),
            '?' => escaped.push_str("%3f"),
            '#' => escaped.push_str("%23"),
            _ => escaped.push(ch),
        }
    }
    let mode = if read_only { "ro" } else { "rw" };
    format!("file:{escaped}?mode={mode}")
}

fn setup_connection(
    conn: &Connection,
    read_only: bool,
    busy_timeout: Duration,
) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    if read_only {
        conn.execute_batch("PRAGMA query_only = ON")?;
    }
    Ok(())
}

fn make_post_create_hook(read_only: bool, busy_timeout: Duration) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            conn.interact(move |conn| setup_connection(conn, read_only, busy_timeout))
                .await
                .map_err(|e| HookError::Message(format!("interact failed: {e}").into()))?
                .map_err(|e| HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

impl SqlitePool {
    /// Build the pool and check that one connection can be established
    pub async fn open(path: &Path, options: &PoolOptions) -> Result<Self, DbError> {
        let connect_err = |message: String| DbError::Connect {
            path: path.display().to_string(),
            message,
        };

        let pool = Config::new(open_uri(path, options.read_only))
            .builder(Runtime::Tokio1)
            .map_err(|e| connect_err(e.to_string()))?
            .max_size(options.max_size.max(1))
            .wait_timeout(Some(options.connection_timeout))
            .create_timeout(Some(options.connection_timeout))
            .post_create(make_post_create_hook(
                options.read_only,
                options.connection_timeout,
            ))
            .build()
            .map_err(|e| connect_err(e.to_string()))?;

        let pool = Self {
            pool,
            path: path.to_path_buf(),
            query_timeout: options.query_timeout,
            counters: Counters::default(),
        };
        pool.interact(|conn| conn.query_row("SELECT 1", [], |_| Ok(())))
            .await?;
        Ok(pool)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a pooled connection, interrupting it past the query timeout
    pub async fn interact<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.get().await.map_err(|e| self.pool_error(e))?;
        let interrupt = conn
            .interact(|conn| conn.get_interrupt_handle())
            .await
            .map_err(|e| DbError::Interact(e.to_string()))?;

        let task = conn.interact(move |conn| f(&*conn));
        tokio::pin!(task);

        let result = match tokio::time::timeout(self.query_timeout, &mut task).await {
            Ok(joined) => joined.map_err(|e| DbError::Interact(e.to_string()))?,
            Err(_) => {
                interrupt.interrupt();
                // The statement unwinds with SQLITE_INTERRUPT; wait so the
                // connection goes back to the pool idle
                let _ = task.await;
                let err = DbError::Timeout(self.query_timeout.as_secs());
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                self.record_error(&err.to_string());
                tracing::warn!("Interrupted statement on {:?}: {}", self.path, err);
                return Err(err);
            }
        };

        self.counters.queries.fetch_add(1, Ordering::Relaxed);
        result.map_err(|e| {
            self.counters.failed_queries.fetch_add(1, Ordering::Relaxed);
            self.record_error(&e.to_string());
            DbError::Query(e)
        })
    }

    fn pool_error(&self, e: PoolError) -> DbError {
        match e {
            PoolError::Timeout(_) => DbError::PoolExhausted(self.pool.status().size),
            other => {
                self.counters
                    .failed_connections
                    .fetch_add(1, Ordering::Relaxed);
                self.record_error(&other.to_string());
                tracing::warn!("Failed to open {:?}: {}", self.path, other);
                DbError::Connect {
                    path: self.path.display().to_string(),
                    message: other.to_string(),
                }
            }
        }
    }

    fn record_error(&self, message: &str) {
        let mut last = self
            .counters
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Some(message.to_string());
    }

    pub fn health(&self) -> PoolHealth {
        let status = self.pool.status();
        PoolHealth {
            size: status.size,
            available: status.available,
            max_size: status.max_size,
            failed_connections: self.counters.failed_connections.load(Ordering::Relaxed),
            queries_executed: self.counters.queries.load(Ordering::Relaxed),
            failed_queries: self.counters.failed_queries.load(Ordering::Relaxed),
            timed_out_queries: self.counters.timeouts.load(Ordering::Relaxed),
            last_error: self
                .counters
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}
