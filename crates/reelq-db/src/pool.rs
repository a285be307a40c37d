//! Fixed-size connection pool.
//!
//! All connections are opened up front; if any of them fails, the ones
//! already opened are closed and construction fails. The pool never grows.
//! A semaphore with one permit per connection bounds the number of
//! outstanding checkouts, so callers wait (optionally with a timeout) for a
//! connection to come back.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::store::{Connection, Connector};
use crate::{PoolError, PoolResult};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Configured number of connections.
    pub size: usize,
    /// Connections that can be acquired right now without waiting.
    pub available: usize,
}

/// Shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    size: usize,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    slots: Arc<Semaphore>,
    closed: AtomicBool,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<Box<dyn Connection>>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn put_back(&self, conn: Box<dyn Connection>) {
        if self.closed.load(Ordering::Acquire) {
            debug!("Pool closed, dropping returned connection");
            return;
        }
        self.idle().push(conn);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.inner.connector.name())
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectionPool {
    /// Open `size` connections eagerly. Never returns a partial pool.
    pub async fn new(size: usize, connector: Arc<dyn Connector>) -> PoolResult<Self> {
        if size == 0 {
            return Err(PoolError::InvalidSize);
        }

        let mut opened: Vec<Box<dyn Connection>> = Vec::with_capacity(size);
        for _ in 0..size {
            match connector.connect().await {
                Ok(conn) => opened.push(conn),
                Err(source) => {
                    let count = opened.len();
                    for mut conn in opened {
                        if let Err(e) = conn.close().await {
                            warn!(error = %e, "Failed to close connection while unwinding pool");
                        }
                    }
                    return Err(PoolError::Build {
                        opened: count,
                        requested: size,
                        source,
                    });
                }
            }
        }

        info!(size, backend = connector.name(), "Connection pool ready");

        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                size,
                idle: Mutex::new(opened),
                slots: Arc::new(Semaphore::new(size)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.inner.size,
            available: self.inner.slots.available_permits(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait for a free connection, without bound.
    pub async fn acquire(&self) -> PoolResult<PooledConnection> {
        let permit = self
            .inner
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        self.checkout(permit).await
    }

    /// Wait at most `timeout` for a free connection.
    pub async fn acquire_timeout(&self, timeout: Duration) -> PoolResult<PooledConnection> {
        let acquire = self.inner.slots.clone().acquire_owned();
        let permit = match tokio::time::timeout(timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Timeout(timeout)),
        };
        self.checkout(permit).await
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> PoolResult<PooledConnection> {
        let idle = self.inner.idle().pop();
        let mut conn = match idle {
            Some(conn) => conn,
            // A slot whose broken connection could not be replaced earlier.
            None => {
                debug!("Refilling empty pool slot");
                self.inner
                    .connector
                    .connect()
                    .await
                    .map_err(PoolError::Refill)?
            }
        };

        // Guards dropped without `release` come back with their transaction
        // still open.
        if conn.in_transaction() {
            warn!("Pooled connection had an abandoned transaction, rolling back");
            crate::store::rollback_quietly(conn.as_mut()).await;
        }

        if conn.is_broken() || conn.in_transaction() {
            conn.reconnect().await.map_err(PoolError::Refill)?;
        }

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Return a connection to the pool.
    ///
    /// A connection that saw a connectivity fault is replaced by a fresh
    /// session first. Dropping a [`PooledConnection`] also returns it; the
    /// rollback and replacement then happen on its next checkout.
    pub async fn release(&self, mut conn: PooledConnection) {
        let Some(inner) = conn.conn.as_mut() else {
            return;
        };

        if self.is_closed() {
            if let Err(e) = inner.close().await {
                debug!(error = %e, "Closing connection returned after pool close failed");
            }
            conn.conn = None;
            return;
        }

        if inner.in_transaction() {
            warn!("Connection returned with an open transaction, rolling back");
            crate::store::rollback_quietly(inner.as_mut()).await;
        }

        if inner.is_broken() {
            if let Err(e) = inner.reconnect().await {
                warn!(error = %e, "Could not replace broken connection, slot left empty");
                conn.conn = None;
            }
        }
    }

    /// Close every connection currently in the pool and refuse further
    /// checkouts. Returns how many connections were closed.
    ///
    /// Checked-out connections are not touched here; they are dropped when
    /// their guard is released.
    pub async fn close(&self) -> usize {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.slots.close();

        let drained = std::mem::take(&mut *self.inner.idle());
        let outstanding = self.inner.size.saturating_sub(drained.len());
        if outstanding > 0 {
            warn!(outstanding, "Closing pool with connections still checked out");
        }

        let mut closed = 0;
        for mut conn in drained {
            if let Err(e) = conn.close().await {
                warn!(error = %e, "Failed to close pooled connection");
            }
            closed += 1;
        }
        info!(closed, "Connection pool closed");
        closed
    }
}

/// A connection checked out of the pool. Returned to the pool on drop or
/// through [`ConnectionPool::release`].
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection is present until the guard drops")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection is present until the guard drops")
    }
}

impl AsMut<dyn Connection> for PooledConnection {
    fn as_mut(&mut self) -> &mut (dyn Connection + 'static) {
        &mut **self
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn);
        }
    }
}
