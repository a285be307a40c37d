//! Store layer for reelq.
//!
//! Provides the store abstraction, a PostgreSQL backend, an in-memory backend,
//! the fixed-size connection pool and the reconnect-and-retry policy.

pub mod error;
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod postgres;
pub mod retry;
pub mod statement;
pub mod store;

pub use error::{DbError, DbResult, PoolError, PoolResult};
pub use memory::{FaultKind, MemoryStore};
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use postgres::{PgConnector, run_migrations};
pub use retry::RetryPolicy;
pub use statement::{Outcome, Statement, StatementKind};
pub use store::{Connection, Connector};
