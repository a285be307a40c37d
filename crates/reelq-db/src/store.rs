//! Store abstraction.
//!
//! A [`Connector`] opens [`Connection`]s; a connection runs [`Statement`]s and
//! explicit transaction control. Connections are long-lived and know how to
//! re-establish their own session, which is what the retry policy relies on.

use async_trait::async_trait;

use crate::{DbResult, Outcome, Statement};

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Open a new live connection.
    async fn connect(&self) -> DbResult<Box<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send {
    async fn begin(&mut self) -> DbResult<()>;

    async fn commit(&mut self) -> DbResult<()>;

    async fn rollback(&mut self) -> DbResult<()>;

    /// Run a single statement, inside the open transaction if there is one.
    async fn execute(&mut self, statement: &Statement) -> DbResult<Outcome>;

    /// Check the session is still usable.
    async fn ping(&mut self) -> DbResult<()>;

    /// Drop the current session (if any) and open a fresh one in its place.
    ///
    /// Any transaction open on the old session is lost.
    async fn reconnect(&mut self) -> DbResult<()>;

    fn in_transaction(&self) -> bool;

    /// Set once a connectivity fault was observed and cleared by a successful
    /// reconnect.
    fn is_broken(&self) -> bool;

    /// Close the session. Further statements fail with [`DbError::Closed`](crate::DbError::Closed).
    async fn close(&mut self) -> DbResult<()>;
}

/// Roll back, logging instead of failing. Used on error paths where the
/// original error is the one worth propagating.
pub async fn rollback_quietly(conn: &mut dyn Connection) {
    if let Err(e) = conn.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}
