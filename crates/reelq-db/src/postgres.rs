//! PostgreSQL backend.

use async_trait::async_trait;
use reelq_core::{JobId, JobPayload, JobRecord, JobState};
use sqlx::Connection as SqlxConnection;
use sqlx::PgConnection;
use sqlx::postgres::PgConnectOptions;
use std::str::FromStr;
use tracing::debug;

use crate::store::{Connection, Connector};
use crate::{DbError, DbResult, Outcome, Statement};

/// Database row for the task table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: i64,
    pub state: i16,
    pub progress: i16,
    pub task_uuid: String,
    pub prompt: Option<String>,
    pub width: i32,
    pub height: i32,
}

impl TryFrom<TaskRow> for JobRecord {
    type Error = DbError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            id: JobId::new(row.id),
            state: JobState::from_code(row.state)?,
            progress: reelq_core::progress_from(i64::from(row.progress))?,
            payload: JobPayload {
                task_uuid: row.task_uuid,
                prompt: row.prompt,
                width: row.width,
                height: row.height,
            },
        })
    }
}

/// Opens Postgres connections from a fixed set of options.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        Self { options }
    }

    pub fn from_url(url: &str) -> DbResult<Self> {
        Ok(Self::new(PgConnectOptions::from_str(url)?))
    }

    pub fn options(&self) -> &PgConnectOptions {
        &self.options
    }
}

#[async_trait]
impl Connector for PgConnector {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let conn = PgConnection::connect_with(&self.options).await?;
        Ok(Box::new(PgStoreConnection {
            options: self.options.clone(),
            conn: Some(conn),
            in_tx: false,
            broken: false,
        }))
    }
}

/// A single long-lived Postgres session that can re-establish itself.
pub struct PgStoreConnection {
    options: PgConnectOptions,
    conn: Option<PgConnection>,
    in_tx: bool,
    broken: bool,
}

impl PgStoreConnection {
    fn session(&mut self) -> DbResult<&mut PgConnection> {
        self.conn.as_mut().ok_or(DbError::Closed)
    }

    fn observe<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            if e.is_transient() {
                self.broken = true;
                self.in_tx = false;
            }
        }
        result
    }

    async fn simple(&mut self, sql: &'static str) -> DbResult<()> {
        let result = match self.session() {
            Ok(conn) => sqlx::query(sql)
                .execute(&mut *conn)
                .await
                .map(|_| ())
                .map_err(DbError::from),
            Err(e) => Err(e),
        };
        self.observe(result)
    }
}

#[async_trait]
impl Connection for PgStoreConnection {
    async fn begin(&mut self) -> DbResult<()> {
        self.simple("BEGIN").await?;
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let result = self.simple("COMMIT").await;
        self.in_tx = false;
        result
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let result = self.simple("ROLLBACK").await;
        self.in_tx = false;
        result
    }

    async fn execute(&mut self, statement: &Statement) -> DbResult<Outcome> {
        let result = match self.session() {
            Ok(conn) => run_statement(conn, statement).await,
            Err(e) => Err(e),
        };
        self.observe(result)
    }

    async fn ping(&mut self) -> DbResult<()> {
        let result = match self.session() {
            Ok(conn) => conn.ping().await.map_err(DbError::from),
            Err(e) => Err(e),
        };
        self.observe(result)
    }

    async fn reconnect(&mut self) -> DbResult<()> {
        if let Some(old) = self.conn.take() {
            if let Err(e) = old.close().await {
                debug!(error = %e, "closing stale session failed");
            }
        }
        self.in_tx = false;
        let conn = PgConnection::connect_with(&self.options).await?;
        self.conn = Some(conn);
        self.broken = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx
    }

    fn is_broken(&self) -> bool {
        self.broken
    }

    async fn close(&mut self) -> DbResult<()> {
        self.in_tx = false;
        match self.conn.take() {
            Some(conn) => conn.close().await.map_err(DbError::from),
            None => Ok(()),
        }
    }
}

const SELECT_PENDING: &str = r#"
    SELECT id, state, progress, task_uuid, prompt, width, height
    FROM movie_agent_tasks
    WHERE state = 0
    LIMIT $1
    FOR UPDATE SKIP LOCKED
"#;

const SELECT_IN_FLIGHT: &str = r#"
    SELECT id FROM movie_agent_tasks WHERE state = 1 FOR UPDATE
"#;

async fn run_statement(conn: &mut PgConnection, statement: &Statement) -> DbResult<Outcome> {
    match statement {
        Statement::SelectPending { limit } => {
            let rows = sqlx::query_as::<_, TaskRow>(SELECT_PENDING)
                .bind(*limit)
                .fetch_all(&mut *conn)
                .await?;
            let records = rows
                .into_iter()
                .map(JobRecord::try_from)
                .collect::<DbResult<Vec<_>>>()?;
            Ok(Outcome::Rows(records))
        }
        Statement::MarkInFlight { ids } => {
            let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
            let marked = sqlx::query_scalar::<_, i64>(
                r#"
                UPDATE movie_agent_tasks SET state = 1, updated_at = NOW()
                WHERE id = ANY($1) AND state = 0
                RETURNING id
                "#,
            )
            .bind(&ids[..])
            .fetch_all(&mut *conn)
            .await?;
            Ok(Outcome::Ids(marked.into_iter().map(JobId::new).collect()))
        }
        Statement::SelectInFlight => {
            let ids = sqlx::query_scalar::<_, i64>(SELECT_IN_FLIGHT)
                .fetch_all(&mut *conn)
                .await?;
            Ok(Outcome::Ids(ids.into_iter().map(JobId::new).collect()))
        }
        Statement::ResetToPending { ids } => {
            let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
            let result = sqlx::query(
                "UPDATE movie_agent_tasks SET state = 0, updated_at = NOW() WHERE id = ANY($1) AND state = 1",
            )
            .bind(&ids[..])
            .execute(&mut *conn)
            .await?;
            Ok(Outcome::Affected(result.rows_affected()))
        }
        Statement::Finish { id, state, error } => {
            let result = sqlx::query(
                r#"
                UPDATE movie_agent_tasks
                SET state = $2, progress = 100, error = $3, updated_at = NOW()
                WHERE id = $1 AND state = 1
                "#,
            )
            .bind(id.get())
            .bind(state.code())
            .bind(error.as_deref())
            .execute(&mut *conn)
            .await?;
            Ok(Outcome::Affected(result.rows_affected()))
        }
        Statement::SetProgress { id, progress } => {
            let result = sqlx::query(
                "UPDATE movie_agent_tasks SET progress = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(id.get())
            .bind(i16::from(*progress))
            .execute(&mut *conn)
            .await?;
            Ok(Outcome::Affected(result.rows_affected()))
        }
        Statement::Insert { payload } => {
            let id = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO movie_agent_tasks (task_uuid, prompt, width, height)
                VALUES ($1, $2, $3, $4)
                RETURNING id
                "#,
            )
            .bind(&payload.task_uuid)
            .bind(payload.prompt.as_deref())
            .bind(payload.width)
            .bind(payload.height)
            .fetch_one(&mut *conn)
            .await?;
            Ok(Outcome::Ids(vec![JobId::new(id)]))
        }
    }
}

/// Apply the bundled migrations.
pub async fn run_migrations(options: &PgConnectOptions) -> DbResult<()> {
    let mut conn = PgConnection::connect_with(options).await?;
    sqlx::migrate!("./migrations").run(&mut conn).await?;
    conn.close().await?;
    Ok(())
}
