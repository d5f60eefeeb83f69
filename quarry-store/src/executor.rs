use std::time::{Duration, Instant};

use async_trait::async_trait;
use quarry_types::{ExecutionError, ExecutionOutcome, ResultSet, Row};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Acquire, Column, Executor, Statement};
use tracing::{debug, warn};

use crate::decode::decode_row;
use crate::QueryExecutor;

/// SQLSTATE `query_canceled`, raised when `statement_timeout` fires.
const QUERY_CANCELED: &str = "57014";

/// Pool-backed executor. Each call holds exactly one connection for the duration of its
/// statement and gives it back on every path.
#[derive(Clone)]
pub struct PgExecutor {
    pool: PgPool,
}

impl PgExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueryExecutor for PgExecutor {
    async fn execute(&self, sql: &str) -> ExecutionOutcome {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "could not acquire a pooled connection");
                return ExecutionOutcome::Failure {
                    elapsed: Duration::ZERO,
                    error: classify_error(&e),
                };
            }
        };

        match run_read_only(&mut conn, sql).await {
            Ok(fetched) => {
                debug!(
                    rows = fetched.rows.len(),
                    elapsed_ms = fetched.elapsed.as_millis() as u64,
                    "statement done"
                );
                ExecutionOutcome::Success(ResultSet {
                    columns: fetched.columns,
                    rows: fetched.rows,
                    elapsed: fetched.elapsed,
                })
            }
            Err((e, elapsed)) => {
                debug!(error = %e, "statement failed");
                ExecutionOutcome::Failure {
                    elapsed,
                    error: classify_error(&e),
                }
            }
        }
    }
}

struct Fetched {
    columns: Vec<String>,
    rows: Vec<Row>,
    elapsed: Duration,
}

/// Run `sql` inside a read-only transaction that is always rolled back.
///
/// Elapsed time covers sending the statement and fetching its rows; transaction setup is
/// not counted. Failures carry the time spent up to the failure.
async fn run_read_only(conn: &mut PgConnection, sql: &str) -> Result<Fetched, (sqlx::Error, Duration)> {
    let mut tx = conn.begin().await.map_err(|e| (e, Duration::ZERO))?;
    sqlx::query("SET TRANSACTION READ ONLY")
        .execute(&mut *tx)
        .await
        .map_err(|e| (e, Duration::ZERO))?;

    let started = Instant::now();
    let statement = (&mut *tx)
        .prepare(sql)
        .await
        .map_err(|e| (e, started.elapsed()))?;
    let columns: Vec<String> = statement
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();
    let fetched = statement
        .query()
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| (e, started.elapsed()))?;
    let elapsed = started.elapsed();

    let rows = fetched.iter().map(|r| decode_row(r, &columns)).collect();
    tx.rollback().await.map_err(|e| (e, elapsed))?;
    Ok(Fetched {
        columns,
        rows,
        elapsed,
    })
}

pub fn classify_error(err: &sqlx::Error) -> ExecutionError {
    match err {
        sqlx::Error::Database(db) => classify_database_error(db.code().as_deref(), db.message()),
        other => ExecutionError::Unexpected(other.to_string()),
    }
}

/// Server-reported failures: the timeout cancellation is told apart, everything else keeps
/// the server's own message.
pub fn classify_database_error(code: Option<&str>, message: &str) -> ExecutionError {
    if code == Some(QUERY_CANCELED) {
        ExecutionError::Timeout
    } else {
        ExecutionError::Database(message.to_string())
    }
}
