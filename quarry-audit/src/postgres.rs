use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_types::{AuditEntry, AuditRecord};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::debug;

use crate::{AuditError, AuditSink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on a whole write: connect, insert, close.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Server-side cap for statements on the audit connection, in milliseconds.
const STATEMENT_TIMEOUT_MS: &str = "5000";

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS query_logs (
        id SERIAL PRIMARY KEY,
        user_question TEXT NOT NULL,
        generated_sql TEXT,
        validation_passed BOOLEAN NOT NULL DEFAULT FALSE,
        execution_time_ms DOUBLE PRECISION,
        row_count INTEGER,
        error_message TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )";

const INSERT: &str = "
    INSERT INTO query_logs
        (user_question, generated_sql, validation_passed, execution_time_ms, row_count, error_message)
    VALUES ($1, $2, $3, $4, $5::integer, $6)";

const RECENT: &str = "
    SELECT
        created_at::timestamptz,
        user_question,
        generated_sql,
        validation_passed,
        execution_time_ms::float8,
        row_count::bigint,
        error_message
    FROM query_logs
    ORDER BY created_at DESC
    LIMIT $1";

type RecentRow = (
    DateTime<Utc>,
    String,
    Option<String>,
    bool,
    Option<f64>,
    Option<i64>,
    Option<String>,
);

/// Writes to the `query_logs` table over its own short-lived connection, never the query
/// pool, so a saturated pool cannot block auditing.
pub struct PgAuditLog {
    options: PgConnectOptions,
}

impl PgAuditLog {
    pub fn new(options: PgConnectOptions) -> Self {
        Self {
            options: options.options([("statement_timeout", STATEMENT_TIMEOUT_MS)]),
        }
    }

    async fn connect(&self) -> Result<PgConnection, AuditError> {
        match tokio::time::timeout(CONNECT_TIMEOUT, PgConnection::connect_with(&self.options)).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(AuditError::ConnectTimeout),
        }
    }

    /// Create `query_logs` if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<(), AuditError> {
        let mut conn = self.connect().await?;
        sqlx::query(CREATE_TABLE).execute(&mut conn).await?;
        conn.close().await?;
        Ok(())
    }

    async fn insert(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut conn = self.connect().await?;
        sqlx::query(INSERT)
            .bind(&record.user_question)
            .bind(&record.generated_sql)
            .bind(record.validation_passed)
            .bind(record.execution_time_ms)
            .bind(record.row_count)
            .bind(&record.error_message)
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        debug!("audit row written");
        Ok(())
    }
}

async fn within<T>(limit: Duration, work: impl Future<Output = Result<T, AuditError>>) -> Result<T, AuditError> {
    tokio::time::timeout(limit, work)
        .await
        .map_err(|_| AuditError::WriteTimeout(limit))?
}

#[async_trait]
impl AuditSink for PgAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        within(WRITE_TIMEOUT, self.insert(record)).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        let mut conn = self.connect().await?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<RecentRow> = sqlx::query_as(RECENT).bind(limit).fetch_all(&mut conn).await?;
        conn.close().await?;
        Ok(rows
            .into_iter()
            .map(
                |(created_at, user_question, generated_sql, validation_passed, execution_time_ms, row_count, error_message)| {
                    AuditEntry {
                        created_at,
                        record: AuditRecord {
                            user_question,
                            generated_sql,
                            validation_passed,
                            execution_time_ms,
                            row_count,
                            error_message,
                        },
                    }
                },
            )
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_database_is_an_error_not_a_panic() {
        let options = PgConnectOptions::new().host("127.0.0.1").port(1);
        let sink = PgAuditLog::new(options);
        let record = AuditRecord {
            user_question: "q".into(),
            generated_sql: None,
            validation_passed: false,
            execution_time_ms: None,
            row_count: None,
            error_message: Some("boom".into()),
        };
        assert!(sink.record(&record).await.is_err());
    }

    #[tokio::test]
    async fn write_that_never_finishes_times_out() {
        let limit = Duration::from_millis(20);
        let stalled = std::future::pending::<Result<(), AuditError>>();
        match within(limit, stalled).await {
            Err(AuditError::WriteTimeout(d)) => assert_eq!(d, limit),
            other => panic!("expected write timeout, got {other:?}"),
        }
    }
}
