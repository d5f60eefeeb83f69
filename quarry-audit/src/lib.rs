use async_trait::async_trait;
use quarry_types::{AuditEntry, AuditRecord};
use thiserror::Error;

mod jsonl;
mod postgres;

pub use jsonl::{verify_log, JsonlAuditLog, LoggedRecord};
pub use postgres::PgAuditLog;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("audit chain broken at line {line}: {reason}")]
    Chain { line: usize, reason: String },
    #[error("audit database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("timed out connecting to the audit database")]
    ConnectTimeout,
    #[error("audit write did not finish within {0:?}")]
    WriteTimeout(std::time::Duration),
}

/// Append-only destination for one record per pipeline invocation.
///
/// Writes are best effort: callers log a failed `record` and carry on.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Most recent entries, newest first.
    async fn recent(&self, _limit: usize) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(Vec::new())
    }
}

/// Discards everything.
pub struct NullAuditLog;

#[async_trait]
impl AuditSink for NullAuditLog {
    async fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        Ok(())
    }
}
