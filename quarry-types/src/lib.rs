use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// A single cell of a result set.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// One result row: column name → value, in the column order of the statement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row(Vec<(String, ScalarValue)>);

impl Row {
    pub fn new(cells: Vec<(String, ScalarValue)>) -> Self {
        Self(cells)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Materialized result of a successful read-only statement.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub elapsed: Duration,
}

/// Classified executor failure. `Display` is the user-facing text.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Query timed out. Try a more specific question.")]
    Timeout,
    #[error("Database error: {0}")]
    Database(String),
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

#[derive(Clone, Debug)]
pub enum ExecutionOutcome {
    Success(ResultSet),
    Failure {
        elapsed: Duration,
        error: ExecutionError,
    },
}

impl ExecutionOutcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            ExecutionOutcome::Success(rs) => rs.elapsed,
            ExecutionOutcome::Failure { elapsed, .. } => *elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success(_))
    }
}

/// Milliseconds rounded to two decimals, the precision reported to callers and the audit log.
pub fn elapsed_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100_000.0).round() / 100.0
}

/// One audit row per pipeline invocation. The creation timestamp is assigned by the sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub user_question: String,
    pub generated_sql: Option<String>,
    pub validation_passed: bool,
    pub execution_time_ms: Option<f64>,
    pub row_count: Option<i64>,
    pub error_message: Option<String>,
}

/// An audit record as read back from a sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: AuditRecord,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
}

/// Which exit of the pipeline produced a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    GenerationError,
    SchemaInsufficient,
    ValidationRejected,
    ExecutionFailed,
    Succeeded,
}

/// Caller-facing result of one question.
#[derive(Clone, Debug, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub user_question: String,
    pub generated_sql: Option<String>,
    pub validated_sql: Option<String>,
    pub can_answer: bool,
    pub validation_passed: bool,
    pub validation_error: Option<String>,
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub execution_time_ms: Option<f64>,
    pub error: Option<String>,
    pub terminal: Terminal,
}

impl QueryResponse {
    /// A failed response with nothing filled in yet.
    pub fn new(user_question: impl Into<String>) -> Self {
        Self {
            success: false,
            user_question: user_question.into(),
            generated_sql: None,
            validated_sql: None,
            can_answer: true,
            validation_passed: false,
            validation_error: None,
            rows: Vec::new(),
            columns: Vec::new(),
            row_count: 0,
            execution_time_ms: None,
            error: None,
            terminal: Terminal::GenerationError,
        }
    }
}
