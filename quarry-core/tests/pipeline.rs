use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quarry_audit::{AuditError, AuditSink};
use quarry_core::{QueryAssistant, CANNOT_ANSWER_GUIDANCE};
use quarry_infer::{Generation, GenerationError, LlmError, LlmSqlGenerator, SqlGenerator, StaticLlmEngine};
use quarry_policy::{Policy, PolicyEngine};
use quarry_store::{CatalogSource, QueryExecutor, SchemaCatalog, StoreError};
use quarry_types::{
    AuditRecord, CatalogEntry, ColumnInfo, ExecutionError, ExecutionOutcome, ResultSet, Row, ScalarValue,
    Terminal,
};

enum Script {
    Sql(&'static str),
    CannotAnswer,
    Unavailable,
}

struct FakeGenerator {
    script: Script,
    seen_schema: Mutex<Option<String>>,
}

#[async_trait]
impl SqlGenerator for FakeGenerator {
    async fn generate_sql(&self, _question: &str, schema: &str) -> Result<Generation, GenerationError> {
        *self.seen_schema.lock().unwrap() = Some(schema.to_string());
        match self.script {
            Script::Sql(sql) => Ok(Generation::Sql(sql.to_string())),
            Script::CannotAnswer => Ok(Generation::CannotAnswer),
            Script::Unavailable => Err(LlmError::Unavailable {
                backend: "Ollama",
                base_url: "http://localhost:11434".into(),
                hint: "Make sure Ollama is running: `ollama serve`".into(),
            }
            .into()),
        }
    }
}

struct FakeExecutor {
    outcome: ExecutionOutcome,
    calls: AtomicUsize,
    last_sql: Mutex<Option<String>>,
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn execute(&self, sql: &str) -> ExecutionOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_sql.lock().unwrap() = Some(sql.to_string());
        self.outcome.clone()
    }
}

struct FakeSource {
    fail: bool,
}

#[async_trait]
impl CatalogSource for FakeSource {
    async fn load(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        if self.fail {
            return Err(StoreError::Other("connection refused".into()));
        }
        Ok(vec![CatalogEntry {
            table: "leads".into(),
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "integer".into(),
                    nullable: false,
                },
                ColumnInfo {
                    name: "status".into(),
                    data_type: "text".into(),
                    nullable: true,
                },
            ],
        }])
    }

    async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(vec!["leads".into()])
    }
}

#[derive(Default)]
struct RecordingAudit {
    records: Mutex<Vec<AuditRecord>>,
    fail: bool,
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.lock().unwrap().push(record.clone());
        if self.fail {
            return Err(AuditError::ConnectTimeout);
        }
        Ok(())
    }
}

/// Accepts the record and then never returns.
struct StuckAudit;

#[async_trait]
impl AuditSink for StuckAudit {
    async fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

struct Harness {
    assistant: QueryAssistant,
    generator: Arc<FakeGenerator>,
    executor: Arc<FakeExecutor>,
    audit: Arc<RecordingAudit>,
}

impl Harness {
    fn records(&self) -> Vec<AuditRecord> {
        self.audit.records.lock().unwrap().clone()
    }
}

fn harness(script: Script, outcome: ExecutionOutcome) -> Harness {
    build(script, outcome, false, false)
}

fn build(script: Script, outcome: ExecutionOutcome, catalog_fails: bool, audit_fails: bool) -> Harness {
    let policy = Policy::default();
    let generator = Arc::new(FakeGenerator {
        script,
        seen_schema: Mutex::new(None),
    });
    let executor = Arc::new(FakeExecutor {
        outcome,
        calls: AtomicUsize::new(0),
        last_sql: Mutex::new(None),
    });
    let audit = Arc::new(RecordingAudit {
        records: Mutex::new(Vec::new()),
        fail: audit_fails,
    });
    let catalog = Arc::new(SchemaCatalog::new(Arc::new(FakeSource { fail: catalog_fails }), &policy));
    let assistant = QueryAssistant::new(
        generator.clone(),
        catalog,
        PolicyEngine::new(policy),
        executor.clone(),
        audit.clone(),
    );
    Harness {
        assistant,
        generator,
        executor,
        audit,
    }
}

fn two_rows() -> ExecutionOutcome {
    let row = |id: i64, status: &str| {
        Row::new(vec![
            ("id".into(), ScalarValue::Integer(id)),
            ("status".into(), ScalarValue::Text(status.into())),
        ])
    };
    ExecutionOutcome::Success(ResultSet {
        columns: vec!["id".into(), "status".into()],
        rows: vec![row(1, "open"), row(2, "won")],
        elapsed: Duration::from_micros(4_321),
    })
}

#[tokio::test]
async fn success_path() {
    let h = harness(Script::Sql("SELECT id, status FROM leads"), two_rows());
    let resp = h.assistant.ask("show me leads").await;

    assert!(resp.success);
    assert_eq!(resp.terminal, Terminal::Succeeded);
    assert!(resp.can_answer && resp.validation_passed);
    assert_eq!(resp.generated_sql.as_deref(), Some("SELECT id, status FROM leads"));
    assert_eq!(resp.validated_sql.as_deref(), Some("SELECT id, status FROM leads\nLIMIT 500"));
    assert_eq!(resp.columns, vec!["id", "status"]);
    assert_eq!(resp.row_count, 2);
    assert_eq!(resp.execution_time_ms, Some(4.32));
    assert!(resp.error.is_none());

    assert_eq!(
        h.executor.last_sql.lock().unwrap().as_deref(),
        Some("SELECT id, status FROM leads\nLIMIT 500")
    );
    let schema = h.generator.seen_schema.lock().unwrap().clone().unwrap();
    assert!(schema.contains("Table: leads"));

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].validation_passed);
    assert_eq!(records[0].row_count, Some(2));
    assert_eq!(records[0].execution_time_ms, Some(4.32));
    assert!(records[0].error_message.is_none());
}

#[tokio::test]
async fn cannot_answer_path() {
    let h = harness(Script::CannotAnswer, two_rows());
    let resp = h.assistant.ask("what's the weather?").await;

    assert!(!resp.success);
    assert!(!resp.can_answer);
    assert_eq!(resp.terminal, Terminal::SchemaInsufficient);
    assert!(resp.generated_sql.is_none());
    assert_eq!(resp.error.as_deref(), Some(CANNOT_ANSWER_GUIDANCE));
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].generated_sql.is_none());
    assert_eq!(records[0].error_message.as_deref(), Some("Schema cannot answer question."));
}

#[tokio::test]
async fn generation_error_path() {
    let h = harness(Script::Unavailable, two_rows());
    let resp = h.assistant.ask("how many leads?").await;

    assert!(!resp.success);
    assert!(resp.can_answer);
    assert_eq!(resp.terminal, Terminal::GenerationError);
    let error = resp.error.unwrap();
    assert!(error.starts_with("Cannot connect to Ollama at http://localhost:11434"));
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].generated_sql.is_none());
    assert!(!records[0].validation_passed);
    assert_eq!(records[0].error_message.as_deref(), Some(error.as_str()));
}

#[tokio::test]
async fn catalog_failure_is_a_generation_error() {
    let h = build(Script::Sql("SELECT 1"), two_rows(), true, false);
    let resp = h.assistant.ask("how many leads?").await;

    assert_eq!(resp.terminal, Terminal::GenerationError);
    assert!(resp
        .error
        .as_deref()
        .unwrap()
        .starts_with("Could not read the database schema: "));
    assert!(h.generator.seen_schema.lock().unwrap().is_none());
    assert_eq!(h.records().len(), 1);
}

#[tokio::test]
async fn validation_rejection_path() {
    let h = harness(Script::Sql("SELECT * FROM leads; DROP TABLE leads"), two_rows());
    let resp = h.assistant.ask("delete everything").await;

    assert!(!resp.success);
    assert_eq!(resp.terminal, Terminal::ValidationRejected);
    assert!(!resp.validation_passed);
    assert!(resp.validated_sql.is_none());
    let reason = resp.validation_error.clone().unwrap();
    assert_eq!(reason, "Forbidden keyword detected: 'DROP'. Only SELECT queries are allowed.");
    assert_eq!(resp.error.as_deref(), Some(format!("Query blocked: {reason}").as_str()));
    assert_eq!(h.executor.calls.load(Ordering::SeqCst), 0);

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].generated_sql.as_deref(),
        Some("SELECT * FROM leads; DROP TABLE leads")
    );
    assert!(!records[0].validation_passed);
    assert_eq!(records[0].error_message.as_deref(), Some(reason.as_str()));
}

#[tokio::test]
async fn restricted_table_is_blocked() {
    let h = harness(Script::Sql("SELECT password_hash FROM Users"), two_rows());
    let resp = h.assistant.ask("show me passwords").await;
    assert_eq!(resp.terminal, Terminal::ValidationRejected);
    assert_eq!(
        resp.validation_error.as_deref(),
        Some("Access to restricted table 'users' is not allowed.")
    );
}

#[tokio::test]
async fn execution_timeout_path() {
    let h = harness(
        Script::Sql("SELECT * FROM leads"),
        ExecutionOutcome::Failure {
            elapsed: Duration::from_millis(30_000),
            error: ExecutionError::Timeout,
        },
    );
    let resp = h.assistant.ask("everything ever").await;

    assert!(!resp.success);
    assert_eq!(resp.terminal, Terminal::ExecutionFailed);
    assert!(resp.validation_passed);
    assert_eq!(resp.error.as_deref(), Some("Query timed out. Try a more specific question."));
    let ms = resp.execution_time_ms.unwrap();
    assert!(ms >= 0.0);
    assert_eq!(ms, 30_000.0);

    let records = h.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].validation_passed);
    assert!(records[0].row_count.is_none());
    assert_eq!(records[0].execution_time_ms, Some(30_000.0));
}

#[tokio::test]
async fn database_error_passes_message_through() {
    let h = harness(
        Script::Sql("SELECT * FROM leadz"),
        ExecutionOutcome::Failure {
            elapsed: Duration::from_millis(2),
            error: ExecutionError::Database("relation \"leadz\" does not exist".into()),
        },
    );
    let resp = h.assistant.ask("leads?").await;
    assert_eq!(
        resp.error.as_deref(),
        Some("Database error: relation \"leadz\" does not exist")
    );
}

#[tokio::test]
async fn audit_failure_does_not_change_the_response() {
    let h = build(Script::Sql("SELECT id FROM leads"), two_rows(), false, true);
    let resp = h.assistant.ask("leads").await;
    assert!(resp.success);
    assert_eq!(resp.row_count, 2);
    assert_eq!(h.records().len(), 1);
}

#[tokio::test]
async fn stuck_audit_sink_does_not_hold_the_response() {
    let policy = Policy::default();
    let executor = Arc::new(FakeExecutor {
        outcome: two_rows(),
        calls: AtomicUsize::new(0),
        last_sql: Mutex::new(None),
    });
    let assistant = QueryAssistant::new(
        Arc::new(FakeGenerator {
            script: Script::Sql("SELECT id, status FROM leads"),
            seen_schema: Mutex::new(None),
        }),
        Arc::new(SchemaCatalog::new(Arc::new(FakeSource { fail: false }), &policy)),
        PolicyEngine::new(policy),
        executor,
        Arc::new(StuckAudit),
    )
    .with_audit_timeout(Duration::from_millis(50));

    let resp = tokio::time::timeout(Duration::from_secs(2), assistant.ask("leads"))
        .await
        .expect("ask returned while the audit sink hung");
    assert!(resp.success);
    assert_eq!(resp.row_count, 2);
}

#[tokio::test]
async fn static_engine_end_to_end() {
    let policy = Policy::default();
    let audit = Arc::new(RecordingAudit::default());
    let executor = Arc::new(FakeExecutor {
        outcome: two_rows(),
        calls: AtomicUsize::new(0),
        last_sql: Mutex::new(None),
    });
    let assistant = QueryAssistant::new(
        Arc::new(LlmSqlGenerator::new(Arc::new(StaticLlmEngine::new(
            "```sql\nSELECT id, status FROM leads LIMIT 10;\n```",
        )))),
        Arc::new(SchemaCatalog::new(Arc::new(FakeSource { fail: false }), &policy)),
        PolicyEngine::new(policy),
        executor.clone(),
        audit.clone(),
    );

    let resp = assistant.ask("ten leads").await;
    assert!(resp.success);
    assert_eq!(resp.validated_sql.as_deref(), Some("SELECT id, status FROM leads LIMIT 10"));
    assert_eq!(audit.records.lock().unwrap().len(), 1);
}
