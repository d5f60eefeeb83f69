use std::sync::Arc;
use std::time::Duration;

use quarry_audit::AuditSink;
use quarry_infer::{Generation, SqlGenerator};
use quarry_policy::{Policy, PolicyEngine, Verdict};
use quarry_store::{CatalogDescription, QueryExecutor, SchemaCatalog, StoreError};
use quarry_types::{elapsed_ms, AuditRecord, ExecutionOutcome, QueryResponse, Terminal};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Shown to the user when the model decides the schema has nothing relevant.
pub const CANNOT_ANSWER_GUIDANCE: &str = "I couldn't find relevant data in the database to answer that question. \
     Try rephrasing or asking about a different topic.";

const CANNOT_ANSWER_AUDIT: &str = "Schema cannot answer question.";

/// Upper bound on the audit write that runs before `ask` returns.
pub const DEFAULT_AUDIT_TIMEOUT: Duration = Duration::from_secs(10);

/// The orchestrator: wires generation, admission control, execution and audit together.
pub struct QueryAssistant {
    generator: Arc<dyn SqlGenerator>,
    catalog: Arc<SchemaCatalog>,
    policy: PolicyEngine,
    executor: Arc<dyn QueryExecutor>,
    audit: Arc<dyn AuditSink>,
    audit_timeout: Duration,
}

impl QueryAssistant {
    pub fn new(
        generator: Arc<dyn SqlGenerator>,
        catalog: Arc<SchemaCatalog>,
        policy: PolicyEngine,
        executor: Arc<dyn QueryExecutor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            generator,
            catalog,
            policy,
            executor,
            audit,
            audit_timeout: DEFAULT_AUDIT_TIMEOUT,
        }
    }

    pub fn with_audit_timeout(mut self, timeout: Duration) -> Self {
        self.audit_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn policy(&self) -> &Policy {
        self.policy.policy()
    }

    pub fn validate(&self, sql: &str) -> Verdict {
        self.policy.validate(sql)
    }

    pub fn audit(&self) -> &Arc<dyn AuditSink> {
        &self.audit
    }

    pub async fn describe_schema(&self) -> Result<Arc<CatalogDescription>, StoreError> {
        self.catalog.describe().await
    }

    /// Answer one question end to end. Never fails: every exit is a [`QueryResponse`], and
    /// exactly one audit record is written on the way out.
    pub async fn ask(&self, question: &str) -> QueryResponse {
        let request_id = Uuid::new_v4();
        let span = info_span!("ask", %request_id);
        async {
            let (response, record) = self.run(question).await;
            info!(
                terminal = ?response.terminal,
                row_count = response.row_count,
                elapsed_ms = response.execution_time_ms,
                "question handled"
            );
            match tokio::time::timeout(self.audit_timeout, self.audit.record(&record)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "audit write failed"),
                Err(_) => warn!(timeout_ms = self.audit_timeout.as_millis() as u64, "audit write timed out"),
            }
            response
        }
        .instrument(span)
        .await
    }

    async fn run(&self, question: &str) -> (QueryResponse, AuditRecord) {
        let mut response = QueryResponse::new(question);
        let mut record = AuditRecord {
            user_question: question.to_string(),
            generated_sql: None,
            validation_passed: false,
            execution_time_ms: None,
            row_count: None,
            error_message: None,
        };

        // Generate. Reading the catalog is part of this stage.
        let schema = match self.catalog.describe().await {
            Ok(schema) => schema,
            Err(e) => {
                let message = format!("Could not read the database schema: {e}");
                warn!(stage = "generate", error = %e, "catalog unavailable");
                response.error = Some(message.clone());
                record.error_message = Some(message);
                return (response, record);
            }
        };

        let candidate = match self.generator.generate_sql(question, &schema.text).await {
            Ok(Generation::Sql(sql)) => sql,
            Ok(Generation::CannotAnswer) => {
                debug!(stage = "generate", "model reports the schema cannot answer");
                response.can_answer = false;
                response.terminal = Terminal::SchemaInsufficient;
                response.error = Some(CANNOT_ANSWER_GUIDANCE.to_string());
                record.error_message = Some(CANNOT_ANSWER_AUDIT.to_string());
                return (response, record);
            }
            Err(e) => {
                warn!(stage = "generate", error = %e, "generation failed");
                let message = e.to_string();
                response.error = Some(message.clone());
                record.error_message = Some(message);
                return (response, record);
            }
        };
        response.generated_sql = Some(candidate.clone());
        record.generated_sql = Some(candidate.clone());

        // Validate.
        let validated = match self.policy.validate(&candidate) {
            Verdict::Accepted(sql) => sql,
            Verdict::Rejected(rejection) => {
                let reason = rejection.to_string();
                info!(stage = "validate", reason = %reason, "query blocked");
                response.terminal = Terminal::ValidationRejected;
                response.validation_error = Some(reason.clone());
                response.error = Some(format!("Query blocked: {reason}"));
                record.error_message = Some(reason);
                return (response, record);
            }
        };
        response.validation_passed = true;
        response.validated_sql = Some(validated.clone());
        record.validation_passed = true;
        record.generated_sql = Some(validated.clone());

        // Execute.
        let outcome = self.executor.execute(&validated).await;
        let ms = elapsed_ms(outcome.elapsed());
        response.execution_time_ms = Some(ms);
        record.execution_time_ms = Some(ms);
        match outcome {
            ExecutionOutcome::Success(result) => {
                response.success = true;
                response.terminal = Terminal::Succeeded;
                response.row_count = result.rows.len();
                response.columns = result.columns;
                response.rows = result.rows;
                record.row_count = Some(response.row_count as i64);
            }
            ExecutionOutcome::Failure { error, .. } => {
                info!(stage = "execute", error = %error, "execution failed");
                let message = error.to_string();
                response.terminal = Terminal::ExecutionFailed;
                response.error = Some(message.clone());
                record.error_message = Some(message);
            }
        }
        (response, record)
    }
}
