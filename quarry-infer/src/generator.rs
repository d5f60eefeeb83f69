//! Natural language → SQL on top of any [`LlmEngine`].

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use thiserror::Error;
use tracing::debug;

use crate::{LlmEngine, LlmError, LlmRequest};

/// Sentinel the model is told to emit when the schema cannot answer the question.
pub const CANNOT_ANSWER: &str = "CANNOT_ANSWER";

const SYSTEM_PROMPT: &str = "You translate business questions into PostgreSQL queries.

Rules:
1. Reply with the raw SQL only. No markdown, no code fences, no explanation.
2. Write a single SELECT statement. Never write INSERT, UPDATE, DELETE, DROP, ALTER, TRUNCATE, GRANT, REVOKE or any other DDL/DML.
3. Only use the tables and columns listed below.
4. Use standard PostgreSQL functions (NOW(), INTERVAL, DATE_TRUNC, ...).
5. Alias every table in a JOIN.
6. Name columns explicitly instead of SELECT *.
7. When the question is ambiguous, make a reasonable business assumption.
8. When the tables below cannot answer the question, reply with exactly: CANNOT_ANSWER

";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Generation {
    Sql(String),
    CannotAnswer,
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("The model returned an empty response. Try rephrasing your question.")]
    Empty,
}

/// The generation collaborator: question plus schema description in, one candidate out.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(&self, question: &str, schema: &str) -> Result<Generation, GenerationError>;
}

pub struct LlmSqlGenerator {
    engine: Arc<dyn LlmEngine>,
    max_tokens: u32,
}

impl LlmSqlGenerator {
    pub fn new(engine: Arc<dyn LlmEngine>) -> Self {
        Self {
            engine,
            max_tokens: 1024,
        }
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate_sql(&self, question: &str, schema: &str) -> Result<Generation, GenerationError> {
        let req = LlmRequest {
            system: format!("{SYSTEM_PROMPT}{schema}"),
            prompt: question.to_string(),
            max_tokens: self.max_tokens,
            temperature: 0.0,
        };

        let mut stream = self.engine.generate(req).await?;
        let mut raw = String::new();
        while let Some(tok) = stream.next().await {
            raw.push_str(&tok?.text);
        }
        debug!(chars = raw.len(), "model output received");

        interpret(&raw)
    }
}

/// Strip code fences some models add anyway, drop blank lines.
pub fn clean_model_output(raw: &str) -> String {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.get(..3) {
            Some(tag) if tag.eq_ignore_ascii_case("sql") => &rest[3..],
            _ => rest,
        };
    }
    text = text.trim();
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn interpret(raw: &str) -> Result<Generation, GenerationError> {
    let cleaned = clean_model_output(raw);
    if cleaned.is_empty() {
        return Err(GenerationError::Empty);
    }
    if cleaned.trim().eq_ignore_ascii_case(CANNOT_ANSWER) {
        return Ok(Generation::CannotAnswer);
    }
    Ok(Generation::Sql(cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StaticLlmEngine, TokenStream};

    #[test]
    fn fences_and_blank_lines_removed() {
        assert_eq!(
            clean_model_output("```sql\nSELECT id\n\n  FROM leads\n```"),
            "SELECT id\n  FROM leads"
        );
        assert_eq!(clean_model_output("```SQL SELECT 1```"), "SELECT 1");
        assert_eq!(clean_model_output("```\nSELECT 1\n```"), "SELECT 1");
        assert_eq!(clean_model_output("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn sentinel_detected_case_insensitively() {
        assert_eq!(interpret(" cannot_answer \n").unwrap(), Generation::CannotAnswer);
        assert_eq!(interpret("```\nCANNOT_ANSWER\n```").unwrap(), Generation::CannotAnswer);
    }

    #[test]
    fn empty_output_is_an_error() {
        assert!(matches!(interpret("``` ```"), Err(GenerationError::Empty)));
        assert!(matches!(interpret("  "), Err(GenerationError::Empty)));
    }

    #[tokio::test]
    async fn generator_returns_cleaned_sql() {
        let generator = LlmSqlGenerator::new(Arc::new(StaticLlmEngine::new("```sql\nSELECT count(*) FROM leads\n```")));
        let out = generator.generate_sql("how many leads", "Table: leads").await.unwrap();
        assert_eq!(out, Generation::Sql("SELECT count(*) FROM leads".into()));
    }

    struct DownEngine;

    #[async_trait]
    impl LlmEngine for DownEngine {
        async fn generate(&self, _req: LlmRequest) -> Result<TokenStream, LlmError> {
            Err(LlmError::Timeout { backend: "Ollama" })
        }
    }

    #[tokio::test]
    async fn engine_errors_pass_through() {
        let generator = LlmSqlGenerator::new(Arc::new(DownEngine));
        let err = generator.generate_sql("q", "s").await.unwrap_err();
        assert!(err.to_string().starts_with("Ollama request timed out"));
    }
}
