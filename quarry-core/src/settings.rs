//! Process configuration, read from the environment once at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use quarry_audit::{AuditSink, JsonlAuditLog, NullAuditLog, PgAuditLog};
use quarry_infer::{LlmEngine, LlmSqlGenerator, OllamaEngine, OpenAiCompatEngine, StaticLlmEngine};
use quarry_policy::{Policy, PolicyEngine};
use quarry_store::{Database, DbConfig, PgCatalogSource, PgExecutor, SchemaCatalog};
use tracing::info;

use crate::assistant::DEFAULT_AUDIT_TIMEOUT;
use crate::QueryAssistant;

#[derive(Clone, Debug)]
pub enum LlmBackend {
    Ollama { base_url: String, model: String },
    OpenAi { base_url: String, model: String, seed: Option<u64> },
    Static { response: String },
}

#[derive(Clone, Debug)]
pub struct LlmSettings {
    pub backend: LlmBackend,
    pub timeout: Duration,
}

impl LlmSettings {
    pub fn engine(&self) -> anyhow::Result<Arc<dyn LlmEngine>> {
        let engine: Arc<dyn LlmEngine> = match &self.backend {
            LlmBackend::Ollama { base_url, model } => {
                Arc::new(OllamaEngine::new(base_url.clone(), model.clone(), self.timeout)?)
            }
            LlmBackend::OpenAi { base_url, model, seed } => Arc::new(OpenAiCompatEngine::new(
                base_url.clone(),
                model.clone(),
                *seed,
                self.timeout,
            )?),
            LlmBackend::Static { response } => Arc::new(StaticLlmEngine::new(response.clone())),
        };
        Ok(engine)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuditSettings {
    Postgres,
    Jsonl(PathBuf),
    None,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub database: DbConfig,
    pub llm: LlmSettings,
    pub policy: Policy,
    pub audit: AuditSettings,
    pub audit_timeout: Duration,
    pub http_addr: SocketAddr,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = DbConfig::default();
        let database = DbConfig {
            url: lookup("DATABASE_URL"),
            host: lookup("DB_HOST").unwrap_or(defaults.host),
            port: parse_or(&lookup, "DB_PORT", defaults.port)?,
            name: lookup("DB_NAME").unwrap_or_default(),
            user: lookup("DB_USER").unwrap_or_default(),
            password: lookup("DB_PASSWORD").unwrap_or_default(),
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.max_connections)?,
            acquire_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DB_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )?),
        };

        let backend = match lookup("LLM_BACKEND").as_deref().unwrap_or("ollama") {
            "ollama" => LlmBackend::Ollama {
                base_url: lookup("OLLAMA_BASE_URL").unwrap_or_else(|| "http://localhost:11434".into()),
                model: lookup("OLLAMA_MODEL").unwrap_or_else(|| "llama3.1".into()),
            },
            "openai" => LlmBackend::OpenAi {
                base_url: lookup("LLM_LOCAL_URL").unwrap_or_else(|| "http://localhost:8000/v1".into()),
                model: lookup("LLM_MODEL").unwrap_or_else(|| "mistralai/Mistral-7B-Instruct-v0.3".into()),
                seed: lookup("LLM_SEED")
                    .map(|v| v.parse::<u64>().with_context(|| format!("LLM_SEED={v}")))
                    .transpose()?,
            },
            "static" => LlmBackend::Static {
                response: lookup("LLM_STATIC_RESPONSE").unwrap_or_else(|| quarry_infer::generator::CANNOT_ANSWER.into()),
            },
            other => bail!("unknown LLM_BACKEND {other:?} (expected ollama, openai or static)"),
        };
        let llm = LlmSettings {
            backend,
            timeout: Duration::from_secs(parse_or(&lookup, "LLM_TIMEOUT_SECS", 120u64)?),
        };

        let base_policy = match lookup("QUARRY_POLICY_FILE") {
            Some(path) => Policy::from_path(&path).with_context(|| format!("policy file {path}"))?,
            None => Policy::default(),
        };
        let policy = base_policy.with_overrides(&lookup)?;

        let audit = match lookup("AUDIT_SINK").as_deref().unwrap_or("postgres") {
            "postgres" => AuditSettings::Postgres,
            "jsonl" => AuditSettings::Jsonl(
                lookup("AUDIT_FILE")
                    .unwrap_or_else(|| "./query_audit.jsonl".into())
                    .into(),
            ),
            "none" => AuditSettings::None,
            other => bail!("unknown AUDIT_SINK {other:?} (expected postgres, jsonl or none)"),
        };
        let audit_timeout = Duration::from_secs(parse_or(
            &lookup,
            "AUDIT_TIMEOUT_SECS",
            DEFAULT_AUDIT_TIMEOUT.as_secs(),
        )?);

        let http_addr = lookup("QUARRY_HTTP_ADDR")
            .unwrap_or_else(|| "0.0.0.0:7000".into())
            .parse()
            .context("QUARRY_HTTP_ADDR")?;

        Ok(Self {
            database,
            llm,
            policy,
            audit,
            audit_timeout,
            http_addr,
        })
    }

    pub fn audit_sink(&self) -> anyhow::Result<Arc<dyn AuditSink>> {
        let sink: Arc<dyn AuditSink> = match &self.audit {
            AuditSettings::Postgres => Arc::new(PgAuditLog::new(self.database.connect_options()?)),
            AuditSettings::Jsonl(path) => Arc::new(
                JsonlAuditLog::open(path).with_context(|| format!("audit file {}", path.display()))?,
            ),
            AuditSettings::None => Arc::new(NullAuditLog),
        };
        Ok(sink)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(v) => v.trim().parse().map_err(|e| anyhow!("{key}={v}: {e}")),
        None => Ok(default),
    }
}

/// Everything an entry point needs: the pool (to close on shutdown) and the assistant.
pub struct Assembly {
    pub database: Database,
    pub assistant: Arc<QueryAssistant>,
}

/// Open the pool and wire the production components together.
pub async fn assemble(settings: &Settings) -> anyhow::Result<Assembly> {
    let database = Database::connect(&settings.database, settings.policy.statement_timeout).await?;
    let generator = Arc::new(LlmSqlGenerator::new(settings.llm.engine()?));
    let catalog = Arc::new(SchemaCatalog::new(
        Arc::new(PgCatalogSource::new(database.pool().clone())),
        &settings.policy,
    ));
    let executor = Arc::new(PgExecutor::new(database.pool().clone()));
    let assistant = QueryAssistant::new(
        generator,
        catalog,
        PolicyEngine::new(settings.policy.clone()),
        executor,
        settings.audit_sink()?,
    )
    .with_audit_timeout(settings.audit_timeout);
    info!(
        max_rows = settings.policy.max_rows,
        restricted = settings.policy.restricted_tables.len(),
        audit = ?settings.audit,
        "query assistant ready"
    );
    Ok(Assembly {
        database,
        assistant: Arc::new(assistant),
    })
}
