use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use quarry_audit::AuditSink;
use quarry_core::{assemble, QueryAssistant, Settings};
use quarry_store::Database;
use quarry_types::{AuditEntry, CatalogEntry, QueryResponse};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct AppState {
    assistant: Arc<QueryAssistant>,
    /// Pinged by `/healthz` when present.
    database: Option<Database>,
}

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
struct QueryRequest {
    question: String,
}

#[derive(Debug, Serialize)]
struct CatalogResponse {
    text: String,
    tables: Vec<CatalogEntry>,
}

#[derive(Debug, Serialize)]
struct TablesResponse {
    tables: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AuditParams {
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

fn default_audit_limit() -> usize {
    20
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    let assembly = assemble(&settings).await?;
    let state = AppState {
        assistant: assembly.assistant,
        database: Some(assembly.database.clone()),
    };

    let listener = tokio::net::TcpListener::bind(settings.http_addr).await?;
    info!(addr = %settings.http_addr, "quarry HTTP server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    assembly.database.close().await;
    Ok(())
}

fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/query", post(query))
        .route("/v1/catalog", get(catalog))
        .route("/v1/catalog/invalidate", post(invalidate_catalog))
        .route("/v1/tables", get(tables))
        .route("/v1/audit", get(audit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn healthz(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    if let Some(db) = &state.database {
        db.ping().await.map_err(|e| {
            warn!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        })?;
    }
    Ok("ok")
}

async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let question = req.question.trim();
    if question.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "question must not be empty".into()));
    }
    Ok(Json(state.assistant.ask(question).await))
}

async fn catalog(State(state): State<AppState>) -> Result<Json<CatalogResponse>, ApiError> {
    let description = state
        .assistant
        .describe_schema()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(CatalogResponse {
        text: description.text.clone(),
        tables: description.entries.clone(),
    }))
}

async fn invalidate_catalog(State(state): State<AppState>) -> StatusCode {
    state.assistant.catalog().invalidate().await;
    StatusCode::NO_CONTENT
}

async fn tables(State(state): State<AppState>) -> Result<Json<TablesResponse>, ApiError> {
    let tables = state
        .assistant
        .catalog()
        .table_names()
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(TablesResponse { tables }))
}

async fn audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<Vec<AuditEntry>>, ApiError> {
    let entries = state
        .assistant
        .audit()
        .recent(params.limit)
        .await
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
    Ok(Json(entries))
}
