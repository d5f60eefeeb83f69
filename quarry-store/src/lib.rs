use async_trait::async_trait;
use quarry_types::{CatalogEntry, ExecutionOutcome};
use thiserror::Error;

pub mod catalog;
mod decode;
pub mod executor;
pub mod postgres;

pub use catalog::{CatalogDescription, PgCatalogSource, SchemaCatalog};
pub use executor::{classify_database_error, classify_error, PgExecutor};
pub use postgres::{Database, DbConfig};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid database configuration: {0}")]
    Config(String),
    #[error("{0}")]
    Other(String),
}

/// Runs one already-validated statement under read-only constraints.
///
/// Never returns `Err`: every failure is folded into [`ExecutionOutcome::Failure`].
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str) -> ExecutionOutcome;
}

/// Live database metadata, unfiltered.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Base tables of the default namespace with their columns, ordered by table name then
    /// by physical column position.
    async fn load(&self) -> Result<Vec<CatalogEntry>, StoreError>;

    async fn table_names(&self) -> Result<Vec<String>, StoreError>;
}
