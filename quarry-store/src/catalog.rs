use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use quarry_policy::Policy;
use quarry_types::{CatalogEntry, ColumnInfo};
use sqlx::postgres::PgPool;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{CatalogSource, StoreError};

const COLUMNS_QUERY: &str = "
    SELECT
        c.table_name::text,
        c.column_name::text,
        c.data_type::text,
        c.is_nullable::text = 'YES'
    FROM information_schema.columns c
    JOIN information_schema.tables t
        ON c.table_name = t.table_name
       AND c.table_schema = t.table_schema
    WHERE c.table_schema = 'public'
      AND t.table_type = 'BASE TABLE'
    ORDER BY c.table_name, c.ordinal_position";

const TABLES_QUERY: &str = "
    SELECT table_name::text
    FROM information_schema.tables
    WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
    ORDER BY table_name";

/// Reads `information_schema` through the shared pool.
pub struct PgCatalogSource {
    pool: PgPool,
}

impl PgCatalogSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CatalogSource for PgCatalogSource {
    async fn load(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows: Vec<(String, String, String, bool)> =
            sqlx::query_as(COLUMNS_QUERY).fetch_all(&self.pool).await?;

        let mut entries: Vec<CatalogEntry> = Vec::new();
        for (table, name, data_type, nullable) in rows {
            let column = ColumnInfo {
                name,
                data_type,
                nullable,
            };
            match entries.last_mut() {
                Some(entry) if entry.table == table => entry.columns.push(column),
                _ => entries.push(CatalogEntry {
                    table,
                    columns: vec![column],
                }),
            }
        }
        Ok(entries)
    }

    async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as(TABLES_QUERY).fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(t,)| t).collect())
    }
}

/// Rendered, filtered catalog as handed to the generation prompt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatalogDescription {
    pub entries: Vec<CatalogEntry>,
    pub text: String,
}

impl CatalogDescription {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        let text = render(&entries);
        Self { entries, text }
    }
}

fn render(entries: &[CatalogEntry]) -> String {
    if entries.is_empty() {
        return "No accessible tables found.".into();
    }
    let mut lines = vec!["Available database tables and columns:".to_string(), String::new()];
    for entry in entries {
        lines.push(format!("Table: {}", entry.table));
        for col in &entry.columns {
            if col.nullable {
                lines.push(format!("  - {} [{}] (nullable)", col.name, col.data_type));
            } else {
                lines.push(format!("  - {} [{}]", col.name, col.data_type));
            }
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

/// Process-wide schema cache.
///
/// Filled on first use and kept until [`SchemaCatalog::invalidate`]. No lock is held while
/// the source is queried: concurrent misses may each recompute, and the last write wins.
pub struct SchemaCatalog {
    source: Arc<dyn CatalogSource>,
    restricted: BTreeSet<String>,
    cached: RwLock<Option<Arc<CatalogDescription>>>,
}

impl SchemaCatalog {
    pub fn new(source: Arc<dyn CatalogSource>, policy: &Policy) -> Self {
        Self {
            source,
            restricted: policy.restricted_tables.clone(),
            cached: RwLock::new(None),
        }
    }

    pub async fn describe(&self) -> Result<Arc<CatalogDescription>, StoreError> {
        if let Some(hit) = self.cached.read().await.as_ref() {
            return Ok(Arc::clone(hit));
        }

        // Restricted names are excluded exactly as stored.
        let entries: Vec<CatalogEntry> = self
            .source
            .load()
            .await?
            .into_iter()
            .filter(|e| !self.restricted.contains(&e.table))
            .collect();
        let description = Arc::new(CatalogDescription::new(entries));
        info!(tables = description.entries.len(), "schema catalog loaded");

        *self.cached.write().await = Some(Arc::clone(&description));
        Ok(description)
    }

    /// Drop the cached catalog; the next `describe` reads live metadata again.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
        debug!("schema catalog invalidated");
    }

    pub async fn is_cached(&self) -> bool {
        self.cached.read().await.is_some()
    }

    /// Accessible base tables, read live (not cached).
    pub async fn table_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .source
            .table_names()
            .await?
            .into_iter()
            .filter(|t| !self.restricted.contains(t))
            .collect())
    }
}
