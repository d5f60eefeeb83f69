//! Connection pool construction. The pool is built once by the entry point and handed to
//! the executor and the catalog source; nothing here is global.

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::info;

use crate::StoreError;

#[derive(Clone, Debug)]
pub struct DbConfig {
    /// Full `postgres://` URL. Takes precedence over the individual fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "localhost".into(),
            port: 5432,
            name: String::new(),
            user: String::new(),
            password: String::new(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        let opts = match &self.url {
            Some(url) => PgConnectOptions::from_str(url).map_err(|e| StoreError::Config(e.to_string()))?,
            None => {
                let mut opts = PgConnectOptions::new().host(&self.host).port(self.port);
                if !self.name.is_empty() {
                    opts = opts.database(&self.name);
                }
                if !self.user.is_empty() {
                    opts = opts.username(&self.user);
                }
                if !self.password.is_empty() {
                    opts = opts.password(&self.password);
                }
                opts
            }
        };
        Ok(opts.application_name("quarry"))
    }
}

/// The shared, bounded connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    options: PgConnectOptions,
}

impl Database {
    /// Open the pool. Every pooled session gets a server-side `statement_timeout`, so a
    /// runaway query is cancelled by the database itself.
    pub async fn connect(config: &DbConfig, statement_timeout: Duration) -> Result<Self, StoreError> {
        let options = config.connect_options()?;
        let pooled = options
            .clone()
            .options([("statement_timeout", statement_timeout.as_millis().to_string())]);
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(pooled)
            .await?;
        info!(
            max_connections = config.max_connections,
            statement_timeout_ms = statement_timeout.as_millis() as u64,
            "database pool open"
        );
        Ok(Self { pool, options })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connection options without pool-specific session settings, for side connections.
    pub fn connect_options(&self) -> &PgConnectOptions {
        &self.options
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("database pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_takes_precedence() {
        let cfg = DbConfig {
            url: Some("postgres://alice:pw@db.internal:6543/sales".into()),
            host: "ignored".into(),
            ..DbConfig::default()
        };
        let opts = cfg.connect_options().unwrap();
        assert_eq!(opts.get_host(), "db.internal");
        assert_eq!(opts.get_port(), 6543);
        assert_eq!(opts.get_database(), Some("sales"));
    }

    #[test]
    fn fields_used_without_url() {
        let cfg = DbConfig {
            name: "crm".into(),
            user: "reader".into(),
            ..DbConfig::default()
        };
        let opts = cfg.connect_options().unwrap();
        assert_eq!(opts.get_host(), "localhost");
        assert_eq!(opts.get_port(), 5432);
        assert_eq!(opts.get_username(), "reader");
    }

    #[test]
    fn bad_url_is_a_config_error() {
        let cfg = DbConfig {
            url: Some("not a url".into()),
            ..DbConfig::default()
        };
        assert!(matches!(cfg.connect_options(), Err(StoreError::Config(_))));
    }
}
