use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub mod validator;
pub use validator::{validate, PolicyEngine, Rejection, Verdict};

pub const DEFAULT_MAX_ROWS: u32 = 500;
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RESTRICTED_TABLES: &[&str] =
    &["query_logs", "users", "secrets", "passwords", "api_keys"];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Admission policy for generated SQL. Built once at startup and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    pub max_rows: u32,
    pub statement_timeout: Duration,
    /// Table identifiers that may never be referenced. Matched case-insensitively.
    pub restricted_tables: BTreeSet<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_rows: DEFAULT_MAX_ROWS,
            statement_timeout: Duration::from_secs(DEFAULT_STATEMENT_TIMEOUT_SECS),
            restricted_tables: DEFAULT_RESTRICTED_TABLES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

/// On-disk form of a policy. Missing keys keep their defaults.
#[derive(Clone, Debug, Default, Deserialize)]
struct PolicyFile {
    max_rows: Option<u32>,
    statement_timeout_secs: Option<u64>,
    restricted_tables: Option<Vec<String>>,
}

impl Policy {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let text = fs::read_to_string(path).map_err(|e| PolicyError::Io(e.to_string()))?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, PolicyError> {
        let file: PolicyFile =
            serde_yaml::from_str(text).map_err(|e| PolicyError::Parse(e.to_string()))?;
        let mut policy = Self::default();
        if let Some(max_rows) = file.max_rows {
            policy.max_rows = max_rows;
        }
        if let Some(secs) = file.statement_timeout_secs {
            policy.statement_timeout = Duration::from_secs(secs);
        }
        if let Some(tables) = file.restricted_tables {
            policy.restricted_tables = normalize_tables(tables);
        }
        policy.check()?;
        Ok(policy)
    }

    /// Apply `MAX_ROWS`, `QUERY_TIMEOUT` (seconds) and `RESTRICTED_TABLES` (comma list)
    /// on top of `self`, reading variables through `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, PolicyError> {
        if let Some(v) = lookup("MAX_ROWS") {
            self.max_rows = v.trim().parse().map_err(|_| PolicyError::InvalidValue {
                key: "MAX_ROWS",
                value: v.clone(),
            })?;
        }
        if let Some(v) = lookup("QUERY_TIMEOUT") {
            let secs: u64 = v.trim().parse().map_err(|_| PolicyError::InvalidValue {
                key: "QUERY_TIMEOUT",
                value: v.clone(),
            })?;
            self.statement_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("RESTRICTED_TABLES") {
            self.restricted_tables = normalize_tables(v.split(',').map(str::to_string));
        }
        self.check()?;
        Ok(self)
    }

    pub fn from_env() -> Result<Self, PolicyError> {
        Self::default().with_overrides(|k| std::env::var(k).ok())
    }

    pub fn is_restricted(&self, table: &str) -> bool {
        self.restricted_tables.contains(table)
    }

    fn check(&self) -> Result<(), PolicyError> {
        if self.max_rows == 0 {
            return Err(PolicyError::InvalidValue {
                key: "max_rows",
                value: "0".into(),
            });
        }
        if self.statement_timeout.is_zero() {
            return Err(PolicyError::InvalidValue {
                key: "statement_timeout",
                value: "0".into(),
            });
        }
        Ok(())
    }
}

fn normalize_tables(tables: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    tables
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let p = Policy::default();
        assert_eq!(p.max_rows, 500);
        assert_eq!(p.statement_timeout, Duration::from_secs(30));
        assert!(p.is_restricted("query_logs"));
        assert!(p.is_restricted("api_keys"));
    }

    #[test]
    fn yaml_overrides_only_given_keys() {
        let p = Policy::from_yaml("max_rows: 50\nrestricted_tables: [payroll, ' audit ']\n").unwrap();
        assert_eq!(p.max_rows, 50);
        assert_eq!(p.statement_timeout, Duration::from_secs(30));
        assert_eq!(
            p.restricted_tables.iter().cloned().collect::<Vec<_>>(),
            vec!["audit".to_string(), "payroll".to_string()]
        );
    }

    #[test]
    fn env_overrides_are_parsed() {
        let vars: HashMap<&str, &str> = [
            ("MAX_ROWS", "25"),
            ("QUERY_TIMEOUT", "5"),
            ("RESTRICTED_TABLES", "a, b,,c"),
        ]
        .into_iter()
        .collect();
        let p = Policy::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(p.max_rows, 25);
        assert_eq!(p.statement_timeout, Duration::from_secs(5));
        assert_eq!(p.restricted_tables.len(), 3);
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let err = Policy::default()
            .with_overrides(|k| (k == "MAX_ROWS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidValue { key: "MAX_ROWS", .. }));
    }

    #[test]
    fn zero_rows_rejected() {
        assert!(Policy::from_yaml("max_rows: 0").is_err());
    }
}
