//! Admission control for model-generated SQL.
//!
//! Checks run cheapest and most dangerous first; the first failing check decides the verdict.
//! The only rewrite ever applied to an accepted statement is an appended `LIMIT`.

use std::sync::OnceLock;

use regex::Regex;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use thiserror::Error;

use crate::Policy;

/// Data-modification, data-definition and privileged I/O words that may not appear anywhere.
const FORBIDDEN_PATTERN: &str = r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|TRUNCATE|CREATE|REPLACE|GRANT|REVOKE|EXEC|EXECUTE|CALL|COPY|LOAD|IMPORT|EXPORT|pg_read_file|pg_write_file|lo_import|lo_export|DBLINK)\b";

const LIMIT_PATTERN: &str = r"(?i)\bLIMIT\s+\d+\b";

/// Leading words that open a data-manipulation statement.
const DML_KEYWORDS: &[&str] = &[
    "SELECT", "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "REPLACE",
];

fn forbidden_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FORBIDDEN_PATTERN).expect("static pattern"))
}

fn limit_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(LIMIT_PATTERN).expect("static pattern"))
}

/// Why a candidate statement was refused. `Display` is the user-facing reason.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("Empty query received.")]
    Empty,
    #[error("Forbidden keyword detected: '{0}'. Only SELECT queries are allowed.")]
    ForbiddenKeyword(String),
    #[error("Multiple SQL statements detected. Only a single SELECT is allowed.")]
    MultipleStatements,
    #[error("Query must start with SELECT. Got: '{0}'.")]
    WrongStatement(String),
    #[error("Only SELECT queries are permitted.")]
    NotSelect,
    #[error("Access to restricted table '{0}' is not allowed.")]
    RestrictedTable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Normalized statement, with a row limit appended when it had none.
    Accepted(String),
    Rejected(Rejection),
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }

    pub fn sql(&self) -> Option<&str> {
        match self {
            Verdict::Accepted(sql) => Some(sql),
            Verdict::Rejected(_) => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PolicyEngine {
    policy: Policy,
}

impl PolicyEngine {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn validate(&self, raw_sql: &str) -> Verdict {
        match self.check(raw_sql) {
            Ok(sql) => Verdict::Accepted(sql),
            Err(r) => Verdict::Rejected(r),
        }
    }

    fn check(&self, raw_sql: &str) -> Result<String, Rejection> {
        let sql = raw_sql.trim();
        if sql.is_empty() {
            return Err(Rejection::Empty);
        }

        if let Some(m) = forbidden_regex().find(sql) {
            return Err(Rejection::ForbiddenKeyword(m.as_str().to_string()));
        }

        let body = strip_terminator(sql);
        if body.contains(';') {
            return Err(Rejection::MultipleStatements);
        }
        if body.is_empty() {
            return Err(Rejection::Empty);
        }

        let dialect = PostgreSqlDialect {};
        let tokens = Tokenizer::new(&dialect, body).tokenize().ok();

        check_statement_shape(body, tokens.as_deref())?;

        for table in &self.policy.restricted_tables {
            if contains_word(body, table) {
                return Err(Rejection::RestrictedTable(table.clone()));
            }
        }

        if has_limit_clause(body, tokens.as_deref()) {
            Ok(body.to_string())
        } else {
            Ok(format!("{body}\nLIMIT {}", self.policy.max_rows))
        }
    }
}

/// Validate `raw_sql` against `policy`. Pure: no I/O, same input gives the same verdict.
pub fn validate(raw_sql: &str, policy: &Policy) -> Verdict {
    PolicyEngine::new(policy.clone()).validate(raw_sql)
}

/// Drop a single trailing statement terminator.
fn strip_terminator(sql: &str) -> &str {
    sql.strip_suffix(';').unwrap_or(sql).trim_end()
}

/// The statement must open with the SELECT verb.
///
/// The tokenizer decides when it can: a leading DML word other than SELECT is named in the
/// rejection. When tokenizing fails, or the first token is not a DML word (comment, CTE,
/// parenthesis, identifier), a literal prefix test on the upper-cased text decides instead.
fn check_statement_shape(body: &str, tokens: Option<&[Token]>) -> Result<(), Rejection> {
    let leading = tokens.and_then(|tokens| tokens.iter().find(|t| !is_blank(t)));

    if let Some(Token::Word(word)) = leading {
        if word.quote_style.is_none() && is_dml(&word.value) {
            return if word.value.eq_ignore_ascii_case("SELECT") {
                Ok(())
            } else {
                Err(Rejection::WrongStatement(word.value.to_uppercase()))
            };
        }
    }

    if body.trim_start().to_uppercase().starts_with("SELECT") {
        Ok(())
    } else {
        Err(Rejection::NotSelect)
    }
}

/// A `LIMIT <digits>` clause in the statement itself. Comments are whitespace tokens and
/// literals are string tokens, so neither can satisfy it. Untokenizable text falls back to a
/// pattern search.
fn has_limit_clause(body: &str, tokens: Option<&[Token]>) -> bool {
    let Some(tokens) = tokens else {
        return limit_regex().is_match(body);
    };
    let mut meaningful = tokens.iter().filter(|t| !matches!(t, Token::Whitespace(_)));
    while let Some(token) = meaningful.next() {
        if let Token::Word(word) = token {
            if word.quote_style.is_none() && word.value.eq_ignore_ascii_case("LIMIT") {
                if let Some(Token::Number(digits, _)) = meaningful.next() {
                    if digits.chars().all(|c| c.is_ascii_digit()) {
                        return true;
                    }
                }
            }
        }
    }
    false
}

fn is_blank(token: &Token) -> bool {
    matches!(
        token,
        Token::Whitespace(Whitespace::Space | Whitespace::Newline | Whitespace::Tab)
    )
}

fn is_dml(word: &str) -> bool {
    DML_KEYWORDS.iter().any(|k| word.eq_ignore_ascii_case(k))
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Case-insensitive whole-word search: `users` matches `public.users` and `"USERS"` but not
/// `users_archive` or `superusers`.
pub(crate) fn contains_word(haystack: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    let hay = haystack.to_lowercase();
    let needle = word.to_lowercase();
    hay.match_indices(&needle).any(|(start, m)| {
        let before = hay[..start].chars().next_back();
        let after = hay[start + m.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(Policy::default())
    }

    fn reason(sql: &str) -> String {
        match engine().validate(sql) {
            Verdict::Rejected(r) => r.to_string(),
            Verdict::Accepted(s) => panic!("expected rejection, accepted {s:?}"),
        }
    }

    #[test]
    fn select_one_gets_default_limit() {
        assert_eq!(
            engine().validate("SELECT 1"),
            Verdict::Accepted("SELECT 1\nLIMIT 500".into())
        );
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert_eq!(reason("  \n\t "), "Empty query received.");
        assert_eq!(reason(" ; "), "Empty query received.");
    }

    #[test]
    fn forbidden_keyword_named_as_written() {
        assert_eq!(
            reason("select * from leads where 1=1 or DrOp"),
            "Forbidden keyword detected: 'DrOp'. Only SELECT queries are allowed."
        );
    }

    #[test]
    fn forbidden_keyword_inside_comment_still_rejected() {
        assert!(reason("SELECT 1 -- then delete everything").contains("'delete'"));
    }

    #[test]
    fn forbidden_keyword_needs_word_boundary() {
        assert!(engine()
            .validate("SELECT created_at, updated_at FROM leads")
            .is_accepted());
    }

    #[test]
    fn privileged_function_rejected() {
        assert!(reason("SELECT pg_read_file('/etc/passwd')").contains("pg_read_file"));
    }

    #[test]
    fn stacked_statements_rejected() {
        assert_eq!(
            reason("SELECT 1; SELECT 2"),
            "Multiple SQL statements detected. Only a single SELECT is allowed."
        );
    }

    #[test]
    fn only_one_terminator_is_stripped() {
        assert!(engine().validate("SELECT 1;").is_accepted());
        assert!(matches!(
            engine().validate("SELECT 1;;"),
            Verdict::Rejected(Rejection::MultipleStatements)
        ));
    }

    #[test]
    fn leading_dml_verb_is_named() {
        assert_eq!(
            reason("MERGE INTO leads USING staged ON true WHEN MATCHED THEN DO NOTHING"),
            "Query must start with SELECT. Got: 'MERGE'."
        );
    }

    #[test]
    fn non_dml_leading_token_uses_prefix_fallback() {
        assert_eq!(reason("WITH x AS (SELECT 1) SELECT * FROM x"), "Only SELECT queries are permitted.");
        assert_eq!(reason("EXPLAIN SELECT 1"), "Only SELECT queries are permitted.");
        assert_eq!(reason("-- note\nSELECT 1"), "Only SELECT queries are permitted.");
    }

    #[test]
    fn restricted_table_rejected_case_insensitive() {
        assert_eq!(
            reason("SELECT * FROM public.USERS"),
            "Access to restricted table 'users' is not allowed."
        );
    }

    #[test]
    fn restricted_superstring_allowed() {
        assert!(engine().validate("SELECT * FROM users_archive").is_accepted());
        assert!(engine().validate("SELECT * FROM superusers").is_accepted());
    }

    #[test]
    fn existing_limit_kept() {
        assert_eq!(
            engine().validate("select * from leads limit 10;"),
            Verdict::Accepted("select * from leads limit 10".into())
        );
    }

    #[test]
    fn limit_in_comment_or_literal_does_not_count() {
        assert_eq!(
            engine().validate("SELECT * FROM leads -- LIMIT 1"),
            Verdict::Accepted("SELECT * FROM leads -- LIMIT 1\nLIMIT 500".into())
        );
        assert_eq!(
            engine().validate("SELECT * FROM leads WHERE note = 'limit 5'"),
            Verdict::Accepted("SELECT * FROM leads WHERE note = 'limit 5'\nLIMIT 500".into())
        );
        assert!(engine()
            .validate("SELECT * FROM leads /* LIMIT 3 */")
            .sql()
            .is_some_and(|sql| sql.ends_with("\nLIMIT 500")));
    }

    #[test]
    fn appended_limit_after_trailing_comment_is_recognized() {
        let first = engine().validate("SELECT * FROM leads -- LIMIT 1");
        let sql = first.sql().unwrap().to_string();
        assert_eq!(engine().validate(&sql), Verdict::Accepted(sql));
    }

    #[test]
    fn limit_on_its_own_line_counts() {
        assert_eq!(
            engine().validate("SELECT * FROM leads\nlimit\n  25"),
            Verdict::Accepted("SELECT * FROM leads\nlimit\n  25".into())
        );
    }

    #[test]
    fn case_and_formatting_preserved() {
        let sql = "SeLeCt  name\n  FROM   leads";
        assert_eq!(
            engine().validate(sql),
            Verdict::Accepted(format!("{sql}\nLIMIT 500"))
        );
    }

    #[test]
    fn word_matching_boundaries() {
        assert!(contains_word("select * from \"Users\"", "users"));
        assert!(contains_word("users", "users"));
        assert!(!contains_word("users2", "users"));
        assert!(!contains_word("", "users"));
        assert!(!contains_word("select 1", ""));
    }

    #[test]
    fn non_ascii_identifiers_fold_case() {
        assert!(contains_word("SELECT * FROM KÜNDIGUNGEN", "kündigungen"));
        assert!(!contains_word("SELECT * FROM kündigungen_alt", "Kündigungen"));
        let policy = Policy {
            restricted_tables: ["Kündigungen".to_string()].into_iter().collect(),
            ..Policy::default()
        };
        assert_eq!(
            validate("SELECT * FROM KÜNDIGUNGEN", &policy),
            Verdict::Rejected(Rejection::RestrictedTable("Kündigungen".into()))
        );
    }
}
