//! AQ-004: Static read-only check.
//!
//! Every statement passes through `check_read_only` before it can reach a
//! query executor, whatever the executor itself enforces. A mutating
//! keyword anywhere in the statement rejects it, not only as a prefix.
//! Keywords match on word boundaries, so identifiers like `created_at`
//! or `last_update` pass.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Keywords that reject a statement wherever they appear.
pub const MUTATING_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "exec", "execute", "create", "truncate",
    "grant", "revoke", "merge", "attach", "detach",
];

static MUTATING_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = MUTATING_KEYWORDS.join("|");
    Regex::new(&format!(r"(?i)\b({})\b", alternation)).expect("mutating keyword pattern")
});

static REPLACE_INTO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\breplace\s+into\b").expect("replace-into pattern"));

/// Why a statement was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardViolation {
    #[error("unsafe query: empty statement")]
    Empty,

    #[error("unsafe query: statement contains data-mutating keyword '{0}'")]
    MutatingKeyword(String),
}

/// Reject statements that are empty or contain a mutating keyword token.
pub fn check_read_only(sql: &str) -> Result<(), GuardViolation> {
    if sql.trim().is_empty() {
        return Err(GuardViolation::Empty);
    }
    if let Some(m) = MUTATING_TOKEN.find(sql) {
        return Err(GuardViolation::MutatingKeyword(m.as_str().to_ascii_lowercase()));
    }
    if REPLACE_INTO.is_match(sql) {
        return Err(GuardViolation::MutatingKeyword("replace into".to_string()));
    }
    Ok(())
}

/// Convenience predicate.
pub fn is_read_only(sql: &str) -> bool {
    check_read_only(sql).is_ok()
}
