//! AQ-013: BLAKE3 fingerprints for SQL statements and plan ids.
//!
//! Two statements are "the same" when they normalize to the same text:
//! whitespace runs collapse, a trailing `;` is dropped, and everything
//! outside quoted literals is lowercased.

/// Normalize a statement for comparison.
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.trim().chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => {
                if c.is_whitespace() {
                    pending_space = true;
                    continue;
                }
                if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    out.push(c);
                } else {
                    out.extend(c.to_lowercase());
                }
            }
        }
    }

    while out.ends_with(';') || out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Hash a normalized statement. Returns `"blake3:{hex}"`.
pub fn sql_fingerprint(sql: &str) -> String {
    hash_string(&normalize_sql(sql))
}

/// True when both statements normalize to the same text.
pub fn same_statement(a: &str, b: &str) -> bool {
    sql_fingerprint(a) == sql_fingerprint(b)
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Derive a fresh plan id from the question and the current time.
pub fn plan_id(question: &str) -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut hasher = blake3::Hasher::new();
    hasher.update(question.as_bytes());
    hasher.update(b"\0");
    hasher.update(&nanos.to_le_bytes());
    let hex = hasher.finalize().to_hex().to_string();
    format!("plan-{}", &hex[..12])
}
