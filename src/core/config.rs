//! AQ-011: Configuration parsing and validation.
//!
//! Parses stepql.yaml and validates it, reporting every problem at once:
//! - Version must be "1.0"
//! - Database paths and dialects must be non-empty
//! - Executor limits and refinement cadence must be positive

use super::types::*;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default file name looked up by the CLI.
pub const CONFIG_FILE: &str = "stepql.yaml";

/// Template written by `stepql init`.
pub const CONFIG_TEMPLATE: &str = r#"version: "1.0"

databases:
  main:
    path: data.db
    dialect: sqlite

planner:
  # Receives one JSON request on stdin, answers on stdout
  command: ./planner.sh
  timeout_secs: 120

executor:
  timeout_ms: 30000
  max_rows: 10000

policy:
  max_retries: 3
  schema_top_k: 8
  chart_max_categories: 20
  refinement:
    enabled: true
    every_n_successes: 2
    on_zero_rows: true
    large_result_threshold: 1000
    max_rounds: 8
    max_total_steps: 24
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error: {0}")]
    Parse(String),
}

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ValidationError {
    fn new(message: String) -> Self {
        Self { message }
    }
}

/// Parse a stepql.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<StepqlConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Parse a stepql.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<StepqlConfig, ConfigError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &StepqlConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(ValidationError::new(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        )));
    }

    if config.databases.is_empty() {
        errors.push(ValidationError::new(
            "at least one database must be configured".to_string(),
        ));
    }

    for (id, db) in &config.databases {
        if db.path.trim().is_empty() {
            errors.push(ValidationError::new(format!(
                "database '{}' has an empty path",
                id
            )));
        }
        if db.dialect.trim().is_empty() {
            errors.push(ValidationError::new(format!(
                "database '{}' has an empty dialect",
                id
            )));
        }
    }

    if let Some(ref command) = config.planner.command {
        if command.trim().is_empty() {
            errors.push(ValidationError::new(
                "planner.command must not be blank".to_string(),
            ));
        }
    }
    if config.planner.timeout_secs == 0 {
        errors.push(ValidationError::new(
            "planner.timeout_secs must be positive".to_string(),
        ));
    }

    if config.executor.timeout_ms == 0 {
        errors.push(ValidationError::new(
            "executor.timeout_ms must be positive".to_string(),
        ));
    }
    if config.executor.max_rows == 0 {
        errors.push(ValidationError::new(
            "executor.max_rows must be positive".to_string(),
        ));
    }

    let policy = &config.policy;
    if policy.schema_top_k == 0 {
        errors.push(ValidationError::new(
            "policy.schema_top_k must be positive".to_string(),
        ));
    }
    if policy.chart_max_categories == 0 {
        errors.push(ValidationError::new(
            "policy.chart_max_categories must be positive".to_string(),
        ));
    }

    let refinement = &policy.refinement;
    if refinement.enabled && refinement.every_n_successes == 0 {
        errors.push(ValidationError::new(
            "policy.refinement.every_n_successes must be positive when refinement is enabled"
                .to_string(),
        ));
    }
    if refinement.max_total_steps == 0 {
        errors.push(ValidationError::new(
            "policy.refinement.max_total_steps must be positive".to_string(),
        ));
    }

    errors
}

/// Resolve a database path relative to the directory holding the config.
pub fn database_path(config_dir: &Path, profile: &DatabaseProfile) -> PathBuf {
    let path = Path::new(&profile.path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}
