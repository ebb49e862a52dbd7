//! AQ-001: Plan model — steps, execution context, chart spec, configuration.
//!
//! A `Plan` is created once per question and moved by value through the
//! engine's transition functions. Steps are never deleted: removal is a
//! kind transition that clears the step's SQL.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Step identifier, unique within one plan.
pub type StepId = u32;

/// One result row, column order preserved.
pub type Row = IndexMap<String, serde_json::Value>;

// ============================================================================
// Steps
// ============================================================================

/// What a step does. `Removed` steps never run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Query,
    Analysis,
    Aggregation,
    Removed,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::Analysis => write!(f, "analysis"),
            Self::Aggregation => write!(f, "aggregation"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// One atomic read-only retrieval or analysis unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,

    pub kind: StepKind,

    pub description: String,

    /// SQL text; always `None` once the step is removed
    #[serde(default)]
    pub sql: Option<String>,

    /// Steps that must run first
    #[serde(default)]
    pub depends_on: Vec<StepId>,

    #[serde(default)]
    pub result: Option<QueryResult>,

    #[serde(default)]
    pub error: Option<String>,

    /// Wall time of the last execution attempt
    #[serde(default)]
    pub elapsed_ms: Option<u64>,

    #[serde(default)]
    pub row_count: Option<usize>,

    /// Number of times the SQL was handed to the query executor
    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub removal_reason: Option<String>,
}

impl Step {
    pub fn new(id: StepId, kind: StepKind, description: &str, sql: &str) -> Self {
        Self {
            id,
            kind,
            description: description.to_string(),
            sql: Some(sql.to_string()),
            depends_on: Vec::new(),
            result: None,
            error: None,
            elapsed_ms: None,
            row_count: None,
            attempts: 0,
            removal_reason: None,
        }
    }

    /// Builder-style dependency setter.
    pub fn with_deps(mut self, deps: &[StepId]) -> Self {
        self.depends_on = deps.to_vec();
        self
    }

    pub fn is_removed(&self) -> bool {
        self.kind == StepKind::Removed
    }

    /// Permanently failed: an error and no result.
    pub fn has_failed(&self) -> bool {
        self.error.is_some() && self.result.is_none()
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// SQL that may be handed to the executor. Removed steps have none.
    pub fn executable_sql(&self) -> Option<&str> {
        if self.is_removed() {
            return None;
        }
        self.sql.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Transition to `Removed`. The only way to enter that kind.
    pub fn mark_removed(&mut self, reason: &str) {
        self.kind = StepKind::Removed;
        self.sql = None;
        self.removal_reason = Some(reason.to_string());
    }

    pub fn snapshot(&self) -> StepSnapshot {
        StepSnapshot {
            id: self.id,
            kind: self.kind,
            description: self.description.clone(),
            sql: self.sql.clone(),
        }
    }
}

/// Rows, columns and counts returned by the query executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QueryResult {
    pub columns: Vec<String>,

    #[schemars(with = "Vec<serde_json::Map<String, serde_json::Value>>")]
    pub rows: Vec<Row>,

    /// Total rows produced by the statement (may exceed `rows.len()`)
    pub row_count: usize,

    /// True when the executor stopped collecting at its row cap
    #[serde(default)]
    pub truncated: bool,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            truncated: false,
        }
    }
}

// ============================================================================
// Execution context
// ============================================================================

/// Frozen view of a step at the moment its outcome was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepSnapshot {
    pub id: StepId,
    pub kind: StepKind,
    pub description: String,
    #[serde(default)]
    pub sql: Option<String>,
}

/// Outcome recorded for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ContextOutcome {
    Success { result: QueryResult, elapsed_ms: u64 },
    Skipped { reason: String },
    Failed { error: String },
}

/// Append-only context log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextEntry {
    pub step: StepSnapshot,
    #[serde(flatten)]
    pub outcome: ContextOutcome,
    pub ts: String,
}

impl ContextEntry {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ContextOutcome::Success { .. })
    }
}

// ============================================================================
// Plan
// ============================================================================

/// Plan lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPhase {
    #[default]
    Planning,
    Executing,
    Refining,
    Retrying,
    Aggregating,
    Done,
}

impl fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => write!(f, "PLANNING"),
            Self::Executing => write!(f, "EXECUTING"),
            Self::Refining => write!(f, "REFINING"),
            Self::Retrying => write!(f, "RETRYING"),
            Self::Aggregating => write!(f, "AGGREGATING"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

/// Why the refinement controller should consult the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RefineTrigger {
    Cadence { successes: u32 },
    ZeroRows { step_id: StepId },
    LargeResult { step_id: StepId, rows: usize },
}

/// The mutable step structure derived from one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,

    pub question: String,

    /// Intent inferred by the planner
    #[serde(default)]
    pub intent: String,

    /// SQL dialect of the target database
    pub dialect: String,

    /// Steps in original order
    pub steps: Vec<Step>,

    /// Append-only outcome log
    #[serde(default)]
    pub context: Vec<ContextEntry>,

    /// Ids treated as satisfied for dependency purposes
    #[serde(default)]
    pub executed: BTreeSet<StepId>,

    #[serde(default)]
    pub successful_steps: u32,

    #[serde(default)]
    pub failed_steps: u32,

    #[serde(default)]
    pub final_answer: Option<String>,

    #[serde(default)]
    pub final_sql: Option<String>,

    #[serde(default)]
    pub chart: Option<ChartSpec>,

    #[serde(default)]
    pub phase: PlanPhase,

    /// Set by the step executor, consumed by the refinement controller
    #[serde(default)]
    pub refine_trigger: Option<RefineTrigger>,

    #[serde(default)]
    pub successes_since_refine: u32,

    #[serde(default)]
    pub refinement_rounds: u32,
}

impl Plan {
    pub fn new(id: &str, question: &str, intent: &str, dialect: &str, steps: Vec<Step>) -> Self {
        Self {
            id: id.to_string(),
            question: question.to_string(),
            intent: intent.to_string(),
            dialect: dialect.to_string(),
            steps,
            context: Vec::new(),
            executed: BTreeSet::new(),
            successful_steps: 0,
            failed_steps: 0,
            final_answer: None,
            final_sql: None,
            chart: None,
            phase: PlanPhase::Planning,
            refine_trigger: None,
            successes_since_refine: 0,
            refinement_rounds: 0,
        }
    }

    pub fn step(&self, id: StepId) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.steps.iter().any(|s| s.id == id)
    }

    /// Append a context entry for a step. No-op for unknown ids.
    pub fn record(&mut self, id: StepId, outcome: ContextOutcome) {
        let Some(step) = self.step(id) else {
            return;
        };
        let entry = ContextEntry {
            step: step.snapshot(),
            outcome,
            ts: crate::events::eventlog::now_iso8601(),
        };
        self.context.push(entry);
    }

    /// Counts, timings and row totals for the planner and the fallback answer.
    pub fn summary(&self) -> ExecutionSummary {
        let mut summary = ExecutionSummary {
            total_steps: self.steps.len(),
            successful_steps: self.successful_steps,
            failed_steps: self.failed_steps,
            ..ExecutionSummary::default()
        };

        for step in &self.steps {
            if step.is_removed() {
                summary.skipped_steps += 1;
            } else if !self.executed.contains(&step.id) && !step.has_failed() {
                summary.pending_steps += 1;
            }
            if let Some(ms) = step.elapsed_ms {
                summary.total_elapsed_ms += ms;
                summary.timings.push(StepTiming {
                    id: step.id,
                    elapsed_ms: ms,
                    row_count: step.row_count.unwrap_or(0),
                    attempts: step.attempts,
                });
            }
            if step.has_result() {
                summary.total_rows += step.row_count.unwrap_or(0);
            }
        }

        summary
    }
}

/// Execution counters handed to the planner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionSummary {
    pub total_steps: usize,
    pub successful_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: usize,
    pub pending_steps: usize,
    pub total_rows: usize,
    pub total_elapsed_ms: u64,
    pub timings: Vec<StepTiming>,
}

/// Per-step timing line of the execution summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepTiming {
    pub id: StepId,
    pub elapsed_ms: u64,
    pub row_count: usize,
    pub attempts: u32,
}

// ============================================================================
// Chart spec
// ============================================================================

/// Chart kind suggested by the narrative answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ChartKind {
    Bar,
    Pie,
    Line,
    None,
}

impl ChartKind {
    /// Parse a chart kind name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "bar" => Some(Self::Bar),
            "pie" => Some(Self::Pie),
            "line" => Some(Self::Line),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bar => write!(f, "bar"),
            Self::Pie => write!(f, "pie"),
            Self::Line => write!(f, "line"),
            Self::None => write!(f, "none"),
        }
    }
}

/// One category of a chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPoint {
    pub label: String,
    pub value: f64,
    /// Remaining fields of the source object
    #[serde(flatten, default)]
    pub extra: IndexMap<String, serde_json::Value>,
}

/// Structured visualization suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    #[serde(default)]
    pub data: Vec<ChartPoint>,
    #[serde(default)]
    pub x_key: Option<String>,
    #[serde(default)]
    pub y_key: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// ============================================================================
// Run output
// ============================================================================

/// What `run_plan` hands back to the caller.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub answer: String,
    pub plan: Plan,
}

/// The `{sql, resultData, chartSpec}` triple the caller persists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub plan_id: String,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub result_data: Option<QueryResult>,
    #[serde(default)]
    pub chart_spec: Option<ChartSpec>,
}

impl Artifact {
    /// Assemble the artifact from a finished plan.
    pub fn from_plan(plan: &Plan) -> Self {
        let result_data = plan
            .final_sql
            .as_ref()
            .and_then(|sql| {
                plan.steps
                    .iter()
                    .rev()
                    .find(|s| s.sql.as_ref() == Some(sql) && s.error.is_none())
            })
            .and_then(|s| s.result.clone());
        Self {
            plan_id: plan.id.clone(),
            question: plan.question.clone(),
            answer: plan.final_answer.clone().unwrap_or_default(),
            sql: plan.final_sql.clone(),
            result_data,
            chart_spec: plan.chart.clone(),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Root configuration (`stepql.yaml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepqlConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Data sources keyed by database id (order-preserving)
    #[serde(default)]
    pub databases: IndexMap<String, DatabaseProfile>,

    #[serde(default)]
    pub planner: PlannerSettings,

    #[serde(default)]
    pub executor: ExecutorSettings,

    #[serde(default)]
    pub policy: EnginePolicy,
}

/// A connection profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseProfile {
    /// SQLite database file
    pub path: String,

    #[serde(default = "default_dialect")]
    pub dialect: String,
}

fn default_dialect() -> String {
    "sqlite".to_string()
}

/// External planner process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerSettings {
    /// Shell command that answers planner requests on stdout
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default = "default_planner_timeout")]
    pub timeout_secs: u64,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_planner_timeout(),
        }
    }
}

fn default_planner_timeout() -> u64 {
    120
}

/// Query executor limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Per-statement deadline
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Rows collected per statement; the rest are only counted
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_rows: default_max_rows(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_rows() -> usize {
    10_000
}

/// Engine policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnginePolicy {
    /// Fix-and-rerun attempts after the first failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Tables requested from schema retrieval
    #[serde(default = "default_top_k")]
    pub schema_top_k: usize,

    /// Category cap applied to chart specs
    #[serde(default = "default_chart_max")]
    pub chart_max_categories: usize,

    #[serde(default)]
    pub refinement: RefinementPolicy,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            schema_top_k: default_top_k(),
            chart_max_categories: default_chart_max(),
            refinement: RefinementPolicy::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_top_k() -> usize {
    8
}

fn default_chart_max() -> usize {
    20
}

/// When the refinement controller consults the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Refine after this many successful steps
    #[serde(default = "default_every_n")]
    pub every_n_successes: u32,

    /// Refine immediately after an empty result
    #[serde(default = "default_true")]
    pub on_zero_rows: bool,

    /// Refine immediately when a step returns more rows than this
    #[serde(default = "default_large_result")]
    pub large_result_threshold: usize,

    /// Planner consultations per plan
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Refinement never grows a plan past this many steps
    #[serde(default = "default_max_total_steps")]
    pub max_total_steps: usize,
}

impl Default for RefinementPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_successes: default_every_n(),
            on_zero_rows: true,
            large_result_threshold: default_large_result(),
            max_rounds: default_max_rounds(),
            max_total_steps: default_max_total_steps(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_every_n() -> u32 {
    2
}

fn default_large_result() -> usize {
    1000
}

fn default_max_rounds() -> u32 {
    8
}

fn default_max_total_steps() -> usize {
    24
}

// ============================================================================
// Tests
// ============================================================================
