//! AQ-002: Planner output validation.
//!
//! Planner responses are parsed into typed drafts and validated before any
//! of them becomes a `Step`. Parsing is lenient about framing (markdown
//! fences, prose around the object, camelCase keys) and strict about
//! content: duplicate ids, missing SQL and cycles are rejected.

use super::resolver;
use super::types::{Step, StepId, StepKind};
use crate::planner::PlannerError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Initial plan proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlanDraft {
    #[serde(default)]
    pub intent: String,
    pub steps: Vec<StepDraft>,
}

/// One proposed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDraft {
    pub id: StepId,

    #[serde(default = "default_kind", alias = "type")]
    pub kind: StepKind,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub sql: Option<String>,

    #[serde(default, alias = "dependencies", alias = "dependsOn")]
    pub depends_on: Vec<StepId>,
}

fn default_kind() -> StepKind {
    StepKind::Query
}

impl StepDraft {
    pub fn query(id: StepId, description: &str, sql: &str) -> Self {
        Self {
            id,
            kind: StepKind::Query,
            description: description.to_string(),
            sql: Some(sql.to_string()),
            depends_on: Vec::new(),
        }
    }

    pub fn after(mut self, deps: &[StepId]) -> Self {
        self.depends_on = deps.to_vec();
        self
    }
}

/// Structured revision of the remaining plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RevisionDraft {
    #[serde(default, alias = "shouldRefine")]
    pub should_refine: bool,

    #[serde(default, alias = "newSteps")]
    pub new_steps: Vec<StepDraft>,

    #[serde(default, alias = "modifiedSteps")]
    pub modified_steps: Vec<StepPatch>,
}

/// In-place modification of an existing step, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepPatch {
    pub id: StepId,

    #[serde(default, alias = "type")]
    pub kind: Option<StepKind>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub sql: Option<String>,

    #[serde(default, alias = "dependencies", alias = "dependsOn")]
    pub depends_on: Option<Vec<StepId>>,
}

impl StepPatch {
    pub fn new(id: StepId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn sql(mut self, sql: &str) -> Self {
        self.sql = Some(sql.to_string());
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn depends_on(mut self, deps: &[StepId]) -> Self {
        self.depends_on = Some(deps.to_vec());
        self
    }
}

/// Targeted replacement SQL for a failing step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepFix {
    #[serde(alias = "stepId", alias = "id")]
    pub step_id: StepId,

    pub sql: String,

    #[serde(default)]
    pub explanation: Option<String>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Locate the JSON payload of a planner response.
///
/// Accepts a bare value, a fenced ```json block, or the outermost `{...}`
/// span of surrounding prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') || trimmed == "null" {
        return Some(trimmed);
    }

    if let Some(open) = trimmed.find("```") {
        let after = &trimmed[open + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(close) = body.find("```") {
            let inner = body[..close].trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str, what: &str) -> Result<T, PlannerError> {
    let json = extract_json(text)
        .ok_or_else(|| PlannerError::Malformed(format!("no JSON {} in response", what)))?;
    serde_json::from_str(json).map_err(|e| PlannerError::Malformed(format!("{}: {}", what, e)))
}

pub fn parse_plan_draft(text: &str) -> Result<PlanDraft, PlannerError> {
    parse_json(text, "plan")
}

pub fn parse_revision(text: &str) -> Result<RevisionDraft, PlannerError> {
    parse_json(text, "revision")
}

/// `null`, `{}` or a fix without SQL mean "no revision".
pub fn parse_fix(text: &str) -> Result<Option<StepFix>, PlannerError> {
    let value: serde_json::Value = parse_json(text, "fix")?;
    let has_sql = value
        .get("sql")
        .and_then(|v| v.as_str())
        .is_some_and(|s| !s.trim().is_empty());
    if !has_sql {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| PlannerError::Malformed(format!("fix: {}", e)))
}

// ============================================================================
// Validation
// ============================================================================

/// Structural problems of a plan draft. Empty means valid.
///
/// Dependencies on unknown ids are not errors here: they are pruned when
/// the steps are built.
pub fn validate_plan_draft(draft: &PlanDraft) -> Vec<String> {
    let mut errors = Vec::new();

    if draft.steps.is_empty() {
        errors.push("plan has no steps".to_string());
    }

    let mut seen = HashSet::new();
    for step in &draft.steps {
        if !seen.insert(step.id) {
            errors.push(format!("duplicate step id {}", step.id));
        }
        let has_sql = step.sql.as_deref().is_some_and(|s| !s.trim().is_empty());
        if step.kind != StepKind::Removed && !has_sql {
            errors.push(format!("step {} ({}) has no SQL", step.id, step.kind));
        }
        if step.depends_on.contains(&step.id) {
            errors.push(format!("step {} depends on itself", step.id));
        }
    }

    errors
}

/// Turn a draft step into a plan step.
pub fn step_from_draft(draft: &StepDraft) -> Step {
    let mut step = Step::new(
        draft.id,
        draft.kind,
        &draft.description,
        draft.sql.as_deref().unwrap_or_default(),
    );
    step.depends_on = draft.depends_on.clone();
    if draft.kind == StepKind::Removed {
        step.mark_removed("removed by planner");
    }
    step
}

/// Validate a draft and build its steps: unknown dependencies are pruned,
/// cycles are rejected.
pub fn build_steps(draft: &PlanDraft) -> Result<Vec<Step>, PlannerError> {
    let errors = validate_plan_draft(draft);
    if !errors.is_empty() {
        return Err(PlannerError::Invalid(errors));
    }

    let mut steps: Vec<Step> = draft.steps.iter().map(step_from_draft).collect();
    for (step, dep) in resolver::prune_unknown_dependencies(&mut steps) {
        tracing::warn!(step, dep, "dropped dependency on unknown step");
    }
    resolver::execution_order(&steps).map_err(|e| PlannerError::Invalid(vec![e]))?;
    Ok(steps)
}

// ============================================================================
// Response schemas
// ============================================================================

pub fn plan_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(PlanDraft)).unwrap_or_default()
}

pub fn revision_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(RevisionDraft)).unwrap_or_default()
}

pub fn fix_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(StepFix)).unwrap_or_default()
}
