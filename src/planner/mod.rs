//! AQ-014: Planner oracle contract.
//!
//! The planner proposes the initial plan, revises remaining steps, fixes a
//! failing statement and writes the narrative answer. Responses are parsed
//! into the typed drafts of `core::draft`; nothing downstream sees raw text
//! except the narrative.

pub mod command;
pub mod scripted;

use crate::core::draft::{PlanDraft, RevisionDraft, StepFix};
use crate::core::types::{
    ContextEntry, ExecutionSummary, Plan, RefineTrigger, StepId, StepKind,
};
use crate::source::TableSchema;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Planner failure. Fatal for the initial plan, non-fatal everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),

    #[error("malformed planner response: {0}")]
    Malformed(String),

    #[error("invalid plan: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// One prior conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub question: String,
    pub schema: Vec<TableSchema>,
    pub dialect: String,
    pub history: Vec<HistoryTurn>,
}

/// Compact view of one step for refinement prompts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepBrief {
    pub id: StepId,
    pub kind: StepKind,
    pub description: String,
    pub sql: Option<String>,
    pub depends_on: Vec<StepId>,
    pub status: &'static str,
    pub row_count: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefinementRequest {
    pub question: String,
    pub dialect: String,
    pub plan_summary: Vec<StepBrief>,
    pub pending_steps: Vec<StepId>,
    pub execution_summary: ExecutionSummary,
    pub trigger: RefineTrigger,
}

impl RefinementRequest {
    pub fn from_plan(plan: &Plan, trigger: RefineTrigger) -> Self {
        let plan_summary = plan
            .steps
            .iter()
            .map(|s| StepBrief {
                id: s.id,
                kind: s.kind,
                description: s.description.clone(),
                sql: s.sql.clone(),
                depends_on: s.depends_on.clone(),
                status: if s.is_removed() {
                    "removed"
                } else if s.has_result() {
                    "succeeded"
                } else if s.has_failed() {
                    "failed"
                } else {
                    "pending"
                },
                row_count: s.row_count,
            })
            .collect();
        Self {
            question: plan.question.clone(),
            dialect: plan.dialect.clone(),
            plan_summary,
            pending_steps: crate::core::resolver::pending_ids(plan),
            execution_summary: plan.summary(),
            trigger,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FixRequest {
    pub step_id: StepId,
    pub description: String,
    pub sql: String,
    pub error: String,
    pub question: String,
    pub dialect: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NarrativeRequest {
    pub question: String,
    pub intent: String,
    pub context: Vec<ContextEntry>,
    pub execution_summary: ExecutionSummary,
}

/// The reasoning oracle behind plan generation and revision.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn request_plan(&self, request: &PlanRequest) -> Result<PlanDraft, PlannerError>;

    async fn request_refinement(
        &self,
        request: &RefinementRequest,
    ) -> Result<RevisionDraft, PlannerError>;

    /// `Ok(None)` means the planner has no revision for the failing step.
    async fn request_fix(&self, request: &FixRequest) -> Result<Option<StepFix>, PlannerError>;

    async fn request_narrative(&self, request: &NarrativeRequest) -> Result<String, PlannerError>;
}
