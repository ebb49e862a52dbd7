//! AQ-005: Step executor.
//!
//! Runs one step: guard → execute → record. Success is recorded here;
//! execution errors are handed back so the retry controller can decide.
//! Guard violations fail the step on the spot.

use super::engine::Collaborators;
use super::guard::{self, GuardViolation};
use super::refine;
use super::types::*;
use crate::events::ProgressEvent;
use crate::source::QueryError;
use std::time::Instant;

/// What happened to one execution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded { row_count: usize, elapsed_ms: u64 },
    /// Refused by the read-only guard; the step is already marked failed
    Rejected(GuardViolation),
    /// The executor raised; nothing recorded yet
    Failed(QueryError),
    /// Unknown, removed, executed or already failed
    NotRunnable,
}

/// Execute one step of the plan.
pub async fn execute_step(
    mut plan: Plan,
    id: StepId,
    ctx: &Collaborators<'_>,
    policy: &EnginePolicy,
) -> (Plan, StepOutcome) {
    let Some(step) = plan.step(id) else {
        return (plan, StepOutcome::NotRunnable);
    };
    if step.is_removed() || step.has_failed() || plan.executed.contains(&id) {
        return (plan, StepOutcome::NotRunnable);
    }

    let sql = step.sql.clone().unwrap_or_default();
    if let Err(violation) = guard::check_read_only(&sql) {
        tracing::warn!(plan = %plan.id, step = id, %violation, "statement refused");
        ctx.sink.emit(ProgressEvent::StepError {
            plan_id: plan.id.clone(),
            step_id: id,
            error: violation.to_string(),
            will_retry: false,
        });
        let plan = record_failure(plan, id, &violation.to_string());
        return (plan, StepOutcome::Rejected(violation));
    }

    let (attempt, description) = match plan.step_mut(id) {
        Some(step) => {
            step.attempts += 1;
            (step.attempts, step.description.clone())
        }
        None => return (plan, StepOutcome::NotRunnable),
    };
    ctx.sink.emit(ProgressEvent::StepStarted {
        plan_id: plan.id.clone(),
        step_id: id,
        description,
        attempt,
    });
    tracing::debug!(plan = %plan.id, step = id, attempt, sql = %sql, "executing step");

    let start = Instant::now();
    let result = ctx.source.execute_query(&sql).await;
    let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    match result {
        Ok(result) => {
            let row_count = result.row_count;
            let plan = record_success(plan, id, result, elapsed_ms, &policy.refinement);
            ctx.sink.emit(ProgressEvent::StepCompleted {
                plan_id: plan.id.clone(),
                step_id: id,
                row_count,
                elapsed_ms,
            });
            (
                plan,
                StepOutcome::Succeeded {
                    row_count,
                    elapsed_ms,
                },
            )
        }
        Err(e) => {
            if let Some(step) = plan.step_mut(id) {
                step.elapsed_ms = Some(elapsed_ms);
            }
            tracing::debug!(plan = %plan.id, step = id, error = %e, "step execution failed");
            (plan, StepOutcome::Failed(e))
        }
    }
}

/// Record a successful execution and compute the refinement trigger.
pub fn record_success(
    mut plan: Plan,
    id: StepId,
    result: QueryResult,
    elapsed_ms: u64,
    policy: &RefinementPolicy,
) -> Plan {
    let row_count = result.row_count;
    let Some(step) = plan.step_mut(id) else {
        return plan;
    };
    step.row_count = Some(row_count);
    step.elapsed_ms = Some(elapsed_ms);
    step.error = None;
    step.result = Some(result.clone());

    plan.executed.insert(id);
    plan.successful_steps += 1;
    plan.successes_since_refine += 1;
    plan.record(id, ContextOutcome::Success { result, elapsed_ms });

    if let Some(trigger) = refine::trigger_for(&plan, row_count, id, policy) {
        plan.refine_trigger = Some(trigger);
    }
    plan
}

/// Mark a step permanently failed. A step is recorded failed at most once.
pub fn record_failure(mut plan: Plan, id: StepId, error: &str) -> Plan {
    let Some(step) = plan.step_mut(id) else {
        return plan;
    };
    if step.has_failed() || step.has_result() {
        return plan;
    }
    step.error = Some(error.to_string());
    plan.failed_steps += 1;
    plan.record(
        id,
        ContextOutcome::Failed {
            error: error.to_string(),
        },
    );
    plan
}
