//! AQ-006: Retry controller.
//!
//! After an execution error the planner is asked for a targeted fix. A fix
//! that differs from the failing statement (by normalized fingerprint) and
//! passes the guard replaces the step's SQL and is re-run. Anything else
//! fails the step for good. A step runs at most `max_retries + 1` times.

use super::engine::Collaborators;
use super::executor::{self, StepOutcome};
use super::fingerprint;
use super::guard;
use super::types::*;
use crate::events::ProgressEvent;
use crate::planner::FixRequest;
use crate::source::QueryError;

/// Drive a failed step to success or permanent failure.
pub async fn recover(
    mut plan: Plan,
    id: StepId,
    error: QueryError,
    ctx: &Collaborators<'_>,
    policy: &EnginePolicy,
) -> Plan {
    plan.phase = PlanPhase::Retrying;
    let mut error = error.to_string();

    loop {
        let Some(step) = plan.step(id) else {
            return plan;
        };
        let failing_sql = step.sql.clone().unwrap_or_default();

        if step.attempts > policy.max_retries {
            tracing::info!(plan = %plan.id, step = id, attempts = step.attempts, "retry budget exhausted");
            return give_up(plan, id, &error, ctx);
        }

        let request = FixRequest {
            step_id: id,
            description: step.description.clone(),
            sql: failing_sql.clone(),
            error: error.clone(),
            question: plan.question.clone(),
            dialect: plan.dialect.clone(),
        };
        let fix = match ctx.planner.request_fix(&request).await {
            Ok(Some(fix)) if fix.step_id == id => fix,
            Ok(Some(fix)) => {
                tracing::warn!(step = id, got = fix.step_id, "planner fixed a different step");
                return give_up(plan, id, &error, ctx);
            }
            Ok(None) => {
                tracing::debug!(step = id, "planner offered no fix");
                return give_up(plan, id, &error, ctx);
            }
            Err(e) => {
                tracing::warn!(step = id, error = %e, "fix request failed");
                return give_up(plan, id, &error, ctx);
            }
        };

        if fingerprint::same_statement(&failing_sql, &fix.sql) {
            tracing::debug!(step = id, "planner returned the same statement");
            return give_up(plan, id, &error, ctx);
        }
        if let Err(violation) = guard::check_read_only(&fix.sql) {
            tracing::warn!(step = id, %violation, "planner fix refused");
            let combined = format!("{}; fix refused: {}", error, violation);
            return give_up(plan, id, &combined, ctx);
        }

        ctx.sink.emit(ProgressEvent::StepError {
            plan_id: plan.id.clone(),
            step_id: id,
            error: error.clone(),
            will_retry: true,
        });
        if let Some(step) = plan.step_mut(id) {
            step.sql = Some(fix.sql);
        }

        let (next, outcome) = executor::execute_step(plan, id, ctx, policy).await;
        plan = next;
        match outcome {
            StepOutcome::Succeeded { .. } => {
                plan.phase = PlanPhase::Executing;
                return plan;
            }
            StepOutcome::Failed(e) => error = e.to_string(),
            StepOutcome::Rejected(_) => {
                plan.phase = PlanPhase::Executing;
                return plan;
            }
            StepOutcome::NotRunnable => return give_up(plan, id, &error, ctx),
        }
    }
}

fn give_up(plan: Plan, id: StepId, error: &str, ctx: &Collaborators<'_>) -> Plan {
    ctx.sink.emit(ProgressEvent::StepError {
        plan_id: plan.id.clone(),
        step_id: id,
        error: error.to_string(),
        will_retry: false,
    });
    let mut plan = executor::record_failure(plan, id, error);
    plan.phase = PlanPhase::Executing;
    plan
}
