//! AQ-007: Refinement controller.
//!
//! Consults the planner about the remaining steps when a trigger is pending:
//! cadence (every N successes), an empty result or an unusually large one.
//! Revisions are applied to a copy of the plan; a revision that would leave
//! a dependency cycle is discarded whole.

use super::draft::{step_from_draft, RevisionDraft, StepPatch};
use super::engine::Collaborators;
use super::resolver;
use super::types::*;
use crate::events::ProgressEvent;
use crate::planner::RefinementRequest;
use std::collections::BTreeSet;

/// SQL value a planner uses to retire a step.
pub const REMOVAL_SENTINEL: &str = "REMOVE";

/// Trigger produced by a successful step, if any. Emptiness and size take
/// precedence over cadence.
pub fn trigger_for(
    plan: &Plan,
    row_count: usize,
    step_id: StepId,
    policy: &RefinementPolicy,
) -> Option<RefineTrigger> {
    if !policy.enabled {
        return None;
    }
    if row_count == 0 && policy.on_zero_rows {
        return Some(RefineTrigger::ZeroRows { step_id });
    }
    if row_count > policy.large_result_threshold {
        return Some(RefineTrigger::LargeResult {
            step_id,
            rows: row_count,
        });
    }
    if policy.every_n_successes > 0 && plan.successes_since_refine >= policy.every_n_successes {
        return Some(RefineTrigger::Cadence {
            successes: plan.successes_since_refine,
        });
    }
    None
}

/// True when a pending trigger should reach the planner now. Failed steps
/// still count as open work: a revision may remove or replace them.
pub fn should_attempt(plan: &Plan, policy: &RefinementPolicy) -> bool {
    policy.enabled
        && plan.refine_trigger.is_some()
        && plan.refinement_rounds < policy.max_rounds
        && !resolver::open_ids(plan).is_empty()
}

/// True when a patch asks for the step to be retired.
pub fn signals_removal(patch: &StepPatch) -> bool {
    if patch.kind == Some(StepKind::Removed) {
        return true;
    }
    if patch
        .sql
        .as_deref()
        .is_some_and(|s| s.trim().eq_ignore_ascii_case(REMOVAL_SENTINEL))
    {
        return true;
    }
    patch.description.as_deref().is_some_and(|d| {
        let d = d.trim_start().to_ascii_uppercase();
        d.starts_with("[REMOVED]") || d.starts_with("REMOVED")
    })
}

/// Ids touched by one applied revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionReport {
    pub added: Vec<StepId>,
    pub modified: Vec<StepId>,
    pub removed: Vec<StepId>,
}

impl RevisionReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Apply a revision to a copy of the plan.
///
/// Steps with a result are never modified or removed; failed steps may be
/// removed (which unblocks their dependents) but not modified. New steps
/// whose id already exists are dropped, as are new steps past
/// `max_total_steps`.
pub fn apply_revision(
    plan: &Plan,
    revision: RevisionDraft,
    max_total_steps: usize,
) -> Result<(Plan, RevisionReport), String> {
    let mut next = plan.clone();
    let mut report = RevisionReport::default();
    let mut removed_now: BTreeSet<StepId> = BTreeSet::new();

    for patch in revision.modified_steps {
        let id = patch.id;
        let executed = next.executed.contains(&id);
        let Some(step) = next.step_mut(id) else {
            tracing::warn!(step = id, "revision modifies unknown step");
            continue;
        };
        if step.is_removed() || step.has_result() || executed {
            tracing::debug!(step = id, "revision ignored for settled step");
            continue;
        }

        if signals_removal(&patch) {
            let reason = patch
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .unwrap_or("removed by refinement");
            step.mark_removed(reason);
            removed_now.insert(id);
            report.removed.push(id);
            continue;
        }

        if step.has_failed() {
            tracing::debug!(step = id, "revision ignored for failed step");
            continue;
        }
        let mut changed = false;
        if let Some(description) = patch.description {
            step.description = description;
            changed = true;
        }
        if let Some(sql) = patch.sql {
            step.sql = Some(sql);
            changed = true;
        }
        if let Some(deps) = patch.depends_on {
            step.depends_on = deps;
            changed = true;
        }
        if let Some(kind) = patch.kind {
            step.kind = kind;
            changed = true;
        }
        if changed {
            report.modified.push(id);
        }
    }

    for draft in revision.new_steps {
        if next.contains(draft.id) {
            tracing::warn!(step = draft.id, "revision adds a step with an existing id");
            continue;
        }
        if next.steps.len() >= max_total_steps {
            tracing::warn!(limit = max_total_steps, "revision would exceed the step limit");
            break;
        }
        let has_sql = draft.sql.as_deref().is_some_and(|s| !s.trim().is_empty());
        if draft.kind != StepKind::Removed && !has_sql {
            tracing::warn!(step = draft.id, "revision adds a step without SQL");
            continue;
        }
        report.added.push(draft.id);
        next.steps.push(step_from_draft(&draft));
    }

    resolver::repair_dependencies(&mut next.steps, &removed_now);
    for (step, dep) in resolver::prune_unknown_dependencies(&mut next.steps) {
        tracing::warn!(step, dep, "dropped dependency on unknown step");
    }
    resolver::execution_order(&next.steps)?;

    Ok((next, report))
}

/// Consult the planner if a refinement trigger is pending.
///
/// Planner failures and rejected revisions keep the current plan.
pub async fn maybe_refine(mut plan: Plan, ctx: &Collaborators<'_>, policy: &EnginePolicy) -> Plan {
    let policy = &policy.refinement;
    if plan.refine_trigger.is_none() {
        return plan;
    }
    if !should_attempt(&plan, policy) {
        plan.refine_trigger = None;
        return plan;
    }
    let Some(trigger) = plan.refine_trigger.take() else {
        return plan;
    };

    plan.phase = PlanPhase::Refining;
    plan.refinement_rounds += 1;
    plan.successes_since_refine = 0;
    tracing::debug!(plan = %plan.id, round = plan.refinement_rounds, ?trigger, "requesting refinement");

    let request = RefinementRequest::from_plan(&plan, trigger);
    let revision = match ctx.planner.request_refinement(&request).await {
        Ok(revision) => revision,
        Err(e) => {
            tracing::warn!(plan = %plan.id, error = %e, "refinement request failed; keeping plan");
            plan.phase = PlanPhase::Executing;
            return plan;
        }
    };

    if !revision.should_refine {
        plan.phase = PlanPhase::Executing;
        return plan;
    }

    match apply_revision(&plan, revision, policy.max_total_steps) {
        Ok((mut next, report)) => {
            next.phase = PlanPhase::Executing;
            if !report.is_empty() {
                tracing::info!(
                    plan = %next.id,
                    added = ?report.added,
                    modified = ?report.modified,
                    removed = ?report.removed,
                    "plan refined"
                );
                ctx.sink.emit(ProgressEvent::PlanRefined {
                    plan_id: next.id.clone(),
                    added: report.added,
                    modified: report.modified,
                    removed: report.removed,
                });
            }
            next
        }
        Err(e) => {
            tracing::warn!(plan = %plan.id, error = %e, "revision rejected; keeping plan");
            plan.phase = PlanPhase::Executing;
            plan
        }
    }
}
