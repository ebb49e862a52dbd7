//! AQ-008: Aggregation and artifact building.
//!
//! Runs once the eligible set is empty: picks the representative SQL, asks
//! the planner for the narrative, extracts the chart block and moves the
//! plan to `Done`.

use super::chart;
use super::engine::Collaborators;
use super::types::*;
use crate::events::ProgressEvent;
use crate::planner::NarrativeRequest;
use std::fmt::Write as _;

/// SQL of the last step, in original order, that succeeded.
pub fn final_sql(plan: &Plan) -> Option<String> {
    plan.steps
        .iter()
        .filter(|s| s.has_result() && s.error.is_none())
        .filter_map(|s| s.sql.clone())
        .last()
}

/// Deterministic answer assembled from successful context entries only.
pub fn fallback_answer(plan: &Plan) -> String {
    let successes: Vec<&ContextEntry> = plan.context.iter().filter(|e| e.is_success()).collect();
    if successes.is_empty() {
        return format!("No step produced a result for: {}", plan.question);
    }

    let mut out = format!("Results for: {}\n", plan.question);
    for entry in successes {
        let ContextOutcome::Success { ref result, .. } = entry.outcome else {
            continue;
        };
        let _ = write!(
            out,
            "\n- Step {} ({}): {} row{}",
            entry.step.id,
            entry.step.description,
            result.row_count,
            if result.row_count == 1 { "" } else { "s" }
        );
        if let Some(first) = result.rows.first() {
            let cells: Vec<String> = first.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            let _ = write!(out, "; first row: {}", cells.join(", "));
        }
    }
    out
}

/// Build the final answer and finish the plan.
pub async fn aggregate(mut plan: Plan, ctx: &Collaborators<'_>, policy: &EnginePolicy) -> Plan {
    plan.phase = PlanPhase::Aggregating;
    plan.final_sql = final_sql(&plan);

    let request = NarrativeRequest {
        question: plan.question.clone(),
        intent: plan.intent.clone(),
        context: plan.context.clone(),
        execution_summary: plan.summary(),
    };
    let (answer, chart) = match ctx.planner.request_narrative(&request).await {
        Ok(text) => chart::extract_chart(&text, policy.chart_max_categories),
        Err(e) => {
            tracing::warn!(plan = %plan.id, error = %e, "narrative request failed; using fallback answer");
            (fallback_answer(&plan), None)
        }
    };

    plan.final_answer = Some(answer);
    plan.chart = chart;
    plan.phase = PlanPhase::Done;

    tracing::info!(
        plan = %plan.id,
        successful = plan.successful_steps,
        failed = plan.failed_steps,
        "plan completed"
    );
    ctx.sink.emit(ProgressEvent::PlanCompleted {
        plan_id: plan.id.clone(),
        successful_steps: plan.successful_steps,
        failed_steps: plan.failed_steps,
        final_sql: plan.final_sql.clone(),
        has_chart: plan.chart.is_some(),
    });
    plan
}
