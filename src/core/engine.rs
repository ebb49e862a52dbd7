//! AQ-009: The plan execution engine.
//!
//! `run_plan`: schema retrieval → initial plan → loop { skip removed →
//! refine → next eligible → execute → recover } → aggregate. The loop ends
//! when no step is eligible. One step runs at a time; the plan value is
//! moved through each transition.

use super::aggregate;
use super::draft;
use super::executor::{self, StepOutcome};
use super::fingerprint;
use super::refine;
use super::resolver;
use super::retry;
use super::types::*;
use crate::events::{NullSink, ProgressEvent, ProgressSink};
use crate::planner::{HistoryTurn, PlanRequest, Planner, PlannerError};
use crate::source::{QueryExecutor, SchemaRetriever};
use std::sync::Arc;
use thiserror::Error;

/// The only errors `run_plan` returns. Everything after plan generation is
/// recorded in the plan instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no relevant schema for database '{database_id}': {reason}")]
    NoRelevantSchema { database_id: String, reason: String },

    #[error(transparent)]
    Planner(#[from] PlannerError),
}

/// Borrowed collaborators handed to each transition.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub planner: &'a dyn Planner,
    pub source: &'a dyn QueryExecutor,
    pub sink: &'a dyn ProgressSink,
}

impl<'a> Collaborators<'a> {
    pub fn new(
        planner: &'a dyn Planner,
        source: &'a dyn QueryExecutor,
        sink: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            planner,
            source,
            sink,
        }
    }
}

pub struct Engine {
    retriever: Arc<dyn SchemaRetriever>,
    planner: Arc<dyn Planner>,
    source: Arc<dyn QueryExecutor>,
    sink: Arc<dyn ProgressSink>,
    policy: EnginePolicy,
}

impl Engine {
    pub fn new(
        retriever: Arc<dyn SchemaRetriever>,
        planner: Arc<dyn Planner>,
        source: Arc<dyn QueryExecutor>,
    ) -> Self {
        Self {
            retriever,
            planner,
            source,
            sink: Arc::new(NullSink),
            policy: EnginePolicy::default(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_policy(mut self, policy: EnginePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &EnginePolicy {
        &self.policy
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators::new(self.planner.as_ref(), self.source.as_ref(), self.sink.as_ref())
    }

    /// Answer a question end to end.
    pub async fn run_plan(
        &self,
        question: &str,
        database_id: &str,
        dialect: &str,
        history: &[HistoryTurn],
    ) -> Result<RunOutcome, EngineError> {
        let plan = self
            .generate_plan(question, database_id, dialect, history)
            .await?;
        let plan = self.drive(plan).await;
        Ok(RunOutcome {
            answer: plan.final_answer.clone().unwrap_or_default(),
            plan,
        })
    }

    /// Retrieve schema and obtain a validated initial plan.
    pub async fn generate_plan(
        &self,
        question: &str,
        database_id: &str,
        dialect: &str,
        history: &[HistoryTurn],
    ) -> Result<Plan, EngineError> {
        let schema = self
            .retriever
            .retrieve_relevant_schema(database_id, question, self.policy.schema_top_k)
            .await
            .map_err(|e| EngineError::NoRelevantSchema {
                database_id: database_id.to_string(),
                reason: e.to_string(),
            })?;
        if schema.is_empty() {
            return Err(EngineError::NoRelevantSchema {
                database_id: database_id.to_string(),
                reason: "no tables matched".to_string(),
            });
        }

        let request = PlanRequest {
            question: question.to_string(),
            schema,
            dialect: dialect.to_string(),
            history: history.to_vec(),
        };
        let draft = self.planner.request_plan(&request).await?;
        let steps = draft::build_steps(&draft)?;

        let mut plan = Plan::new(
            &fingerprint::plan_id(question),
            question,
            &draft.intent,
            dialect,
            steps,
        );
        plan.phase = PlanPhase::Executing;

        tracing::info!(plan = %plan.id, steps = plan.steps.len(), intent = %plan.intent, "plan generated");
        self.sink.emit(ProgressEvent::PlanGenerated {
            plan_id: plan.id.clone(),
            intent: plan.intent.clone(),
            steps: plan.steps.len(),
        });
        Ok(plan)
    }

    /// Execute a plan until no step is eligible, then aggregate.
    pub async fn drive(&self, mut plan: Plan) -> Plan {
        let ctx = self.collaborators();
        plan.phase = PlanPhase::Executing;

        loop {
            plan = skip_removed(plan, ctx.sink);
            plan = refine::maybe_refine(plan, &ctx, &self.policy).await;
            plan = skip_removed(plan, ctx.sink);

            let Some(id) = resolver::next_eligible(&plan) else {
                break;
            };
            let (next, outcome) = executor::execute_step(plan, id, &ctx, &self.policy).await;
            plan = next;
            match outcome {
                StepOutcome::Failed(error) => {
                    plan = retry::recover(plan, id, error, &ctx, &self.policy).await;
                }
                StepOutcome::NotRunnable => {
                    // eligible but refused by the executor; fail it so the loop advances
                    plan = executor::record_failure(plan, id, "step is not runnable");
                }
                StepOutcome::Succeeded { .. } | StepOutcome::Rejected(_) => {}
            }
        }

        let blocked = resolver::blocked_ids(&plan);
        if !blocked.is_empty() {
            tracing::warn!(plan = %plan.id, ?blocked, "steps left unexecuted behind failed dependencies");
        }

        aggregate::aggregate(plan, &ctx, &self.policy).await
    }
}

fn skip_removed(plan: Plan, sink: &dyn ProgressSink) -> Plan {
    let (plan, skipped) = resolver::skip_removed(plan);
    for id in skipped {
        let reason = plan
            .step(id)
            .and_then(|s| s.removal_reason.clone())
            .unwrap_or_default();
        tracing::debug!(plan = %plan.id, step = id, %reason, "step skipped");
        sink.emit(ProgressEvent::StepSkipped {
            plan_id: plan.id.clone(),
            step_id: id,
            reason,
        });
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::draft::{PlanDraft, RevisionDraft, StepDraft, StepPatch};
    use crate::events::ChannelSink;
    use crate::planner::scripted::{PlannerScript, ScriptedPlanner};
    use crate::source::catalog::LexicalRetriever;
    use crate::source::memory::MemoryExecutor;
    use crate::source::{ColumnSchema, QueryError, TableSchema};

    fn catalog() -> LexicalRetriever {
        LexicalRetriever::new().with_catalog(
            "shop",
            vec![TableSchema {
                name: "orders".into(),
                columns: vec![ColumnSchema {
                    name: "total".into(),
                    data_type: "REAL".into(),
                    nullable: true,
                    primary_key: false,
                }],
            }],
        )
    }

    fn draft(steps: Vec<StepDraft>) -> PlanDraft {
        PlanDraft {
            intent: "analyse orders".into(),
            steps,
        }
    }

    struct Harness {
        engine: Engine,
        planner: Arc<ScriptedPlanner>,
        source: Arc<MemoryExecutor>,
        events: tokio::sync::mpsc::UnboundedReceiver<crate::events::TimestampedEvent>,
    }

    fn harness(script: PlannerScript, source: MemoryExecutor, policy: EnginePolicy) -> Harness {
        let planner = Arc::new(ScriptedPlanner::new(script));
        let source = Arc::new(source);
        let (sink, events) = ChannelSink::new();
        let engine = Engine::new(Arc::new(catalog()), planner.clone(), source.clone())
            .with_sink(Arc::new(sink))
            .with_policy(policy);
        Harness {
            engine,
            planner,
            source,
            events,
        }
    }

    fn no_refinement() -> EnginePolicy {
        let mut policy = EnginePolicy::default();
        policy.refinement.enabled = false;
        policy
    }

    fn event_names(h: &mut Harness) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(e) = h.events.try_recv() {
            names.push(e.event.name());
        }
        names
    }

    #[tokio::test]
    async fn test_aq009_independent_steps_all_succeed() {
        let script = PlannerScript::default()
            .with_plan(draft(vec![
                StepDraft::query(1, "count", "SELECT COUNT(*) FROM orders"),
                StepDraft::query(2, "sum", "SELECT SUM(total) FROM orders"),
                StepDraft::query(3, "max", "SELECT MAX(total) FROM orders"),
            ]))
            .with_narrative("Done.");
        let source = MemoryExecutor::new()
            .rows("SELECT COUNT(*) FROM orders", 1)
            .rows("SELECT SUM(total) FROM orders", 1)
            .rows("SELECT MAX(total) FROM orders", 1);
        let mut h = harness(script, source, no_refinement());

        let out = h.engine.run_plan("orders?", "shop", "sqlite", &[]).await.unwrap();
        assert_eq!(out.answer, "Done.");
        assert_eq!(out.plan.final_sql.as_deref(), Some("SELECT MAX(total) FROM orders"));
        assert_eq!(out.plan.failed_steps, 0);
        assert_eq!(out.plan.successful_steps, 3);
        assert_eq!(out.plan.phase, PlanPhase::Done);
        assert!(out.plan.id.starts_with("plan-"));

        let names = event_names(&mut h);
        assert_eq!(names.first(), Some(&"plan_generated"));
        assert_eq!(names.last(), Some(&"plan_completed"));
        assert_eq!(names.iter().filter(|n| **n == "step_completed").count(), 3);
    }

    #[tokio::test]
    async fn test_aq009_dependent_of_failed_step_never_runs() {
        let script = PlannerScript::default()
            .with_plan(draft(vec![
                StepDraft::query(1, "bad", "SELECT nope FROM orders"),
                StepDraft::query(2, "after", "SELECT 2").after(&[1]),
            ]))
            .with_narrative("Nothing.");
        let source = MemoryExecutor::new()
            .fail("SELECT nope FROM orders", "no such column: nope")
            .rows("SELECT 2", 1);
        let h = harness(script, source, no_refinement());

        let out = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap();
        assert!(out.plan.failed_steps >= 1);
        assert_eq!(out.plan.successful_steps, 0);
        assert_eq!(h.source.count("SELECT 2"), 0);
        assert!(!out.plan.executed.contains(&2));
        assert_eq!(out.plan.final_sql, None);
        assert_eq!(resolver::blocked_ids(&out.plan), vec![2]);
    }

    #[tokio::test]
    async fn test_aq009_refinement_removal_unblocks_dependent() {
        let script = PlannerScript::default()
            .with_plan(draft(vec![
                StepDraft::query(1, "a", "SELECT 1"),
                StepDraft::query(2, "b", "SELECT 2").after(&[1]),
                StepDraft::query(3, "c", "SELECT 3").after(&[2]),
            ]))
            .push_revision(RevisionDraft {
                should_refine: true,
                new_steps: vec![],
                modified_steps: vec![StepPatch::new(2).sql("REMOVE")],
            })
            .with_narrative("ok");
        let source = MemoryExecutor::new()
            .rows("SELECT 1", 0)
            .rows("SELECT 2", 1)
            .rows("SELECT 3", 1);
        let mut h = harness(script, source, EnginePolicy::default());

        let out = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap();
        let plan = &out.plan;
        assert!(plan.step(2).unwrap().is_removed());
        assert!(plan.step(3).unwrap().depends_on.is_empty());
        assert!(plan.executed.contains(&2));
        assert!(plan.step(3).unwrap().has_result());
        assert_eq!(h.source.count("SELECT 2"), 0);
        assert_eq!(plan.final_sql.as_deref(), Some("SELECT 3"));

        let names = event_names(&mut h);
        assert!(names.contains(&"plan_refined"));
        assert!(names.contains(&"step_skipped"));
    }

    #[tokio::test]
    async fn test_aq009_zero_rows_triggers_refinement_early() {
        let script = PlannerScript::default()
            .with_plan(draft(vec![
                StepDraft::query(1, "a", "SELECT 1"),
                StepDraft::query(2, "b", "SELECT 2"),
                StepDraft::query(3, "c", "SELECT 3"),
                StepDraft::query(4, "d", "SELECT 4"),
            ]))
            .with_narrative("ok");
        let source = MemoryExecutor::new()
            .rows("SELECT 1", 0)
            .otherwise(Ok(crate::source::memory::numbered_rows(5)));
        let h = harness(script, source, EnginePolicy::default());

        let out = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap();
        // cadence restarts after the zero-row refinement, so it fires after steps 2 and 3
        assert_eq!(
            h.planner.calls().triggers,
            vec![
                RefineTrigger::ZeroRows { step_id: 1 },
                RefineTrigger::Cadence { successes: 2 },
            ]
        );
        assert_eq!(out.plan.successful_steps, 4);
        assert_eq!(out.plan.refinement_rounds, 2);
    }

    #[tokio::test]
    async fn test_aq009_malformed_chart_stripped() {
        let script = PlannerScript::default()
            .with_plan(draft(vec![StepDraft::query(1, "a", "SELECT 1")]))
            .with_narrative("Answer text.\n```chart\n{\"type\": \"bar\", \"data\": 7}\n```");
        let source = MemoryExecutor::new().rows("SELECT 1", 1);
        let h = harness(script, source, no_refinement());

        let out = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap();
        assert_eq!(out.answer, "Answer text.");
        assert!(out.plan.chart.is_none());
    }

    #[tokio::test]
    async fn test_aq009_unsafe_sql_never_reaches_executor() {
        let script = PlannerScript::default()
            .with_plan(draft(vec![
                StepDraft::query(1, "empty", "SELECT 1"),
                StepDraft::query(2, "wipe", "DELETE FROM orders"),
                StepDraft::query(3, "bad", "SELECT x FROM orders"),
                StepDraft::query(4, "later", "SELECT 4"),
            ]))
            .push_fix(3, Some("UPDATE orders SET total = 0"))
            .push_revision(RevisionDraft {
                should_refine: true,
                new_steps: vec![StepDraft::query(5, "sneaky", "SELECT 1; DROP TABLE orders")],
                modified_steps: vec![StepPatch::new(4).sql("INSERT INTO orders VALUES (1)")],
            })
            .with_narrative("ok");
        let source = MemoryExecutor::new()
            .fail("SELECT x FROM orders", "no such column: x")
            .otherwise(Ok(crate::source::memory::numbered_rows(0)));
        let h = harness(script, source, EnginePolicy::default());

        let out = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap();
        for sql in h.source.executed() {
            assert!(crate::core::guard::is_read_only(&sql), "unsafe SQL executed: {}", sql);
        }
        assert_eq!(h.source.executed(), vec!["SELECT 1", "SELECT x FROM orders"]);
        assert_eq!(out.plan.successful_steps, 1);
        assert_eq!(out.plan.failed_steps, 4);
    }

    #[tokio::test]
    async fn test_aq009_always_failing_step_bounded() {
        let script = PlannerScript::default()
            .with_plan(draft(vec![StepDraft::query(1, "a", "SELECT a")]))
            .push_fix(1, Some("SELECT b"))
            .push_fix(1, Some("SELECT c"))
            .push_fix(1, Some("SELECT d"))
            .push_fix(1, Some("SELECT e"))
            .with_narrative("none");
        let source = MemoryExecutor::new().otherwise(Err(QueryError::Timeout(
            std::time::Duration::from_secs(1),
        )));
        let h = harness(script, source, EnginePolicy::default());

        let out = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap();
        assert_eq!(h.source.executed().len(), 4);
        assert_eq!(out.plan.failed_steps, 1);
        assert_eq!(out.plan.step(1).unwrap().attempts, 4);
    }

    #[tokio::test]
    async fn test_aq009_no_schema() {
        let h = harness(PlannerScript::default(), MemoryExecutor::new(), EnginePolicy::default());
        let err = h.engine.run_plan("q", "crm", "sqlite", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::NoRelevantSchema { .. }));
        assert_eq!(h.planner.calls().plans, 0);
    }

    #[tokio::test]
    async fn test_aq009_planner_failure_is_fatal() {
        let h = harness(
            PlannerScript::default().failing_plan("rate limited"),
            MemoryExecutor::new(),
            EnginePolicy::default(),
        );
        let err = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::Planner(PlannerError::Unavailable("rate limited".into()))
        );
    }

    #[tokio::test]
    async fn test_aq009_cyclic_plan_rejected() {
        let script = PlannerScript::default().with_plan(draft(vec![
            StepDraft::query(1, "a", "SELECT 1").after(&[2]),
            StepDraft::query(2, "b", "SELECT 2").after(&[1]),
        ]));
        let h = harness(script, MemoryExecutor::new(), EnginePolicy::default());
        let err = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap_err();
        assert!(matches!(err, EngineError::Planner(PlannerError::Invalid(_))));
        assert!(h.source.executed().is_empty());
    }

    #[tokio::test]
    async fn test_aq009_refinement_adds_steps() {
        let script = PlannerScript::default()
            .with_plan(draft(vec![
                StepDraft::query(1, "a", "SELECT 1"),
                StepDraft::query(2, "b", "SELECT 2"),
                StepDraft::query(3, "c", "SELECT 3"),
            ]))
            .push_revision(RevisionDraft {
                should_refine: true,
                new_steps: vec![StepDraft::query(4, "drill down", "SELECT 4").after(&[2])],
                modified_steps: vec![],
            })
            .with_narrative("ok");
        let source = MemoryExecutor::new().otherwise(Ok(crate::source::memory::numbered_rows(3)));
        let h = harness(script, source, EnginePolicy::default());

        let out = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap();
        assert_eq!(out.plan.steps.len(), 4);
        assert_eq!(out.plan.successful_steps, 4);
        assert_eq!(out.plan.final_sql.as_deref(), Some("SELECT 4"));
    }

    #[tokio::test]
    async fn test_aq009_removed_in_initial_plan_skipped() {
        let mut removed = StepDraft::query(2, "skip", "SELECT 2");
        removed.kind = StepKind::Removed;
        let script = PlannerScript::default()
            .with_plan(draft(vec![
                StepDraft::query(1, "a", "SELECT 1"),
                removed,
                StepDraft::query(3, "c", "SELECT 3").after(&[2]),
            ]))
            .with_narrative("ok");
        let source = MemoryExecutor::new().otherwise(Ok(crate::source::memory::numbered_rows(1)));
        let h = harness(script, source, no_refinement());

        let out = h.engine.run_plan("q", "shop", "sqlite", &[]).await.unwrap();
        assert_eq!(h.source.executed(), vec!["SELECT 1", "SELECT 3"]);
        assert!(out.plan.executed.contains(&2));
        assert!(out
            .plan
            .context
            .iter()
            .any(|e| e.step.id == 2 && matches!(e.outcome, ContextOutcome::Skipped { .. })));
    }
}
