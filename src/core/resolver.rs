//! AQ-003: Dependency resolution over plan steps.
//!
//! Eligibility is recomputed from scratch on every call: a step is eligible
//! when it is pending and every dependency is either executed or removed.
//! Topological order uses Kahn's algorithm with ascending-id tie-breaking.

use super::types::{ContextOutcome, Plan, Step, StepId};
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, VecDeque};

/// True when every dependency of `step` is satisfied.
///
/// Dependencies on removed steps are vacuously satisfied.
pub fn is_executable(step: &Step, executed: &BTreeSet<StepId>, steps: &[Step]) -> bool {
    step.depends_on.iter().all(|dep| {
        executed.contains(dep) || steps.iter().any(|s| s.id == *dep && s.is_removed())
    })
}

/// Mark removed steps executed without running them.
///
/// Returns the ids skipped by this pass; each gets one `Skipped` context
/// entry.
pub fn skip_removed(mut plan: Plan) -> (Plan, Vec<StepId>) {
    let newly: Vec<(StepId, String)> = plan
        .steps
        .iter()
        .filter(|s| s.is_removed() && !plan.executed.contains(&s.id))
        .map(|s| {
            let reason = s
                .removal_reason
                .clone()
                .unwrap_or_else(|| "removed".to_string());
            (s.id, reason)
        })
        .collect();

    let mut skipped = Vec::with_capacity(newly.len());
    for (id, reason) in newly {
        plan.executed.insert(id);
        plan.record(id, ContextOutcome::Skipped { reason });
        skipped.push(id);
    }
    (plan, skipped)
}

/// Steps not yet executed, not removed and not permanently failed.
pub fn pending_ids(plan: &Plan) -> Vec<StepId> {
    plan.steps
        .iter()
        .filter(|s| !plan.executed.contains(&s.id) && !s.is_removed() && !s.has_failed())
        .map(|s| s.id)
        .collect()
}

/// Steps not yet executed and not removed, failed ones included.
pub fn open_ids(plan: &Plan) -> Vec<StepId> {
    plan.steps
        .iter()
        .filter(|s| !plan.executed.contains(&s.id) && !s.is_removed())
        .map(|s| s.id)
        .collect()
}

/// Pending steps whose dependencies are satisfied, in original order.
pub fn eligible_ids(plan: &Plan) -> Vec<StepId> {
    plan.steps
        .iter()
        .filter(|s| !plan.executed.contains(&s.id) && !s.is_removed() && !s.has_failed())
        .filter(|s| is_executable(s, &plan.executed, &plan.steps))
        .map(|s| s.id)
        .collect()
}

pub fn next_eligible(plan: &Plan) -> Option<StepId> {
    eligible_ids(plan).into_iter().next()
}

/// Pending steps that can never run because a dependency failed, directly
/// or through another blocked step.
pub fn blocked_ids(plan: &Plan) -> Vec<StepId> {
    let pending = pending_ids(plan);
    let failed: BTreeSet<StepId> = plan
        .steps
        .iter()
        .filter(|s| s.has_failed() && !s.is_removed())
        .map(|s| s.id)
        .collect();

    let mut blocked: BTreeSet<StepId> = BTreeSet::new();
    loop {
        let mut changed = false;
        for id in &pending {
            if blocked.contains(id) {
                continue;
            }
            let Some(step) = plan.step(*id) else {
                continue;
            };
            if step
                .depends_on
                .iter()
                .any(|d| failed.contains(d) || blocked.contains(d))
            {
                blocked.insert(*id);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    pending.into_iter().filter(|id| blocked.contains(id)).collect()
}

/// Drop every id in `removed` from every dependency list. Returns the
/// number of edges dropped.
pub fn repair_dependencies(steps: &mut [Step], removed: &BTreeSet<StepId>) -> usize {
    let mut dropped = 0;
    for step in steps.iter_mut() {
        let before = step.depends_on.len();
        step.depends_on.retain(|d| !removed.contains(d));
        dropped += before - step.depends_on.len();
    }
    dropped
}

/// Drop dependency ids that name no step. Returns the dropped
/// `(step, dependency)` pairs.
pub fn prune_unknown_dependencies(steps: &mut [Step]) -> Vec<(StepId, StepId)> {
    let known: BTreeSet<StepId> = steps.iter().map(|s| s.id).collect();
    let mut dropped = Vec::new();
    for step in steps.iter_mut() {
        let id = step.id;
        step.depends_on.retain(|d| {
            let keep = known.contains(d);
            if !keep {
                dropped.push((id, *d));
            }
            keep
        });
    }
    dropped
}

/// Topological order of steps.
/// Uses Kahn's algorithm with ascending-id tie-breaking for determinism.
/// Removed steps are satisfied unconditionally, so their own dependencies
/// contribute no edges.
pub fn execution_order(steps: &[Step]) -> Result<Vec<StepId>, String> {
    let mut in_degree: FxHashMap<StepId, usize> = FxHashMap::default();
    let mut adjacency: FxHashMap<StepId, Vec<StepId>> = FxHashMap::default();

    for step in steps {
        in_degree.insert(step.id, 0);
        adjacency.insert(step.id, Vec::new());
    }

    for step in steps.iter().filter(|s| !s.is_removed()) {
        for dep in &step.depends_on {
            let Some(neighbors) = adjacency.get_mut(dep) else {
                return Err(format!("step {} depends on unknown step {}", step.id, dep));
            };
            neighbors.push(step.id);
            *in_degree.entry(step.id).or_default() += 1;
        }
    }

    let mut zero_degree: Vec<StepId> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(id, _)| *id)
        .collect();
    zero_degree.sort_unstable();
    let mut queue: VecDeque<StepId> = zero_degree.into_iter().collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(current) = queue.pop_front() {
        order.push(current);

        let mut next_ready = Vec::new();
        if let Some(neighbors) = adjacency.get(&current) {
            for neighbor in neighbors {
                if let Some(degree) = in_degree.get_mut(neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next_ready.push(*neighbor);
                    }
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != in_degree.len() {
        let ordered: BTreeSet<StepId> = order.iter().copied().collect();
        let members: Vec<String> = in_degree
            .keys()
            .filter(|id| !ordered.contains(id))
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        return Err(format!(
            "dependency cycle detected involving steps: {}",
            members.join(", ")
        ));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{QueryResult, StepKind};
    use proptest::prelude::*;

    fn step(id: StepId, deps: &[StepId]) -> Step {
        Step::new(id, StepKind::Query, &format!("step {}", id), "SELECT 1").with_deps(deps)
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan::new("p", "q", "i", "sqlite", steps)
    }

    fn succeed(plan: &mut Plan, id: StepId) {
        plan.step_mut(id).unwrap().result = Some(QueryResult::default());
        plan.executed.insert(id);
    }

    fn fail(plan: &mut Plan, id: StepId) {
        plan.step_mut(id).unwrap().error = Some("boom".into());
    }

    #[test]
    fn test_aq003_no_deps_always_executable() {
        let steps = vec![step(1, &[])];
        assert!(is_executable(&steps[0], &BTreeSet::new(), &steps));
    }

    #[test]
    fn test_aq003_removed_dependency_satisfied() {
        let mut removed = step(1, &[]);
        removed.mark_removed("dup");
        let steps = vec![removed, step(2, &[1])];
        assert!(is_executable(&steps[1], &BTreeSet::new(), &steps));
    }

    #[test]
    fn test_aq003_unexecuted_dependency_blocks() {
        let steps = vec![step(1, &[]), step(2, &[1])];
        assert!(!is_executable(&steps[1], &BTreeSet::new(), &steps));
        let executed: BTreeSet<_> = [1].into_iter().collect();
        assert!(is_executable(&steps[1], &executed, &steps));
    }

    #[test]
    fn test_aq003_skip_removed_records_once() {
        let mut removed = step(2, &[1]);
        removed.mark_removed("redundant");
        let p = plan(vec![step(1, &[]), removed]);

        let (p, skipped) = skip_removed(p);
        assert_eq!(skipped, vec![2]);
        assert!(p.executed.contains(&2));
        assert_eq!(p.context.len(), 1);
        assert!(matches!(
            &p.context[0].outcome,
            ContextOutcome::Skipped { reason } if reason == "redundant"
        ));

        let (p, skipped) = skip_removed(p);
        assert!(skipped.is_empty());
        assert_eq!(p.context.len(), 1);
    }

    #[test]
    fn test_aq003_eligible_original_order() {
        let p = plan(vec![step(3, &[]), step(1, &[]), step(2, &[3])]);
        assert_eq!(eligible_ids(&p), vec![3, 1]);
        assert_eq!(next_eligible(&p), Some(3));
    }

    #[test]
    fn test_aq003_failed_step_not_pending() {
        let mut p = plan(vec![step(1, &[]), step(2, &[1]), step(3, &[])]);
        fail(&mut p, 1);
        assert_eq!(pending_ids(&p), vec![2, 3]);
        assert_eq!(open_ids(&p), vec![1, 2, 3]);
        assert_eq!(eligible_ids(&p), vec![3]);
        assert_eq!(blocked_ids(&p), vec![2]);
    }

    #[test]
    fn test_aq003_blocked_transitively() {
        let mut p = plan(vec![step(1, &[]), step(2, &[1]), step(3, &[2]), step(4, &[])]);
        fail(&mut p, 1);
        succeed(&mut p, 4);
        assert_eq!(blocked_ids(&p), vec![2, 3]);
        assert!(eligible_ids(&p).is_empty());
    }

    #[test]
    fn test_aq003_repair_dependencies() {
        let mut steps = vec![step(1, &[]), step(2, &[1]), step(3, &[1, 2])];
        let removed: BTreeSet<_> = [1].into_iter().collect();
        assert_eq!(repair_dependencies(&mut steps, &removed), 2);
        assert!(steps[1].depends_on.is_empty());
        assert_eq!(steps[2].depends_on, vec![2]);
    }

    #[test]
    fn test_aq003_prune_unknown() {
        let mut steps = vec![step(1, &[9]), step(2, &[1, 7])];
        let dropped = prune_unknown_dependencies(&mut steps);
        assert_eq!(dropped, vec![(1, 9), (2, 7)]);
        assert!(steps[0].depends_on.is_empty());
        assert_eq!(steps[1].depends_on, vec![1]);
    }

    #[test]
    fn test_aq003_topo_linear() {
        let steps = vec![step(3, &[2]), step(2, &[1]), step(1, &[])];
        assert_eq!(execution_order(&steps).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_aq003_topo_diamond() {
        let steps = vec![step(1, &[]), step(3, &[1]), step(2, &[1]), step(4, &[2, 3])];
        assert_eq!(execution_order(&steps).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_aq003_topo_cycle() {
        let steps = vec![step(1, &[]), step(2, &[3]), step(3, &[2])];
        let err = execution_order(&steps).unwrap_err();
        assert!(err.contains("cycle"));
        assert!(err.contains("2, 3"));
    }

    #[test]
    fn test_aq003_topo_ignores_removed_step_edges() {
        let mut removed = step(1, &[2]);
        removed.mark_removed("obsolete");
        let steps = vec![removed, step(2, &[1]), step(3, &[2])];
        assert_eq!(execution_order(&steps).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_aq003_topo_unknown_dependency() {
        let steps = vec![step(1, &[5])];
        assert!(execution_order(&steps).unwrap_err().contains("unknown step 5"));
    }

    /// Acyclic step lists: each step may only depend on lower ids.
    fn arb_dag() -> impl Strategy<Value = Vec<Step>> {
        (1usize..12).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<prop::sample::Index>(), 0..3), n)
                .prop_map(move |deps| {
                    deps.into_iter()
                        .enumerate()
                        .map(|(i, picks)| {
                            let id = i as StepId + 1;
                            let mut ds: Vec<StepId> = if i == 0 {
                                Vec::new()
                            } else {
                                picks.iter().map(|p| p.index(i) as StepId + 1).collect()
                            };
                            ds.sort_unstable();
                            ds.dedup();
                            step(id, &ds)
                        })
                        .collect()
                })
        })
    }

    proptest! {
        #[test]
        fn test_aq003_prop_order_respects_deps(steps in arb_dag()) {
            let order = execution_order(&steps).unwrap();
            prop_assert_eq!(order.len(), steps.len());
            let pos: FxHashMap<StepId, usize> =
                order.iter().enumerate().map(|(i, id)| (*id, i)).collect();
            for s in &steps {
                for d in &s.depends_on {
                    prop_assert!(pos[d] < pos[&s.id]);
                }
            }
        }

        #[test]
        fn test_aq003_prop_eligible_idempotent(steps in arb_dag(), done in 0usize..6) {
            let mut p = plan(steps);
            let ids: Vec<StepId> = p.steps.iter().map(|s| s.id).take(done).collect();
            for id in ids {
                succeed(&mut p, id);
            }
            prop_assert_eq!(eligible_ids(&p), eligible_ids(&p));
        }

        #[test]
        fn test_aq003_prop_removed_executed_after_one_pass(
            steps in arb_dag(),
            mask in proptest::collection::vec(any::<bool>(), 12),
        ) {
            let mut p = plan(steps);
            for (s, remove) in p.steps.iter_mut().zip(mask) {
                if remove {
                    s.mark_removed("prop");
                }
            }
            let removed: Vec<StepId> =
                p.steps.iter().filter(|s| s.is_removed()).map(|s| s.id).collect();
            let (p, _) = skip_removed(p);
            for id in removed {
                prop_assert!(p.executed.contains(&id));
            }
        }
    }
}
