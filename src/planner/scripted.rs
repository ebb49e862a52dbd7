//! AQ-014: Deterministic planner replaying canned responses.
//!
//! A script holds the initial plan, a queue of revisions, per-step queues
//! of fixes and the narrative. Scripts load from YAML for offline runs of
//! the CLI.

use super::{
    FixRequest, NarrativeRequest, PlanRequest, Planner, PlannerError, RefinementRequest,
};
use crate::core::draft::{PlanDraft, RevisionDraft, StepFix};
use crate::core::types::{RefineTrigger, StepId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

/// Canned planner responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerScript {
    #[serde(default)]
    pub plan: Option<PlanDraft>,

    /// Fail plan generation with this message
    #[serde(default)]
    pub plan_error: Option<String>,

    /// Consumed one per refinement request; exhausted means "no change"
    #[serde(default)]
    pub revisions: Vec<RevisionDraft>,

    /// Replacement SQL per step; `null` entries mean "no revision"
    #[serde(default)]
    pub fixes: BTreeMap<StepId, Vec<Option<String>>>,

    #[serde(default)]
    pub narrative: Option<String>,

    #[serde(default)]
    pub narrative_error: Option<String>,
}

impl PlannerScript {
    pub fn with_plan(mut self, plan: PlanDraft) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn failing_plan(mut self, message: &str) -> Self {
        self.plan_error = Some(message.to_string());
        self
    }

    pub fn push_revision(mut self, revision: RevisionDraft) -> Self {
        self.revisions.push(revision);
        self
    }

    pub fn push_fix(mut self, step_id: StepId, sql: Option<&str>) -> Self {
        self.fixes
            .entry(step_id)
            .or_default()
            .push(sql.map(str::to_string));
        self
    }

    pub fn with_narrative(mut self, text: &str) -> Self {
        self.narrative = Some(text.to_string());
        self
    }

    pub fn failing_narrative(mut self, message: &str) -> Self {
        self.narrative_error = Some(message.to_string());
        self
    }
}

/// Requests received, for assertions.
#[derive(Debug, Clone, Default)]
pub struct PlannerCalls {
    pub plans: usize,
    pub refinements: usize,
    pub fixes: usize,
    pub narratives: usize,
    pub triggers: Vec<RefineTrigger>,
    pub fix_requests: Vec<FixRequest>,
    pub last_narrative: Option<NarrativeRequest>,
}

#[derive(Debug)]
pub struct ScriptedPlanner {
    plan: Option<PlanDraft>,
    plan_error: Option<String>,
    narrative: Option<String>,
    narrative_error: Option<String>,
    revisions: Mutex<VecDeque<RevisionDraft>>,
    fixes: Mutex<BTreeMap<StepId, VecDeque<Option<String>>>>,
    calls: Mutex<PlannerCalls>,
}

impl ScriptedPlanner {
    pub fn new(script: PlannerScript) -> Self {
        Self {
            plan: script.plan,
            plan_error: script.plan_error,
            narrative: script.narrative,
            narrative_error: script.narrative_error,
            revisions: Mutex::new(script.revisions.into_iter().collect()),
            fixes: Mutex::new(
                script
                    .fixes
                    .into_iter()
                    .map(|(id, queue)| (id, queue.into_iter().collect()))
                    .collect(),
            ),
            calls: Mutex::new(PlannerCalls::default()),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, String> {
        let script: PlannerScript =
            serde_yaml_ng::from_str(yaml).map_err(|e| format!("invalid planner script: {}", e))?;
        Ok(Self::new(script))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Self::from_yaml(&content)
    }

    /// Snapshot of the requests received so far.
    pub fn calls(&self) -> PlannerCalls {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn note(&self, f: impl FnOnce(&mut PlannerCalls)) {
        if let Ok(mut calls) = self.calls.lock() {
            f(&mut calls);
        }
    }
}

impl From<PlannerScript> for ScriptedPlanner {
    fn from(script: PlannerScript) -> Self {
        Self::new(script)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn request_plan(&self, _request: &PlanRequest) -> Result<PlanDraft, PlannerError> {
        self.note(|c| c.plans += 1);
        if let Some(ref msg) = self.plan_error {
            return Err(PlannerError::Unavailable(msg.clone()));
        }
        self.plan
            .clone()
            .ok_or_else(|| PlannerError::Unavailable("no plan scripted".to_string()))
    }

    async fn request_refinement(
        &self,
        request: &RefinementRequest,
    ) -> Result<RevisionDraft, PlannerError> {
        self.note(|c| {
            c.refinements += 1;
            c.triggers.push(request.trigger.clone());
        });
        let next = self.revisions.lock().ok().and_then(|mut q| q.pop_front());
        Ok(next.unwrap_or_default())
    }

    async fn request_fix(&self, request: &FixRequest) -> Result<Option<StepFix>, PlannerError> {
        self.note(|c| {
            c.fixes += 1;
            c.fix_requests.push(request.clone());
        });
        let next = self
            .fixes
            .lock()
            .ok()
            .and_then(|mut map| map.get_mut(&request.step_id)?.pop_front())
            .flatten();
        Ok(next.map(|sql| StepFix {
            step_id: request.step_id,
            sql,
            explanation: None,
        }))
    }

    async fn request_narrative(&self, request: &NarrativeRequest) -> Result<String, PlannerError> {
        self.note(|c| {
            c.narratives += 1;
            c.last_narrative = Some(request.clone());
        });
        if let Some(ref msg) = self.narrative_error {
            return Err(PlannerError::Unavailable(msg.clone()));
        }
        self.narrative
            .clone()
            .ok_or_else(|| PlannerError::Unavailable("no narrative scripted".to_string()))
    }
}
