//! AQ-014: Planner backed by an external process.
//!
//! Each request runs the configured command under `bash -c`. The request is
//! written to stdin as one JSON line `{operation, request, response_schema}`
//! and the response is read from stdout. Structured responses go through
//! the draft parsers; the narrative is taken verbatim.

use super::{
    FixRequest, NarrativeRequest, PlanRequest, Planner, PlannerError, RefinementRequest,
};
use crate::core::draft::{self, PlanDraft, RevisionDraft, StepFix};
use crate::core::types::PlannerSettings;
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    operation: &'a str,
    request: &'a T,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct CommandPlanner {
    command: String,
    timeout: Duration,
}

impl CommandPlanner {
    pub fn new(command: &str, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            timeout,
        }
    }

    pub fn from_settings(settings: &PlannerSettings) -> Result<Self, PlannerError> {
        let command = settings
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| PlannerError::Unavailable("no planner command configured".to_string()))?;
        Ok(Self::new(command, Duration::from_secs(settings.timeout_secs)))
    }

    /// Run the command once and return its stdout.
    async fn call<T: Serialize + Sync>(
        &self,
        operation: &str,
        request: &T,
        response_schema: Option<serde_json::Value>,
    ) -> Result<String, PlannerError> {
        let envelope = Envelope {
            operation,
            request,
            response_schema,
        };
        let mut payload = serde_json::to_string(&envelope)
            .map_err(|e| PlannerError::Unavailable(format!("cannot encode request: {}", e)))?;
        payload.push('\n');

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlannerError::Unavailable(format!("failed to spawn planner: {}", e)))?;

        // Feed stdin while draining stdout so neither pipe can stall the
        // other; the timeout bounds both halves of the exchange.
        let stdin = child.stdin.take();
        let write = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(payload.as_bytes()).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        tracing::debug!(operation, "planner request sent");
        let (written, output) = tokio::time::timeout(self.timeout, async {
            tokio::join!(write, child.wait_with_output())
        })
        .await
        .map_err(|_| PlannerError::Unavailable(format!("planner timed out after {:?}", self.timeout)))?;

        written.map_err(|e| PlannerError::Unavailable(format!("stdin write error: {}", e)))?;
        let output = output.map_err(|e| PlannerError::Unavailable(format!("wait error: {}", e)))?;

        if !output.status.success() {
            return Err(PlannerError::Unavailable(format!(
                "planner exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Planner for CommandPlanner {
    async fn request_plan(&self, request: &PlanRequest) -> Result<PlanDraft, PlannerError> {
        let out = self.call("plan", request, Some(draft::plan_schema())).await?;
        draft::parse_plan_draft(&out)
    }

    async fn request_refinement(
        &self,
        request: &RefinementRequest,
    ) -> Result<RevisionDraft, PlannerError> {
        let out = self
            .call("refine", request, Some(draft::revision_schema()))
            .await?;
        draft::parse_revision(&out)
    }

    async fn request_fix(&self, request: &FixRequest) -> Result<Option<StepFix>, PlannerError> {
        let out = self.call("fix", request, Some(draft::fix_schema())).await?;
        draft::parse_fix(&out)
    }

    async fn request_narrative(&self, request: &NarrativeRequest) -> Result<String, PlannerError> {
        let out = self.call("narrative", request, None).await?;
        let text = out.trim();
        if text.is_empty() {
            return Err(PlannerError::Malformed("empty narrative".to_string()));
        }
        Ok(text.to_string())
    }
}
