//! Stage execution.
//!
//! A stage is an opaque external collaborator. [`CommandStageRunner`] runs a
//! shell command with the stage context in `GATEHOUSE_*` environment
//! variables and as JSON on stdin, and expects a JSON report as the last
//! JSON line on stdout:
//!
//! ```json
//! {"status": "pass", "evidence": "tests: 295/295 pass", "outcome": "clean"}
//! ```

use crate::errors::StageError;
use crate::gates::GateStatus;
use crate::pull_request::PullRequestRef;
use crate::router::OutcomeClass;
use crate::util::{last_json_object, truncate_chars};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// What a stage is asked to evaluate.
#[derive(Debug, Clone, Serialize)]
pub struct StageContext {
    pub pr: PullRequestRef,
    pub stage_id: String,
    pub gate_id: Option<String>,
    /// 1-based evaluation count of this stage within the run.
    pub attempt: u32,
}

/// What a stage reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub status: GateStatus,
    pub evidence: String,
    /// Defaults to `clean` when omitted.
    #[serde(default)]
    pub outcome: Option<OutcomeClass>,
}

impl StageReport {
    pub fn new(status: GateStatus, evidence: &str) -> Self {
        Self {
            status,
            evidence: evidence.to_string(),
            outcome: None,
        }
    }

    pub fn pass(evidence: &str) -> Self {
        Self::new(GateStatus::Pass, evidence)
    }

    pub fn fail(evidence: &str) -> Self {
        Self::new(GateStatus::Fail, evidence)
    }

    pub fn skipped(reason: &str) -> Self {
        Self::new(GateStatus::Skipped, &format!("skipped ({})", reason))
    }

    pub fn with_outcome(mut self, outcome: OutcomeClass) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn outcome_class(&self) -> OutcomeClass {
        self.outcome.unwrap_or(OutcomeClass::Clean)
    }

    /// Parse a report from stage stdout.
    pub fn from_stdout(stdout: &str) -> Result<Self, StageError> {
        let json = last_json_object(stdout)
            .ok_or_else(|| StageError::MalformedReport("no JSON report on stdout".to_string()))?;
        let report: StageReport = serde_json::from_str(json)
            .map_err(|e| StageError::MalformedReport(e.to_string()))?;
        if report.status == GateStatus::Pending {
            return Err(StageError::MalformedReport(
                "status must be pass, fail or skipped".to_string(),
            ));
        }
        Ok(report)
    }
}

/// Runs one stage to completion.
///
/// Timeouts and cancellation are applied by the caller; implementations
/// only need to be cancel-safe when their future is dropped.
#[async_trait]
pub trait StageRunner: Send + Sync {
    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError>;
}

/// Runs a stage as `sh -c <command>`.
#[derive(Debug, Clone)]
pub struct CommandStageRunner {
    command: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl CommandStageRunner {
    pub fn new(command: &str, working_dir: PathBuf) -> Self {
        Self {
            command: command.to_string(),
            working_dir,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl StageRunner for CommandStageRunner {
    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let context_json = serde_json::to_string(ctx).map_err(|e| StageError::Other(e.into()))?;

        debug!(stage = %ctx.stage_id, command = %self.command, "spawning stage");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("GATEHOUSE_OWNER", &ctx.pr.owner)
            .env("GATEHOUSE_REPO", &ctx.pr.repo)
            .env("GATEHOUSE_PR", ctx.pr.number.to_string())
            .env("GATEHOUSE_HEAD_SHA", &ctx.pr.head_sha)
            .env("GATEHOUSE_STAGE", &ctx.stage_id)
            .env("GATEHOUSE_GATE", ctx.gate_id.as_deref().unwrap_or(""))
            .env("GATEHOUSE_ATTEMPT", ctx.attempt.to_string())
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .spawn()
            .map_err(StageError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that never reads stdin closes the pipe early.
            let _ = stdin.write_all(context_json.as_bytes()).await;
        }

        let output = child.wait_with_output().await.map_err(StageError::Spawn)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let code = output.status.code().unwrap_or(-1);
        debug!(stage = %ctx.stage_id, code, "stage exited");

        match StageReport::from_stdout(&stdout) {
            Ok(report) => Ok(report),
            Err(_) if code != 0 => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.trim().is_empty() {
                    debug!(stage = %ctx.stage_id, stderr = %truncate_chars(stderr.trim(), 500), "stage stderr");
                }
                Err(StageError::NonZeroExit { code })
            }
            Err(e) => Err(e),
        }
    }
}
