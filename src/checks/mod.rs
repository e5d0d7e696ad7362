//! Check-run emission.
//!
//! Each gate is mirrored as one check run named `<namespace>:gate:<gate_id>`
//! on the PR's head commit. Emission is idempotent per `(head_sha, gate_id)`:
//! re-emitting the same outcome is a no-op, a changed outcome updates the
//! existing run, and a restart re-discovers runs from the host instead of
//! creating new ones.

use crate::evidence::unescape;
use crate::gates::{ExternalConclusion, GateOutcome, GateStatus};
use crate::pull_request::PullRequestRef;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Lifecycle status of a check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunStatus {
    InProgress,
    Completed,
}

impl CheckRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckRunStatus::InProgress => "in_progress",
            CheckRunStatus::Completed => "completed",
        }
    }
}

/// What the emitter asks the host to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRunRequest {
    pub name: String,
    pub head_sha: String,
    pub status: CheckRunStatus,
    pub conclusion: Option<ExternalConclusion>,
    pub title: String,
    pub summary: String,
}

/// A check run as stored by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRun {
    pub id: u64,
    pub name: String,
    pub head_sha: String,
    pub status: CheckRunStatus,
    pub conclusion: Option<ExternalConclusion>,
    pub title: String,
    pub summary: String,
}

impl CheckRun {
    fn matches(&self, request: &CheckRunRequest) -> bool {
        self.status == request.status
            && self.conclusion == request.conclusion
            && self.title == request.title
            && self.summary == request.summary
    }
}

/// Result of one emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Where check runs live.
#[async_trait]
pub trait CheckHost: Send + Sync {
    async fn list_check_runs(&self, pr: &PullRequestRef, head_sha: &str) -> Result<Vec<CheckRun>>;

    async fn create_check_run(&self, pr: &PullRequestRef, request: &CheckRunRequest) -> Result<CheckRun>;

    async fn update_check_run(
        &self,
        pr: &PullRequestRef,
        run_id: u64,
        request: &CheckRunRequest,
    ) -> Result<CheckRun>;
}

/// Publishes gate outcomes as namespaced check runs.
pub struct CheckRunEmitter {
    host: Arc<dyn CheckHost>,
    namespace: String,
    /// Last published state keyed by (pr key, head sha, gate id). Only the
    /// most recently emitted head of each PR is kept.
    published: DashMap<(String, String, String), CheckRun>,
}

impl CheckRunEmitter {
    pub fn new(host: Arc<dyn CheckHost>, namespace: &str) -> Self {
        Self {
            host,
            namespace: namespace.to_string(),
            published: DashMap::new(),
        }
    }

    pub fn check_name(&self, gate_id: &str) -> String {
        format!("{}:gate:{}", self.namespace, gate_id)
    }

    /// Build the request for an outcome without sending it.
    pub fn request_for(&self, pr: &PullRequestRef, gate_id: &str, outcome: &GateOutcome) -> CheckRunRequest {
        let (status, conclusion) = match outcome.status.conclusion() {
            Some(conclusion) => (CheckRunStatus::Completed, Some(conclusion)),
            None => (CheckRunStatus::InProgress, None),
        };
        let summary = match outcome.status {
            GateStatus::Skipped => format!(
                "Skipped: {}",
                outcome.skip_reason().unwrap_or("no reason given")
            ),
            _ => unescape(&outcome.evidence),
        };
        CheckRunRequest {
            name: self.check_name(gate_id),
            head_sha: pr.head_sha.clone(),
            status,
            conclusion,
            title: format!("{}: {}", gate_id, outcome.status),
            summary,
        }
    }

    /// Publish `outcome` for `gate_id` on the PR's head commit.
    #[instrument(skip(self, pr, outcome), fields(pr = %pr.key(), head = %pr.short_sha()))]
    pub async fn emit(
        &self,
        pr: &PullRequestRef,
        gate_id: &str,
        outcome: &GateOutcome,
    ) -> Result<EmitOutcome> {
        let request = self.request_for(pr, gate_id, outcome);
        let key = (pr.key(), pr.head_sha.clone(), gate_id.to_string());

        let existing = match self.published.get(&key).map(|r| r.clone()) {
            Some(run) => Some(run),
            None => self
                .host
                .list_check_runs(pr, &pr.head_sha)
                .await?
                .into_iter()
                .find(|run| run.name == request.name),
        };

        let (run, result) = match existing {
            Some(run) if run.matches(&request) => (run, EmitOutcome::Unchanged),
            Some(run) => (
                self.host.update_check_run(pr, run.id, &request).await?,
                EmitOutcome::Updated,
            ),
            None => (
                self.host.create_check_run(pr, &request).await?,
                EmitOutcome::Created,
            ),
        };
        debug!(check = %request.name, ?result, "check run emitted");
        let (pr_key, head_sha, _) = &key;
        self.published
            .retain(|(k, head, _), _| k != pr_key || head == head_sha);
        self.published.insert(key, run);
        Ok(result)
    }
}
