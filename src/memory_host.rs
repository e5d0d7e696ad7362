//! In-process comment and check-run host.
//!
//! Backs `run --dry-run` and the test suites. Revisions are a per-comment
//! write counter, so conditional updates behave like the real host.

use crate::checks::{CheckHost, CheckRun, CheckRunRequest};
use crate::ledger::{CommentHost, HostedComment, WriteResult};
use crate::pull_request::PullRequestRef;
use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Default)]
struct State {
    comments: HashMap<String, Vec<HostedComment>>,
    check_runs: HashMap<String, Vec<CheckRun>>,
}

#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<State>,
    next_id: AtomicU64,
    pending_conflicts: AtomicU32,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` conditional updates fail as if another writer got
    /// there first.
    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    /// Snapshot of the comments on a PR, in creation order.
    pub fn comments(&self, pr: &PullRequestRef) -> Vec<HostedComment> {
        self.lock().comments.get(&pr.key()).cloned().unwrap_or_default()
    }

    /// Snapshot of the check runs on the PR's head commit.
    pub fn check_runs(&self, pr: &PullRequestRef) -> Vec<CheckRun> {
        self.lock()
            .check_runs
            .get(&pr.key())
            .map(|runs| {
                runs.iter()
                    .filter(|r| r.head_sha == pr.head_sha)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A poisoned lock only means a test panicked mid-write.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn bump(revision: &str) -> String {
    (revision.parse::<u64>().unwrap_or(0) + 1).to_string()
}

#[async_trait]
impl CommentHost for MemoryHost {
    async fn list_comments(&self, pr: &PullRequestRef) -> Result<Vec<HostedComment>> {
        Ok(self.comments(pr))
    }

    async fn create_comment(&self, pr: &PullRequestRef, body: &str) -> Result<HostedComment> {
        let comment = HostedComment {
            id: self.next_id(),
            body: body.to_string(),
            revision: "1".to_string(),
            created_at: Utc::now(),
        };
        self.lock()
            .comments
            .entry(pr.key())
            .or_default()
            .push(comment.clone());
        Ok(comment)
    }

    async fn update_comment(
        &self,
        pr: &PullRequestRef,
        comment_id: u64,
        body: &str,
        expected_revision: &str,
    ) -> Result<WriteResult> {
        let conflict = self.take_conflict();
        let mut state = self.lock();
        let Some(comment) = state
            .comments
            .get_mut(&pr.key())
            .and_then(|c| c.iter_mut().find(|c| c.id == comment_id))
        else {
            bail!("comment {} not found on {}", comment_id, pr.key());
        };
        if conflict {
            // Someone else wrote in between.
            comment.revision = bump(&comment.revision);
            return Ok(WriteResult::Stale);
        }
        if comment.revision != expected_revision {
            return Ok(WriteResult::Stale);
        }
        comment.body = body.to_string();
        comment.revision = bump(&comment.revision);
        Ok(WriteResult::Written(comment.clone()))
    }

    async fn delete_comment(&self, pr: &PullRequestRef, comment_id: u64) -> Result<()> {
        let mut state = self.lock();
        if let Some(comments) = state.comments.get_mut(&pr.key()) {
            comments.retain(|c| c.id != comment_id);
        }
        Ok(())
    }
}

#[async_trait]
impl CheckHost for MemoryHost {
    async fn list_check_runs(&self, pr: &PullRequestRef, head_sha: &str) -> Result<Vec<CheckRun>> {
        Ok(self.check_runs(&pr.at_head(head_sha)))
    }

    async fn create_check_run(&self, pr: &PullRequestRef, request: &CheckRunRequest) -> Result<CheckRun> {
        let run = CheckRun {
            id: self.next_id(),
            name: request.name.clone(),
            head_sha: request.head_sha.clone(),
            status: request.status,
            conclusion: request.conclusion,
            title: request.title.clone(),
            summary: request.summary.clone(),
        };
        self.lock()
            .check_runs
            .entry(pr.key())
            .or_default()
            .push(run.clone());
        Ok(run)
    }

    async fn update_check_run(
        &self,
        pr: &PullRequestRef,
        run_id: u64,
        request: &CheckRunRequest,
    ) -> Result<CheckRun> {
        let mut state = self.lock();
        let Some(run) = state
            .check_runs
            .get_mut(&pr.key())
            .and_then(|runs| runs.iter_mut().find(|r| r.id == run_id))
        else {
            bail!("check run {} not found on {}", run_id, pr.key());
        };
        run.status = request.status;
        run.conclusion = request.conclusion;
        run.title = request.title.clone();
        run.summary = request.summary.clone();
        Ok(run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_with_stale_revision_is_rejected() {
        let host = MemoryHost::new();
        let pr = PullRequestRef::new("o", "r", 1, "abc1234");
        let c = host.create_comment(&pr, "v1").await.unwrap();

        let first = host.update_comment(&pr, c.id, "v2", &c.revision).await.unwrap();
        assert!(matches!(first, WriteResult::Written(_)));
        let second = host.update_comment(&pr, c.id, "v3", &c.revision).await.unwrap();
        assert_eq!(second, WriteResult::Stale);
        assert_eq!(host.comments(&pr)[0].body, "v2");
    }

    #[tokio::test]
    async fn test_injected_conflicts_are_consumed() {
        let host = MemoryHost::new();
        let pr = PullRequestRef::new("o", "r", 1, "abc1234");
        let c = host.create_comment(&pr, "v1").await.unwrap();
        host.inject_conflicts(1);

        let stale = host.update_comment(&pr, c.id, "v2", &c.revision).await.unwrap();
        assert_eq!(stale, WriteResult::Stale);
        let fresh = host.comments(&pr)[0].revision.clone();
        let ok = host.update_comment(&pr, c.id, "v2", &fresh).await.unwrap();
        assert!(matches!(ok, WriteResult::Written(_)));
    }

    #[tokio::test]
    async fn test_update_missing_comment_errors() {
        let host = MemoryHost::new();
        let pr = PullRequestRef::new("o", "r", 1, "abc1234");
        assert!(host.update_comment(&pr, 99, "x", "1").await.is_err());
    }
}
