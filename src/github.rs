//! GitHub REST client: ledger comments, check runs and head lookups.
//!
//! GitHub has no compare-and-swap for issue comments. `updated_at` is used
//! as the revision token and `update_comment` re-reads it right before the
//! PATCH; the window between the read and the write is covered by the
//! store's per-PR lock for writers inside this process only.

use crate::checks::{CheckHost, CheckRun, CheckRunRequest, CheckRunStatus};
use crate::gates::ExternalConclusion;
use crate::ledger::{CommentHost, HostedComment, WriteResult};
use crate::pipeline::HeadResolver;
use crate::pull_request::PullRequestRef;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

const PER_PAGE: usize = 100;
const USER_AGENT: &str = "gatehouse";

#[derive(Debug, Deserialize)]
struct ApiComment {
    id: u64,
    #[serde(default)]
    body: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: String,
}

impl From<ApiComment> for HostedComment {
    fn from(c: ApiComment) -> Self {
        HostedComment {
            id: c.id,
            body: c.body.unwrap_or_default(),
            revision: c.updated_at,
            created_at: c.created_at,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct ApiCheckOutput {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiCheckRun {
    id: u64,
    name: String,
    head_sha: String,
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    output: ApiCheckOutput,
}

impl From<ApiCheckRun> for CheckRun {
    fn from(r: ApiCheckRun) -> Self {
        let status = match r.status.as_str() {
            "completed" => CheckRunStatus::Completed,
            _ => CheckRunStatus::InProgress,
        };
        let conclusion = r.conclusion.as_deref().map(|c| match c {
            "success" => ExternalConclusion::Success,
            "neutral" | "skipped" => ExternalConclusion::Neutral,
            _ => ExternalConclusion::Failure,
        });
        CheckRun {
            id: r.id,
            name: r.name,
            head_sha: r.head_sha.to_ascii_lowercase(),
            status,
            conclusion,
            title: r.output.title.unwrap_or_default(),
            summary: r.output.summary.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CheckRunList {
    check_runs: Vec<ApiCheckRun>,
}

#[derive(Debug, Deserialize)]
struct ApiPull {
    head: ApiPullHead,
}

#[derive(Debug, Deserialize)]
struct ApiPullHead {
    sha: String,
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubClient {
    pub fn new(api_url: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn repo_url(&self, pr: &PullRequestRef, path: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, pr.owner, pr.repo, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    async fn get_comment(&self, pr: &PullRequestRef, comment_id: u64) -> Result<ApiComment> {
        let url = self.repo_url(pr, &format!("issues/comments/{}", comment_id));
        self.request(reqwest::Method::GET, &url)
            .send()
            .await
            .context("Failed to fetch comment")?
            .error_for_status()
            .context("GitHub API returned error fetching comment")?
            .json()
            .await
            .context("Failed to parse comment")
    }
}

fn check_run_body(request: &CheckRunRequest) -> serde_json::Value {
    let mut body = json!({
        "name": request.name,
        "head_sha": request.head_sha,
        "status": request.status.as_str(),
        "output": {
            "title": request.title,
            "summary": request.summary,
        },
    });
    if let Some(conclusion) = request.conclusion {
        body["conclusion"] = json!(conclusion.as_str());
    }
    body
}

#[async_trait]
impl CommentHost for GitHubClient {
    async fn list_comments(&self, pr: &PullRequestRef) -> Result<Vec<HostedComment>> {
        let url = self.repo_url(pr, &format!("issues/{}/comments", pr.number));
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let comments: Vec<ApiComment> = self
                .request(reqwest::Method::GET, &url)
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                .send()
                .await
                .context("Failed to list PR comments")?
                .error_for_status()
                .context("GitHub API returned error listing comments")?
                .json()
                .await
                .context("Failed to parse comments")?;
            let count = comments.len();
            all.extend(comments.into_iter().map(HostedComment::from));
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        debug!(pr = %pr.key(), count = all.len(), "listed comments");
        Ok(all)
    }

    async fn create_comment(&self, pr: &PullRequestRef, body: &str) -> Result<HostedComment> {
        let url = self.repo_url(pr, &format!("issues/{}/comments", pr.number));
        let comment: ApiComment = self
            .request(reqwest::Method::POST, &url)
            .json(&json!({ "body": body }))
            .send()
            .await
            .context("Failed to create comment")?
            .error_for_status()
            .context("GitHub API returned error creating comment")?
            .json()
            .await
            .context("Failed to parse created comment")?;
        Ok(comment.into())
    }

    async fn update_comment(
        &self,
        pr: &PullRequestRef,
        comment_id: u64,
        body: &str,
        expected_revision: &str,
    ) -> Result<WriteResult> {
        let current = self.get_comment(pr, comment_id).await?;
        if current.updated_at != expected_revision {
            return Ok(WriteResult::Stale);
        }
        let url = self.repo_url(pr, &format!("issues/comments/{}", comment_id));
        let comment: ApiComment = self
            .request(reqwest::Method::PATCH, &url)
            .json(&json!({ "body": body }))
            .send()
            .await
            .context("Failed to update comment")?
            .error_for_status()
            .context("GitHub API returned error updating comment")?
            .json()
            .await
            .context("Failed to parse updated comment")?;
        Ok(WriteResult::Written(comment.into()))
    }

    async fn delete_comment(&self, pr: &PullRequestRef, comment_id: u64) -> Result<()> {
        let url = self.repo_url(pr, &format!("issues/comments/{}", comment_id));
        let resp = self
            .request(reqwest::Method::DELETE, &url)
            .send()
            .await
            .context("Failed to delete comment")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        resp.error_for_status()
            .context("GitHub API returned error deleting comment")?;
        Ok(())
    }
}

#[async_trait]
impl CheckHost for GitHubClient {
    async fn list_check_runs(&self, pr: &PullRequestRef, head_sha: &str) -> Result<Vec<CheckRun>> {
        let url = self.repo_url(pr, &format!("commits/{}/check-runs", head_sha));
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let list: CheckRunList = self
                .request(reqwest::Method::GET, &url)
                .query(&[("per_page", PER_PAGE.to_string()), ("page", page.to_string())])
                .send()
                .await
                .context("Failed to list check runs")?
                .error_for_status()
                .context("GitHub API returned error listing check runs")?
                .json()
                .await
                .context("Failed to parse check runs")?;
            let count = list.check_runs.len();
            all.extend(list.check_runs.into_iter().map(CheckRun::from));
            if count < PER_PAGE {
                break;
            }
            page += 1;
        }
        Ok(all)
    }

    async fn create_check_run(&self, pr: &PullRequestRef, request: &CheckRunRequest) -> Result<CheckRun> {
        let url = self.repo_url(pr, "check-runs");
        let run: ApiCheckRun = self
            .request(reqwest::Method::POST, &url)
            .json(&check_run_body(request))
            .send()
            .await
            .context("Failed to create check run")?
            .error_for_status()
            .context("GitHub API returned error creating check run")?
            .json()
            .await
            .context("Failed to parse created check run")?;
        Ok(run.into())
    }

    async fn update_check_run(
        &self,
        pr: &PullRequestRef,
        run_id: u64,
        request: &CheckRunRequest,
    ) -> Result<CheckRun> {
        let url = self.repo_url(pr, &format!("check-runs/{}", run_id));
        let run: ApiCheckRun = self
            .request(reqwest::Method::PATCH, &url)
            .json(&check_run_body(request))
            .send()
            .await
            .context("Failed to update check run")?
            .error_for_status()
            .context("GitHub API returned error updating check run")?
            .json()
            .await
            .context("Failed to parse updated check run")?;
        Ok(run.into())
    }
}

#[async_trait]
impl HeadResolver for GitHubClient {
    async fn head_sha(&self, pr: &PullRequestRef) -> Result<String> {
        let url = self.repo_url(pr, &format!("pulls/{}", pr.number));
        let pull: ApiPull = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .context("Failed to fetch pull request")?
            .error_for_status()
            .context("GitHub API returned error fetching pull request")?
            .json()
            .await
            .context("Failed to parse pull request")?;
        Ok(pull.head.sha.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_run_body_omits_conclusion_while_in_progress() {
        let request = CheckRunRequest {
            name: "gatehouse:gate:tests".into(),
            head_sha: "abc".into(),
            status: CheckRunStatus::InProgress,
            conclusion: None,
            title: "tests: pending".into(),
            summary: "pending: awaiting abc".into(),
        };
        let body = check_run_body(&request);
        assert_eq!(body["status"], "in_progress");
        assert!(body.get("conclusion").is_none());
        assert_eq!(body["output"]["title"], "tests: pending");
    }

    #[test]
    fn test_check_run_body_with_conclusion() {
        let request = CheckRunRequest {
            name: "gatehouse:gate:tests".into(),
            head_sha: "abc".into(),
            status: CheckRunStatus::Completed,
            conclusion: Some(ExternalConclusion::Neutral),
            title: "tests: skipped".into(),
            summary: "Skipped: no tests".into(),
        };
        assert_eq!(check_run_body(&request)["conclusion"], "neutral");
    }

    #[test]
    fn test_api_check_run_conversion() {
        let raw = r#"{
            "id": 7,
            "name": "gatehouse:gate:clippy",
            "head_sha": "ABC123",
            "status": "queued",
            "conclusion": null,
            "output": {"title": null, "summary": null}
        }"#;
        let run: CheckRun = serde_json::from_str::<ApiCheckRun>(raw).unwrap().into();
        assert_eq!(run.status, CheckRunStatus::InProgress);
        assert_eq!(run.head_sha, "abc123");
        assert_eq!(run.title, "");

        let raw = r#"{
            "id": 8,
            "name": "gatehouse:gate:clippy",
            "head_sha": "abc123",
            "status": "completed",
            "conclusion": "timed_out"
        }"#;
        let run: CheckRun = serde_json::from_str::<ApiCheckRun>(raw).unwrap().into();
        assert_eq!(run.conclusion, Some(ExternalConclusion::Failure));
    }

    #[test]
    fn test_api_comment_conversion() {
        let raw = r#"{
            "id": 42,
            "body": "hello",
            "created_at": "2026-01-02T03:04:05Z",
            "updated_at": "2026-01-02T03:05:00Z"
        }"#;
        let comment: HostedComment = serde_json::from_str::<ApiComment>(raw).unwrap().into();
        assert_eq!(comment.id, 42);
        assert_eq!(comment.revision, "2026-01-02T03:05:00Z");
    }
}
