//! Comment hosting seam for the ledger store.

use crate::pull_request::PullRequestRef;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A comment as stored by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedComment {
    pub id: u64,
    pub body: String,
    /// Opaque token that changes on every write to the comment.
    pub revision: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Written(HostedComment),
    /// The stored revision no longer matches the expected one.
    Stale,
}

/// Where ledger comments live.
///
/// Implementations must make `update_comment` conditional on
/// `expected_revision`: when the stored comment has moved on, return
/// [`WriteResult::Stale`] instead of overwriting it.
#[async_trait]
pub trait CommentHost: Send + Sync {
    async fn list_comments(&self, pr: &PullRequestRef) -> Result<Vec<HostedComment>>;

    async fn create_comment(&self, pr: &PullRequestRef, body: &str) -> Result<HostedComment>;

    async fn update_comment(
        &self,
        pr: &PullRequestRef,
        comment_id: u64,
        body: &str,
        expected_revision: &str,
    ) -> Result<WriteResult>;

    async fn delete_comment(&self, pr: &PullRequestRef, comment_id: u64) -> Result<()>;
}
