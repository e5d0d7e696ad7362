//! Pull request identity.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A pull request at a specific head commit.
///
/// The head sha defines the evaluation epoch: gate outcomes and retry
/// budgets recorded under one head never count for another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub head_sha: String,
}

impl PullRequestRef {
    pub fn new(
        owner: impl Into<String>,
        repo: impl Into<String>,
        number: u64,
        head_sha: impl Into<String>,
    ) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            number,
            head_sha: head_sha.into().to_ascii_lowercase(),
        }
    }

    /// Build from an `owner/repo` slug.
    pub fn from_slug(slug: &str, number: u64, head_sha: &str) -> Result<Self> {
        let (owner, repo) = split_slug(slug)
            .with_context(|| format!("Invalid repository '{}': expected owner/repo", slug))?;
        Ok(Self::new(owner, repo, number, head_sha))
    }

    /// Head-independent identity, `owner/repo#number`.
    pub fn key(&self) -> String {
        format!("{}/{}#{}", self.owner, self.repo, self.number)
    }

    pub fn slug(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }

    /// First seven characters of the head sha.
    pub fn short_sha(&self) -> &str {
        let end = self.head_sha.len().min(7);
        &self.head_sha[..end]
    }

    /// Same pull request at a new head commit.
    pub fn at_head(&self, head_sha: &str) -> Self {
        Self::new(&self.owner, &self.repo, self.number, head_sha)
    }

    /// Filesystem-safe directory name, `owner-repo-number`.
    pub fn dir_name(&self) -> String {
        format!("{}-{}-{}", self.owner, self.repo, self.number)
    }
}

impl fmt::Display for PullRequestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key(), self.short_sha())
    }
}

/// Split `owner/repo` into its two non-empty segments.
pub fn split_slug(slug: &str) -> Option<(&str, &str)> {
    let slug = slug.strip_suffix(".git").unwrap_or(slug);
    let (owner, repo) = slug.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner, repo))
}
