//! Retry budgets per (pull request, stage).
//!
//! A stage's ceiling counts re-entries after its first evaluation, so a
//! ceiling of 0 means the stage runs exactly once per head commit. Records
//! are keyed by head sha as well, so a late consume from a superseded run
//! never touches the budget of the current head.

use crate::pull_request::PullRequestRef;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;

/// Budget usage of one stage for one pull request head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryRecord {
    pub pr_key: String,
    pub stage_id: String,
    pub head_sha: String,
    pub attempts_used: u32,
    pub attempts_allowed: u32,
}

/// Result of asking for one more attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consume {
    Allowed { used: u32, allowed: u32 },
    BudgetExhausted { used: u32, allowed: u32 },
}

impl Consume {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Consume::Allowed { .. })
    }
}

#[derive(Debug, Default)]
pub struct RetryBudget {
    default_ceiling: u32,
    ceilings: HashMap<String, u32>,
    /// Keyed by (pr key, stage id, head sha).
    records: DashMap<(String, String, String), RetryRecord>,
}

impl RetryBudget {
    pub fn new(default_ceiling: u32) -> Self {
        Self {
            default_ceiling,
            ..Default::default()
        }
    }

    pub fn with_ceiling(mut self, stage_id: &str, ceiling: u32) -> Self {
        self.ceilings.insert(stage_id.to_string(), ceiling);
        self
    }

    pub fn ceiling(&self, stage_id: &str) -> u32 {
        self.ceilings
            .get(stage_id)
            .copied()
            .unwrap_or(self.default_ceiling)
    }

    /// Take one retry unit for `stage_id` if any is left.
    pub fn try_consume(&self, pr: &PullRequestRef, stage_id: &str) -> Consume {
        let allowed = self.ceiling(stage_id);
        let mut record = self
            .records
            .entry(key(pr, stage_id))
            .or_insert_with(|| self.fresh(pr, stage_id, allowed));
        if record.attempts_used < record.attempts_allowed {
            record.attempts_used += 1;
            Consume::Allowed {
                used: record.attempts_used,
                allowed: record.attempts_allowed,
            }
        } else {
            Consume::BudgetExhausted {
                used: record.attempts_used,
                allowed: record.attempts_allowed,
            }
        }
    }

    /// Current record for `pr` at its head; fresh when none was opened.
    pub fn record(&self, pr: &PullRequestRef, stage_id: &str) -> RetryRecord {
        match self.records.get(&key(pr, stage_id)) {
            Some(record) => record.clone(),
            None => self.fresh(pr, stage_id, self.ceiling(stage_id)),
        }
    }

    /// Drop every record of the pull request, for every head.
    pub fn reset(&self, pr: &PullRequestRef) {
        let pr_key = pr.key();
        self.records.retain(|(k, _, _), _| *k != pr_key);
    }

    fn fresh(&self, pr: &PullRequestRef, stage_id: &str, allowed: u32) -> RetryRecord {
        RetryRecord {
            pr_key: pr.key(),
            stage_id: stage_id.to_string(),
            head_sha: pr.head_sha.clone(),
            attempts_used: 0,
            attempts_allowed: allowed,
        }
    }
}

fn key(pr: &PullRequestRef, stage_id: &str) -> (String, String, String) {
    (pr.key(), stage_id.to_string(), pr.head_sha.clone())
}
