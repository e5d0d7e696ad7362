//! Serialized, compare-and-retry writes to the ledger comment.

use super::document::{DecisionBlock, HopEntry, LedgerDocument};
use super::host::{CommentHost, HostedComment, WriteResult};
use crate::errors::LedgerError;
use crate::gates::{GateOutcome, GateRegistry};
use crate::pull_request::PullRequestRef;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Default number of retries after a stale write.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;

/// Largest comment body GitHub accepts, in characters.
pub const MAX_COMMENT_CHARS: usize = 65_536;

/// Owner of the single ledger comment of each pull request.
///
/// Writers for the same PR queue on a per-PR mutex; writers in other
/// processes are caught by the revision check and retried.
pub struct LedgerStore {
    host: Arc<dyn CommentHost>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    conflict_retries: u32,
    max_body_chars: usize,
}

impl LedgerStore {
    pub fn new(host: Arc<dyn CommentHost>) -> Self {
        Self {
            host,
            locks: DashMap::new(),
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            max_body_chars: MAX_COMMENT_CHARS,
        }
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn with_max_body_chars(mut self, max: usize) -> Self {
        self.max_body_chars = max;
        self
    }

    /// Upsert one gate outcome. Outcomes of other gates are untouched.
    ///
    /// The write is dropped when the ledger already belongs to another head;
    /// callers compare the returned document's `head_sha` to find out.
    pub async fn update(
        &self,
        pr: &PullRequestRef,
        gate_id: &str,
        outcome: GateOutcome,
    ) -> Result<LedgerDocument, LedgerError> {
        let mut outcome = outcome;
        outcome.gate_id = gate_id.to_string();
        self.mutate(pr, move |doc| {
            if owns(doc, pr) {
                doc.head_sha = pr.head_sha.clone();
                doc.upsert(outcome.clone());
            }
        })
        .await
    }

    pub async fn append_hop(
        &self,
        pr: &PullRequestRef,
        entry: HopEntry,
    ) -> Result<LedgerDocument, LedgerError> {
        self.mutate(pr, move |doc| doc.append_hop(entry.clone())).await
    }

    pub async fn set_decision(
        &self,
        pr: &PullRequestRef,
        decision: DecisionBlock,
    ) -> Result<LedgerDocument, LedgerError> {
        self.mutate(pr, move |doc| {
            if owns(doc, pr) {
                doc.decision = Some(decision.clone());
            }
        })
        .await
    }

    /// Start a new evaluation epoch at `pr.head_sha`: every registered gate
    /// goes back to pending. The hop log is kept.
    pub async fn begin_epoch(
        &self,
        pr: &PullRequestRef,
        registry: &GateRegistry,
    ) -> Result<LedgerDocument, LedgerError> {
        let short = pr.short_sha().to_string();
        self.mutate(pr, move |doc| {
            doc.head_sha = pr.head_sha.clone();
            doc.gates.clear();
            for gate in registry.iter() {
                doc.upsert(GateOutcome::pending(&gate.id, &short));
            }
            doc.decision = Some(DecisionBlock::new(
                "evaluating",
                &format!("evaluation started for {}", short),
                None,
            ));
        })
        .await
    }

    /// Current ledger, or an empty document at the PR's head when no ledger
    /// comment exists yet. Duplicates are merged in memory only.
    #[instrument(skip(self, pr), fields(pr = %pr.key()))]
    pub async fn read(&self, pr: &PullRequestRef) -> Result<LedgerDocument, LedgerError> {
        let comments = self.list_ledgers(pr).await?;
        let mut iter = comments.into_iter();
        let Some(primary) = iter.next() else {
            return Ok(LedgerDocument::new(&pr.head_sha));
        };
        let mut doc = self.parse(pr, &primary)?;
        for duplicate in iter {
            doc.absorb(self.parse(pr, &duplicate)?);
        }
        Ok(doc)
    }

    /// Apply `mutation` to the ledger with compare-and-retry.
    ///
    /// The mutation may run more than once, always against a fresh read.
    #[instrument(skip(self, pr, mutation), fields(pr = %pr.key()))]
    pub async fn mutate<F>(
        &self,
        pr: &PullRequestRef,
        mutation: F,
    ) -> Result<LedgerDocument, LedgerError>
    where
        F: Fn(&mut LedgerDocument) + Send + Sync,
    {
        let lock = self.lock_for(pr);
        let _guard = lock.lock().await;

        let attempts = self.conflict_retries + 1;
        // Set once the mutation has been persisted; further passes only fold
        // duplicate comments.
        let mut applied = false;

        for attempt in 1..=attempts {
            let ledgers = self.list_ledgers(pr).await?;
            let mut iter = ledgers.into_iter();

            let Some(primary) = iter.next() else {
                let mut doc = LedgerDocument::new(&pr.head_sha);
                mutation(&mut doc);
                let body = self.fit(pr, &mut doc, LedgerDocument::render)?;
                self.host
                    .create_comment(pr, &body)
                    .await
                    .map_err(LedgerError::Host)?;
                debug!(attempt, "created ledger comment");

                // A concurrent creator may have raced us.
                if self.list_ledgers(pr).await?.len() <= 1 {
                    return Ok(doc);
                }
                warn!("duplicate ledger comment detected, folding");
                applied = true;
                continue;
            };
            let duplicates: Vec<HostedComment> = iter.collect();

            let mut doc = self.parse(pr, &primary)?;
            for duplicate in &duplicates {
                doc.absorb(self.parse(pr, duplicate)?);
            }
            if !applied {
                mutation(&mut doc);
            }

            let body = self.fit(pr, &mut doc, |d| d.splice_into(&primary.body))?;
            match self
                .host
                .update_comment(pr, primary.id, &body, &primary.revision)
                .await
                .map_err(LedgerError::Host)?
            {
                WriteResult::Written(_) => {
                    for duplicate in duplicates {
                        self.host
                            .delete_comment(pr, duplicate.id)
                            .await
                            .map_err(LedgerError::Host)?;
                        debug!(comment_id = duplicate.id, "deleted folded duplicate ledger");
                    }
                    return Ok(doc);
                }
                WriteResult::Stale => {
                    warn!(attempt, attempts, "ledger changed underneath us, retrying");
                }
            }
        }

        Err(LedgerError::ConcurrentEditConflict {
            pr: pr.key(),
            attempts,
        })
    }

    /// Render `doc`, eliding the oldest hops until the body fits the host's
    /// size limit.
    fn fit<R>(&self, pr: &PullRequestRef, doc: &mut LedgerDocument, render: R) -> Result<String, LedgerError>
    where
        R: Fn(&LedgerDocument) -> String,
    {
        let mut body = render(doc);
        loop {
            let len = body.chars().count();
            if len <= self.max_body_chars {
                return Ok(body);
            }
            if doc.hops.is_empty() {
                return Err(LedgerError::TooLarge {
                    pr: pr.key(),
                    len,
                    max: self.max_body_chars,
                });
            }
            let keep = doc.hops.len() / 2;
            warn!(len, max = self.max_body_chars, keep, "ledger comment too large, eliding hops");
            doc.elide_oldest_hops(keep);
            body = render(doc);
        }
    }

    fn lock_for(&self, pr: &PullRequestRef) -> Arc<Mutex<()>> {
        self.locks
            .entry(pr.key())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ledger comments, oldest first.
    async fn list_ledgers(&self, pr: &PullRequestRef) -> Result<Vec<HostedComment>, LedgerError> {
        let mut ledgers: Vec<HostedComment> = self
            .host
            .list_comments(pr)
            .await
            .map_err(LedgerError::Host)?
            .into_iter()
            .filter(|c| LedgerDocument::is_ledger(&c.body))
            .collect();
        ledgers.sort_by_key(|c| (c.created_at, c.id));
        Ok(ledgers)
    }

    fn parse(&self, pr: &PullRequestRef, comment: &HostedComment) -> Result<LedgerDocument, LedgerError> {
        LedgerDocument::parse(&comment.body).map_err(|message| LedgerError::Malformed {
            pr: pr.key(),
            message,
        })
    }
}

/// Whether writes made on behalf of `pr` may touch the gate outcomes.
fn owns(doc: &LedgerDocument, pr: &PullRequestRef) -> bool {
    doc.head_sha.is_empty() || doc.head_sha == pr.head_sha
}
