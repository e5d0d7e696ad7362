//! One pipeline task per pull request.
//!
//! The supervisor keeps at most one run in flight per PR key. A trigger for
//! a new head cancels the running one, whose result is then discarded; a
//! trigger for the head already in flight is coalesced.

use super::controller::PipelineController;
use super::state::RunSummary;
use crate::errors::PipelineError;
use crate::pull_request::PullRequestRef;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub type RunHandle = JoinHandle<Result<RunSummary, PipelineError>>;

/// Result of a trigger.
pub enum Trigger {
    /// No run was in flight for this PR.
    Started(RunHandle),
    /// A run for an older head was cancelled in favour of this one.
    Restarted { previous_head: String, handle: RunHandle },
    /// A run for the same head is already in flight.
    Coalesced,
}

impl Trigger {
    pub fn into_handle(self) -> Option<RunHandle> {
        match self {
            Trigger::Started(handle) | Trigger::Restarted { handle, .. } => Some(handle),
            Trigger::Coalesced => None,
        }
    }
}

/// Looks up the current head commit of a pull request.
#[async_trait]
pub trait HeadResolver: Send + Sync {
    async fn head_sha(&self, pr: &PullRequestRef) -> Result<String>;
}

struct InFlight {
    run_token: Uuid,
    head_sha: String,
    cancel: CancellationToken,
}

pub struct Supervisor {
    controller: Arc<PipelineController>,
    in_flight: Arc<DashMap<String, InFlight>>,
}

impl Supervisor {
    pub fn new(controller: Arc<PipelineController>) -> Self {
        Self {
            controller,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Head of the run currently in flight for `pr`, if any.
    pub fn in_flight_head(&self, pr: &PullRequestRef) -> Option<String> {
        self.in_flight.get(&pr.key()).map(|f| f.head_sha.clone())
    }

    /// Start (or restart) the pipeline for `pr`.
    pub fn trigger(&self, pr: PullRequestRef) -> Trigger {
        let key = pr.key();
        let run_token = Uuid::new_v4();
        let cancel = CancellationToken::new();

        let in_flight = || InFlight {
            run_token,
            head_sha: pr.head_sha.clone(),
            cancel: cancel.clone(),
        };
        let previous_head = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().head_sha == pr.head_sha {
                    return Trigger::Coalesced;
                }
                existing.get().cancel.cancel();
                let previous = existing.get().head_sha.clone();
                existing.insert(in_flight());
                Some(previous)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(in_flight());
                None
            }
        };

        if let Some(previous) = &previous_head {
            info!(pr = %key, from = %previous, to = %pr.short_sha(), "head changed, restarting pipeline");
            self.controller.retry().reset(&pr);
        }

        let controller = self.controller.clone();
        let in_flight = self.in_flight.clone();
        let handle = tokio::spawn(async move {
            let result = controller.run(&pr, cancel).await;
            in_flight.remove_if(&pr.key(), |_, f| f.run_token == run_token);
            match &result {
                Ok(summary) => info!(pr = %pr, final_state = %summary.final_state, "run complete"),
                Err(e) if e.is_superseded() => info!(pr = %pr, "run discarded"),
                Err(e) => warn!(pr = %pr, error = %e, "run failed"),
            }
            result
        });

        match previous_head {
            Some(previous_head) => Trigger::Restarted {
                previous_head,
                handle,
            },
            None => Trigger::Started(handle),
        }
    }

    /// Run several pull requests concurrently and collect their results.
    /// Coalesced triggers produce no result.
    pub async fn run_all(
        &self,
        prs: Vec<PullRequestRef>,
    ) -> Vec<(PullRequestRef, Result<RunSummary, PipelineError>)> {
        let mut started = Vec::new();
        for pr in prs {
            if let Some(handle) = self.trigger(pr.clone()).into_handle() {
                started.push((pr, handle));
            }
        }
        let (prs, handles): (Vec<_>, Vec<_>) = started.into_iter().unzip();
        let results = join_all(handles).await;
        prs.into_iter()
            .zip(results)
            .map(|(pr, joined)| {
                let result = joined
                    .unwrap_or_else(|e| Err(PipelineError::Other(anyhow!("pipeline task failed: {}", e))));
                (pr, result)
            })
            .collect()
    }

    /// Poll head commits every `interval` and re-trigger on change until
    /// `shutdown` fires.
    pub async fn watch(
        &self,
        prs: Vec<PullRequestRef>,
        interval: Duration,
        resolver: Arc<dyn HeadResolver>,
        shutdown: CancellationToken,
    ) {
        let mut last_seen: Vec<Option<String>> = vec![None; prs.len()];
        loop {
            for (pr, seen) in prs.iter().zip(last_seen.iter_mut()) {
                let head = match resolver.head_sha(pr).await {
                    Ok(head) => head.to_ascii_lowercase(),
                    Err(e) => {
                        warn!(pr = %pr.key(), error = %e, "failed to resolve head");
                        continue;
                    }
                };
                if seen.as_deref() == Some(head.as_str()) {
                    continue;
                }
                *seen = Some(head.clone());
                // Coalesced when this head is already running.
                let _ = self.trigger(pr.at_head(&head));
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        for entry in self.in_flight.iter() {
            entry.cancel.cancel();
        }
        info!("watch stopped");
    }
}
