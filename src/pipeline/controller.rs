//! The per-PR state machine.

use super::stage::{StageContext, StageReport, StageRunner};
use super::state::{PipelineState, RunSummary};
use crate::checks::CheckRunEmitter;
use crate::errors::{PipelineError, RoutingError, StageError};
use crate::evidence::EvidenceCodec;
use crate::gates::{GateOutcome, GateRegistry, GateStatus};
use crate::ledger::{DecisionBlock, HopEntry, LedgerStore};
use crate::pull_request::PullRequestRef;
use crate::receipt::{GateReceipt, ReceiptWriter};
use crate::retry::{Consume, RetryBudget};
use crate::router::{OutcomeClass, RouteTarget, RoutingTable};
use anyhow::anyhow;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A runner bound to a stage, with the gate it records and its time limit.
#[derive(Clone)]
pub struct StageBinding {
    pub runner: Arc<dyn StageRunner>,
    pub gate_id: Option<String>,
    pub timeout: Duration,
}

impl StageBinding {
    pub fn new(runner: Arc<dyn StageRunner>, gate_id: Option<&str>, timeout: Duration) -> Self {
        Self {
            runner,
            gate_id: gate_id.map(str::to_string),
            timeout,
        }
    }
}

/// A stage result after evidence validation.
#[derive(Debug, Clone)]
struct Recorded {
    status: GateStatus,
    evidence: String,
    outcome: OutcomeClass,
}

/// What follows the attempt that was just recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Next {
    Stage { id: String, retrying: bool },
    Terminal,
    Blocked(String),
}

/// Drives one pull request head through the configured stages.
pub struct PipelineController {
    registry: Arc<GateRegistry>,
    codec: EvidenceCodec,
    router: Arc<RoutingTable>,
    ledger: Arc<LedgerStore>,
    checks: Arc<CheckRunEmitter>,
    retry: Arc<RetryBudget>,
    stages: HashMap<String, StageBinding>,
    receipts: Option<ReceiptWriter>,
}

impl PipelineController {
    pub fn new(
        registry: Arc<GateRegistry>,
        codec: EvidenceCodec,
        router: Arc<RoutingTable>,
        ledger: Arc<LedgerStore>,
        checks: Arc<CheckRunEmitter>,
        retry: Arc<RetryBudget>,
    ) -> Self {
        Self {
            registry,
            codec,
            router,
            ledger,
            checks,
            retry,
            stages: HashMap::new(),
            receipts: None,
        }
    }

    pub fn bind(mut self, stage_id: &str, binding: StageBinding) -> Self {
        self.stages.insert(stage_id.to_string(), binding);
        self
    }

    pub fn with_receipts(mut self, writer: ReceiptWriter) -> Self {
        self.receipts = Some(writer);
        self
    }

    pub fn registry(&self) -> &GateRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    pub fn retry(&self) -> &RetryBudget {
        &self.retry
    }

    /// Run the pipeline for `pr` from the entry stage to a terminal state.
    ///
    /// Returns [`PipelineError::Superseded`] when `cancel` fires; nothing from
    /// the interrupted attempt is recorded in that case.
    #[instrument(skip(self, pr, cancel), fields(pr = %pr.key(), head = %pr.short_sha()))]
    pub async fn run(
        &self,
        pr: &PullRequestRef,
        cancel: CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        self.ensure_bound()?;
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(run_id = %run_id, "pipeline run started");

        self.retry.reset(pr);
        self.ledger.begin_epoch(pr, &self.registry).await?;
        for gate in self.registry.iter() {
            self.checks
                .emit(pr, &gate.id, &GateOutcome::pending(&gate.id, pr.short_sha()))
                .await
                .map_err(PipelineError::Checks)?;
        }

        let mut state = PipelineState::Idle;
        let mut stage = self.router.entry().to_string();
        let mut visited: HashSet<String> = HashSet::new();
        let mut attempts: BTreeMap<String, u32> = BTreeMap::new();
        let mut hops = Vec::new();

        while !state.is_terminal() {
            self.check_cancelled(pr, &cancel)?;
            let binding = self.binding(&stage)?;
            let attempt = {
                let n = attempts.entry(stage.clone()).or_insert(0);
                *n += 1;
                *n
            };
            visited.insert(stage.clone());

            state = PipelineState::Evaluating {
                stage: stage.clone(),
            };
            info!(%state, attempt, "evaluating stage");
            let ctx = StageContext {
                pr: pr.clone(),
                stage_id: stage.clone(),
                gate_id: binding.gate_id.clone(),
                attempt,
            };
            let result = evaluate(&binding, &ctx, &cancel).await;
            if matches!(result, Err(StageError::Cancelled)) {
                return Err(self.superseded(pr));
            }
            self.check_cancelled(pr, &cancel)?;

            state = PipelineState::Recording {
                stage: stage.clone(),
            };
            let recorded = self.record_result(&stage, binding.gate_id.as_deref(), result);
            debug!(%state, status = %recorded.status, evidence = %recorded.evidence);
            if let Some(gate_id) = &binding.gate_id {
                let outcome = GateOutcome::new(gate_id, recorded.status, &recorded.evidence, attempt);
                let doc = self.ledger.update(pr, gate_id, outcome.clone()).await?;
                if doc.head_sha != pr.head_sha {
                    return Err(self.superseded(pr));
                }
                self.checks
                    .emit(pr, gate_id, &outcome)
                    .await
                    .map_err(PipelineError::Checks)?;
            }

            let decided = self.decide(pr, &stage, &recorded, &visited);
            let note = match &decided {
                Ok((_, note)) => note.clone(),
                Err(e) => format!("routing failed: {}", e),
            };
            let hop = HopEntry::new(
                &stage,
                &format!(
                    "attempt {}: {} ({}); {}",
                    attempt, recorded.status, recorded.evidence, note
                ),
            );
            self.ledger.append_hop(pr, hop.clone()).await?;
            hops.push(hop);

            let next = match decided {
                Ok((next, _)) => next,
                Err(e) => {
                    warn!(error = %e, "routing table defect");
                    let decision = DecisionBlock::new(
                        "blocked",
                        &format!("configuration defect: {}", e),
                        None,
                    );
                    if let Err(write_err) = self.ledger.set_decision(pr, decision).await {
                        warn!(error = %write_err, "failed to record decision");
                    }
                    return Err(e.into());
                }
            };

            state = match next {
                Next::Stage { id, retrying } => {
                    let next_state = if retrying {
                        PipelineState::Retrying { stage: id.clone() }
                    } else {
                        PipelineState::Routing {
                            stage: stage.clone(),
                        }
                    };
                    let reasoning = format!(
                        "{} attempt {} was {}; {}",
                        stage, attempt, recorded.status, note
                    );
                    self.ledger
                        .set_decision(
                            pr,
                            DecisionBlock::new(next_state.label(), &reasoning, Some(&id)),
                        )
                        .await?;
                    stage = id;
                    next_state
                }
                Next::Terminal => self.conclude(pr).await?,
                Next::Blocked(reason) => {
                    self.ledger
                        .set_decision(pr, DecisionBlock::new("blocked", &reason, None))
                        .await?;
                    PipelineState::Blocked { reason }
                }
            };
            info!(%state, "transition");
        }

        let summary = RunSummary {
            run_id,
            pr: pr.clone(),
            final_state: state,
            hops,
            attempts,
            started_at,
            duration: clock.elapsed(),
        };
        info!(
            final_state = %summary.final_state,
            attempts = summary.total_attempts(),
            "pipeline run finished"
        );
        self.write_receipt(&summary).await;
        Ok(summary)
    }

    /// Apply the Ready predicate at the terminal route.
    async fn conclude(&self, pr: &PullRequestRef) -> Result<PipelineState, PipelineError> {
        let doc = self.ledger.read(pr).await?;
        if doc.head_sha != pr.head_sha {
            return Err(self.superseded(pr));
        }
        let blocking = self.registry.blocking_gates(&doc, &pr.head_sha);
        let (state, reasoning) = if blocking.is_empty() {
            (
                PipelineState::ReadyForPromotion,
                format!("all required gates hold for {}", pr.short_sha()),
            )
        } else {
            let reasons: Vec<String> = blocking
                .iter()
                .map(|b| format!("{} ({})", b.gate_id, b.reason))
                .collect();
            let reason = format!("blocking gates: {}", reasons.join(", "));
            (
                PipelineState::Blocked {
                    reason: reason.clone(),
                },
                reason,
            )
        };
        self.ledger
            .set_decision(pr, DecisionBlock::new(state.label(), &reasoning, None))
            .await?;
        Ok(state)
    }

    /// Choose what follows an attempt, with a note for the hop log.
    fn decide(
        &self,
        pr: &PullRequestRef,
        stage: &str,
        recorded: &Recorded,
        visited: &HashSet<String>,
    ) -> Result<(Next, String), RoutingError> {
        if recorded.status == GateStatus::Fail {
            return Ok(match self.retry.try_consume(pr, stage) {
                Consume::Allowed { used, allowed } => (
                    Next::Stage {
                        id: stage.to_string(),
                        retrying: true,
                    },
                    format!("retry {}/{}", used, allowed),
                ),
                Consume::BudgetExhausted { used, allowed } => {
                    match self.router.escalation_for(stage) {
                        Some(escalation) => self.enter(
                            pr,
                            escalation,
                            visited,
                            format!(
                                "retry budget exhausted ({}/{}), escalating to {}",
                                used, allowed, escalation
                            ),
                        ),
                        None => (
                            Next::Blocked(format!(
                                "{} failed and its retry budget is exhausted ({}/{})",
                                stage, used, allowed
                            )),
                            format!("retry budget exhausted ({}/{}), no escalation stage", used, allowed),
                        ),
                    }
                }
            });
        }

        match self.router.route(stage, recorded.outcome)? {
            RouteTarget::Terminal => Ok((Next::Terminal, format!("{} -> terminal", recorded.outcome))),
            RouteTarget::Stage(next) => {
                let note = format!("{} -> {}", recorded.outcome, next);
                Ok(self.enter(pr, &next, visited, note))
            }
        }
    }

    /// Enter `next`; a stage already visited in this run pays from its
    /// retry budget.
    fn enter(
        &self,
        pr: &PullRequestRef,
        next: &str,
        visited: &HashSet<String>,
        note: String,
    ) -> (Next, String) {
        if !visited.contains(next) {
            return (
                Next::Stage {
                    id: next.to_string(),
                    retrying: false,
                },
                note,
            );
        }
        match self.retry.try_consume(pr, next) {
            Consume::Allowed { used, allowed } => (
                Next::Stage {
                    id: next.to_string(),
                    retrying: false,
                },
                format!("{}, re-entry {}/{}", note, used, allowed),
            ),
            Consume::BudgetExhausted { used, allowed } => (
                Next::Blocked(format!(
                    "re-entering {} would exceed its retry budget ({}/{})",
                    next, used, allowed
                )),
                format!("{}, budget exhausted", note),
            ),
        }
    }

    /// Validate a stage result. Anything unusable becomes a failure with an
    /// `error:` line so the ledger never shows a blank row.
    fn record_result(
        &self,
        stage: &str,
        gate_id: Option<&str>,
        result: Result<StageReport, StageError>,
    ) -> Recorded {
        let grammar_key = gate_id.unwrap_or(stage);
        match result {
            Ok(report) => {
                let evidence = report.evidence.trim().to_string();
                match self.codec.decode(grammar_key, &evidence) {
                    Ok(_) => Recorded {
                        status: report.status,
                        outcome: report.outcome_class(),
                        evidence,
                    },
                    Err(e) => {
                        warn!(stage, error = %e, "malformed evidence");
                        Recorded {
                            status: GateStatus::Fail,
                            evidence: self.codec.error_line(&format!("malformed evidence ({})", e)),
                            outcome: OutcomeClass::Clean,
                        }
                    }
                }
            }
            Err(e) => {
                warn!(stage, error = %e, "stage failed");
                Recorded {
                    status: GateStatus::Fail,
                    evidence: self.codec.error_line(&e.to_string()),
                    outcome: OutcomeClass::Clean,
                }
            }
        }
    }

    async fn write_receipt(&self, summary: &RunSummary) {
        let Some(writer) = &self.receipts else {
            return;
        };
        let doc = match self.ledger.read(&summary.pr).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(error = %e, "could not read ledger for receipt");
                return;
            }
        };
        let receipt = GateReceipt::from_run(summary, &doc, &self.registry);
        match writer.write(&summary.pr, &receipt) {
            Ok(path) => info!(path = %path.display(), "gate receipt written"),
            Err(e) => warn!(error = %e, "failed to write gate receipt"),
        }
    }

    fn binding(&self, stage: &str) -> Result<StageBinding, PipelineError> {
        self.stages
            .get(stage)
            .cloned()
            .ok_or_else(|| PipelineError::Other(anyhow!("no runner bound to stage '{}'", stage)))
    }

    fn ensure_bound(&self) -> Result<(), PipelineError> {
        for stage in self.router.stages() {
            self.binding(stage)?;
        }
        Ok(())
    }

    fn check_cancelled(&self, pr: &PullRequestRef, cancel: &CancellationToken) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(self.superseded(pr));
        }
        Ok(())
    }

    fn superseded(&self, pr: &PullRequestRef) -> PipelineError {
        info!("run superseded by a newer head, discarding");
        PipelineError::Superseded {
            pr: pr.key(),
            head: pr.short_sha().to_string(),
        }
    }
}

/// Run one stage, bounded by its timeout and the run's cancellation token.
async fn evaluate(
    binding: &StageBinding,
    ctx: &StageContext,
    cancel: &CancellationToken,
) -> Result<StageReport, StageError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StageError::Cancelled),
        result = tokio::time::timeout(binding.timeout, binding.runner.run(ctx)) => match result {
            Ok(report) => report,
            Err(_) => Err(StageError::Timeout {
                secs: binding.timeout.as_secs(),
            }),
        },
    }
}
