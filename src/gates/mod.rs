//! Gate registry and gate outcome types.
//!
//! A gate is a named checkpoint with a pass/fail/skipped outcome. The
//! registry is the static catalog loaded from configuration; it never
//! changes at runtime and is the sole source for the Ready predicate.

use crate::errors::RegistryError;
use crate::evidence::{Grammar, skip_reason};
use crate::ledger::LedgerDocument;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status of one gate within an evaluation epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    #[default]
    Pending,
    Pass,
    Fail,
    Skipped,
}

impl GateStatus {
    /// Conclusion published on the external check run. `None` means the
    /// run is still in progress.
    pub fn conclusion(&self) -> Option<ExternalConclusion> {
        match self {
            GateStatus::Pending => None,
            GateStatus::Pass => Some(ExternalConclusion::Success),
            GateStatus::Fail => Some(ExternalConclusion::Failure),
            GateStatus::Skipped => Some(ExternalConclusion::Neutral),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::Pending => "pending",
            GateStatus::Pass => "pass",
            GateStatus::Fail => "fail",
            GateStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for GateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GateStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(GateStatus::Pending),
            "pass" | "passed" => Ok(GateStatus::Pass),
            "fail" | "failed" => Ok(GateStatus::Fail),
            "skipped" | "skip" => Ok(GateStatus::Skipped),
            _ => anyhow::bail!(
                "Invalid gate status '{}'. Valid values: pending, pass, fail, skipped",
                s
            ),
        }
    }
}

/// Conclusion of an external check run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalConclusion {
    Success,
    Failure,
    Neutral,
}

impl ExternalConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalConclusion::Success => "success",
            ExternalConclusion::Failure => "failure",
            ExternalConclusion::Neutral => "neutral",
        }
    }
}

/// A registered gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    pub id: String,
    /// Whether the Ready predicate requires this gate.
    #[serde(default = "default_required")]
    pub required: bool,
    /// Evidence grammar for this gate.
    #[serde(default)]
    pub grammar: Grammar,
    #[serde(default)]
    pub description: String,
}

fn default_required() -> bool {
    true
}

impl Gate {
    pub fn required(id: &str, grammar: Grammar) -> Self {
        Self {
            id: id.to_string(),
            required: true,
            grammar,
            description: String::new(),
        }
    }

    pub fn optional(id: &str, grammar: Grammar) -> Self {
        Self {
            id: id.to_string(),
            required: false,
            grammar,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }
}

/// Latest recorded outcome of a gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateOutcome {
    pub gate_id: String,
    pub status: GateStatus,
    /// Encoded evidence line, as it appears in the ledger table.
    pub evidence: String,
    pub updated_at: DateTime<Utc>,
    pub attempt: u32,
}

impl GateOutcome {
    pub fn new(gate_id: &str, status: GateStatus, evidence: impl Into<String>, attempt: u32) -> Self {
        Self {
            gate_id: gate_id.to_string(),
            status,
            evidence: evidence.into(),
            updated_at: Utc::now(),
            attempt,
        }
    }

    /// Placeholder outcome for a fresh epoch.
    pub fn pending(gate_id: &str, short_sha: &str) -> Self {
        Self::new(
            gate_id,
            GateStatus::Pending,
            format!("pending: awaiting {}", short_sha),
            0,
        )
    }

    /// Reason text when the outcome is a skip with `skipped (<reason>)` evidence.
    pub fn skip_reason(&self) -> Option<&str> {
        if self.status != GateStatus::Skipped {
            return None;
        }
        skip_reason(&self.evidence)
    }

    /// Whether this outcome satisfies a required gate.
    pub fn satisfies(&self) -> bool {
        match self.status {
            GateStatus::Pass => true,
            GateStatus::Skipped => self.skip_reason().is_some(),
            GateStatus::Pending | GateStatus::Fail => false,
        }
    }
}

/// Why a gate prevents promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingGate {
    pub gate_id: String,
    pub reason: String,
}

/// Static catalog of known gates.
#[derive(Debug, Clone, Default)]
pub struct GateRegistry {
    gates: BTreeMap<String, Gate>,
    order: Vec<String>,
}

impl GateRegistry {
    pub fn new(gates: Vec<Gate>) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for gate in gates {
            if registry.gates.contains_key(&gate.id) {
                return Err(RegistryError::Duplicate(gate.id));
            }
            registry.order.push(gate.id.clone());
            registry.gates.insert(gate.id.clone(), gate);
        }
        Ok(registry)
    }

    pub fn lookup(&self, gate_id: &str) -> Result<&Gate, RegistryError> {
        self.gates
            .get(gate_id)
            .ok_or_else(|| RegistryError::NotFound(gate_id.to_string()))
    }

    /// Unknown gates are never required.
    pub fn is_required_for_ready(&self, gate_id: &str) -> bool {
        self.gates.get(gate_id).is_some_and(|g| g.required)
    }

    /// Gates in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Gate> {
        self.order.iter().filter_map(|id| self.gates.get(id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Gates that prevent `doc` from being promotable at `head_sha`.
    pub fn blocking_gates(&self, doc: &LedgerDocument, head_sha: &str) -> Vec<BlockingGate> {
        let mut blocking = Vec::new();

        if !doc.head_sha.eq_ignore_ascii_case(head_sha) {
            // Outcomes recorded for another head satisfy nothing.
            for gate in self.iter().filter(|g| g.required) {
                blocking.push(BlockingGate {
                    gate_id: gate.id.clone(),
                    reason: "no outcome for current head".to_string(),
                });
            }
            return blocking;
        }

        for gate in self.iter() {
            match doc.gates.get(&gate.id) {
                Some(outcome) if outcome.status == GateStatus::Fail => {
                    blocking.push(BlockingGate {
                        gate_id: gate.id.clone(),
                        reason: format!("failed: {}", outcome.evidence),
                    });
                }
                Some(outcome) if gate.required && !outcome.satisfies() => {
                    let reason = if outcome.status == GateStatus::Skipped {
                        "skipped without a reason".to_string()
                    } else {
                        outcome.status.to_string()
                    };
                    blocking.push(BlockingGate {
                        gate_id: gate.id.clone(),
                        reason,
                    });
                }
                None if gate.required => blocking.push(BlockingGate {
                    gate_id: gate.id.clone(),
                    reason: "not evaluated".to_string(),
                }),
                _ => {}
            }
        }

        // Failures of gates outside the registry still block.
        for (gate_id, outcome) in &doc.gates {
            if !self.gates.contains_key(gate_id) && outcome.status == GateStatus::Fail {
                blocking.push(BlockingGate {
                    gate_id: gate_id.clone(),
                    reason: format!("failed: {}", outcome.evidence),
                });
            }
        }

        blocking
    }

    /// The Ready predicate: every required gate passed (or was skipped with a
    /// reason) for `head_sha`, and no gate failed.
    pub fn is_ready(&self, doc: &LedgerDocument, head_sha: &str) -> bool {
        self.blocking_gates(doc, head_sha).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> GateRegistry {
        GateRegistry::new(vec![
            Gate::required("format", Grammar::Summary),
            Gate::required("clippy", Grammar::Warnings),
            Gate::required("tests", Grammar::TestCounts),
            Gate::optional("perf", Grammar::Summary),
        ])
        .unwrap()
    }

    fn doc(head: &str, outcomes: &[(&str, GateStatus, &str)]) -> LedgerDocument {
        let mut doc = LedgerDocument::new(head);
        for (id, status, evidence) in outcomes {
            doc.upsert(GateOutcome::new(id, *status, *evidence, 1));
        }
        doc
    }

    #[test]
    fn test_conclusion_mapping() {
        assert_eq!(GateStatus::Pass.conclusion(), Some(ExternalConclusion::Success));
        assert_eq!(GateStatus::Fail.conclusion(), Some(ExternalConclusion::Failure));
        assert_eq!(GateStatus::Skipped.conclusion(), Some(ExternalConclusion::Neutral));
        assert_eq!(GateStatus::Pending.conclusion(), None);
    }

    #[test]
    fn test_lookup_and_required() {
        let reg = registry();
        assert!(reg.lookup("tests").is_ok());
        assert_eq!(
            reg.lookup("nope").unwrap_err(),
            RegistryError::NotFound("nope".into())
        );
        assert!(reg.is_required_for_ready("tests"));
        assert!(!reg.is_required_for_ready("perf"));
        assert!(!reg.is_required_for_ready("nope"));
    }

    #[test]
    fn test_duplicate_gate_rejected() {
        let err = GateRegistry::new(vec![
            Gate::required("tests", Grammar::TestCounts),
            Gate::optional("tests", Grammar::Summary),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("tests".into()));
    }

    #[test]
    fn test_ready_when_required_gates_pass() {
        let d = doc(
            "abc1234",
            &[
                ("format", GateStatus::Pass, "format: clean"),
                ("clippy", GateStatus::Pass, "clippy: 0 warnings"),
                ("tests", GateStatus::Pass, "tests: 10/10 pass"),
            ],
        );
        assert!(registry().is_ready(&d, "abc1234"));
    }

    #[test]
    fn test_not_ready_when_tests_fail() {
        let d = doc(
            "abc1234",
            &[
                ("format", GateStatus::Pass, "format: clean"),
                ("clippy", GateStatus::Pass, "clippy: 0 warnings"),
                ("tests", GateStatus::Fail, "tests: 9/10 pass"),
            ],
        );
        let reg = registry();
        assert!(!reg.is_ready(&d, "abc1234"));
        let blocking = reg.blocking_gates(&d, "abc1234");
        assert_eq!(blocking.len(), 1);
        assert_eq!(blocking[0].gate_id, "tests");
    }

    #[test]
    fn test_optional_failure_blocks() {
        let d = doc(
            "abc1234",
            &[
                ("format", GateStatus::Pass, "format: clean"),
                ("clippy", GateStatus::Pass, "clippy: 0 warnings"),
                ("tests", GateStatus::Pass, "tests: 10/10 pass"),
                ("perf", GateStatus::Fail, "perf: 12% slower"),
            ],
        );
        assert!(!registry().is_ready(&d, "abc1234"));
    }

    #[test]
    fn test_skipped_requires_reason() {
        let with_reason = doc(
            "abc1234",
            &[
                ("format", GateStatus::Pass, "format: clean"),
                ("clippy", GateStatus::Skipped, "skipped (no rust changes)"),
                ("tests", GateStatus::Pass, "tests: 10/10 pass"),
            ],
        );
        assert!(registry().is_ready(&with_reason, "abc1234"));

        let without_reason = doc(
            "abc1234",
            &[
                ("format", GateStatus::Pass, "format: clean"),
                ("clippy", GateStatus::Skipped, "clippy: skipped"),
                ("tests", GateStatus::Pass, "tests: 10/10 pass"),
            ],
        );
        assert!(!registry().is_ready(&without_reason, "abc1234"));
    }

    #[test]
    fn test_missing_required_gate_blocks() {
        let d = doc("abc1234", &[("format", GateStatus::Pass, "format: clean")]);
        let blocking = registry().blocking_gates(&d, "abc1234");
        let ids: Vec<_> = blocking.iter().map(|b| b.gate_id.as_str()).collect();
        assert_eq!(ids, vec!["clippy", "tests"]);
    }

    #[test]
    fn test_outcomes_for_other_head_do_not_count() {
        let d = doc(
            "aaaaaaa",
            &[
                ("format", GateStatus::Pass, "format: clean"),
                ("clippy", GateStatus::Pass, "clippy: 0 warnings"),
                ("tests", GateStatus::Pass, "tests: 10/10 pass"),
            ],
        );
        assert!(registry().is_ready(&d, "aaaaaaa"));
        assert!(!registry().is_ready(&d, "bbbbbbb"));
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("PASS".parse::<GateStatus>().unwrap(), GateStatus::Pass);
        assert_eq!("skipped".parse::<GateStatus>().unwrap(), GateStatus::Skipped);
        assert!("green".parse::<GateStatus>().is_err());
    }
}
