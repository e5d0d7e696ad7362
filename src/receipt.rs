//! Gate receipts: one JSON file per finished run, keyed by head commit.
//!
//! Layout: `<state_dir>/receipts/<owner>-<repo>-<number>/<sha>.json`. A later
//! run on the same head overwrites the earlier receipt. Two receipts of the
//! same PR can be compared to see which gates regressed or recovered between
//! heads.

use crate::gates::{GateRegistry, GateStatus};
use crate::ledger::LedgerDocument;
use crate::pipeline::RunSummary;
use crate::pull_request::PullRequestRef;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptMetadata {
    pub run_id: String,
    pub pr_key: String,
    pub head_sha: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: String,
    pub total_attempts: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub status: GateStatus,
    pub evidence: String,
    pub attempt: u32,
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptSummary {
    pub total_gates: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub pending: u32,
    pub overall_status: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking_gates: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateReceipt {
    pub metadata: ReceiptMetadata,
    pub gates: Vec<GateResult>,
    pub summary: ReceiptSummary,
}

impl GateReceipt {
    /// Assemble a receipt from a finished run and the ledger it left behind.
    pub fn from_run(run: &RunSummary, doc: &LedgerDocument, registry: &GateRegistry) -> Self {
        let gates: Vec<GateResult> = doc
            .gates
            .values()
            .map(|o| GateResult {
                gate_id: o.gate_id.clone(),
                status: o.status,
                evidence: o.evidence.clone(),
                attempt: o.attempt,
                required: registry.is_required_for_ready(&o.gate_id),
            })
            .collect();

        let count = |status: GateStatus| gates.iter().filter(|g| g.status == status).count() as u32;
        let blocking_gates = registry
            .blocking_gates(doc, &run.pr.head_sha)
            .into_iter()
            .map(|b| b.gate_id)
            .collect();
        let summary = ReceiptSummary {
            total_gates: gates.len() as u32,
            passed: count(GateStatus::Pass),
            failed: count(GateStatus::Fail),
            skipped: count(GateStatus::Skipped),
            pending: count(GateStatus::Pending),
            overall_status: if run.is_ready() { "pass" } else { "blocked" }.to_string(),
            blocking_gates,
        };

        Self {
            metadata: ReceiptMetadata {
                run_id: run.run_id.clone(),
                pr_key: run.pr.key(),
                head_sha: run.pr.head_sha.clone(),
                started_at: run.started_at,
                finished_at: Utc::now(),
                final_state: run.final_state.label().to_string(),
                total_attempts: run.total_attempts(),
                duration_ms: run.duration.as_millis() as u64,
            },
            gates,
            summary,
        }
    }
}

/// One gate whose status differs between two receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub gate_id: String,
    pub old_status: GateStatus,
    pub new_status: GateStatus,
    /// The gate held (pass or skipped) before and no longer does.
    pub is_regression: bool,
}

/// Differences between a baseline receipt and a current one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptDiff {
    pub baseline_head: String,
    pub current_head: String,
    pub gates_added: Vec<String>,
    pub gates_removed: Vec<String>,
    pub status_changes: Vec<StatusChange>,
    pub overall_regression: bool,
}

impl ReceiptDiff {
    pub fn is_empty(&self) -> bool {
        self.gates_added.is_empty() && self.gates_removed.is_empty() && self.status_changes.is_empty()
    }
}

fn holds(status: GateStatus) -> bool {
    matches!(status, GateStatus::Pass | GateStatus::Skipped)
}

/// Compare two receipts gate by gate.
pub fn compare_receipts(baseline: &GateReceipt, current: &GateReceipt) -> ReceiptDiff {
    let before: BTreeMap<&str, GateStatus> = baseline
        .gates
        .iter()
        .map(|g| (g.gate_id.as_str(), g.status))
        .collect();
    let after: BTreeMap<&str, GateStatus> = current
        .gates
        .iter()
        .map(|g| (g.gate_id.as_str(), g.status))
        .collect();

    let gates_added = after
        .keys()
        .filter(|id| !before.contains_key(*id))
        .map(|id| id.to_string())
        .collect();
    let gates_removed = before
        .keys()
        .filter(|id| !after.contains_key(*id))
        .map(|id| id.to_string())
        .collect();

    let status_changes: Vec<StatusChange> = after
        .iter()
        .filter_map(|(id, new)| {
            let old = *before.get(id)?;
            (old != *new).then(|| StatusChange {
                gate_id: id.to_string(),
                old_status: old,
                new_status: *new,
                is_regression: holds(old) && !holds(*new),
            })
        })
        .collect();
    let overall_regression = status_changes.iter().any(|c| c.is_regression);

    ReceiptDiff {
        baseline_head: baseline.metadata.head_sha.clone(),
        current_head: current.metadata.head_sha.clone(),
        gates_added,
        gates_removed,
        status_changes,
        overall_regression,
    }
}

pub struct ReceiptWriter {
    receipts_dir: PathBuf,
}

impl ReceiptWriter {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            receipts_dir: state_dir.join("receipts"),
        }
    }

    fn pr_dir(&self, pr: &PullRequestRef) -> PathBuf {
        self.receipts_dir.join(pr.dir_name())
    }

    pub fn write(&self, pr: &PullRequestRef, receipt: &GateReceipt) -> Result<PathBuf> {
        let dir = self.pr_dir(pr);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create receipts directory {}", dir.display()))?;
        let path = dir.join(format!("{}.json", pr.head_sha));
        let json = serde_json::to_string_pretty(receipt).context("Failed to serialize gate receipt")?;
        fs::write(&path, json).context("Failed to write gate receipt")?;
        Ok(path)
    }

    /// Receipts of a pull request, most recently written first.
    pub fn list(&self, pr: &PullRequestRef) -> Result<Vec<PathBuf>> {
        let dir = self.pr_dir(pr);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut receipts: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .map(|p| {
                let modified = fs::metadata(&p)
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::UNIX_EPOCH);
                (modified, p)
            })
            .collect();
        receipts.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(receipts.into_iter().map(|(_, p)| p).collect())
    }

    pub fn load(&self, path: &Path) -> Result<GateReceipt> {
        let content = fs::read_to_string(path).context("Failed to read gate receipt")?;
        serde_json::from_str(&content).context("Failed to parse gate receipt")
    }

    /// Compare the receipt of `baseline_sha` against the most recent receipt
    /// of any other head of the same pull request.
    pub fn compare(&self, pr: &PullRequestRef, baseline_sha: &str) -> Result<ReceiptDiff> {
        let baseline_path = self.pr_dir(pr).join(format!("{}.json", baseline_sha));
        if !baseline_path.exists() {
            anyhow::bail!("No receipt for {} at {}", pr.key(), baseline_sha);
        }
        let baseline = self.load(&baseline_path)?;
        let current_path = self
            .list(pr)?
            .into_iter()
            .find(|p| p != &baseline_path)
            .with_context(|| format!("No other receipt for {} to compare against", pr.key()))?;
        let current = self.load(&current_path)?;
        Ok(compare_receipts(&baseline, &current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Grammar;
    use crate::gates::{Gate, GateOutcome};
    use crate::pipeline::PipelineState;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fixture(final_state: PipelineState) -> (RunSummary, LedgerDocument, GateRegistry) {
        let pr = PullRequestRef::new("acme", "widgets", 9, "abc1234");
        let registry = GateRegistry::new(vec![
            Gate::required("format", Grammar::Summary),
            Gate::required("tests", Grammar::TestCounts),
        ])
        .unwrap();
        let mut doc = LedgerDocument::new("abc1234");
        doc.upsert(GateOutcome::new("format", GateStatus::Pass, "format: clean", 1));
        doc.upsert(GateOutcome::new("tests", GateStatus::Fail, "tests: 1/2 pass", 2));
        let run = RunSummary {
            run_id: "run-1".into(),
            pr,
            final_state,
            hops: Vec::new(),
            attempts: BTreeMap::from([("format".to_string(), 1), ("tests".to_string(), 2)]),
            started_at: Utc::now(),
            duration: Duration::from_millis(1500),
        };
        (run, doc, registry)
    }

    #[test]
    fn test_receipt_summary_counts() {
        let (run, doc, registry) = fixture(PipelineState::Blocked {
            reason: "tests failed".into(),
        });
        let receipt = GateReceipt::from_run(&run, &doc, &registry);
        assert_eq!(receipt.summary.total_gates, 2);
        assert_eq!(receipt.summary.passed, 1);
        assert_eq!(receipt.summary.failed, 1);
        assert_eq!(receipt.summary.overall_status, "blocked");
        assert_eq!(receipt.summary.blocking_gates, vec!["tests".to_string()]);
        assert_eq!(receipt.metadata.total_attempts, 3);
        assert_eq!(receipt.metadata.final_state, "blocked");
    }

    #[test]
    fn test_write_list_load() {
        let tmp = TempDir::new().unwrap();
        let writer = ReceiptWriter::new(tmp.path());
        let (run, doc, registry) = fixture(PipelineState::ReadyForPromotion);
        let receipt = GateReceipt::from_run(&run, &doc, &registry);

        let path = writer.write(&run.pr, &receipt).unwrap();
        assert!(path.ends_with("receipts/acme-widgets-9/abc1234.json"));

        let listed = writer.list(&run.pr).unwrap();
        assert_eq!(listed, vec![path.clone()]);
        let loaded = writer.load(&path).unwrap();
        assert_eq!(loaded.metadata.run_id, "run-1");
        assert_eq!(loaded.gates.len(), 2);
    }

    fn receipt_at(head: &str, gates: &[(&str, GateStatus)]) -> GateReceipt {
        let (mut run, _, registry) = fixture(PipelineState::ReadyForPromotion);
        run.pr = run.pr.at_head(head);
        let mut doc = LedgerDocument::new(head);
        for (id, status) in gates {
            doc.upsert(GateOutcome::new(id, *status, format!("{}: x", id), 1));
        }
        GateReceipt::from_run(&run, &doc, &registry)
    }

    #[test]
    fn test_compare_reports_regressions_and_recoveries() {
        let baseline = receipt_at(
            "aaaaaaa",
            &[
                ("format", GateStatus::Pass),
                ("tests", GateStatus::Fail),
                ("clippy", GateStatus::Pass),
                ("docs", GateStatus::Pass),
            ],
        );
        let current = receipt_at(
            "bbbbbbb",
            &[
                ("format", GateStatus::Fail),
                ("tests", GateStatus::Pass),
                ("clippy", GateStatus::Pass),
                ("security", GateStatus::Pass),
            ],
        );

        let diff = compare_receipts(&baseline, &current);
        assert_eq!(diff.baseline_head, "aaaaaaa");
        assert_eq!(diff.current_head, "bbbbbbb");
        assert_eq!(diff.gates_added, vec!["security".to_string()]);
        assert_eq!(diff.gates_removed, vec!["docs".to_string()]);
        assert_eq!(diff.status_changes.len(), 2);

        let format = diff.status_changes.iter().find(|c| c.gate_id == "format").unwrap();
        assert!(format.is_regression);
        let tests = diff.status_changes.iter().find(|c| c.gate_id == "tests").unwrap();
        assert!(!tests.is_regression);
        assert_eq!(tests.new_status, GateStatus::Pass);
        assert!(diff.overall_regression);
    }

    #[test]
    fn test_compare_identical_receipts_is_empty() {
        let a = receipt_at("aaaaaaa", &[("tests", GateStatus::Pass)]);
        let b = receipt_at("bbbbbbb", &[("tests", GateStatus::Pass)]);
        let diff = compare_receipts(&a, &b);
        assert!(diff.is_empty());
        assert!(!diff.overall_regression);
    }

    #[test]
    fn test_writer_compare_uses_other_head() {
        let tmp = TempDir::new().unwrap();
        let writer = ReceiptWriter::new(tmp.path());
        let baseline = receipt_at("aaaaaaa", &[("tests", GateStatus::Pass)]);
        let current = receipt_at("bbbbbbb", &[("tests", GateStatus::Fail)]);
        let pr = PullRequestRef::new("acme", "widgets", 9, "aaaaaaa");
        writer.write(&pr, &baseline).unwrap();
        writer.write(&pr.at_head("bbbbbbb"), &current).unwrap();

        let diff = writer.compare(&pr, "aaaaaaa").unwrap();
        assert_eq!(diff.current_head, "bbbbbbb");
        assert!(diff.overall_regression);

        assert!(writer.compare(&pr, "ccccccc").is_err());
    }

    #[test]
    fn test_writer_compare_needs_a_second_receipt() {
        let tmp = TempDir::new().unwrap();
        let writer = ReceiptWriter::new(tmp.path());
        let pr = PullRequestRef::new("acme", "widgets", 9, "aaaaaaa");
        writer.write(&pr, &receipt_at("aaaaaaa", &[("tests", GateStatus::Pass)])).unwrap();
        let err = writer.compare(&pr, "aaaaaaa").unwrap_err();
        assert!(err.to_string().contains("No other receipt"), "{}", err);
    }

    #[test]
    fn test_list_without_receipts_is_empty() {
        let tmp = TempDir::new().unwrap();
        let writer = ReceiptWriter::new(tmp.path());
        let pr = PullRequestRef::new("o", "r", 1, "abc");
        assert!(writer.list(&pr).unwrap().is_empty());
    }
}
