//! Ledger comment format.
//!
//! The ledger lives in one PR comment with three anchored regions:
//!
//! ```text
//! <!--gates:start-->
//! <!-- gate-meta {"head_sha":"…","gates":{"tests":{"attempt":2,"updated_at":"…"}}} -->
//! | Gate | Status | Evidence |
//! |------|--------|----------|
//! | tests | fail | tests: 9/10 pass |
//! <!--gates:end-->
//! <!--hops:start-->
//! - 2026-01-01T00:00:00Z **tests**: attempt 1: fail (tests: 9/10 pass)
//! <!--hops:end-->
//! <!--decision:start-->
//! **State:** blocked
//! **Next:** none
//! **Reasoning:** required gate tests failed
//! <!--decision:end-->
//! ```
//!
//! Rendering back into an existing body only replaces the bytes between the
//! anchors; everything else in the comment is kept as written. Free text is
//! rendered with comment markers defused so it can never fake an anchor.
//!
//! The hop log keeps the newest [`MAX_HOPS`] entries; older ones are counted
//! on an `_N earlier hops elided._` line.

use crate::evidence::defuse_markers;
use crate::gates::{GateOutcome, GateStatus};
use crate::util::truncate_chars;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const GATES_START: &str = "<!--gates:start-->";
pub const GATES_END: &str = "<!--gates:end-->";
pub const HOPS_START: &str = "<!--hops:start-->";
pub const HOPS_END: &str = "<!--hops:end-->";
pub const DECISION_START: &str = "<!--decision:start-->";
pub const DECISION_END: &str = "<!--decision:end-->";

const META_PREFIX: &str = "<!-- gate-meta ";
const META_SUFFIX: &str = " -->";
const TABLE_HEADER: &str = "| Gate | Status | Evidence |";
const TABLE_RULE: &str = "|------|--------|----------|";
const LEDGER_TITLE: &str = "## Review ledger";
const ELIDED_SUFFIX: &str = " earlier hops elided._";

/// Hop entries kept in the rendered log.
pub const MAX_HOPS: usize = 100;

const MAX_HOP_SUMMARY_CHARS: usize = 400;

/// One line of the append-only hop log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub summary: String,
}

impl HopEntry {
    /// New entry stamped now. Line breaks in the summary are flattened and
    /// long summaries are truncated.
    pub fn new(stage: &str, summary: &str) -> Self {
        Self {
            timestamp: truncate_to_seconds(Utc::now()),
            stage: stage.to_string(),
            summary: truncate_chars(&flatten(summary), MAX_HOP_SUMMARY_CHARS),
        }
    }

    fn render(&self) -> String {
        format!(
            "- {} **{}**: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            defuse_markers(&self.stage),
            defuse_markers(&self.summary)
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let rest = line.strip_prefix("- ")?;
        let (stamp, rest) = rest.split_once(' ')?;
        let timestamp = DateTime::parse_from_rfc3339(stamp).ok()?.with_timezone(&Utc);
        let rest = rest.strip_prefix("**")?;
        let (stage, summary) = rest.split_once("**: ")?;
        Some(Self {
            timestamp,
            stage: stage.to_string(),
            summary: summary.to_string(),
        })
    }
}

/// The decision block: where the pipeline stands and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionBlock {
    pub state: String,
    pub reasoning: String,
    pub next_stage: Option<String>,
}

impl DecisionBlock {
    pub fn new(state: &str, reasoning: &str, next_stage: Option<&str>) -> Self {
        Self {
            state: state.to_string(),
            reasoning: flatten(reasoning),
            next_stage: next_stage.map(str::to_string),
        }
    }

    fn render(&self) -> String {
        format!(
            "**State:** {}\n**Next:** {}\n**Reasoning:** {}",
            defuse_markers(&self.state),
            defuse_markers(self.next_stage.as_deref().unwrap_or("none")),
            defuse_markers(&self.reasoning)
        )
    }

    fn parse(region: &str) -> Option<Self> {
        let mut state = None;
        let mut next_stage = None;
        let mut reasoning = String::new();
        for line in region.lines() {
            let line = line.trim();
            if let Some(v) = line.strip_prefix("**State:** ") {
                state = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("**Next:** ") {
                let v = v.trim();
                if v != "none" {
                    next_stage = Some(v.to_string());
                }
            } else if let Some(v) = line.strip_prefix("**Reasoning:** ") {
                reasoning = v.trim().to_string();
            }
        }
        Some(Self {
            state: state?,
            reasoning,
            next_stage,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GateMeta {
    head_sha: String,
    #[serde(default)]
    gates: BTreeMap<String, GateMetaEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GateMetaEntry {
    attempt: u32,
    updated_at: DateTime<Utc>,
}

/// Parsed contents of the ledger comment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct LedgerDocument {
    /// Head commit the gate outcomes belong to.
    pub head_sha: String,
    pub gates: BTreeMap<String, GateOutcome>,
    pub hops: Vec<HopEntry>,
    /// Older hops dropped from `hops`.
    pub hops_elided: usize,
    pub decision: Option<DecisionBlock>,
}

impl LedgerDocument {
    pub fn new(head_sha: &str) -> Self {
        Self {
            head_sha: head_sha.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    /// Whether `body` carries a ledger.
    pub fn is_ledger(body: &str) -> bool {
        body.contains(GATES_START) && body.contains(GATES_END)
    }

    /// Insert or replace the outcome for one gate.
    pub fn upsert(&mut self, outcome: GateOutcome) {
        self.gates.insert(outcome.gate_id.clone(), outcome);
    }

    pub fn append_hop(&mut self, entry: HopEntry) {
        self.hops.push(entry);
        self.elide_oldest_hops(MAX_HOPS);
    }

    /// Keep only the newest `keep` hops, counting the rest as elided.
    pub fn elide_oldest_hops(&mut self, keep: usize) {
        if self.hops.len() > keep {
            let dropped = self.hops.len() - keep;
            self.hops.drain(..dropped);
            self.hops_elided += dropped;
        }
    }

    pub fn outcome(&self, gate_id: &str) -> Option<&GateOutcome> {
        self.gates.get(gate_id)
    }

    /// Fold another copy of the ledger into this one. Gate outcomes for the
    /// same head are merged per gate, newest `updated_at` winning; hops are
    /// merged by timestamp without duplicates.
    pub fn absorb(&mut self, other: LedgerDocument) {
        if other.head_sha == self.head_sha {
            for (gate_id, outcome) in other.gates {
                match self.gates.get(&gate_id) {
                    Some(existing) if existing.updated_at >= outcome.updated_at => {}
                    _ => {
                        self.gates.insert(gate_id, outcome);
                    }
                }
            }
        }
        for hop in other.hops {
            if !self.hops.contains(&hop) {
                self.hops.push(hop);
            }
        }
        self.hops.sort_by_key(|h| h.timestamp);
        self.hops_elided = self.hops_elided.max(other.hops_elided);
        self.elide_oldest_hops(MAX_HOPS);
        if self.decision.is_none() {
            self.decision = other.decision;
        }
    }

    /// Render a complete comment body for a new ledger.
    pub fn render(&self) -> String {
        format!(
            "{}\n\n### Gates\n{}\n{}\n{}\n\n### Hop log\n{}\n{}\n{}\n\n### Decision\n{}\n{}\n{}\n",
            LEDGER_TITLE,
            GATES_START,
            self.render_gates(),
            GATES_END,
            HOPS_START,
            self.render_hops(),
            HOPS_END,
            DECISION_START,
            self.render_decision(),
            DECISION_END,
        )
    }

    /// Write this document into an existing comment body, touching only the
    /// anchored regions. Missing regions are appended at the end.
    pub fn splice_into(&self, body: &str) -> String {
        let mut out = replace_region(body, GATES_START, GATES_END, &self.render_gates());
        out = replace_region(&out, HOPS_START, HOPS_END, &self.render_hops());
        replace_region(&out, DECISION_START, DECISION_END, &self.render_decision())
    }

    /// Parse a ledger comment body.
    pub fn parse(body: &str) -> Result<Self, String> {
        let gates_region = region(body, GATES_START, GATES_END)
            .ok_or_else(|| "gates anchors are missing or out of order".to_string())?;

        let mut meta = GateMeta::default();
        let mut gates = BTreeMap::new();
        for line in gates_region.lines() {
            let line = line.trim();
            if let Some(json) = line
                .strip_prefix(META_PREFIX)
                .and_then(|l| l.strip_suffix(META_SUFFIX))
            {
                meta = serde_json::from_str(json)
                    .map_err(|e| format!("gate-meta is not valid JSON: {}", e))?;
                continue;
            }
            if line.is_empty() || line == TABLE_HEADER || line.starts_with("|--") {
                continue;
            }
            let cells = split_row(line)
                .ok_or_else(|| format!("gates table row is malformed: {}", line))?;
            let [gate_id, status, evidence] = cells;
            let status: GateStatus = status
                .parse()
                .map_err(|e: anyhow::Error| format!("gate '{}': {}", gate_id, e))?;
            gates.insert(
                gate_id.clone(),
                GateOutcome {
                    gate_id,
                    status,
                    evidence,
                    updated_at: DateTime::<Utc>::default(),
                    attempt: 0,
                },
            );
        }
        for (gate_id, entry) in meta.gates {
            if let Some(outcome) = gates.get_mut(&gate_id) {
                outcome.attempt = entry.attempt;
                outcome.updated_at = entry.updated_at;
            }
        }

        let mut hops = Vec::new();
        let mut hops_elided = 0;
        for line in region(body, HOPS_START, HOPS_END).unwrap_or_default().lines() {
            let line = line.trim();
            if let Some(n) = line
                .strip_prefix('_')
                .and_then(|l| l.strip_suffix(ELIDED_SUFFIX))
                .and_then(|n| n.parse().ok())
            {
                hops_elided = n;
            } else if let Some(hop) = HopEntry::parse(line) {
                hops.push(hop);
            }
        }
        let decision = region(body, DECISION_START, DECISION_END).and_then(DecisionBlock::parse);

        Ok(Self {
            head_sha: meta.head_sha,
            gates,
            hops,
            hops_elided,
            decision,
        })
    }

    fn render_gates(&self) -> String {
        let meta = GateMeta {
            head_sha: self.head_sha.clone(),
            gates: self
                .gates
                .iter()
                .map(|(id, o)| {
                    (
                        id.clone(),
                        GateMetaEntry {
                            attempt: o.attempt,
                            updated_at: o.updated_at,
                        },
                    )
                })
                .collect(),
        };
        // GateMeta is plain data; serialization cannot fail.
        let json = serde_json::to_string(&meta).unwrap_or_default();
        let mut out = format!("{}{}{}\n{}\n{}", META_PREFIX, json, META_SUFFIX, TABLE_HEADER, TABLE_RULE);
        for outcome in self.gates.values() {
            out.push_str(&format!(
                "\n| {} | {} | {} |",
                defuse_markers(&outcome.gate_id),
                outcome.status,
                defuse_markers(&outcome.evidence)
            ));
        }
        out
    }

    fn render_hops(&self) -> String {
        if self.hops.is_empty() && self.hops_elided == 0 {
            return "_No hops yet._".to_string();
        }
        let mut lines = Vec::with_capacity(self.hops.len() + 1);
        if self.hops_elided > 0 {
            lines.push(format!("_{}{}", self.hops_elided, ELIDED_SUFFIX));
        }
        lines.extend(self.hops.iter().map(HopEntry::render));
        lines.join("\n")
    }

    fn render_decision(&self) -> String {
        match &self.decision {
            Some(decision) => decision.render(),
            None => "_Pending._".to_string(),
        }
    }
}

/// Text strictly between `start` and `end`, if both anchors are present in order.
fn region<'a>(body: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = body.find(start)? + start.len();
    let to = body[from..].find(end)? + from;
    Some(&body[from..to])
}

fn replace_region(body: &str, start: &str, end: &str, content: &str) -> String {
    if let Some(from) = body.find(start).map(|i| i + start.len())
        && let Some(to) = body[from..].find(end).map(|i| i + from)
    {
        return format!("{}\n{}\n{}", &body[..from], content, &body[to..]);
    }
    let mut out = body.trim_end().to_string();
    out.push_str(&format!("\n\n{}\n{}\n{}\n", start, content, end));
    out
}

/// Split `| a | b | c |` into its three cells, honouring `\|` escapes.
fn split_row(line: &str) -> Option<[String; 3]> {
    let inner = line.strip_prefix('|')?.strip_suffix('|')?;
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut prev = None;
    for ch in inner.chars() {
        if ch == '|' && prev != Some('\\') {
            cells.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(ch);
        }
        prev = Some(ch);
    }
    cells.push(current.trim().to_string());
    cells.try_into().ok()
}

fn flatten(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_to_seconds(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, status: GateStatus, evidence: &str, attempt: u32) -> GateOutcome {
        let mut o = GateOutcome::new(id, status, evidence, attempt);
        o.updated_at = truncate_to_seconds(o.updated_at);
        o
    }

    fn sample() -> LedgerDocument {
        let mut doc = LedgerDocument::new("abc1234");
        doc.upsert(outcome("format", GateStatus::Pass, "format: clean", 1));
        doc.upsert(outcome("tests", GateStatus::Fail, "tests: 9/10 pass", 2));
        doc.upsert(outcome("docs", GateStatus::Pass, "docs: a \\| b", 1));
        doc.append_hop(HopEntry::new("tests", "attempt 1: fail (tests: 9/10 pass)"));
        doc.decision = Some(DecisionBlock::new("retrying", "tests failed", Some("tests")));
        doc
    }

    #[test]
    fn test_render_then_parse_preserves_document() {
        let doc = sample();
        let parsed = LedgerDocument::parse(&doc.render()).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_splice_preserves_surrounding_text() {
        let doc = sample();
        let body = format!("Intro written by a human.\n\n{}\nTrailing note.", doc.render());

        let mut updated = doc.clone();
        updated.upsert(outcome("tests", GateStatus::Pass, "tests: 10/10 pass", 3));
        let spliced = updated.splice_into(&body);

        assert!(spliced.starts_with("Intro written by a human.\n\n## Review ledger"));
        assert!(spliced.ends_with("Trailing note."));
        let parsed = LedgerDocument::parse(&spliced).unwrap();
        assert_eq!(parsed.outcome("tests").unwrap().status, GateStatus::Pass);
        assert_eq!(parsed.outcome("tests").unwrap().attempt, 3);
        assert_eq!(parsed.gates.len(), 3);
    }

    #[test]
    fn test_splice_appends_missing_regions() {
        let doc = sample();
        let body = format!("{}\n{}\n{}", GATES_START, "| x | pass | x: y |", GATES_END);
        let spliced = doc.splice_into(&body);
        assert!(spliced.contains(HOPS_START));
        assert!(spliced.contains(DECISION_END));
        assert_eq!(LedgerDocument::parse(&spliced).unwrap(), doc);
    }

    #[test]
    fn test_parse_requires_gates_anchor() {
        assert!(LedgerDocument::parse("just a comment").is_err());
        assert!(!LedgerDocument::is_ledger("just a comment"));
        assert!(LedgerDocument::is_ledger(&sample().render()));
    }

    #[test]
    fn test_parse_rejects_bad_row() {
        let body = format!("{}\n| tests | pass |\n{}", GATES_START, GATES_END);
        assert!(LedgerDocument::parse(&body).is_err());
    }

    #[test]
    fn test_escaped_pipe_stays_in_evidence_cell() {
        let parsed = LedgerDocument::parse(&sample().render()).unwrap();
        assert_eq!(parsed.outcome("docs").unwrap().evidence, "docs: a \\| b");
    }

    #[test]
    fn test_absorb_merges_per_gate_and_hops() {
        let mut a = LedgerDocument::new("abc1234");
        a.upsert(outcome("format", GateStatus::Pass, "format: clean", 1));
        a.append_hop(HopEntry::new("format", "attempt 1: pass"));

        let mut b = LedgerDocument::new("abc1234");
        b.upsert(outcome("tests", GateStatus::Pass, "tests: 3/3 pass", 1));
        b.append_hop(HopEntry::new("tests", "attempt 1: pass"));

        a.absorb(b.clone());
        assert_eq!(a.gates.len(), 2);
        assert_eq!(a.hops.len(), 2);

        // absorbing the same copy twice adds nothing
        a.absorb(b);
        assert_eq!(a.hops.len(), 2);
    }

    #[test]
    fn test_absorb_ignores_gates_of_other_head() {
        let mut a = LedgerDocument::new("abc1234");
        let mut b = LedgerDocument::new("0000000");
        b.upsert(outcome("tests", GateStatus::Pass, "tests: 3/3 pass", 1));
        a.absorb(b);
        assert!(a.gates.is_empty());
    }

    #[test]
    fn test_hop_log_keeps_newest_entries() {
        let mut doc = LedgerDocument::new("abc1234");
        for i in 0..MAX_HOPS + 30 {
            doc.append_hop(HopEntry::new("tests", &format!("attempt {}: fail", i)));
        }
        assert_eq!(doc.hops.len(), MAX_HOPS);
        assert_eq!(doc.hops_elided, 30);
        assert_eq!(doc.hops[0].summary, "attempt 30: fail");

        let rendered = doc.render();
        assert!(rendered.contains("_30 earlier hops elided._"));
        let parsed = LedgerDocument::parse(&rendered).unwrap();
        assert_eq!(parsed.hops_elided, 30);
        assert_eq!(parsed.hops.len(), MAX_HOPS);
    }

    #[test]
    fn test_long_hop_summary_is_truncated() {
        let hop = HopEntry::new("tests", &"x".repeat(2000));
        assert_eq!(hop.summary.chars().count(), MAX_HOP_SUMMARY_CHARS);
        assert!(hop.summary.ends_with("..."));
    }

    #[test]
    fn test_injected_anchors_are_rendered_inert() {
        let mut doc = LedgerDocument::new("abc1234");
        doc.upsert(outcome("docs", GateStatus::Pass, "docs: mentions <!--gates:end--> literally", 1));
        doc.append_hop(HopEntry::new("docs", "saw <!--hops:end--> in output"));
        doc.decision = Some(DecisionBlock::new("blocked", "reason <!--decision:end-->", None));

        let parsed = LedgerDocument::parse(&doc.render()).unwrap();
        assert_eq!(
            parsed.outcome("docs").unwrap().evidence,
            "docs: mentions &lt;!--gates:end--&gt; literally"
        );
        assert_eq!(parsed.hops.len(), 1);
        assert_eq!(parsed.hops[0].summary, "saw &lt;!--hops:end--&gt; in output");
        assert_eq!(
            parsed.decision.unwrap().reasoning,
            "reason &lt;!--decision:end--&gt;"
        );
    }

    #[test]
    fn test_hop_summary_is_flattened() {
        let hop = HopEntry::new("tests", "line one\nline two");
        assert_eq!(hop.summary, "line one line two");
    }
}
