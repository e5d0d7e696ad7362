//! Per-gate evidence grammars.
//!
//! Each grammar owns one or more line shapes:
//! - `test_counts`: `<label>: <passed>/<total> pass`
//! - `audit`: `<label>: audit: clean` or `advisories: <ID>, <ID>, remediated`
//! - `warnings`: `<label>: <n> warnings`
//! - `freshness`: `base: <sha>, up-to-date` or `base: <sha>, behind <n>`
//! - `summary`: `<label>: <free text>`
//!
//! Every grammar also accepts the universal `skipped (<reason>)` and
//! `error: <message>` forms. Delimiter escaping and length checks live in
//! the codec; this module sees already-unescaped text.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static SKIPPED_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^skipped \((.+)\)$").unwrap());

static ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^error: (.+)$").unwrap());

static TEST_COUNTS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+): (\d+)/(\d+) pass$").unwrap());

static AUDIT_CLEAN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+): audit: clean$").unwrap());

static ADVISORIES_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^advisories: (.+), remediated$").unwrap());

static ADVISORY_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

static WARNINGS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+): (\d+) warnings?$").unwrap());

static FRESHNESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^base: ([0-9a-f]{7,40}), (?:(up-to-date)|behind (\d+))$").unwrap()
});

static SUMMARY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^:]+): (.+)$").unwrap());

/// The evidence grammar a gate declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grammar {
    TestCounts,
    Audit,
    Warnings,
    Freshness,
    #[default]
    Summary,
}

impl std::fmt::Display for Grammar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Grammar::TestCounts => write!(f, "test_counts"),
            Grammar::Audit => write!(f, "audit"),
            Grammar::Warnings => write!(f, "warnings"),
            Grammar::Freshness => write!(f, "freshness"),
            Grammar::Summary => write!(f, "summary"),
        }
    }
}

impl std::str::FromStr for Grammar {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "test_counts" | "tests" => Ok(Grammar::TestCounts),
            "audit" | "security" => Ok(Grammar::Audit),
            "warnings" => Ok(Grammar::Warnings),
            "freshness" => Ok(Grammar::Freshness),
            "summary" => Ok(Grammar::Summary),
            _ => anyhow::bail!(
                "Invalid grammar '{}'. Valid values: test_counts, audit, warnings, freshness, summary",
                s
            ),
        }
    }
}

/// Structured evidence, the decoded form of an evidence string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    TestCounts { label: String, passed: u32, total: u32 },
    AuditClean { label: String },
    Advisories { ids: Vec<String> },
    Warnings { label: String, count: u32 },
    /// `behind == 0` renders as `up-to-date`.
    Freshness { base: String, behind: u32 },
    Summary { label: String, text: String },
    Skipped { reason: String },
    Error { message: String },
}

impl Evidence {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Evidence::TestCounts { .. } => "test_counts",
            Evidence::AuditClean { .. } => "audit_clean",
            Evidence::Advisories { .. } => "advisories",
            Evidence::Warnings { .. } => "warnings",
            Evidence::Freshness { .. } => "freshness",
            Evidence::Summary { .. } => "summary",
            Evidence::Skipped { .. } => "skipped",
            Evidence::Error { .. } => "error",
        }
    }

    /// Whether `grammar` is allowed to write this evidence.
    pub fn fits(&self, grammar: Grammar) -> bool {
        match self {
            Evidence::Skipped { .. } | Evidence::Error { .. } => true,
            Evidence::TestCounts { .. } => grammar == Grammar::TestCounts,
            Evidence::AuditClean { .. } | Evidence::Advisories { .. } => grammar == Grammar::Audit,
            Evidence::Warnings { .. } => grammar == Grammar::Warnings,
            Evidence::Freshness { .. } => grammar == Grammar::Freshness,
            Evidence::Summary { .. } => grammar == Grammar::Summary,
        }
    }
}

/// Render evidence as an unescaped line.
pub(crate) fn format_line(evidence: &Evidence) -> String {
    match evidence {
        Evidence::TestCounts {
            label,
            passed,
            total,
        } => format!("{}: {}/{} pass", label, passed, total),
        Evidence::AuditClean { label } => format!("{}: audit: clean", label),
        Evidence::Advisories { ids } => format!("advisories: {}, remediated", ids.join(", ")),
        Evidence::Warnings { label, count } => {
            let noun = if *count == 1 { "warning" } else { "warnings" };
            format!("{}: {} {}", label, count, noun)
        }
        Evidence::Freshness { base, behind } => {
            if *behind == 0 {
                format!("base: {}, up-to-date", base)
            } else {
                format!("base: {}, behind {}", base, behind)
            }
        }
        Evidence::Summary { label, text } => format!("{}: {}", label, text),
        Evidence::Skipped { reason } => format!("skipped ({})", reason),
        Evidence::Error { message } => format!("error: {}", message),
    }
}

/// Parse an unescaped line under `grammar`. Returns `None` when no shape matches.
pub(crate) fn parse_line(grammar: Grammar, line: &str) -> Option<Evidence> {
    if let Some(cap) = SKIPPED_REGEX.captures(line) {
        let reason = cap[1].trim();
        if !reason.is_empty() {
            return Some(Evidence::skipped(reason));
        }
        return None;
    }

    // "error: ..." is universal, but a summary gate labelled "error" would be
    // ambiguous; the universal form wins.
    if let Some(cap) = ERROR_REGEX.captures(line) {
        let message = cap[1].trim();
        if !message.is_empty() {
            return Some(Evidence::error(message));
        }
        return None;
    }

    match grammar {
        Grammar::TestCounts => {
            let cap = TEST_COUNTS_REGEX.captures(line)?;
            Some(Evidence::TestCounts {
                label: cap[1].to_string(),
                passed: cap[2].parse().ok()?,
                total: cap[3].parse().ok()?,
            })
        }
        Grammar::Audit => {
            if let Some(cap) = AUDIT_CLEAN_REGEX.captures(line) {
                return Some(Evidence::AuditClean {
                    label: cap[1].to_string(),
                });
            }
            let cap = ADVISORIES_REGEX.captures(line)?;
            let ids: Vec<String> = cap[1].split(", ").map(|s| s.to_string()).collect();
            if ids.iter().all(|id| ADVISORY_ID_REGEX.is_match(id)) {
                Some(Evidence::Advisories { ids })
            } else {
                None
            }
        }
        Grammar::Warnings => {
            let cap = WARNINGS_REGEX.captures(line)?;
            let count: u32 = cap[2].parse().ok()?;
            // "1 warnings" and "2 warning" are rejected so encode stays canonical
            let plural = line.ends_with("warnings");
            if (count == 1) == plural {
                return None;
            }
            Some(Evidence::Warnings {
                label: cap[1].to_string(),
                count,
            })
        }
        Grammar::Freshness => {
            let cap = FRESHNESS_REGEX.captures(line)?;
            let behind = match cap.get(3) {
                Some(n) => {
                    let n: u32 = n.as_str().parse().ok()?;
                    if n == 0 {
                        return None;
                    }
                    n
                }
                None => 0,
            };
            Some(Evidence::Freshness {
                base: cap[1].to_string(),
                behind,
            })
        }
        Grammar::Summary => {
            let cap = SUMMARY_REGEX.captures(line)?;
            let text = cap[2].trim();
            if text.is_empty() {
                return None;
            }
            Some(Evidence::Summary {
                label: cap[1].to_string(),
                text: text.to_string(),
            })
        }
    }
}

/// Extract the reason from a `skipped (<reason>)` line, if it is one.
pub fn skip_reason(line: &str) -> Option<&str> {
    SKIPPED_REGEX
        .captures(line)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().trim())
        .filter(|r| !r.is_empty())
}

/// Validate a label: non-empty, trimmed, no `:`.
pub(crate) fn valid_label(label: &str) -> bool {
    !label.is_empty() && label.trim() == label && !label.contains(':')
}

/// Validate an advisory identifier.
pub(crate) fn valid_advisory_id(id: &str) -> bool {
    ADVISORY_ID_REGEX.is_match(id)
}

/// Validate a hex commit prefix used as a freshness base.
pub(crate) fn valid_base(base: &str) -> bool {
    (7..=40).contains(&base.len()) && base.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_test_counts() {
        let ev = parse_line(Grammar::TestCounts, "tests: 295/295 pass").unwrap();
        assert_eq!(
            ev,
            Evidence::TestCounts {
                label: "tests".into(),
                passed: 295,
                total: 295
            }
        );
    }

    #[test]
    fn test_parse_test_counts_rejects_other_shapes() {
        assert!(parse_line(Grammar::TestCounts, "tests: all pass").is_none());
        assert!(parse_line(Grammar::TestCounts, "tests: 3/4").is_none());
    }

    #[test]
    fn test_parse_audit_clean_and_advisories() {
        assert_eq!(
            parse_line(Grammar::Audit, "cargo: audit: clean"),
            Some(Evidence::AuditClean {
                label: "cargo".into()
            })
        );
        assert_eq!(
            parse_line(
                Grammar::Audit,
                "advisories: RUSTSEC-2024-0001, CVE-2023-1234, remediated"
            ),
            Some(Evidence::Advisories {
                ids: vec!["RUSTSEC-2024-0001".into(), "CVE-2023-1234".into()]
            })
        );
    }

    #[test]
    fn test_parse_advisories_rejects_bad_ids() {
        assert!(parse_line(Grammar::Audit, "advisories: bad id, remediated").is_none());
    }

    #[test]
    fn test_parse_warnings_plurality() {
        assert_eq!(
            parse_line(Grammar::Warnings, "clippy: 0 warnings"),
            Some(Evidence::Warnings {
                label: "clippy".into(),
                count: 0
            })
        );
        assert!(parse_line(Grammar::Warnings, "clippy: 1 warning").is_some());
        assert!(parse_line(Grammar::Warnings, "clippy: 1 warnings").is_none());
        assert!(parse_line(Grammar::Warnings, "clippy: 2 warning").is_none());
    }

    #[test]
    fn test_parse_freshness() {
        assert_eq!(
            parse_line(Grammar::Freshness, "base: abc1234, up-to-date"),
            Some(Evidence::Freshness {
                base: "abc1234".into(),
                behind: 0
            })
        );
        assert_eq!(
            parse_line(Grammar::Freshness, "base: abc1234, behind 3"),
            Some(Evidence::Freshness {
                base: "abc1234".into(),
                behind: 3
            })
        );
        assert!(parse_line(Grammar::Freshness, "base: abc1234, behind 0").is_none());
        assert!(parse_line(Grammar::Freshness, "base: main, up-to-date").is_none());
    }

    #[test]
    fn test_universal_forms_accepted_by_every_grammar() {
        for grammar in [
            Grammar::TestCounts,
            Grammar::Audit,
            Grammar::Warnings,
            Grammar::Freshness,
            Grammar::Summary,
        ] {
            assert_eq!(
                parse_line(grammar, "skipped (no rust changes)"),
                Some(Evidence::skipped("no rust changes"))
            );
            assert_eq!(
                parse_line(grammar, "error: spawn failed"),
                Some(Evidence::error("spawn failed"))
            );
        }
    }

    #[test]
    fn test_empty_skip_reason_rejected() {
        assert!(parse_line(Grammar::Summary, "skipped ( )").is_none());
        assert_eq!(skip_reason("skipped ( )"), None);
        assert_eq!(skip_reason("skipped (docs only)"), Some("docs only"));
        assert_eq!(skip_reason("docs: ok"), None);
    }

    #[test]
    fn test_summary_keeps_colons_in_text() {
        assert_eq!(
            parse_line(Grammar::Summary, "api: additive: 2 new fns"),
            Some(Evidence::Summary {
                label: "api".into(),
                text: "additive: 2 new fns".into()
            })
        );
    }

    #[test]
    fn test_grammar_from_str_aliases() {
        assert_eq!("tests".parse::<Grammar>().unwrap(), Grammar::TestCounts);
        assert_eq!("SECURITY".parse::<Grammar>().unwrap(), Grammar::Audit);
        assert!("nope".parse::<Grammar>().is_err());
    }

    #[test]
    fn test_evidence_fits_grammar() {
        assert!(Evidence::skipped("x").fits(Grammar::Freshness));
        assert!(
            Evidence::AuditClean {
                label: "cargo".into()
            }
            .fits(Grammar::Audit)
        );
        assert!(
            !Evidence::Warnings {
                label: "clippy".into(),
                count: 0
            }
            .fits(Grammar::TestCounts)
        );
    }
}
