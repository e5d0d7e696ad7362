//! Evidence encoding and decoding against per-gate grammars.

use super::grammar::{self, Evidence, Grammar};
use crate::errors::EvidenceError;
use std::collections::HashMap;

/// Default upper bound on evidence length, in characters.
pub const DEFAULT_MAX_EVIDENCE_LEN: usize = 160;

/// Column delimiter of the ledger's gates table.
const DELIMITER: char = '|';

const COMMENT_OPEN: &str = "<!--";
const COMMENT_CLOSE: &str = "-->";

/// Encodes and decodes evidence strings for a fixed set of gates.
///
/// Gates without a declared grammar fall back to [`Grammar::Summary`].
#[derive(Debug, Clone)]
pub struct EvidenceCodec {
    grammars: HashMap<String, Grammar>,
    max_len: usize,
}

impl Default for EvidenceCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVIDENCE_LEN)
    }
}

impl EvidenceCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            grammars: HashMap::new(),
            max_len,
        }
    }

    /// Declare the grammar for a gate.
    pub fn with_grammar(mut self, gate_id: &str, grammar: Grammar) -> Self {
        self.grammars.insert(gate_id.to_string(), grammar);
        self
    }

    pub fn grammar_for(&self, gate_id: &str) -> Grammar {
        self.grammars.get(gate_id).copied().unwrap_or_default()
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Render structured evidence for `gate_id` as a table-safe line.
    pub fn encode(&self, gate_id: &str, evidence: &Evidence) -> Result<String, EvidenceError> {
        let grammar = self.grammar_for(gate_id);
        if !evidence.fits(grammar) {
            return Err(EvidenceError::GrammarMismatch {
                gate: gate_id.to_string(),
                grammar: grammar.to_string(),
                kind: evidence.kind().to_string(),
            });
        }
        validate_fields(gate_id, evidence)?;

        let line = grammar::format_line(evidence);
        // Some field values produce a line another shape claims first
        // (a summary labelled "skipped (x" for instance).
        if grammar::parse_line(grammar, &line).as_ref() != Some(evidence) {
            return Err(EvidenceError::Invalid {
                gate: gate_id.to_string(),
                message: format!("'{}' would not decode back to the same evidence", line),
            });
        }

        let encoded = escape(&line);
        self.check_shape(gate_id, &encoded)?;
        Ok(encoded)
    }

    /// Parse an evidence line for `gate_id`.
    pub fn decode(&self, gate_id: &str, input: &str) -> Result<Evidence, EvidenceError> {
        self.check_shape(gate_id, input)?;
        let grammar = self.grammar_for(gate_id);
        let line = unescape(input);
        let evidence =
            grammar::parse_line(grammar, &line).ok_or_else(|| EvidenceError::Malformed {
                gate: gate_id.to_string(),
                grammar: grammar.to_string(),
                input: input.to_string(),
            })?;
        validate_fields(gate_id, &evidence)?;
        Ok(evidence)
    }

    /// Build an always-valid `error: <message>` line, flattening and
    /// truncating the message so the result fits the length budget.
    pub fn error_line(&self, message: &str) -> String {
        let flattened = message.split_whitespace().collect::<Vec<_>>().join(" ");
        let flattened = if flattened.is_empty() {
            "unknown error".to_string()
        } else {
            flattened
        };
        let prefix = "error: ";
        let budget = self.max_len.saturating_sub(prefix.len()).max(1);
        let mut body = escape(&defuse_markers(&flattened));
        if body.chars().count() > budget {
            let keep = budget.saturating_sub(3);
            body = body.chars().take(keep).collect();
            // never leave a dangling escape
            if body.ends_with('\\') {
                body.pop();
            }
            body.push_str("...");
        }
        format!("{}{}", prefix, body)
    }

    /// The shared invariants: single line, non-empty, bounded, no bare
    /// delimiter and no comment markers (the ledger's anchors are comments).
    fn check_shape(&self, gate_id: &str, input: &str) -> Result<(), EvidenceError> {
        if input.trim().is_empty() {
            return Err(EvidenceError::Empty {
                gate: gate_id.to_string(),
            });
        }
        if input.contains('\n') || input.contains('\r') {
            return Err(EvidenceError::MultiLine {
                gate: gate_id.to_string(),
            });
        }
        let len = input.chars().count();
        if len > self.max_len {
            return Err(EvidenceError::TooLong {
                gate: gate_id.to_string(),
                len,
                max: self.max_len,
            });
        }
        if has_unescaped_delimiter(input) {
            return Err(EvidenceError::UnescapedDelimiter {
                gate: gate_id.to_string(),
            });
        }
        if input.contains(COMMENT_OPEN) || input.contains(COMMENT_CLOSE) {
            return Err(EvidenceError::CommentMarker {
                gate: gate_id.to_string(),
            });
        }
        Ok(())
    }
}

fn validate_fields(gate_id: &str, evidence: &Evidence) -> Result<(), EvidenceError> {
    let invalid = |message: &str| EvidenceError::Invalid {
        gate: gate_id.to_string(),
        message: message.to_string(),
    };
    match evidence {
        Evidence::TestCounts {
            label,
            passed,
            total,
        } => {
            if !grammar::valid_label(label) {
                return Err(invalid("label must be non-empty, trimmed and free of ':'"));
            }
            if passed > total {
                return Err(invalid("passed count exceeds total"));
            }
        }
        Evidence::AuditClean { label } | Evidence::Warnings { label, .. } => {
            if !grammar::valid_label(label) {
                return Err(invalid("label must be non-empty, trimmed and free of ':'"));
            }
        }
        Evidence::Advisories { ids } => {
            if ids.is_empty() {
                return Err(invalid("advisory list is empty"));
            }
            if !ids.iter().all(|id| grammar::valid_advisory_id(id)) {
                return Err(invalid("advisory ids must be alphanumeric identifiers"));
            }
        }
        Evidence::Freshness { base, .. } => {
            if !grammar::valid_base(base) {
                return Err(invalid("base must be a 7-40 char lowercase hex sha"));
            }
        }
        Evidence::Summary { label, text } => {
            if !grammar::valid_label(label) {
                return Err(invalid("label must be non-empty, trimmed and free of ':'"));
            }
            if text.is_empty() || text.trim() != text {
                return Err(invalid("summary text must be non-empty and trimmed"));
            }
        }
        Evidence::Skipped { reason } => {
            if reason.is_empty() || reason.trim() != reason {
                return Err(invalid("skip reason must be non-empty and trimmed"));
            }
        }
        Evidence::Error { message } => {
            if message.is_empty() || message.trim() != message {
                return Err(invalid("error message must be non-empty and trimmed"));
            }
        }
    }
    Ok(())
}

/// Escape the table delimiter.
pub fn escape(text: &str) -> String {
    text.replace(DELIMITER, "\\|")
}

/// Reverse [`escape`].
pub fn unescape(text: &str) -> String {
    text.replace("\\|", "|")
}

/// Replace HTML comment markers with their entity-escaped form, which
/// renders the same in markdown but can never close or open an anchor.
pub fn defuse_markers(text: &str) -> String {
    text.replace(COMMENT_OPEN, "&lt;!--")
        .replace(COMMENT_CLOSE, "--&gt;")
}

fn has_unescaped_delimiter(text: &str) -> bool {
    let mut prev = None;
    for ch in text.chars() {
        if ch == DELIMITER && prev != Some('\\') {
            return true;
        }
        prev = Some(ch);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> EvidenceCodec {
        EvidenceCodec::default()
            .with_grammar("tests", Grammar::TestCounts)
            .with_grammar("security", Grammar::Audit)
            .with_grammar("clippy", Grammar::Warnings)
            .with_grammar("freshness", Grammar::Freshness)
    }

    #[test]
    fn test_round_trip_law_for_each_grammar() {
        let codec = codec();
        let cases = vec![
            (
                "tests",
                Evidence::TestCounts {
                    label: "tests".into(),
                    passed: 295,
                    total: 295,
                },
            ),
            (
                "security",
                Evidence::AuditClean {
                    label: "cargo".into(),
                },
            ),
            (
                "security",
                Evidence::Advisories {
                    ids: vec!["RUSTSEC-2024-0001".into()],
                },
            ),
            (
                "clippy",
                Evidence::Warnings {
                    label: "clippy".into(),
                    count: 1,
                },
            ),
            (
                "freshness",
                Evidence::Freshness {
                    base: "0123abcd".into(),
                    behind: 0,
                },
            ),
            (
                "docs",
                Evidence::Summary {
                    label: "docs".into(),
                    text: "a | b".into(),
                },
            ),
            ("docs", Evidence::skipped("no public api change")),
            ("tests", Evidence::error("runner crashed")),
        ];
        for (gate, evidence) in cases {
            let encoded = codec.encode(gate, &evidence).unwrap();
            assert_eq!(codec.decode(gate, &encoded).unwrap(), evidence, "{}", encoded);
        }
    }

    #[test]
    fn test_encode_escapes_delimiter() {
        let codec = codec();
        let encoded = codec
            .encode(
                "docs",
                &Evidence::Summary {
                    label: "docs".into(),
                    text: "a|b".into(),
                },
            )
            .unwrap();
        assert_eq!(encoded, "docs: a\\|b");
    }

    #[test]
    fn test_decode_rejects_unescaped_delimiter() {
        let err = codec().decode("docs", "docs: a|b").unwrap_err();
        assert!(matches!(err, EvidenceError::UnescapedDelimiter { .. }));
    }

    #[test]
    fn test_decode_rejects_multi_line() {
        let err = codec().decode("tests", "tests: 1/1 pass\nmore").unwrap_err();
        assert!(matches!(err, EvidenceError::MultiLine { .. }));
    }

    #[test]
    fn test_decode_rejects_too_long() {
        let codec = EvidenceCodec::new(20);
        let err = codec
            .decode("docs", "docs: this is far longer than twenty chars")
            .unwrap_err();
        assert!(matches!(err, EvidenceError::TooLong { max: 20, .. }));
    }

    #[test]
    fn test_decode_rejects_empty() {
        assert!(matches!(
            codec().decode("docs", "   ").unwrap_err(),
            EvidenceError::Empty { .. }
        ));
    }

    #[test]
    fn test_decode_malformed_for_grammar() {
        let err = codec().decode("tests", "tests: looked fine").unwrap_err();
        match err {
            EvidenceError::Malformed { gate, grammar, .. } => {
                assert_eq!(gate, "tests");
                assert_eq!(grammar, "test_counts");
            }
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_passed_over_total() {
        let err = codec().decode("tests", "tests: 5/4 pass").unwrap_err();
        assert!(matches!(err, EvidenceError::Invalid { .. }));
    }

    #[test]
    fn test_encode_rejects_grammar_mismatch() {
        let err = codec()
            .encode(
                "tests",
                &Evidence::Warnings {
                    label: "clippy".into(),
                    count: 0,
                },
            )
            .unwrap_err();
        assert!(matches!(err, EvidenceError::GrammarMismatch { .. }));
    }

    #[test]
    fn test_encode_rejects_ambiguous_summary() {
        let err = codec()
            .encode(
                "docs",
                &Evidence::Summary {
                    label: "skipped (x".into(),
                    text: "y)".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, EvidenceError::Invalid { .. }));
    }

    #[test]
    fn test_unknown_gate_uses_summary_grammar() {
        let codec = codec();
        assert_eq!(codec.grammar_for("perf"), Grammar::Summary);
        assert!(codec.decode("perf", "perf: no regressions").is_ok());
    }

    #[test]
    fn test_error_line_is_always_decodable() {
        let codec = EvidenceCodec::new(40);
        let line = codec.error_line("first line\nsecond | line with a lot of extra words");
        assert!(line.chars().count() <= 40, "{}", line);
        assert!(line.starts_with("error: "));
        assert!(codec.decode("tests", &line).is_ok(), "{}", line);
    }

    #[test]
    fn test_decode_rejects_comment_markers() {
        let codec = codec();
        for input in ["docs: mentions <!--gates:end--> literally", "docs: x -->", "docs: <!-- y"] {
            let err = codec.decode("docs", input).unwrap_err();
            assert!(matches!(err, EvidenceError::CommentMarker { .. }), "{}", input);
        }
    }

    #[test]
    fn test_encode_rejects_comment_markers() {
        let err = codec()
            .encode(
                "docs",
                &Evidence::Summary {
                    label: "docs".into(),
                    text: "see <!--hops:start-->".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, EvidenceError::CommentMarker { .. }));
    }

    #[test]
    fn test_error_line_defuses_comment_markers() {
        let codec = EvidenceCodec::default();
        let line = codec.error_line("stage printed <!--gates:end--> and <!-- x -->");
        assert!(!line.contains("<!--") && !line.contains("-->"), "{}", line);
        assert!(line.contains("&lt;!--gates:end--&gt;"), "{}", line);
        assert!(codec.decode("tests", &line).is_ok(), "{}", line);
    }

    #[test]
    fn test_defuse_markers() {
        assert_eq!(defuse_markers("a <!--> b"), "a &lt;!--&gt; b");
        assert_eq!(defuse_markers("a --> b"), "a --&gt; b");
        assert_eq!(defuse_markers("plain - text"), "plain - text");
    }

    #[test]
    fn test_error_line_empty_message() {
        let codec = EvidenceCodec::default();
        assert_eq!(codec.error_line("  \n "), "error: unknown error");
    }
}
