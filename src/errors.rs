//! Typed error hierarchy for the gatehouse orchestrator.
//!
//! One enum per subsystem:
//! - `EvidenceError` — malformed evidence strings (always fail-closed)
//! - `RegistryError` — gate catalog lookups
//! - `LedgerError` — ledger comment reads and compare-and-retry writes
//! - `RoutingError` — routing table defects (fatal, never guessed)
//! - `StageError` — failures of an external stage collaborator
//! - `PipelineError` — controller-level failures surfaced to the caller

use thiserror::Error;

/// Errors from decoding or encoding an evidence string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvidenceError {
    #[error("evidence for gate '{gate}' is empty")]
    Empty { gate: String },

    #[error("evidence for gate '{gate}' spans multiple lines")]
    MultiLine { gate: String },

    #[error("evidence for gate '{gate}' is {len} chars, limit is {max}")]
    TooLong { gate: String, len: usize, max: usize },

    #[error("evidence for gate '{gate}' contains an unescaped '|'")]
    UnescapedDelimiter { gate: String },

    #[error("evidence for gate '{gate}' contains an HTML comment marker")]
    CommentMarker { gate: String },

    #[error("evidence for gate '{gate}' does not match the {grammar} grammar: {input}")]
    Malformed {
        gate: String,
        grammar: String,
        input: String,
    },

    #[error("evidence for gate '{gate}' is inconsistent: {message}")]
    Invalid { gate: String, message: String },

    #[error("evidence kind {kind} cannot be written by the {grammar} grammar of gate '{gate}'")]
    GrammarMismatch {
        gate: String,
        grammar: String,
        kind: String,
    },
}

/// Errors from the gate registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("gate '{0}' is not registered")]
    NotFound(String),

    #[error("gate '{0}' is declared more than once")]
    Duplicate(String),
}

/// Errors from the ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger for {pr} changed concurrently on every one of {attempts} attempts")]
    ConcurrentEditConflict { pr: String, attempts: u32 },

    #[error("ledger comment for {pr} is malformed: {message}")]
    Malformed { pr: String, message: String },

    #[error("ledger comment for {pr} would be {len} chars, the host accepts {max}")]
    TooLarge { pr: String, len: usize, max: usize },

    #[error("comment host error: {0}")]
    Host(#[source] anyhow::Error),
}

/// Configuration defects in the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no route declared for stage '{stage}' with outcome '{outcome}'")]
    UnmappedRoute { stage: String, outcome: String },

    #[error("stage '{0}' is not declared")]
    UnknownStage(String),

    #[error("route from stage '{stage}' uses outcome '{outcome}' which the stage does not declare")]
    UndeclaredOutcome { stage: String, outcome: String },

    #[error("stage '{stage}' declares gate '{gate}' which is not registered")]
    UnknownGate { stage: String, gate: String },

    #[error("escalation stage '{0}' is not declared")]
    MissingEscalation(String),

    #[error("stage '{0}' is declared more than once")]
    DuplicateStage(String),
}

/// Failures of an external stage collaborator. The controller turns every
/// variant into a `Fail` outcome with `error: <message>` evidence.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("failed to spawn stage command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("stage timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("stage exited with code {code} without a report")]
    NonZeroExit { code: i32 },

    #[error("stage report is malformed: {0}")]
    MalformedReport(String),

    #[error("stage was cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the pipeline controller.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("run for {pr} at {head} was superseded by a newer head commit")]
    Superseded { pr: String, head: String },

    #[error("check-run emission failed: {0}")]
    Checks(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether this error means the result must be discarded rather than reported.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evidence_error_too_long_carries_sizes() {
        let err = EvidenceError::TooLong {
            gate: "tests".into(),
            len: 200,
            max: 160,
        };
        let msg = err.to_string();
        assert!(msg.contains("200"));
        assert!(msg.contains("160"));
        assert!(msg.contains("tests"));
    }

    #[test]
    fn ledger_conflict_is_matchable() {
        let err = LedgerError::ConcurrentEditConflict {
            pr: "o/r#1".into(),
            attempts: 3,
        };
        match &err {
            LedgerError::ConcurrentEditConflict { attempts, .. } => assert_eq!(*attempts, 3),
            _ => panic!("Expected ConcurrentEditConflict"),
        }
    }

    #[test]
    fn pipeline_error_converts_from_routing_error() {
        let inner = RoutingError::UnmappedRoute {
            stage: "tests".into(),
            outcome: "partial_progress".into(),
        };
        let err: PipelineError = inner.into();
        match &err {
            PipelineError::Routing(RoutingError::UnmappedRoute { stage, .. }) => {
                assert_eq!(stage, "tests");
            }
            _ => panic!("Expected PipelineError::Routing(UnmappedRoute)"),
        }
        assert!(!err.is_superseded());
    }

    #[test]
    fn pipeline_error_superseded_flag() {
        let err = PipelineError::Superseded {
            pr: "o/r#7".into(),
            head: "abc".into(),
        };
        assert!(err.is_superseded());
        assert!(err.to_string().contains("o/r#7"));
    }

    #[test]
    fn stage_error_timeout_message() {
        let err = StageError::Timeout { secs: 30 };
        assert_eq!(err.to_string(), "stage timed out after 30s");
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&EvidenceError::Empty { gate: "x".into() });
        assert_std_error(&RegistryError::NotFound("x".into()));
        assert_std_error(&LedgerError::Malformed {
            pr: "x".into(),
            message: "y".into(),
        });
        assert_std_error(&RoutingError::UnknownStage("x".into()));
        assert_std_error(&StageError::Cancelled);
    }
}
