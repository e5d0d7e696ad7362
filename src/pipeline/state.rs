//! Controller state machine and run results.

use crate::ledger::HopEntry;
use crate::pull_request::PullRequestRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Where a pull request's pipeline stands.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    /// Waiting for a trigger
    #[default]
    Idle,
    /// A stage is running
    Evaluating { stage: String },
    /// A stage result is being written to the ledger and checks
    Recording { stage: String },
    /// A failed stage is about to run again
    Retrying { stage: String },
    /// Choosing the next stage from the routing table
    Routing { stage: String },
    /// Stopped; a human has to look
    Blocked { reason: String },
    /// Every required gate holds for the current head
    ReadyForPromotion,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked { .. } | Self::ReadyForPromotion)
    }

    /// Short label used in the decision block and receipts.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Evaluating { .. } => "evaluating",
            Self::Recording { .. } => "recording",
            Self::Retrying { .. } => "retrying",
            Self::Routing { .. } => "routing",
            Self::Blocked { .. } => "blocked",
            Self::ReadyForPromotion => "ready_for_promotion",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evaluating { stage }
            | Self::Recording { stage }
            | Self::Retrying { stage }
            | Self::Routing { stage } => write!(f, "{}({})", self.label(), stage),
            Self::Blocked { reason } => write!(f, "blocked: {}", reason),
            _ => f.write_str(self.label()),
        }
    }
}

/// Result of one pipeline run for one pull request head.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub pr: PullRequestRef,
    pub final_state: PipelineState,
    /// Hops appended during this run, in order.
    pub hops: Vec<HopEntry>,
    /// Evaluations per stage.
    pub attempts: BTreeMap<String, u32>,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl RunSummary {
    pub fn is_ready(&self) -> bool {
        self.final_state == PipelineState::ReadyForPromotion
    }

    pub fn total_attempts(&self) -> u32 {
        self.attempts.values().sum()
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(PipelineState::ReadyForPromotion.is_terminal());
        assert!(PipelineState::Blocked { reason: "x".into() }.is_terminal());
        assert!(!PipelineState::Idle.is_terminal());
        assert!(!PipelineState::Retrying { stage: "tests".into() }.is_terminal());
    }

    #[test]
    fn test_display() {
        let s = PipelineState::Evaluating {
            stage: "tests".into(),
        };
        assert_eq!(s.to_string(), "evaluating(tests)");
        assert_eq!(PipelineState::ReadyForPromotion.to_string(), "ready_for_promotion");
    }

    #[test]
    fn test_state_serializes_with_tag() {
        let json = serde_json::to_string(&PipelineState::Blocked {
            reason: "tests failed".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"blocked","reason":"tests failed"}"#);
    }
}
