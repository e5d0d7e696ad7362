//! Stage routing.
//!
//! The routing table maps `(stage, outcome class)` to the next stage or to
//! the terminal state. It is validated once when built; a lookup that
//! still misses at runtime is a configuration defect and is never guessed.

use crate::errors::RoutingError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// Route target name for the terminal state.
pub const TERMINAL: &str = "terminal";

/// What a stage reports about the change it just looked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Clean,
    MechanicalFixApplied,
    NeedsSpecialist,
    ArchitecturalConcern,
    BreakingChangeDetected,
    PartialProgress,
}

impl OutcomeClass {
    pub const ALL: [OutcomeClass; 6] = [
        OutcomeClass::Clean,
        OutcomeClass::MechanicalFixApplied,
        OutcomeClass::NeedsSpecialist,
        OutcomeClass::ArchitecturalConcern,
        OutcomeClass::BreakingChangeDetected,
        OutcomeClass::PartialProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeClass::Clean => "clean",
            OutcomeClass::MechanicalFixApplied => "mechanical_fix_applied",
            OutcomeClass::NeedsSpecialist => "needs_specialist",
            OutcomeClass::ArchitecturalConcern => "architectural_concern",
            OutcomeClass::BreakingChangeDetected => "breaking_change_detected",
            OutcomeClass::PartialProgress => "partial_progress",
        }
    }
}

impl fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        OutcomeClass::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid outcome class '{}'. Valid values: {}",
                    s,
                    OutcomeClass::ALL.map(|c| c.as_str()).join(", ")
                )
            })
    }
}

/// Where control goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    Stage(String),
    Terminal,
}

impl RouteTarget {
    fn parse(target: &str) -> Self {
        if target == TERMINAL {
            RouteTarget::Terminal
        } else {
            RouteTarget::Stage(target.to_string())
        }
    }
}

impl fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteTarget::Stage(id) => f.write_str(id),
            RouteTarget::Terminal => f.write_str(TERMINAL),
        }
    }
}

/// Declared routes of one stage, before validation.
#[derive(Debug, Clone, Default)]
pub struct StageRoutes {
    pub stage_id: String,
    /// Outcome classes the stage may report.
    pub outcomes: Vec<String>,
    /// Outcome class name to stage id or [`TERMINAL`].
    pub routes: BTreeMap<String, String>,
    pub escalation: Option<String>,
}

#[derive(Debug, Clone)]
struct CompiledStage {
    routes: HashMap<OutcomeClass, RouteTarget>,
    escalation: Option<String>,
}

/// Validated routing table.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    entry: String,
    order: Vec<String>,
    stages: HashMap<String, CompiledStage>,
    default_escalation: Option<String>,
}

impl RoutingTable {
    /// Validate and compile the declared routes.
    ///
    /// Every declared outcome must be mapped, every route key must be a
    /// declared outcome, every target and escalation stage must exist, and
    /// so must the entry stage.
    pub fn build(
        entry: &str,
        stages: Vec<StageRoutes>,
        default_escalation: Option<&str>,
    ) -> Result<Self, RoutingError> {
        let mut order = Vec::new();
        for stage in &stages {
            if stage.stage_id == TERMINAL || order.contains(&stage.stage_id) {
                return Err(RoutingError::DuplicateStage(stage.stage_id.clone()));
            }
            order.push(stage.stage_id.clone());
        }
        let known = |id: &str| order.iter().any(|s| s == id);

        if !known(entry) {
            return Err(RoutingError::UnknownStage(entry.to_string()));
        }
        if let Some(esc) = default_escalation
            && !known(esc)
        {
            return Err(RoutingError::MissingEscalation(esc.to_string()));
        }

        let mut compiled = HashMap::new();
        for stage in stages {
            let mut declared = Vec::new();
            for name in &stage.outcomes {
                let class = parse_outcome(&stage.stage_id, name)?;
                declared.push(class);
            }

            let mut routes = HashMap::new();
            for (name, target) in &stage.routes {
                let class = parse_outcome(&stage.stage_id, name)?;
                if !declared.contains(&class) {
                    return Err(RoutingError::UndeclaredOutcome {
                        stage: stage.stage_id.clone(),
                        outcome: class.to_string(),
                    });
                }
                let target = RouteTarget::parse(target);
                if let RouteTarget::Stage(id) = &target
                    && !known(id)
                {
                    return Err(RoutingError::UnknownStage(id.clone()));
                }
                routes.insert(class, target);
            }

            if let Some(missing) = declared.iter().find(|c| !routes.contains_key(*c)) {
                return Err(RoutingError::UnmappedRoute {
                    stage: stage.stage_id.clone(),
                    outcome: missing.to_string(),
                });
            }
            if let Some(esc) = &stage.escalation
                && !known(esc)
            {
                return Err(RoutingError::MissingEscalation(esc.clone()));
            }

            compiled.insert(
                stage.stage_id,
                CompiledStage {
                    routes,
                    escalation: stage.escalation,
                },
            );
        }

        Ok(Self {
            entry: entry.to_string(),
            order,
            stages: compiled,
            default_escalation: default_escalation.map(str::to_string),
        })
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Stage ids in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn contains(&self, stage_id: &str) -> bool {
        self.stages.contains_key(stage_id)
    }

    /// Next step after `stage_id` reported `outcome`.
    pub fn route(&self, stage_id: &str, outcome: OutcomeClass) -> Result<RouteTarget, RoutingError> {
        let stage = self
            .stages
            .get(stage_id)
            .ok_or_else(|| RoutingError::UnknownStage(stage_id.to_string()))?;
        stage
            .routes
            .get(&outcome)
            .cloned()
            .ok_or_else(|| RoutingError::UnmappedRoute {
                stage: stage_id.to_string(),
                outcome: outcome.to_string(),
            })
    }

    /// Escalation stage for `stage_id`: its own, else the default.
    pub fn escalation_for(&self, stage_id: &str) -> Option<&str> {
        self.stages
            .get(stage_id)
            .and_then(|s| s.escalation.as_deref())
            .or(self.default_escalation.as_deref())
            .filter(|esc| *esc != stage_id)
    }
}

fn parse_outcome(stage_id: &str, name: &str) -> Result<OutcomeClass, RoutingError> {
    name.parse().map_err(|_| RoutingError::UndeclaredOutcome {
        stage: stage_id.to_string(),
        outcome: name.to_string(),
    })
}
