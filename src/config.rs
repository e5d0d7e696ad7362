//! Configuration, read from `.gatehouse/gatehouse.toml`.
//!
//! Layered file → environment → CLI. The file declares the gates, the
//! stages that evaluate them and the routes between stages:
//!
//! ```toml
//! [project]
//! namespace = "gatehouse"
//!
//! [defaults]
//! max_attempts = 2
//! timeout_secs = 900
//!
//! [pipeline]
//! entry = "format"
//! escalation = "triage"
//!
//! [[gates]]
//! id = "tests"
//! grammar = "test_counts"
//!
//! [[stages]]
//! id = "tests"
//! gate = "tests"
//! command = "./scripts/gate-tests.sh"
//! outcomes = ["clean", "needs_specialist"]
//! routes = { clean = "terminal", needs_specialist = "triage" }
//!
//! [overrides."*-fix"]
//! max_attempts = 1
//! ```

use crate::checks::{CheckHost, CheckRunEmitter};
use crate::errors::{RegistryError, RoutingError};
use crate::evidence::EvidenceCodec;
use crate::gates::{Gate, GateRegistry};
use crate::ledger::{CommentHost, DEFAULT_CONFLICT_RETRIES, LedgerStore};
use crate::pipeline::{CommandStageRunner, PipelineController, StageBinding};
use crate::receipt::ReceiptWriter;
use crate::retry::RetryBudget;
use crate::router::{RoutingTable, StageRoutes, TERMINAL};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const CONFIG_DIR: &str = ".gatehouse";
pub const CONFIG_FILE: &str = "gatehouse.toml";
pub const DEFAULT_NAMESPACE: &str = "gatehouse";
pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Project-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Check-run namespace (`<namespace>:gate:<id>`)
    #[serde(default)]
    pub namespace: Option<String>,
    /// Where receipts are written, relative to the project directory
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubSection {
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

/// Defaults for every stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsSection {
    /// Re-entries allowed after a stage's first evaluation
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_evidence_len")]
    pub max_evidence_len: usize,
    /// Retries after a stale ledger write
    #[serde(default = "default_conflict_retries")]
    pub ledger_conflict_retries: u32,
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            timeout_secs: default_timeout_secs(),
            max_evidence_len: default_max_evidence_len(),
            ledger_conflict_retries: default_conflict_retries(),
        }
    }
}

fn default_max_attempts() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    900
}

fn default_max_evidence_len() -> usize {
    crate::evidence::DEFAULT_MAX_EVIDENCE_LEN
}

fn default_conflict_retries() -> u32 {
    DEFAULT_CONFLICT_RETRIES
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSection {
    /// First stage of every run
    #[serde(default)]
    pub entry: String,
    /// Escalation stage for stages that do not name their own
    #[serde(default)]
    pub escalation: Option<String>,
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageConfig {
    pub id: String,
    /// Gate this stage records; stages without one only log hops
    #[serde(default)]
    pub gate: Option<String>,
    pub command: String,
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub routes: BTreeMap<String, String>,
    #[serde(default)]
    pub escalation: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Stage settings matched by glob pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Resolved settings for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSettings {
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

/// The complete gatehouse.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatehouseToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub github: GithubSection,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub gates: Vec<Gate>,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub overrides: BTreeMap<String, StageOverride>,
}

impl GatehouseToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse gatehouse.toml")
    }

    /// Load `.gatehouse/gatehouse.toml`, or defaults when it does not exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize gatehouse.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn stage(&self, stage_id: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Effective settings: defaults, then matching overrides, then the
    /// stage's own values.
    pub fn stage_settings(&self, stage_id: &str) -> StageSettings {
        let mut settings = StageSettings {
            max_attempts: self.defaults.max_attempts,
            timeout_secs: self.defaults.timeout_secs,
        };
        for (pattern, over) in &self.overrides {
            if pattern_matches(pattern, stage_id) {
                if let Some(n) = over.max_attempts {
                    settings.max_attempts = n;
                }
                if let Some(t) = over.timeout_secs {
                    settings.timeout_secs = t;
                }
            }
        }
        if let Some(stage) = self.stage(stage_id) {
            if let Some(n) = stage.max_attempts {
                settings.max_attempts = n;
            }
            if let Some(t) = stage.timeout_secs {
                settings.timeout_secs = t;
            }
        }
        settings
    }

    pub fn build_registry(&self) -> Result<GateRegistry, RegistryError> {
        GateRegistry::new(self.gates.clone())
    }

    pub fn build_codec(&self) -> EvidenceCodec {
        self.gates
            .iter()
            .fold(EvidenceCodec::new(self.defaults.max_evidence_len), |codec, gate| {
                codec.with_grammar(&gate.id, gate.grammar)
            })
    }

    /// Validate and compile the routing table. Stages must also name only
    /// registered gates.
    pub fn build_routing(&self) -> Result<RoutingTable, RoutingError> {
        let registry = self.build_registry();
        for stage in &self.stages {
            if let Some(gate) = &stage.gate {
                let known = registry.as_ref().is_ok_and(|r| r.lookup(gate).is_ok());
                if !known {
                    return Err(RoutingError::UnknownGate {
                        stage: stage.id.clone(),
                        gate: gate.clone(),
                    });
                }
            }
        }
        let routes = self
            .stages
            .iter()
            .map(|s| StageRoutes {
                stage_id: s.id.clone(),
                outcomes: s.outcomes.clone(),
                routes: s.routes.clone(),
                escalation: s.escalation.clone(),
            })
            .collect();
        RoutingTable::build(
            &self.pipeline.entry,
            routes,
            self.pipeline.escalation.as_deref(),
        )
    }

    pub fn build_retry(&self) -> RetryBudget {
        self.stages
            .iter()
            .fold(RetryBudget::new(self.defaults.max_attempts), |budget, stage| {
                budget.with_ceiling(&stage.id, self.stage_settings(&stage.id).max_attempts)
            })
    }

    /// Validate and return warnings. Hard errors (routing defects, duplicate
    /// gates) are reported here too, prefixed with `error:`.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if let Err(e) = self.build_registry() {
            warnings.push(format!("error: {}", e));
        }
        if self.stages.is_empty() {
            warnings.push("No stages configured; run `gatehouse config init`".to_string());
        } else if let Err(e) = self.build_routing() {
            warnings.push(format!("error: {}", e));
        }

        if self.defaults.max_evidence_len < 20 {
            warnings.push(format!(
                "max_evidence_len {} is too small to hold useful evidence",
                self.defaults.max_evidence_len
            ));
        }
        if self.defaults.timeout_secs == 0 {
            warnings.push("timeout_secs = 0 makes every stage time out".to_string());
        }

        for stage in &self.stages {
            if stage.command.trim().is_empty() {
                warnings.push(format!("Stage '{}' has an empty command", stage.id));
            }
            if stage.outcomes.is_empty() {
                warnings.push(format!(
                    "Stage '{}' declares no outcomes; a passing run of it cannot be routed",
                    stage.id
                ));
            }
        }

        for gate in self.gates.iter().filter(|g| g.required) {
            if !self.stages.iter().any(|s| s.gate.as_deref() == Some(gate.id.as_str())) {
                warnings.push(format!(
                    "Required gate '{}' has no stage and will block every run",
                    gate.id
                ));
            }
        }

        for pattern in self.overrides.keys() {
            if !self.stages.iter().any(|s| pattern_matches(pattern, &s.id)) {
                warnings.push(format!("Override pattern '{}' matches no stage", pattern));
            }
        }

        warnings
    }
}

/// Case-insensitive glob match supporting `*` and `?`.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    glob_match(&pattern, &name)
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

/// Template written by `gatehouse config init`.
pub const DEFAULT_TEMPLATE: &str = r#"# Gatehouse pipeline configuration.
#
# Every stage command receives GATEHOUSE_OWNER, GATEHOUSE_REPO, GATEHOUSE_PR,
# GATEHOUSE_HEAD_SHA, GATEHOUSE_STAGE, GATEHOUSE_GATE and GATEHOUSE_ATTEMPT,
# plus the same context as JSON on stdin. It must print a JSON report:
#   {"status": "pass|fail|skipped", "evidence": "...", "outcome": "clean"}

[project]
namespace = "gatehouse"

[defaults]
max_attempts = 2
timeout_secs = 900
max_evidence_len = 160
ledger_conflict_retries = 3

[pipeline]
entry = "format"
escalation = "triage"

[[gates]]
id = "format"
grammar = "summary"
description = "rustfmt reports no diffs"

[[gates]]
id = "clippy"
grammar = "warnings"
description = "clippy warnings on the workspace"

[[gates]]
id = "tests"
grammar = "test_counts"
description = "workspace test suite"

[[gates]]
id = "security"
grammar = "audit"
required = false
description = "dependency advisories"

[[stages]]
id = "format"
gate = "format"
command = '''
if cargo fmt --all -- --check >/dev/null 2>&1; then
  echo '{"status":"pass","evidence":"format: clean"}'
else
  echo '{"status":"fail","evidence":"format: cargo fmt reported diffs"}'
fi
'''
outcomes = ["clean"]
routes = { clean = "clippy" }

[[stages]]
id = "clippy"
gate = "clippy"
command = '''
n=$(cargo clippy --workspace --message-format short 2>&1 | grep -c '^warning:' || true)
if [ "$n" -eq 0 ]; then
  echo '{"status":"pass","evidence":"clippy: 0 warnings"}'
else
  w=warnings; [ "$n" -eq 1 ] && w=warning
  echo "{\"status\":\"fail\",\"evidence\":\"clippy: $n $w\"}"
fi
'''
outcomes = ["clean"]
routes = { clean = "tests" }

[[stages]]
id = "tests"
gate = "tests"
command = "./scripts/gate-tests.sh"
outcomes = ["clean", "needs_specialist"]
routes = { clean = "security", needs_specialist = "triage" }

[[stages]]
id = "security"
gate = "security"
command = '''
if cargo audit >/dev/null 2>&1; then
  echo '{"status":"pass","evidence":"cargo: audit: clean"}'
else
  echo '{"status":"skipped","evidence":"skipped (cargo audit unavailable or failing)"}'
fi
'''
outcomes = ["clean"]
routes = { clean = "terminal" }

[[stages]]
id = "triage"
command = "echo '{\"status\":\"pass\",\"evidence\":\"triage: needs a human reviewer\"}'"
outcomes = ["clean"]
routes = { clean = "terminal" }
max_attempts = 0

# Settings for every stage whose id matches a glob pattern:
# [overrides."*-fix"]
# max_attempts = 1
# timeout_secs = 300
"#;

/// Runtime configuration: the parsed file plus environment and CLI layers.
#[derive(Debug, Clone)]
pub struct GatehouseConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: GatehouseToml,
    /// `GATEHOUSE_NAMESPACE` overrides the file
    pub namespace: String,
    /// From `GITHUB_TOKEN`
    pub github_token: Option<String>,
}

impl GatehouseConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = GatehouseToml::load_or_default(&config_dir)?;
        let namespace = std::env::var("GATEHOUSE_NAMESPACE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| toml.project.namespace.clone())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let github_token = std::env::var("GITHUB_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            project_dir,
            config_dir,
            toml,
            namespace,
            github_token,
        })
    }

    /// CLI override for the namespace.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        if let Some(ns) = namespace {
            self.namespace = ns;
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn state_dir(&self) -> PathBuf {
        match &self.toml.project.state_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_dir.join(dir),
            None => self.config_dir.join("state"),
        }
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.toml.validate();
        if !self.namespace.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            warnings.push(format!(
                "Namespace '{}' should only contain letters, digits, '-' and '_'",
                self.namespace
            ));
        }
        warnings
    }

    /// Wire a controller for this configuration: one shell runner per
    /// stage, run from the project directory, with receipts under
    /// [`Self::state_dir`].
    pub fn build_controller(
        &self,
        comments: Arc<dyn CommentHost>,
        checks: Arc<dyn CheckHost>,
    ) -> Result<PipelineController> {
        let registry = self.toml.build_registry()?;
        let router = self.toml.build_routing()?;
        let ledger = LedgerStore::new(comments)
            .with_conflict_retries(self.toml.defaults.ledger_conflict_retries);
        let emitter = CheckRunEmitter::new(checks, &self.namespace);

        let mut controller = PipelineController::new(
            Arc::new(registry),
            self.toml.build_codec(),
            Arc::new(router),
            Arc::new(ledger),
            Arc::new(emitter),
            Arc::new(self.toml.build_retry()),
        )
        .with_receipts(ReceiptWriter::new(&self.state_dir()));

        for stage in &self.toml.stages {
            let settings = self.toml.stage_settings(&stage.id);
            let runner = CommandStageRunner::new(&stage.command, self.project_dir.clone());
            controller = controller.bind(
                &stage.id,
                StageBinding::new(
                    Arc::new(runner),
                    stage.gate.as_deref(),
                    Duration::from_secs(settings.timeout_secs),
                ),
            );
        }
        Ok(controller)
    }

    /// Whether a stage id is known to the routing table.
    pub fn has_stage(&self, stage_id: &str) -> bool {
        stage_id == TERMINAL || self.toml.stage(stage_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Grammar;
    use tempfile::TempDir;

    #[test]
    fn test_default_template_parses_and_builds() {
        let toml = GatehouseToml::parse(DEFAULT_TEMPLATE).unwrap();
        assert_eq!(toml.gates.len(), 4);
        assert_eq!(toml.stages.len(), 5);
        let registry = toml.build_registry().unwrap();
        assert!(!registry.is_required_for_ready("security"));
        let routing = toml.build_routing().unwrap();
        assert_eq!(routing.entry(), "format");
        assert_eq!(routing.escalation_for("tests"), Some("triage"));
        assert_eq!(toml.build_codec().grammar_for("tests"), Grammar::TestCounts);
        assert!(toml.validate().is_empty(), "{:?}", toml.validate());
    }

    #[test]
    fn test_defaults_when_file_missing() {
        let tmp = TempDir::new().unwrap();
        let toml = GatehouseToml::load_or_default(tmp.path()).unwrap();
        assert_eq!(toml.defaults.max_attempts, 2);
        assert_eq!(toml.defaults.max_evidence_len, 160);
        assert_eq!(toml.defaults.ledger_conflict_retries, 3);
        assert_eq!(toml.github.api_url, DEFAULT_API_URL);
        assert!(
            toml.validate()
                .iter()
                .any(|w| w.contains("No stages configured"))
        );
    }

    #[test]
    fn test_stage_settings_layering() {
        let toml = GatehouseToml::parse(
            r#"
            [defaults]
            max_attempts = 3
            timeout_secs = 100

            [[stages]]
            id = "lint-fix"
            command = "true"

            [[stages]]
            id = "tests"
            command = "true"
            timeout_secs = 50

            [overrides."*-fix"]
            max_attempts = 1
            "#,
        )
        .unwrap();
        assert_eq!(
            toml.stage_settings("lint-fix"),
            StageSettings {
                max_attempts: 1,
                timeout_secs: 100
            }
        );
        assert_eq!(
            toml.stage_settings("tests"),
            StageSettings {
                max_attempts: 3,
                timeout_secs: 50
            }
        );
        let retry = toml.build_retry();
        assert_eq!(retry.ceiling("lint-fix"), 1);
        assert_eq!(retry.ceiling("tests"), 3);
    }

    #[test]
    fn test_build_routing_rejects_unknown_gate() {
        let toml = GatehouseToml::parse(
            r#"
            [pipeline]
            entry = "tests"

            [[stages]]
            id = "tests"
            gate = "tests"
            command = "true"
            outcomes = ["clean"]
            routes = { clean = "terminal" }
            "#,
        )
        .unwrap();
        assert_eq!(
            toml.build_routing().unwrap_err(),
            RoutingError::UnknownGate {
                stage: "tests".into(),
                gate: "tests".into()
            }
        );
        assert!(toml.validate().iter().any(|w| w.starts_with("error:")));
    }

    #[test]
    fn test_gate_defaults() {
        let toml = GatehouseToml::parse(
            r#"
            [[gates]]
            id = "docs"
            "#,
        )
        .unwrap();
        assert!(toml.gates[0].required);
        assert_eq!(toml.gates[0].grammar, Grammar::Summary);
    }

    #[test]
    fn test_parse_rejects_bad_grammar() {
        let result = GatehouseToml::parse(
            r#"
            [[gates]]
            id = "docs"
            grammar = "haiku"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        let toml = GatehouseToml::parse(DEFAULT_TEMPLATE).unwrap();
        toml.save(&path).unwrap();
        let reloaded = GatehouseToml::load(&path).unwrap();
        assert_eq!(reloaded.stages.len(), toml.stages.len());
        assert_eq!(reloaded.pipeline.entry, "format");
    }

    #[test]
    fn test_pattern_matches() {
        assert!(pattern_matches("*-fix", "lint-fix"));
        assert!(pattern_matches("*-FIX", "lint-fix"));
        assert!(!pattern_matches("*-fix", "fix"));
        assert!(pattern_matches("stage-0?", "stage-01"));
        assert!(!pattern_matches("stage-0?", "stage-10"));
        assert!(pattern_matches("db-*-init", "db--init"));
        assert!(pattern_matches("naïve-*", "naïve-stage"));
    }

    #[test]
    fn test_build_controller_from_template() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE), DEFAULT_TEMPLATE).unwrap();

        let config = GatehouseConfig::new(tmp.path().to_path_buf()).unwrap();
        let host = Arc::new(crate::memory_host::MemoryHost::new());
        let controller = config.build_controller(host.clone(), host).unwrap();
        assert_eq!(controller.registry().len(), 4);
        assert_eq!(controller.retry().ceiling("triage"), 0);
    }

    #[test]
    fn test_state_dir_resolution() {
        let tmp = TempDir::new().unwrap();
        let config = GatehouseConfig::new(tmp.path().to_path_buf()).unwrap();
        assert!(config.state_dir().ends_with(".gatehouse/state"));
        assert!(config.has_stage("terminal"));
        assert!(!config.has_stage("tests"));
    }
}
