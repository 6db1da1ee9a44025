//! Plan, task and policy types shared across swarm crates

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Worker identifiers equal the identifier of the task they execute
pub type WorkerId = String;

/// Identifier of one end-to-end pipeline run
///
/// Format: `YYYYMMDD-HHMMSS-xxxxxx` (UTC timestamp plus random suffix), safe
/// for use in branch names and directory names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run identifier
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", stamp, &suffix[..6]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if is_safe_identifier(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(format!("Invalid run id: {}", s))
        }
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Check that an identifier is usable as a path component and a branch segment
pub fn is_safe_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && !id.starts_with(['-', '.'])
        && !id.ends_with(".lock")
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !id.contains("..")
}

/// Strength/cost class of the agent capability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityTier {
    #[default]
    Standard,
    Escalated,
}

impl std::fmt::Display for CapabilityTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}

/// A planned unit of work executed by exactly one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, also the worker id
    pub id: WorkerId,
    /// Short title for status displays
    #[serde(default)]
    pub title: String,
    /// What the worker must accomplish
    pub objective: String,
    /// Files or directories the worker is expected to touch
    #[serde(default)]
    pub scope: Vec<String>,
    /// Tasks whose work this one depends on or feeds
    #[serde(default)]
    pub coupled_with: BTreeSet<WorkerId>,
    /// Shared interfaces (types, endpoints, schemas) this task defines or consumes
    #[serde(default)]
    pub interfaces: Vec<String>,
    /// Conditions for the task to count as done
    #[serde(default)]
    pub acceptance: Vec<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, objective: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            objective: objective.into(),
            scope: Vec::new(),
            coupled_with: BTreeSet::new(),
            interfaces: Vec::new(),
            acceptance: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_scope(mut self, scope: Vec<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn coupled_to(mut self, other: impl Into<String>) -> Self {
        self.coupled_with.insert(other.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Title for display, falling back to the id
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }
}

/// The ordered, immutable decomposition of a run's objective
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// The objective the plan decomposes
    pub objective: String,
    /// Why the work was split this way
    #[serde(default)]
    pub reasoning: String,
    /// Tasks in plan order (this order drives integration)
    pub tasks: Vec<Task>,
    /// How the pieces are meant to fit together
    #[serde(default)]
    pub integration_notes: String,
    /// Project build command to run on the integration branch
    #[serde(default)]
    pub build_command: Option<String>,
    /// Project verification command (test suite) to run on the integration branch
    #[serde(default)]
    pub verify_command: Option<String>,
}

impl Plan {
    pub fn new(objective: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            objective: objective.into(),
            reasoning: String::new(),
            tasks,
            integration_notes: String::new(),
            build_command: None,
            verify_command: None,
        }
    }

    /// Look up a task by id
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Position of a task in plan order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }
}

/// Human-control policy applied at checkpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversightPolicy {
    /// Deliver automatically once verification passes
    Autonomous,
    /// Always stop before delivery
    #[default]
    Gated,
    /// Confirm before fan-out, before integration and before delivery
    Checkpoint,
}

impl std::fmt::Display for OversightPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Autonomous => write!(f, "autonomous"),
            Self::Gated => write!(f, "gated"),
            Self::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

impl std::str::FromStr for OversightPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "autonomous" => Ok(Self::Autonomous),
            "gated" | "pr-gated" => Ok(Self::Gated),
            "checkpoint" => Ok(Self::Checkpoint),
            _ => Err(format!(
                "Invalid oversight policy: {}. Use autonomous, gated or checkpoint.",
                s
            )),
        }
    }
}

/// Fixed points in the pipeline where the oversight gate is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checkpoint {
    BeforeFanOut,
    BeforeIntegration,
    BeforeDelivery,
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeforeFanOut => write!(f, "before fan-out"),
            Self::BeforeIntegration => write!(f, "before integration"),
            Self::BeforeDelivery => write!(f, "before delivery"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_format() {
        let id = RunId::generate();
        let parts: Vec<&str> = id.as_str().split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 6);
        assert!(is_safe_identifier(id.as_str()));
    }

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("worker-1"));
        assert!(is_safe_identifier("api_layer.v2"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("-rf"));
        assert!(!is_safe_identifier(".hidden"));
        assert!(!is_safe_identifier("a/b"));
        assert!(!is_safe_identifier("a..b"));
        assert!(!is_safe_identifier("has space"));
        assert!(!is_safe_identifier("ref.lock"));
    }

    #[test]
    fn test_oversight_policy_parse() {
        assert_eq!(
            "gated".parse::<OversightPolicy>().unwrap(),
            OversightPolicy::Gated
        );
        assert_eq!(
            "PR-GATED".parse::<OversightPolicy>().unwrap(),
            OversightPolicy::Gated
        );
        assert_eq!(
            "checkpoint".parse::<OversightPolicy>().unwrap(),
            OversightPolicy::Checkpoint
        );
        assert!("yolo".parse::<OversightPolicy>().is_err());
        assert_eq!(OversightPolicy::default(), OversightPolicy::Gated);
    }

    #[test]
    fn test_plan_lookup() {
        let plan = Plan::new(
            "add auth",
            vec![Task::new("api", "build api"), Task::new("ui", "build ui")],
        );
        assert_eq!(plan.position("ui"), Some(1));
        assert!(plan.task("db").is_none());
        assert_eq!(plan.task("api").unwrap().display_title(), "api");
    }
}
