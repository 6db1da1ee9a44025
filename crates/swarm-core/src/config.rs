//! Configuration management for swarm
//!
//! Repository-level settings live in `.swarm/config.toml`. Every field has a
//! serde default so a partial (or missing) file yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::OversightPolicy;
use crate::{Result, SwarmError};

/// Directory (relative to the repo root) holding swarm state
pub const SWARM_DIR: &str = ".swarm";

/// Repository-level swarm configuration
///
/// Loaded from `.swarm/config.toml` in the repo root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Maximum number of workers running simultaneously
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum number of tasks a plan may contain (larger plans are truncated)
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,

    /// Ref worker branches start from (defaults to the current branch)
    #[serde(default)]
    pub base_branch: Option<String>,

    /// Attempt, escalation, cost and stall limits
    #[serde(default)]
    pub limits: RunLimits,

    /// Worktree placement and VCS lock handling
    #[serde(default)]
    pub worktree: WorktreeConfig,

    /// Integration behaviour
    #[serde(default)]
    pub integration: IntegrationConfig,

    /// Oversight gate settings
    #[serde(default)]
    pub oversight: OversightConfig,

    /// Agent backend settings
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Per-run limits, snapshotted into each run at plan time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLimits {
    /// Attempts per worker, including the escalated one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Whether the final attempt may use the escalated capability tier
    #[serde(default = "default_true")]
    pub escalation: bool,

    /// Spend ceiling for a single worker
    #[serde(default = "default_worker_ceiling")]
    pub worker_ceiling_usd: f64,

    /// Spend ceiling for the whole run (circuit breaker)
    #[serde(default = "default_aggregate_ceiling")]
    pub aggregate_ceiling_usd: f64,

    /// Seconds without a progress signal before an attempt counts as stalled
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
}

/// Worktree placement and lock-contention retry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// Directory (relative to the repo root) holding worker worktrees
    #[serde(default = "default_worktree_dir")]
    pub dir: PathBuf,

    /// Retries for lock-contended VCS operations
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,

    /// Base backoff between lock retries, doubled per retry
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
}

/// Integration behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Invoke the conflict-resolution capability on merge conflicts
    #[serde(default = "default_true")]
    pub resolve_conflicts: bool,

    /// Run the semantic review pass over the aggregate diff
    #[serde(default)]
    pub review: bool,

    /// Apply a fix pass when the review reports findings
    #[serde(default = "default_true")]
    pub fix_findings: bool,

    /// Verification command used when the plan does not supply one
    #[serde(default)]
    pub verify_command: Option<String>,

    /// How an approved run is published
    #[serde(default)]
    pub delivery: DeliveryMode,
}

/// How an approved run is published
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Leave the integration branch in the local repository
    #[default]
    Branch,
    /// Push the integration branch and open a pull request with `gh`
    Pr,
}

/// Oversight gate settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OversightConfig {
    #[serde(default)]
    pub policy: OversightPolicy,

    /// How long to wait for an interactive approval before pausing
    #[serde(default = "default_approval_timeout")]
    pub approval_timeout_secs: u64,
}

/// Agent subprocess configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent CLI program
    #[serde(default = "default_program")]
    pub program: String,

    /// Extra arguments passed on every invocation
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_standard_model")]
    pub standard_model: String,

    #[serde(default = "default_escalated_model")]
    pub escalated_model: String,

    #[serde(default = "default_planner_model")]
    pub planner_model: String,

    /// Tool rules the agent CLI refuses outright (`--disallowedTools`)
    #[serde(default = "default_disallowed_tools")]
    pub disallowed_tools: Vec<String>,

    /// Shell commands that end an attempt when an agent tries to run them
    #[serde(default = "default_deny_commands")]
    pub deny_commands: Vec<CommandRule>,
}

/// A shell command pattern agents may not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRule {
    /// Regular expression matched anywhere in the command line
    pub pattern: String,
    /// Reported when the rule blocks a command
    pub reason: String,
}

impl CommandRule {
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
        }
    }
}

// Default value providers
fn default_max_concurrency() -> usize {
    4
}

fn default_max_tasks() -> usize {
    8
}

fn default_max_attempts() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_worker_ceiling() -> f64 {
    5.0
}

fn default_aggregate_ceiling() -> f64 {
    50.0
}

fn default_stall_timeout() -> u64 {
    900
}

fn default_worktree_dir() -> PathBuf {
    PathBuf::from(".swarm-worktrees")
}

fn default_lock_retries() -> u32 {
    3
}

fn default_lock_backoff_ms() -> u64 {
    500
}

fn default_approval_timeout() -> u64 {
    300
}

fn default_program() -> String {
    "claude".to_string()
}

fn default_standard_model() -> String {
    "sonnet".to_string()
}

fn default_escalated_model() -> String {
    "opus".to_string()
}

fn default_planner_model() -> String {
    "opus".to_string()
}

fn default_disallowed_tools() -> Vec<String> {
    [
        "Bash(git push --force:*)",
        "Bash(git push -f:*)",
        "Bash(git reset --hard:*)",
        "Bash(git remote add:*)",
        "Bash(git remote set-url:*)",
        "Bash(sudo:*)",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

// Command-position anchor: start of line or after a separator
const CMD_START: &str = r"(?:^|[;&|]\s*)";

fn default_deny_commands() -> Vec<CommandRule> {
    vec![
        CommandRule::new(r"git\s+push\s+.*--force\b", "Force push is blocked"),
        CommandRule::new(
            r"git\s+push\s+(?:.*\s)?-[a-zA-Z]*f[a-zA-Z]*\b",
            "Force push is blocked",
        ),
        CommandRule::new(
            r"git\s+(?:checkout|switch)\s+(?:main|master)\b",
            "Switching to a protected branch is blocked",
        ),
        CommandRule::new(r"git\s+reset\s+--hard\b", "Hard reset is blocked"),
        CommandRule::new(r"git\s+clean\s+-[a-zA-Z]*f", "git clean -f is blocked"),
        CommandRule::new(
            r"git\s+remote\s+(?:add|set-url)\b",
            "Changing git remotes is blocked",
        ),
        CommandRule::new(
            r"rm\s+(?:-[a-zA-Z]*r[a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*r)[a-zA-Z]*\s+/",
            "Recursive delete on an absolute path is blocked",
        ),
        CommandRule::new(
            r"rm\s+.*-[rf]\b.*-[rf]\b.*\s+/",
            "Recursive delete on an absolute path is blocked",
        ),
        CommandRule::new(r"(?i)DROP\s+TABLE", "DROP TABLE is blocked"),
        CommandRule::new(
            r"(?i)DELETE\s+FROM\s+\S+\s*(?:;|$)",
            "DELETE FROM without WHERE is blocked",
        ),
        CommandRule::new(
            r"(?:curl|wget)\s+.*\|\s*(?:/\S*)?(?:ba|da|z)?sh\b",
            "Piping a download to a shell is blocked",
        ),
        CommandRule::new(format!(r"{}sudo\b", CMD_START), "sudo is blocked"),
        CommandRule::new(format!(r"{}(?:mkfs|shred)\b", CMD_START), "Disk destruction is blocked"),
        CommandRule::new(r"\bdd\b.*\bof\s*=\s*/dev/", "dd writing to a device is blocked"),
        CommandRule::new(r"\|\s*(?:nc|netcat|ncat)\b", "Piping to netcat is blocked"),
        CommandRule::new(r"/dev/(?:tcp|udp)/", "Raw socket device access is blocked"),
        CommandRule::new(
            r"(?:>|\btee\s+)\s*/(?:etc|var|usr|sys|proc)/",
            "Writing to system paths is blocked",
        ),
        CommandRule::new(
            format!(r"{}(?:nohup|crontab)\b", CMD_START),
            "Background persistence is blocked",
        ),
        CommandRule::new(
            r"\bfind\s+/\S*\s.*(?:-delete\b|-exec\s+rm\b)",
            "find deleting under an absolute path is blocked",
        ),
        CommandRule::new(r"\bchmod\b.*\b777\b", "chmod 777 is blocked"),
        CommandRule::new(r":\(\)\s*\{", "Fork bomb is blocked"),
    ]
}

impl SwarmConfig {
    /// Path of the config file for a repository
    pub fn path(repo_root: &Path) -> PathBuf {
        repo_root.join(SWARM_DIR).join("config.toml")
    }

    /// Load configuration from `.swarm/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = Self::path(repo_root);

        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content).map_err(|e| {
                SwarmError::Config(format!(
                    "Failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.swarm/config.toml`
    ///
    /// Returns the path written. An existing file is left untouched.
    pub fn write_default(repo_root: &Path) -> Result<PathBuf> {
        let config_path = Self::path(repo_root);
        if config_path.exists() {
            return Ok(config_path);
        }
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| SwarmError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(SwarmError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_tasks == 0 {
            return Err(SwarmError::Config("max_tasks must be at least 1".to_string()));
        }
        self.limits.validate()?;
        if self.oversight.approval_timeout_secs == 0 {
            return Err(SwarmError::Config(
                "oversight.approval_timeout_secs must be positive".to_string(),
            ));
        }
        for rule in &self.agent.deny_commands {
            regex::Regex::new(&rule.pattern).map_err(|e| {
                SwarmError::Config(format!(
                    "agent.deny_commands pattern `{}` is invalid: {}",
                    rule.pattern, e
                ))
            })?;
        }
        Ok(())
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_policy(mut self, policy: OversightPolicy) -> Self {
        self.oversight.policy = policy;
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl RunLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SwarmError::Config(
                "limits.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(self.worker_ceiling_usd > 0.0) {
            return Err(SwarmError::Config(
                "limits.worker_ceiling_usd must be positive".to_string(),
            ));
        }
        if !(self.aggregate_ceiling_usd > 0.0) {
            return Err(SwarmError::Config(
                "limits.aggregate_ceiling_usd must be positive".to_string(),
            ));
        }
        if self.stall_timeout_secs == 0 {
            return Err(SwarmError::Config(
                "limits.stall_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_tasks: default_max_tasks(),
            base_branch: None,
            limits: RunLimits::default(),
            worktree: WorktreeConfig::default(),
            integration: IntegrationConfig::default(),
            oversight: OversightConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            escalation: true,
            worker_ceiling_usd: default_worker_ceiling(),
            aggregate_ceiling_usd: default_aggregate_ceiling(),
            stall_timeout_secs: default_stall_timeout(),
        }
    }
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            dir: default_worktree_dir(),
            lock_retries: default_lock_retries(),
            lock_backoff_ms: default_lock_backoff_ms(),
        }
    }
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            resolve_conflicts: true,
            review: false,
            fix_findings: true,
            verify_command: None,
            delivery: DeliveryMode::default(),
        }
    }
}

impl Default for OversightConfig {
    fn default() -> Self {
        Self {
            policy: OversightPolicy::default(),
            approval_timeout_secs: default_approval_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            extra_args: Vec::new(),
            standard_model: default_standard_model(),
            escalated_model: default_escalated_model(),
            planner_model: default_planner_model(),
            disallowed_tools: default_disallowed_tools(),
            deny_commands: default_deny_commands(),
        }
    }
}
