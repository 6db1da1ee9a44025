//! Git command execution abstraction

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, Mutex};
use swarm_core::{Result, SwarmError};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from a git command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl VcsOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
        }
    }

    /// Non-empty trimmed stdout lines
    pub fn lines(&self) -> Vec<String> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl From<Output> for VcsOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for executing git commands (allows mocking in tests)
#[async_trait]
pub trait VcsExecutor: Send + Sync {
    /// Execute a git command in the repository root
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput>;

    /// Execute a git command inside a worktree
    async fn exec_in(&self, dir: &Path, args: &[&str]) -> Result<VcsOutput>;

    /// Get the repository root
    fn repo_root(&self) -> &PathBuf;
}

/// Real git command executor
#[derive(Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
}

impl GitCommand {
    /// Create a new git executor for the given repository
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Auto-detect repository root from the current directory
    pub async fn detect() -> Result<Self> {
        Self::detect_from(Path::new(".")).await
    }

    /// Auto-detect the repository containing `dir`
    pub async fn detect_from(dir: &Path) -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| SwarmError::VcsCommand(format!("Failed to run git rev-parse: {}", e)))?;

        if !output.status.success() {
            return Err(SwarmError::VcsCommand(format!(
                "Not in a git repository: {}",
                dir.display()
            )));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self::new(root))
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<VcsOutput> {
        debug!("Executing git {:?} in {}", args, dir.display());

        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SwarmError::VcsCommand(format!("Failed to execute git: {}", e)))?;

        let git_output = VcsOutput::from(output);

        if !git_output.success {
            debug!("git command failed: {}", git_output.stderr.trim());
        }

        Ok(git_output)
    }
}

#[async_trait]
impl VcsExecutor for GitCommand {
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput> {
        self.run(&self.repo_root, args).await
    }

    #[instrument(skip(self), fields(dir = %dir.display()))]
    async fn exec_in(&self, dir: &Path, args: &[&str]) -> Result<VcsOutput> {
        self.run(dir, args).await
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Runs non-git tools (`gh`, ...) that sit next to the VCS
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, dir: &Path, program: &str, args: &[&str]) -> Result<VcsOutput>;
}

/// Spawns the program as a child process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    #[instrument(skip(self, args), fields(dir = %dir.display()))]
    async fn run(&self, dir: &Path, program: &str, args: &[&str]) -> Result<VcsOutput> {
        debug!("Executing {} {:?}", program, args);

        let output = Command::new(program)
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SwarmError::Other(format!("Failed to execute {}: {}", program, e)))?;

        Ok(VcsOutput::from(output))
    }
}

/// One command observed by [`MockVcsExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VcsCall {
    /// Working directory for `exec_in`, `None` for the repository root
    pub dir: Option<PathBuf>,
    /// Space-joined arguments
    pub command: String,
}

type Handler = Arc<dyn Fn(Option<&Path>, &[&str]) -> Option<VcsOutput> + Send + Sync>;

/// Scripted git executor for tests
///
/// Lookup order for a command: the handler, queued responses for the exact
/// command (the last one repeats), then the longest matching prefix. Anything
/// unscripted succeeds with empty output. Every call is journaled.
#[derive(Clone)]
pub struct MockVcsExecutor {
    repo_root: PathBuf,
    sequences: Arc<Mutex<HashMap<String, VecDeque<VcsOutput>>>>,
    prefixes: Vec<(String, VcsOutput)>,
    handler: Option<Handler>,
    journal: Arc<Mutex<Vec<VcsCall>>>,
}

impl Default for MockVcsExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVcsExecutor {
    pub fn new() -> Self {
        Self::with_root("/mock/repo")
    }

    pub fn with_root(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            sequences: Arc::new(Mutex::new(HashMap::new())),
            prefixes: Vec::new(),
            handler: None,
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Respond to an exact command
    pub fn with_response(self, command: &str, output: VcsOutput) -> Self {
        self.with_sequence(command, vec![output])
    }

    /// Respond to an exact command with successive outputs
    pub fn with_sequence(self, command: &str, outputs: Vec<VcsOutput>) -> Self {
        if let Ok(mut sequences) = self.sequences.lock() {
            sequences.insert(command.to_string(), outputs.into());
        }
        self
    }

    /// Respond to every command starting with `prefix`
    pub fn with_prefix(mut self, prefix: &str, output: VcsOutput) -> Self {
        self.prefixes.push((prefix.to_string(), output));
        self
    }

    /// Compute responses dynamically; returning `None` falls through to the script
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Option<&Path>, &[&str]) -> Option<VcsOutput> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Every command executed so far, in order
    pub fn calls(&self) -> Vec<VcsCall> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Commands (without directories) starting with `prefix`
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|c| c.command)
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    fn respond(&self, dir: Option<&Path>, args: &[&str]) -> VcsOutput {
        let key = args.join(" ");
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(VcsCall {
                dir: dir.map(Path::to_path_buf),
                command: key.clone(),
            });
        }

        if let Some(handler) = &self.handler {
            if let Some(output) = handler(dir, args) {
                return output;
            }
        }

        if let Ok(mut sequences) = self.sequences.lock() {
            if let Some(queue) = sequences.get_mut(&key) {
                let output = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
                if let Some(output) = output {
                    return output;
                }
            }
        }

        self.prefixes
            .iter()
            .filter(|(prefix, _)| key.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, output)| output.clone())
            .unwrap_or_else(|| VcsOutput::ok(""))
    }
}

#[async_trait]
impl VcsExecutor for MockVcsExecutor {
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput> {
        Ok(self.respond(None, args))
    }

    async fn exec_in(&self, dir: &Path, args: &[&str]) -> Result<VcsOutput> {
        Ok(self.respond(Some(dir), args))
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Other programs are scripted and journaled like git, keyed with the
/// program name in front (`gh pr create ...`)
#[async_trait]
impl CommandRunner for MockVcsExecutor {
    async fn run(&self, dir: &Path, program: &str, args: &[&str]) -> Result<VcsOutput> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(program);
        argv.extend_from_slice(args);
        Ok(self.respond(Some(dir), &argv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_exact_response() {
        let executor = MockVcsExecutor::new()
            .with_response("rev-parse --abbrev-ref HEAD", VcsOutput::ok("main\n"));

        let output = executor
            .exec(&["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.lines(), vec!["main"]);
    }

    #[tokio::test]
    async fn test_mock_sequence_repeats_last() {
        let executor = MockVcsExecutor::new().with_sequence(
            "worktree prune",
            vec![VcsOutput::failed("index.lock exists"), VcsOutput::ok("")],
        );

        assert!(!executor.exec(&["worktree", "prune"]).await.unwrap().success);
        assert!(executor.exec(&["worktree", "prune"]).await.unwrap().success);
        assert!(executor.exec(&["worktree", "prune"]).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_mock_prefix_and_journal() {
        let executor = MockVcsExecutor::new()
            .with_prefix("merge", VcsOutput::failed("CONFLICT"))
            .with_prefix("merge --abort", VcsOutput::ok(""));

        let dir = PathBuf::from("/tmp/wt");
        assert!(!executor
            .exec_in(&dir, &["merge", "--no-ff", "x"])
            .await
            .unwrap()
            .success);
        assert!(executor
            .exec_in(&dir, &["merge", "--abort"])
            .await
            .unwrap()
            .success);
        assert!(executor.exec(&["status"]).await.unwrap().success);

        let calls = executor.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].dir.as_deref(), Some(dir.as_path()));
        assert_eq!(calls[2].dir, None);
        assert_eq!(executor.calls_matching("merge").len(), 2);
    }

    #[tokio::test]
    async fn test_mock_scripts_other_programs() {
        let executor = MockVcsExecutor::new()
            .with_prefix("gh pr create", VcsOutput::ok("https://example.com/pr/7\n"));

        let dir = PathBuf::from("/mock/repo");
        let output = CommandRunner::run(&executor, &dir, "gh", &["pr", "create", "--fill"])
            .await
            .unwrap();
        assert_eq!(output.lines(), vec!["https://example.com/pr/7"]);
        assert_eq!(executor.calls_matching("gh pr"), vec!["gh pr create --fill"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_runner_captures_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let output = ProcessRunner
            .run(dir.path(), "sh", &["-c", "echo out; echo err >&2; exit 2"])
            .await
            .unwrap();
        assert!(!output.success);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }
}
