//! Project build and verification commands

use std::path::Path;
use std::process::Stdio;
use swarm_core::{CheckReport, Result, SwarmError};
use tokio::process::Command;
use tracing::{debug, info};

/// Maximum characters of command output kept in a report
const OUTPUT_TAIL_CHARS: usize = 4000;

/// Run a shell command in `dir` and report whether it passed
pub async fn run_check(dir: &Path, command: &str) -> Result<CheckReport> {
    info!("Running `{}` in {}", command, dir.display());

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SwarmError::Other(format!("Failed to run `{}`: {}", command, e)))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    let passed = output.status.success();
    debug!("`{}` exited with {:?}", command, output.status.code());

    Ok(CheckReport {
        command: command.to_string(),
        passed,
        output: tail(&combined, OUTPUT_TAIL_CHARS),
    })
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_passing_command() {
        let dir = TempDir::new().unwrap();
        let report = run_check(dir.path(), "echo hello").await.unwrap();
        assert!(report.passed);
        assert!(report.output.contains("hello"));
    }

    #[tokio::test]
    async fn test_failing_command() {
        let dir = TempDir::new().unwrap();
        let report = run_check(dir.path(), "echo broken >&2; exit 3").await.unwrap();
        assert!(!report.passed);
        assert!(report.output.contains("broken"));
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
