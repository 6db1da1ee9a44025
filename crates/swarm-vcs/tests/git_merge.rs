//! Merge behaviour against a real git repository
//!
//! Skipped when no `git` binary is available.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use swarm_core::{RunId, WorktreeConfig};
use swarm_vcs::{GitCommand, MergeOutcome, WorktreeManager};
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        status.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&status.stderr)
    );
}

fn numbered_lines(overrides: &[(usize, &str)]) -> String {
    (1..=12)
        .map(|n| {
            overrides
                .iter()
                .find(|(line, _)| *line == n)
                .map(|(_, text)| text.to_string())
                .unwrap_or_else(|| format!("line {}", n))
        })
        .collect::<Vec<_>>()
        .join("\n")
        + "\n"
}

fn init_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    git(root, &["init", "-q"]);
    git(root, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(root, &["config", "user.name", "Test"]);
    git(root, &["config", "user.email", "test@example.com"]);
    std::fs::write(root.join("shared.txt"), numbered_lines(&[])).unwrap();
    std::fs::write(root.join(".gitignore"), ".swarm-worktrees/\n").unwrap();
    git(root, &["add", "."]);
    git(root, &["commit", "-q", "-m", "initial"]);
    dir
}

fn commit_edit(dir: &Path, content: String, message: &str) {
    std::fs::write(dir.join("shared.txt"), content).unwrap();
    git(dir, &["add", "shared.txt"]);
    git(dir, &["commit", "-q", "-m", message]);
}

async fn setup(
    left: &[(usize, &str)],
    right: &[(usize, &str)],
) -> (TempDir, WorktreeManager<GitCommand>, RunId) {
    let repo = init_repo();
    let executor = Arc::new(GitCommand::new(repo.path().canonicalize().unwrap()));
    let mgr = WorktreeManager::new(executor, &WorktreeConfig::default());
    let run = RunId::from("20260101-000000-test01");

    let a = mgr.acquire(&run, "a", "main").await.unwrap();
    let b = mgr.acquire(&run, "b", "main").await.unwrap();
    commit_edit(&a.path, numbered_lines(left), "a work");
    commit_edit(&b.path, numbered_lines(right), "b work");

    (repo, mgr, run)
}

#[tokio::test]
async fn test_non_overlapping_hunks_merge_cleanly() {
    if !git_available() {
        return;
    }
    let (_repo, mgr, run) = setup(&[(1, "left edit")], &[(12, "right edit")]).await;
    let integration = mgr.acquire(&run, "integration", "main").await.unwrap();

    let first = mgr
        .repo()
        .merge(&integration.path, &mgr.branch_name(&run, "a"), "Merge a")
        .await
        .unwrap();
    let second = mgr
        .repo()
        .merge(&integration.path, &mgr.branch_name(&run, "b"), "Merge b")
        .await
        .unwrap();

    assert_eq!(first, MergeOutcome::Clean);
    assert_eq!(second, MergeOutcome::Clean);

    let merged = std::fs::read_to_string(integration.path.join("shared.txt")).unwrap();
    assert!(merged.contains("left edit"));
    assert!(merged.contains("right edit"));
}

#[tokio::test]
async fn test_overlapping_hunks_conflict() {
    if !git_available() {
        return;
    }
    let (_repo, mgr, run) = setup(&[(6, "left edit")], &[(6, "right edit")]).await;
    let integration = mgr.acquire(&run, "integration", "main").await.unwrap();

    let first = mgr
        .repo()
        .merge(&integration.path, &mgr.branch_name(&run, "a"), "Merge a")
        .await
        .unwrap();
    let second = mgr
        .repo()
        .merge(&integration.path, &mgr.branch_name(&run, "b"), "Merge b")
        .await
        .unwrap();

    assert_eq!(first, MergeOutcome::Clean);
    assert_eq!(
        second,
        MergeOutcome::Conflicted {
            files: vec!["shared.txt".to_string()]
        }
    );

    mgr.repo().merge_abort(&integration.path).await.unwrap();
    assert!(mgr
        .repo()
        .conflicted_files(&integration.path)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_changed_files_and_cleanup() {
    if !git_available() {
        return;
    }
    let (_repo, mgr, run) = setup(&[(2, "left")], &[(3, "right")]).await;

    let a = mgr.acquire(&run, "a", "main").await.unwrap();
    assert_eq!(
        mgr.changed_files(&a, "main").await.unwrap(),
        vec!["shared.txt"]
    );
    assert!(mgr.diff(&a, "main").await.unwrap().contains("+left"));

    let report = mgr.cleanup(&run).await.unwrap();
    assert_eq!(report.worktrees_removed, 2);
    assert_eq!(report.branches_deleted, 2);
    assert!(!mgr.exists(&run, "a"));
}
