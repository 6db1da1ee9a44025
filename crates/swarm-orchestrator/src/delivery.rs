//! Delivery of an integrated run

use async_trait::async_trait;
use std::sync::Arc;
use swarm_core::{DeliveryMode, IntegrationRecord, Result, Run, SwarmError};
use swarm_vcs::{CommandRunner, VcsExecutor};
use tracing::info;

/// Characters of the objective kept in a pull request title
const TITLE_CHARS: usize = 60;

/// Publishes the integration result once the oversight gate allows it
///
/// Returns a reference to what was delivered (branch name, PR URL, ...).
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, run: &Run) -> Result<String>;
}

/// Delivery configured by `integration.delivery`
pub fn delivery_for<E>(
    mode: DeliveryMode,
    vcs: Arc<E>,
    runner: Arc<dyn CommandRunner>,
) -> Arc<dyn Delivery>
where
    E: VcsExecutor + ?Sized + 'static,
{
    match mode {
        DeliveryMode::Branch => Arc::new(BranchDelivery),
        DeliveryMode::Pr => Arc::new(GhPrDelivery::new(vcs, runner)),
    }
}

fn integration_of(run: &Run) -> Result<&IntegrationRecord> {
    run.integration
        .as_ref()
        .ok_or_else(|| SwarmError::Other(format!("run {} has not been integrated", run.run_id)))
}

/// Leaves the integration branch in place and reports its name
pub struct BranchDelivery;

#[async_trait]
impl Delivery for BranchDelivery {
    async fn deliver(&self, run: &Run) -> Result<String> {
        let record = integration_of(run)?;
        info!("Run {} delivered on branch {}", run.run_id, record.branch);
        Ok(record.branch.clone())
    }
}

/// Pushes the integration branch to `origin` and opens a pull request with `gh`
pub struct GhPrDelivery<E: VcsExecutor + ?Sized> {
    vcs: Arc<E>,
    runner: Arc<dyn CommandRunner>,
    remote: String,
}

impl<E: VcsExecutor + ?Sized> GhPrDelivery<E> {
    pub fn new(vcs: Arc<E>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            vcs,
            runner,
            remote: "origin".to_string(),
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }
}

fn pr_title(run: &Run) -> String {
    let objective = run.objective.lines().next().unwrap_or_default().trim();
    let short: String = objective.chars().take(TITLE_CHARS).collect();
    format!("[swarm] {}", short)
}

fn pr_body(run: &Run, record: &IntegrationRecord) -> String {
    let mut body = format!("## Objective\n{}\n\n## Workers\n", run.objective);
    for worker in run.succeeded_workers() {
        body.push_str(&format!(
            "- **{}**: {} (${:.2})\n",
            worker.worker_id,
            worker.summary.as_deref().unwrap_or("completed"),
            worker.cost_usd
        ));
    }
    if !record.unmerged.is_empty() {
        body.push_str(&format!("\nNot merged: {}\n", record.unmerged.join(", ")));
    }
    if !record.resolved.is_empty() {
        body.push_str(&format!(
            "\nConflicts resolved for: {}\n",
            record.resolved.join(", ")
        ));
    }
    body.push_str(&format!(
        "\n**Total cost**: ${:.2}\n\n---\nswarm run `{}`\n",
        run.cost.total_usd, run.run_id
    ));
    body
}

/// The PR URL `gh pr create` prints as its last line
fn parse_pr_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("https://") || l.starts_with("http://"))
        .last()
        .map(str::to_string)
}

#[async_trait]
impl<E: VcsExecutor + ?Sized + 'static> Delivery for GhPrDelivery<E> {
    async fn deliver(&self, run: &Run) -> Result<String> {
        let record = integration_of(run)?;
        let root = self.vcs.repo_root().clone();

        let push = self
            .vcs
            .exec(&["push", "-u", &self.remote, &record.branch])
            .await?;
        if !push.success {
            return Err(SwarmError::VcsCommand(format!(
                "push of {} failed: {}",
                record.branch,
                push.stderr.trim()
            )));
        }

        let title = pr_title(run);
        let body = pr_body(run, record);
        let output = self
            .runner
            .run(
                &root,
                "gh",
                &[
                    "pr",
                    "create",
                    "--title",
                    &title,
                    "--body",
                    &body,
                    "--base",
                    &run.base_ref,
                    "--head",
                    &record.branch,
                ],
            )
            .await?;
        if !output.success {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim()
            } else {
                output.stderr.trim()
            };
            return Err(SwarmError::Other(format!("gh pr create failed: {}", detail)));
        }

        let url = parse_pr_url(&output.stdout).ok_or_else(|| {
            SwarmError::Other(format!(
                "gh pr create printed no URL: {}",
                output.stdout.trim()
            ))
        })?;
        info!("Run {} delivered as {}", run.run_id, url);
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::{OversightPolicy, RunId, RunLimits};
    use swarm_vcs::{MockVcsExecutor, VcsOutput};

    fn integrated_run() -> Run {
        let mut run = Run::new(
            RunId::from("r1"),
            "Add login flow\nwith sessions",
            "main",
            RunLimits::default(),
            OversightPolicy::Autonomous,
        );
        run.integration = Some(IntegrationRecord {
            branch: "swarm/r1/integration".into(),
            unmerged: vec!["docs".into()],
            ..IntegrationRecord::default()
        });
        run
    }

    #[tokio::test]
    async fn test_branch_delivery_reports_branch() {
        let mut run = integrated_run();
        assert_eq!(
            BranchDelivery.deliver(&run).await.unwrap(),
            "swarm/r1/integration"
        );

        run.integration = None;
        assert!(BranchDelivery.deliver(&run).await.is_err());
    }

    #[tokio::test]
    async fn test_pr_delivery_pushes_and_records_url() {
        let executor = Arc::new(MockVcsExecutor::new().with_prefix(
            "gh pr create",
            VcsOutput::ok("Creating pull request\nhttps://github.com/acme/app/pull/42\n"),
        ));
        let delivery = GhPrDelivery::new(executor.clone(), executor.clone());

        let url = delivery.deliver(&integrated_run()).await.unwrap();
        assert_eq!(url, "https://github.com/acme/app/pull/42");

        let calls = executor.calls();
        assert_eq!(calls[0].command, "push -u origin swarm/r1/integration");
        let gh = &calls[1].command;
        assert!(gh.starts_with("gh pr create --title [swarm] Add login flow --body "));
        assert!(gh.ends_with("--base main --head swarm/r1/integration"));
        assert!(gh.contains("Not merged: docs"));
        assert_eq!(calls[1].dir.as_deref(), Some(executor.repo_root().as_path()));
    }

    #[tokio::test]
    async fn test_pr_delivery_stops_when_push_fails() {
        let executor = Arc::new(
            MockVcsExecutor::new()
                .with_prefix("push", VcsOutput::failed("no such remote 'origin'")),
        );
        let delivery = GhPrDelivery::new(executor.clone(), executor.clone());

        let err = delivery.deliver(&integrated_run()).await.unwrap_err();
        assert!(matches!(err, SwarmError::VcsCommand(_)));
        assert!(executor.calls_matching("gh").is_empty());
    }

    #[tokio::test]
    async fn test_pr_delivery_reports_gh_failure() {
        let executor = Arc::new(MockVcsExecutor::new().with_prefix(
            "gh pr create",
            VcsOutput::failed("a pull request already exists"),
        ));
        let delivery = GhPrDelivery::new(executor.clone(), executor.clone()).with_remote("fork");

        let err = delivery.deliver(&integrated_run()).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert_eq!(
            executor.calls_matching("push"),
            vec!["push -u fork swarm/r1/integration"]
        );
    }

    #[test]
    fn test_parse_pr_url() {
        assert_eq!(
            parse_pr_url("Warning: 2 uncommitted changes\nhttps://github.com/a/b/pull/3\n"),
            Some("https://github.com/a/b/pull/3".to_string())
        );
        assert_eq!(parse_pr_url("nothing here"), None);
    }
}
