//! Integration of worker branches
//!
//! Succeeded branches are merged one at a time, in plan order, into the run's
//! integration branch. A conflicted merge goes to the conflict resolver once;
//! if it is disabled or fails, the merge is aborted and the conflict surfaces
//! as [`SwarmError::MergeConflict`]. After merging, an optional semantic review
//! runs, then the build and verification commands.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use swarm_agent::{
    has_conflict_markers, ConflictContext, ConflictFile, ConflictResolver, ReviewCapability,
    ReviewContext,
};
use swarm_core::fail_open::fail_open;
use swarm_core::{
    IntegrationConfig, IntegrationRecord, Result, Run, SwarmError, WorkerId, WorkerStatus,
};
use swarm_vcs::{
    branch_name, run_check, MergeOutcome, VcsExecutor, Workspace, WorktreeManager,
    INTEGRATION_WORKER,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination::CoordinationBus;
use crate::session::{SessionEvent, SessionLog};

/// Placeholder for the left side of a conflict when nothing was merged yet
const BASE_SIDE: &str = "base";

pub struct Integrator<E: VcsExecutor + ?Sized> {
    worktrees: WorktreeManager<E>,
    config: IntegrationConfig,
    resolver: Option<Arc<dyn ConflictResolver>>,
    reviewer: Option<Arc<dyn ReviewCapability>>,
    bus: CoordinationBus,
    session: SessionLog,
    cancel: CancellationToken,
}

impl<E: VcsExecutor + ?Sized> Integrator<E> {
    pub fn new(
        worktrees: WorktreeManager<E>,
        config: IntegrationConfig,
        bus: CoordinationBus,
        session: SessionLog,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worktrees,
            config,
            resolver: None,
            reviewer: None,
            bus,
            session,
            cancel,
        }
    }

    pub fn with_resolver(mut self, resolver: Option<Arc<dyn ConflictResolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_reviewer(mut self, reviewer: Option<Arc<dyn ReviewCapability>>) -> Self {
        self.reviewer = reviewer;
        self
    }

    /// Merge every succeeded worker and check the result
    ///
    /// The integration branch is reset to the run's base ref first, so
    /// repeating integration reproduces the same merge sequence.
    pub async fn integrate(&self, run: &Run) -> Result<IntegrationRecord> {
        let succeeded = run.succeeded_workers();
        if succeeded.is_empty() {
            return Err(SwarmError::Other(format!(
                "run {} has no succeeded workers to integrate",
                run.run_id
            )));
        }

        let workspace = self
            .worktrees
            .acquire(&run.run_id, INTEGRATION_WORKER, &run.base_ref)
            .await?;
        let repo = self.worktrees.repo();
        repo.reset_hard(&workspace.path, &run.base_ref).await?;

        let mut record = IntegrationRecord {
            branch: workspace.branch.clone(),
            worktree_path: Some(workspace.path.clone()),
            unmerged: run
                .workers
                .iter()
                .filter(|w| w.status != WorkerStatus::Succeeded)
                .map(|w| w.worker_id.clone())
                .collect(),
            ..IntegrationRecord::default()
        };

        info!(
            "Integrating {} branches into {}",
            succeeded.len(),
            workspace.branch
        );

        for worker in succeeded {
            if self.cancel.is_cancelled() {
                return Err(SwarmError::Cancelled(run.run_id.to_string()));
            }

            let branch = worker
                .branch
                .clone()
                .unwrap_or_else(|| branch_name(&run.run_id, &worker.worker_id));
            let headline = worker
                .summary
                .as_deref()
                .and_then(|s| s.lines().next())
                .unwrap_or(&worker.title);
            let message = format!("Merge {}: {}", worker.worker_id, headline);

            match repo.merge(&workspace.path, &branch, &message).await? {
                MergeOutcome::Clean => {
                    debug!("Merged {} cleanly", worker.worker_id);
                    self.merge_event(run, &worker.worker_id, true, Vec::new())
                        .await;
                }
                MergeOutcome::Conflicted { files } => {
                    let left = attribute_conflict(run, &record.merged, &files);
                    warn!(
                        "Merging {} conflicts with {} on {}",
                        worker.worker_id,
                        left,
                        files.join(", ")
                    );
                    self.merge_event(run, &worker.worker_id, false, files.clone())
                        .await;

                    let resolved = self
                        .resolve(run, &workspace, &left, &worker.worker_id, &branch, &files, &message)
                        .await;
                    if let Err(e) = resolved {
                        warn!("Conflict resolution failed: {}", e);
                        repo.merge_abort(&workspace.path).await?;
                        return Err(SwarmError::MergeConflict {
                            run_id: run.run_id.to_string(),
                            left,
                            right: worker.worker_id.clone(),
                            files,
                        });
                    }
                    record.resolved.push(worker.worker_id.clone());
                }
            }
            record.merged.push(worker.worker_id.clone());
        }

        self.review(run, &workspace, &mut record).await;
        self.checks(run, &workspace, &mut record).await?;

        info!(
            "Integration of run {} finished: {} merged, {} resolved, checks {}",
            run.run_id,
            record.merged.len(),
            record.resolved.len(),
            if record.checks_passed() { "passed" } else { "failed" }
        );
        Ok(record)
    }

    /// Hand an in-progress conflicted merge to the resolver and conclude it
    #[allow(clippy::too_many_arguments)]
    async fn resolve(
        &self,
        run: &Run,
        workspace: &Workspace,
        left: &str,
        right: &str,
        right_branch: &str,
        files: &[String],
        message: &str,
    ) -> Result<()> {
        let resolver = match &self.resolver {
            Some(resolver) if self.config.resolve_conflicts => resolver,
            _ => {
                return Err(SwarmError::Validation(
                    "conflict resolution is disabled".to_string(),
                ))
            }
        };

        let repo = self.worktrees.repo();
        let left_diff = match run.worker(left).and_then(|w| w.branch.clone()) {
            Some(left_branch) => {
                repo.diff_range(&workspace.path, &run.base_ref, &left_branch, files)
                    .await?
            }
            None => String::new(),
        };
        let right_diff = repo
            .diff_range(&workspace.path, &run.base_ref, right_branch, files)
            .await?;

        let mut conflict_files = Vec::new();
        for path in files {
            let content = match tokio::fs::read_to_string(workspace.path.join(path)).await {
                Ok(content) => content,
                Err(e) => {
                    debug!("Could not read conflicted file {}: {}", path, e);
                    String::new()
                }
            };
            conflict_files.push(ConflictFile {
                path: path.clone(),
                content,
            });
        }

        let coordination = fail_open("integrator::coordination_summary", || {
            self.bus.summary(&run.run_id)
        })
        .await
        .unwrap_or_default();

        let context = ConflictContext {
            run_id: run.run_id.clone(),
            left: left.to_string(),
            right: right.to_string(),
            left_diff,
            right_diff,
            files: conflict_files,
            coordination,
            workspace: workspace.path.clone(),
        };

        let resolved = resolver.resolve(&context, self.cancel.child_token()).await?;
        for file in &resolved {
            write_resolved(&workspace.path, &file.path, &file.content).await?;
        }

        for path in files {
            let content = tokio::fs::read_to_string(workspace.path.join(path))
                .await
                .unwrap_or_default();
            if has_conflict_markers(&content) {
                return Err(SwarmError::Agent(format!(
                    "conflict markers remain in {}",
                    path
                )));
            }
        }

        repo.add(&workspace.path, files).await?;
        repo.commit(&workspace.path, message).await?;
        info!("Resolved conflict between {} and {}", left, right);
        Ok(())
    }

    /// Semantic review of the aggregate diff; never fails integration
    async fn review(&self, run: &Run, workspace: &Workspace, record: &mut IntegrationRecord) {
        if !self.config.review {
            return;
        }
        let (Some(reviewer), Some(plan)) = (&self.reviewer, &run.plan) else {
            return;
        };

        let repo = self.worktrees.repo();
        let diff = match repo
            .diff_range(&workspace.path, &run.base_ref, "HEAD", &[])
            .await
        {
            Ok(diff) => diff,
            Err(e) => {
                warn!("Skipping review, could not diff integration branch: {}", e);
                return;
            }
        };
        let coordination = fail_open("integrator::coordination_summary", || {
            self.bus.summary(&run.run_id)
        })
        .await
        .unwrap_or_default();

        let context = ReviewContext {
            run_id: run.run_id.clone(),
            plan: plan.clone(),
            diff,
            worker_summaries: run
                .succeeded_workers()
                .into_iter()
                .map(|w| {
                    (
                        w.worker_id.clone(),
                        w.summary.clone().unwrap_or_default(),
                    )
                })
                .collect(),
            coordination,
            workspace: workspace.path.clone(),
        };

        let findings = match reviewer.review(&context, self.cancel.child_token()).await {
            Ok(findings) => findings,
            Err(e) => {
                warn!("Semantic review failed: {}", e);
                return;
            }
        };
        info!("Semantic review reported {} findings", findings.len());

        if !findings.is_empty() && self.config.fix_findings {
            match reviewer
                .fix(&context, &findings, self.cancel.child_token())
                .await
            {
                Ok(()) => {
                    match repo
                        .commit_all(&workspace.path, "Fix integration review findings")
                        .await
                    {
                        Ok(_) => record.findings_fixed = true,
                        Err(e) => warn!("Could not commit review fixes: {}", e),
                    }
                }
                Err(e) => warn!("Fixing review findings failed: {}", e),
            }
        }

        self.session
            .record(
                &run.run_id,
                SessionEvent::Review {
                    findings: findings.len(),
                    fixed: record.findings_fixed,
                },
            )
            .await;
        record.findings = findings;
    }

    /// Build, then verify; a failing check is reported, never rolled back
    async fn checks(
        &self,
        run: &Run,
        workspace: &Workspace,
        record: &mut IntegrationRecord,
    ) -> Result<()> {
        let plan = run.plan.as_ref();
        let build = plan.and_then(|p| p.build_command.clone());
        let verify = plan
            .and_then(|p| p.verify_command.clone())
            .or_else(|| self.config.verify_command.clone());

        if let Some(command) = build {
            let report = run_check(&workspace.path, &command).await?;
            self.check_event(run, &report.command, report.passed).await;
            if !report.passed {
                warn!("Build failed on {}: {}", record.branch, command);
            }
            record.build = Some(report);
        }

        if let Some(command) = verify {
            let report = run_check(&workspace.path, &command).await?;
            self.check_event(run, &report.command, report.passed).await;
            if !report.passed {
                warn!("Verification failed on {}: {}", record.branch, command);
            }
            record.verification = Some(report);
        }
        Ok(())
    }

    async fn merge_event(&self, run: &Run, worker_id: &str, clean: bool, conflicts: Vec<String>) {
        self.session
            .record(
                &run.run_id,
                SessionEvent::Merge {
                    worker_id: worker_id.to_string(),
                    clean,
                    conflicts,
                },
            )
            .await;
    }

    async fn check_event(&self, run: &Run, command: &str, passed: bool) {
        self.session
            .record(
                &run.run_id,
                SessionEvent::Verification {
                    command: command.to_string(),
                    passed,
                },
            )
            .await;
    }
}

/// The already-merged worker a conflict is blamed on
///
/// The latest merged worker that changed one of the conflicted files, else
/// the latest merged worker, else the base ref.
pub fn attribute_conflict(run: &Run, merged: &[WorkerId], files: &[String]) -> String {
    let conflicted: HashSet<&str> = files.iter().map(String::as_str).collect();
    merged
        .iter()
        .rev()
        .find(|id| {
            run.worker(id).map_or(false, |w| {
                w.files_changed
                    .iter()
                    .any(|f| conflicted.contains(f.as_str()))
            })
        })
        .or_else(|| merged.last())
        .cloned()
        .unwrap_or_else(|| BASE_SIDE.to_string())
}

async fn write_resolved(root: &Path, relative: &str, content: &str) -> Result<()> {
    let relative_path = Path::new(relative);
    if relative_path.is_absolute()
        || relative_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(SwarmError::Validation(format!(
            "resolved file {} is outside the worktree",
            relative
        )));
    }
    let path = root.join(relative_path);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, content).await?;
    Ok(())
}
