//! Session event log - `.swarm/logs/<run_id>/events.jsonl`
//!
//! One JSON object per line, appended as the pipeline progresses. Writes are
//! fail-open: a broken log never changes the outcome of a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_core::fail_open::fail_open;
use swarm_core::{
    CapabilityTier, Checkpoint, Result, RunId, RunStatus, WorkerId, WorkerStatus, SWARM_DIR,
};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Maximum characters of free text kept per event
const EVENT_TEXT_CHARS: usize = 500;

/// Pipeline events worth keeping for post-mortem inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    RunStarted {
        objective: String,
        base_ref: String,
    },
    PlanReady {
        tasks: Vec<WorkerId>,
    },
    AttemptStarted {
        worker_id: WorkerId,
        attempt: u32,
        tier: CapabilityTier,
    },
    AttemptFinished {
        worker_id: WorkerId,
        attempt: u32,
        outcome: String,
        cost_usd: f64,
    },
    WorkerTerminal {
        worker_id: WorkerId,
        status: WorkerStatus,
        #[serde(default)]
        reason: Option<String>,
    },
    Merge {
        worker_id: WorkerId,
        clean: bool,
        #[serde(default)]
        conflicts: Vec<String>,
    },
    Review {
        findings: usize,
        fixed: bool,
    },
    Verification {
        command: String,
        passed: bool,
    },
    Gate {
        checkpoint: Checkpoint,
        decision: String,
    },
    RunFinished {
        status: RunStatus,
        #[serde(default)]
        delivery: Option<String>,
    },
}

/// One line of the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Append-only JSONL writer shared by every task of a run
#[derive(Debug, Clone)]
pub struct SessionLog {
    logs_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SessionLog {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn for_repo(repo_root: &Path) -> Self {
        Self::new(repo_root.join(SWARM_DIR).join("logs"))
    }

    pub fn path(&self, run_id: &RunId) -> PathBuf {
        self.logs_dir.join(run_id.as_str()).join("events.jsonl")
    }

    /// Append an event
    ///
    /// This operation is fail-open - logging failures won't fail the run
    pub async fn record(&self, run_id: &RunId, event: SessionEvent) {
        let record = SessionRecord {
            timestamp: Utc::now(),
            run_id: run_id.clone(),
            event: truncate_text(event),
        };
        fail_open("session_log::record", || self.append(&record)).await;
    }

    async fn append(&self, record: &SessionRecord) -> Result<()> {
        let path = self.path(&record.run_id);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every readable record of a run, in write order
    pub async fn read(&self, run_id: &RunId) -> Result<Vec<SessionRecord>> {
        let content = match fs::read_to_string(self.path(run_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

fn truncate_text(event: SessionEvent) -> SessionEvent {
    match event {
        SessionEvent::RunStarted {
            objective,
            base_ref,
        } => SessionEvent::RunStarted {
            objective: preview(&objective),
            base_ref,
        },
        SessionEvent::AttemptFinished {
            worker_id,
            attempt,
            outcome,
            cost_usd,
        } => SessionEvent::AttemptFinished {
            worker_id,
            attempt,
            outcome: preview(&outcome),
            cost_usd,
        },
        other => other,
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > EVENT_TEXT_CHARS {
        let truncated: String = text.chars().take(EVENT_TEXT_CHARS).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_events_append_in_order() {
        let dir = TempDir::new().unwrap();
        let log = SessionLog::new(dir.path());
        let run = RunId::from("r1");

        log.record(
            &run,
            SessionEvent::RunStarted {
                objective: "x".repeat(2000),
                base_ref: "main".into(),
            },
        )
        .await;
        log.record(
            &run,
            SessionEvent::PlanReady {
                tasks: vec!["api".into(), "ui".into()],
            },
        )
        .await;

        let records = log.read(&run).await.unwrap();
        assert_eq!(records.len(), 2);
        match &records[0].event {
            SessionEvent::RunStarted { objective, .. } => {
                assert_eq!(objective.chars().count(), EVENT_TEXT_CHARS + 3)
            }
            other => panic!("unexpected event {:?}", other),
        }

        let raw = std::fs::read_to_string(log.path(&run)).unwrap();
        assert!(raw.lines().nth(1).unwrap().contains("\"event\":\"plan_ready\""));
    }

    #[tokio::test]
    async fn test_unwritable_log_is_fail_open() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("logs");
        std::fs::write(&blocker, "a file, not a directory").unwrap();

        let log = SessionLog::new(&blocker);
        log.record(
            &RunId::from("r1"),
            SessionEvent::Review {
                findings: 0,
                fixed: false,
            },
        )
        .await;
        assert!(log.read(&RunId::from("r1")).await.is_err());
    }
}
