//! Coordination bus
//!
//! Filesystem-scoped, advisory exchange between concurrently running workers.
//! Each run gets its own directory:
//!
//! ```text
//! .swarm/coordination/<run_id>/
//!   notes/<worker>.json                  latest broadcast note per worker
//!   messages/<to>/<seq>-<from>.json      directed messages, never rewritten
//!   status/<worker>.json                 latest milestone per worker
//! ```
//!
//! Every write is an atomic replace. Reads validate each artifact and skip
//! (with a warning) anything malformed; nothing here fails a run.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm_agent::{PeerChannel, ProgressReporter};
use swarm_core::fsutil::{atomic_write_json, is_tmp_file};
use swarm_core::{
    is_safe_identifier, Message, MessageKind, Note, PeerState, PeerStatus, Plan, Result, RunId,
    SwarmError, WorkerId, SWARM_DIR,
};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type PairKey = (RunId, WorkerId, WorkerId);

/// Notes, messages and peer status of every run in a repository
#[derive(Debug, Clone)]
pub struct CoordinationBus {
    root: PathBuf,
    /// Last sequence number handed out per (run, from, to)
    sequences: Arc<Mutex<HashMap<PairKey, u64>>>,
}

impl CoordinationBus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sequences: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bus for a repository (`<repo>/.swarm/coordination`)
    pub fn for_repo(repo_root: &Path) -> Self {
        Self::new(repo_root.join(SWARM_DIR).join("coordination"))
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    fn notes_dir(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("notes")
    }

    fn inbox_dir(&self, run_id: &RunId, worker_id: &str) -> PathBuf {
        self.run_dir(run_id).join("messages").join(worker_id)
    }

    fn status_dir(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join("status")
    }

    /// Overwrite the sender's broadcast note
    pub async fn publish_note(&self, run_id: &RunId, note: &Note) -> Result<()> {
        note.validate().map_err(SwarmError::Validation)?;
        let path = self
            .notes_dir(run_id)
            .join(format!("{}.json", note.worker_id));
        atomic_write_json(&path, note).await?;
        debug!("Worker {} published a note in run {}", note.worker_id, run_id);
        Ok(())
    }

    /// Latest note of every worker in the run
    pub async fn list_notes(&self, run_id: &RunId) -> Result<BTreeMap<WorkerId, Note>> {
        let notes: Vec<(PathBuf, Note)> = read_artifacts(&self.notes_dir(run_id)).await?;
        let mut latest = BTreeMap::new();
        for (path, note) in notes {
            if let Err(reason) = note.validate().and_then(|_| stem_matches(&path, &note.worker_id)) {
                skip_artifact(&path, reason);
                continue;
            }
            latest.insert(note.worker_id.clone(), note);
        }
        Ok(latest)
    }

    /// Deliver a message into the recipient's inbox
    ///
    /// Sequence numbers are allocated per `(from, to)` pair, starting at 1
    /// and continuing after whatever is already on disk.
    pub async fn send_message(
        &self,
        run_id: &RunId,
        from: &str,
        to: &str,
        kind: MessageKind,
        topic: &str,
        content: &str,
    ) -> Result<Message> {
        if !is_safe_identifier(to) {
            return Err(SwarmError::Validation(format!(
                "invalid message recipient {:?}",
                to
            )));
        }

        let inbox = self.inbox_dir(run_id, to);
        let key = (run_id.clone(), from.to_string(), to.to_string());

        // held until the file exists so numbers are never reused
        let mut sequences = self.sequences.lock().await;
        let last = match sequences.get(&key) {
            Some(seq) => *seq,
            None => highest_sequence(&inbox, from).await?,
        };

        let message = Message {
            seq: last + 1,
            from: from.to_string(),
            to: to.to_string(),
            timestamp: Utc::now(),
            kind,
            topic: topic.to_string(),
            content: content.to_string(),
        };
        message.validate().map_err(SwarmError::Validation)?;

        let path = inbox.join(format!("{:08}-{}.json", message.seq, from));
        atomic_write_json(&path, &message).await?;
        sequences.insert(key, message.seq);

        debug!(
            "Message {} -> {} #{} in run {}",
            from, to, message.seq, run_id
        );
        Ok(message)
    }

    /// Full inbox of a worker, ordered by sequence number
    ///
    /// Reading does not consume; every call returns everything delivered so far.
    pub async fn read_inbox(&self, run_id: &RunId, worker_id: &str) -> Result<Vec<Message>> {
        let messages: Vec<(PathBuf, Message)> =
            read_artifacts(&self.inbox_dir(run_id, worker_id)).await?;
        let mut inbox = Vec::new();
        for (path, message) in messages {
            let check = message.validate().and_then(|_| {
                if message.to == worker_id {
                    Ok(())
                } else {
                    Err(format!("addressed to {}", message.to))
                }
            });
            if let Err(reason) = check {
                skip_artifact(&path, reason);
                continue;
            }
            inbox.push(message);
        }
        inbox.sort_by(|a, b| {
            a.seq
                .cmp(&b.seq)
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.from.cmp(&b.from))
        });
        Ok(inbox)
    }

    /// Overwrite a worker's milestone
    pub async fn publish_status(&self, run_id: &RunId, status: &PeerStatus) -> Result<()> {
        status.validate().map_err(SwarmError::Validation)?;
        let path = self
            .status_dir(run_id)
            .join(format!("{}.json", status.worker_id));
        atomic_write_json(&path, status).await
    }

    /// Latest milestone of every worker in the run
    pub async fn list_status(&self, run_id: &RunId) -> Result<BTreeMap<WorkerId, PeerStatus>> {
        let statuses: Vec<(PathBuf, PeerStatus)> =
            read_artifacts(&self.status_dir(run_id)).await?;
        let mut latest = BTreeMap::new();
        for (path, status) in statuses {
            if let Err(reason) = status
                .validate()
                .and_then(|_| stem_matches(&path, &status.worker_id))
            {
                skip_artifact(&path, reason);
                continue;
            }
            latest.insert(status.worker_id.clone(), status);
        }
        Ok(latest)
    }

    /// Markdown digest of everything exchanged in the run
    pub async fn summary(&self, run_id: &RunId) -> Result<String> {
        let notes = self.list_notes(run_id).await?;
        let statuses = self.list_status(run_id).await?;

        let mut messages = Vec::new();
        let messages_root = self.run_dir(run_id).join("messages");
        if let Ok(mut entries) = fs::read_dir(&messages_root).await {
            while let Some(entry) = entries.next_entry().await? {
                let recipient = entry.file_name().to_string_lossy().to_string();
                if is_safe_identifier(&recipient) {
                    messages.extend(self.read_inbox(run_id, &recipient).await?);
                }
            }
        }
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));

        let mut out = String::new();
        out.push_str("## Worker notes\n\n");
        if notes.is_empty() {
            out.push_str("_none_\n");
        }
        for note in notes.values() {
            match &note.topic {
                Some(topic) => out.push_str(&format!(
                    "- **{}** ({}): {}\n",
                    note.worker_id, topic, note.content
                )),
                None => out.push_str(&format!("- **{}**: {}\n", note.worker_id, note.content)),
            }
        }

        out.push_str("\n## Messages\n\n");
        if messages.is_empty() {
            out.push_str("_none_\n");
        }
        for message in &messages {
            out.push_str(&format!(
                "- {} -> {} [{}] {}{}\n",
                message.from,
                message.to,
                message.kind,
                if message.topic.is_empty() {
                    String::new()
                } else {
                    format!("{}: ", message.topic)
                },
                message.content
            ));
        }

        out.push_str("\n## Status\n\n");
        if statuses.is_empty() {
            out.push_str("_none_\n");
        }
        for status in statuses.values() {
            out.push_str(&format!(
                "- **{}**: {} {}\n",
                status.worker_id, status.state, status.milestone
            ));
        }
        Ok(out)
    }

    /// Workers worth messaging: coupled tasks (either direction) and tasks
    /// sharing an interface hint, in plan order
    pub fn peers_for(plan: &Plan, worker_id: &str) -> Vec<WorkerId> {
        let Some(task) = plan.task(worker_id) else {
            return Vec::new();
        };
        plan.tasks
            .iter()
            .filter(|other| other.id != task.id)
            .filter(|other| {
                task.coupled_with.contains(&other.id)
                    || other.coupled_with.contains(&task.id)
                    || other.interfaces.iter().any(|i| task.interfaces.contains(i))
            })
            .map(|other| other.id.clone())
            .collect()
    }

    /// Remove every artifact of a run
    pub async fn cleanup(&self, run_id: &RunId) -> Result<()> {
        let dir = self.run_dir(run_id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.sequences
            .lock()
            .await
            .retain(|(run, _, _), _| run != run_id);
        Ok(())
    }

    /// A worker-bound handle for agents
    pub fn channel(
        &self,
        run_id: &RunId,
        worker_id: &str,
        progress: ProgressReporter,
    ) -> WorkerChannel {
        WorkerChannel {
            bus: self.clone(),
            run_id: run_id.clone(),
            worker_id: worker_id.to_string(),
            progress,
        }
    }
}

/// [`PeerChannel`] bound to one run and one sender
///
/// Every write counts as progress for the stall watchdog.
#[derive(Debug, Clone)]
pub struct WorkerChannel {
    bus: CoordinationBus,
    run_id: RunId,
    worker_id: WorkerId,
    progress: ProgressReporter,
}

#[async_trait]
impl PeerChannel for WorkerChannel {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn publish_note(&self, topic: Option<&str>, content: &str, tags: &[String]) -> Result<()> {
        let mut note = Note::new(&self.worker_id, content).with_tags(tags.to_vec());
        if let Some(topic) = topic {
            note = note.with_topic(topic);
        }
        self.bus.publish_note(&self.run_id, &note).await?;
        self.progress.heartbeat();
        Ok(())
    }

    async fn notes(&self) -> Result<BTreeMap<WorkerId, Note>> {
        self.bus.list_notes(&self.run_id).await
    }

    async fn send_message(
        &self,
        to: &str,
        kind: MessageKind,
        topic: &str,
        content: &str,
    ) -> Result<u64> {
        let message = self
            .bus
            .send_message(&self.run_id, &self.worker_id, to, kind, topic, content)
            .await?;
        self.progress.heartbeat();
        Ok(message.seq)
    }

    async fn inbox(&self) -> Result<Vec<Message>> {
        self.bus.read_inbox(&self.run_id, &self.worker_id).await
    }

    async fn publish_status(&self, state: PeerState, milestone: &str, details: &str) -> Result<()> {
        let status = PeerStatus::new(&self.worker_id, state, milestone).with_details(details);
        self.bus.publish_status(&self.run_id, &status).await?;
        self.progress.heartbeat();
        Ok(())
    }

    async fn statuses(&self) -> Result<BTreeMap<WorkerId, PeerStatus>> {
        self.bus.list_status(&self.run_id).await
    }
}

/// Parse every `*.json` file in `dir`, skipping temp files and unparsable ones
async fn read_artifacts<T: DeserializeOwned>(dir: &Path) -> Result<Vec<(PathBuf, T)>> {
    let mut artifacts = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(artifacts),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if is_tmp_file(&path) || path.extension().map_or(true, |ext| ext != "json") {
            continue;
        }
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                skip_artifact(&path, e.to_string());
                continue;
            }
        };
        match serde_json::from_str::<T>(&content) {
            Ok(value) => artifacts.push((path, value)),
            Err(e) => skip_artifact(&path, e.to_string()),
        }
    }
    Ok(artifacts)
}

/// Highest sequence number `from` has already delivered into `inbox`
async fn highest_sequence(inbox: &Path, from: &str) -> Result<u64> {
    let mut highest = 0;
    let mut entries = match fs::read_dir(inbox).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(stem) = name.strip_suffix(".json") else {
            continue;
        };
        let Some((seq, sender)) = stem.split_once('-') else {
            continue;
        };
        if sender != from {
            continue;
        }
        if let Ok(seq) = seq.parse::<u64>() {
            highest = highest.max(seq);
        }
    }
    Ok(highest)
}

fn stem_matches(path: &Path, worker_id: &str) -> std::result::Result<(), String> {
    let stem = path.file_stem().map(|s| s.to_string_lossy().to_string());
    if stem.as_deref() == Some(worker_id) {
        Ok(())
    } else {
        Err(format!("file name does not match worker {}", worker_id))
    }
}

fn skip_artifact(path: &Path, reason: String) {
    let err = SwarmError::CoordinationArtifact {
        path: path.display().to_string(),
        reason,
    };
    warn!("{}", err);
}
