//! Coordination artifacts exchanged between concurrently running workers
//!
//! All three kinds are advisory. Readers call `validate` and skip anything
//! that fails rather than propagating the error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{is_safe_identifier, WorkerId};

/// Broadcast note; one current value per worker, latest wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub topic: Option<String>,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Note {
    pub fn new(worker_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
            topic: None,
            content: content.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        check_id("worker_id", &self.worker_id)?;
        if self.content.trim().is_empty() {
            return Err("note content is empty".to_string());
        }
        Ok(())
    }
}

/// Kind of a directed message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Info,
    Question,
    Decision,
    Blocker,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Question => write!(f, "question"),
            Self::Decision => write!(f, "decision"),
            Self::Blocker => write!(f, "blocker"),
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "question" => Ok(Self::Question),
            "decision" => Ok(Self::Decision),
            "blocker" => Ok(Self::Blocker),
            _ => Err(format!("Invalid message kind: {}", s)),
        }
    }
}

/// Point-to-point message, immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Monotonic per `(from, to)` pair, starting at 1
    pub seq: u64,
    pub from: WorkerId,
    pub to: WorkerId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub topic: String,
    pub content: String,
}

impl Message {
    pub fn validate(&self) -> Result<(), String> {
        check_id("from", &self.from)?;
        check_id("to", &self.to)?;
        if self.seq == 0 {
            return Err("message sequence numbers start at 1".to_string());
        }
        if self.content.trim().is_empty() {
            return Err("message content is empty".to_string());
        }
        Ok(())
    }
}

/// Self-reported progress state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerState {
    #[default]
    Starting,
    InProgress,
    MilestoneReached,
    Blocked,
    Done,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::InProgress => write!(f, "in-progress"),
            Self::MilestoneReached => write!(f, "milestone-reached"),
            Self::Blocked => write!(f, "blocked"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Current milestone of one worker; latest wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub worker_id: WorkerId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub state: PeerState,
    #[serde(default)]
    pub milestone: String,
    #[serde(default)]
    pub details: String,
}

impl PeerStatus {
    pub fn new(worker_id: impl Into<String>, state: PeerState, milestone: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            timestamp: Utc::now(),
            state,
            milestone: milestone.into(),
            details: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        check_id("worker_id", &self.worker_id)
    }
}

fn check_id(field: &str, id: &str) -> Result<(), String> {
    if is_safe_identifier(id) {
        Ok(())
    } else {
        Err(format!("{} {:?} is not a valid worker id", field, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_validation() {
        assert!(Note::new("api", "exposes POST /login").validate().is_ok());
        assert!(Note::new("api", "   ").validate().is_err());
        assert!(Note::new("../x", "content").validate().is_err());
    }

    #[test]
    fn test_message_rejects_zero_sequence() {
        let message = Message {
            seq: 0,
            from: "a".into(),
            to: "b".into(),
            timestamp: Utc::now(),
            kind: MessageKind::Question,
            topic: "schema".into(),
            content: "which table?".into(),
        };
        assert!(message.validate().is_err());
        assert!(Message { seq: 1, ..message }.validate().is_ok());
    }

    #[test]
    fn test_peer_state_wire_names() {
        let status = PeerStatus::new("ui", PeerState::MilestoneReached, "forms done");
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"milestone-reached\""));
        assert_eq!("blocker".parse::<MessageKind>().unwrap(), MessageKind::Blocker);
    }
}
