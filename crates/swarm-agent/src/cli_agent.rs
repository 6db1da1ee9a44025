//! Subprocess backend driving a coding-agent CLI
//!
//! The CLI runs non-interactively with streamed JSON output. Every output line
//! counts as progress; the final `result` event carries the answer text and
//! the cumulative cost. Cancellation kills the subprocess, and so does a shell
//! tool call refused by the [`CommandGuard`].
//!
//! Agents reach the coordination bus through directive lines in their final
//! answer:
//!
//! ```text
//! NOTE: exposes AuthService::login(email, password) -> Session
//! MESSAGE ui question: should the session token live in a cookie?
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use swarm_core::fail_open::fail_open;
use swarm_core::{
    AgentConfig, CapabilityTier, MessageKind, PeerState, Result, ReviewFinding, SwarmError,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::{AgentCapability, AgentOutcome, AgentRequest};
use crate::guards::CommandGuard;
use crate::peer::PeerChannel;
use crate::planner::PlanningCapability;
use crate::progress::ProgressReporter;
use crate::resolver::{has_conflict_markers, ConflictContext, ConflictResolver, ResolvedFile};
use crate::review::{ReviewCapability, ReviewContext};

/// Maximum characters of a diff embedded in a prompt
const PROMPT_DIFF_CHARS: usize = 30_000;

/// One parsed line of the agent's stream-JSON output
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Final event of a session
    Result {
        is_error: bool,
        text: String,
        cost_usd: f64,
    },
    /// Tool calls requested by an assistant turn, as `(name, input)`
    ToolCalls(Vec<(String, serde_json::Value)>),
    /// Anything else (system, plain assistant text, tool results)
    Activity,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    message: Option<serde_json::Value>,
}

fn tool_calls(message: &serde_json::Value) -> Vec<(String, serde_json::Value)> {
    let Some(blocks) = message.get("content").and_then(|c| c.as_array()) else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
        .filter_map(|b| {
            let name = b.get("name")?.as_str()?.to_string();
            let input = b.get("input").cloned().unwrap_or_default();
            Some((name, input))
        })
        .collect()
}

/// Parse one stream line; `None` for non-JSON noise
pub fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let raw: RawEvent = serde_json::from_str(line.trim()).ok()?;
    match raw.kind.as_str() {
        "result" => Some(StreamEvent::Result {
            is_error: raw.is_error,
            text: raw.result.unwrap_or_default(),
            cost_usd: raw.total_cost_usd.unwrap_or(0.0),
        }),
        "assistant" => {
            let calls = raw.message.as_ref().map(tool_calls).unwrap_or_default();
            if calls.is_empty() {
                Some(StreamEvent::Activity)
            } else {
                Some(StreamEvent::ToolCalls(calls))
            }
        }
        _ => Some(StreamEvent::Activity),
    }
}

/// Coordination directive found in an agent's final answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Note(String),
    Message {
        to: String,
        kind: MessageKind,
        content: String,
    },
}

/// Extract `NOTE:` and `MESSAGE <peer> [kind]:` lines
pub fn parse_directives(text: &str) -> Vec<Directive> {
    let mut directives = Vec::new();
    for line in text.lines().map(str::trim) {
        if let Some(content) = line.strip_prefix("NOTE:") {
            let content = content.trim();
            if !content.is_empty() {
                directives.push(Directive::Note(content.to_string()));
            }
        } else if let Some(rest) = line.strip_prefix("MESSAGE ") {
            let Some((head, content)) = rest.split_once(':') else {
                continue;
            };
            let mut words = head.split_whitespace();
            let Some(to) = words.next() else {
                continue;
            };
            let kind = words
                .next()
                .and_then(|k| k.parse().ok())
                .unwrap_or_default();
            let content = content.trim();
            if !content.is_empty() {
                directives.push(Directive::Message {
                    to: to.to_string(),
                    kind,
                    content: content.to_string(),
                });
            }
        }
    }
    directives
}

/// Outermost `open`..`close` delimited span of `text`
fn extract_delimited<'a>(text: &'a str, open: char, close: char) -> Option<&'a str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Pull the first JSON object out of free-form agent text
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let span = extract_delimited(text, '{', '}')?;
    serde_json::from_str(span).ok()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}\n... (truncated)", kept)
}

/// Outcome of one CLI session
#[derive(Debug, Default)]
struct Session {
    text: String,
    is_error: bool,
    cost_usd: f64,
    finished: bool,
    cancelled: bool,
}

/// Coding-agent CLI used as agent, planner, resolver and reviewer
#[derive(Debug, Clone)]
pub struct ClaudeCli {
    config: AgentConfig,
    guard: CommandGuard,
}

impl ClaudeCli {
    pub fn new(config: AgentConfig) -> Self {
        let guard = CommandGuard::new(&config.deny_commands);
        if guard.is_empty() {
            debug!("No shell command deny rules configured");
        }
        Self { config, guard }
    }

    /// Arguments shared by every session
    fn base_args(&self, model: &str) -> Vec<String> {
        let mut args: Vec<String> = ["--output-format", "stream-json", "--verbose"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(["--model".to_string(), model.to_string()]);
        args.extend(["--permission-mode".to_string(), "acceptEdits".to_string()]);
        for rule in &self.config.disallowed_tools {
            args.push(format!("--disallowedTools={}", rule));
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    pub fn model_for(&self, tier: CapabilityTier) -> &str {
        match tier {
            CapabilityTier::Standard => &self.config.standard_model,
            CapabilityTier::Escalated => &self.config.escalated_model,
        }
    }

    async fn run_session(
        &self,
        cwd: &Path,
        model: &str,
        prompt: &str,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        debug!(
            "Spawning {} (model {}) in {}",
            self.config.program,
            model,
            cwd.display()
        );

        let mut child = Command::new(&self.config.program)
            .arg("-p")
            .arg(prompt)
            .args(self.base_args(model))
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SwarmError::Agent(format!("Failed to spawn {}: {}", self.config.program, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SwarmError::Agent("agent stdout unavailable".to_string()))?;
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text).await;
                text
            })
        });

        let mut session = Session::default();
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill agent process: {}", e);
                    }
                    session.cancelled = true;
                    break;
                }
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    progress.heartbeat();
                    match parse_stream_line(&line) {
                        Some(StreamEvent::Result { is_error, text, cost_usd }) => {
                            session.is_error = is_error;
                            session.text = text;
                            session.cost_usd = cost_usd;
                            session.finished = true;
                            progress.cost(cost_usd);
                        }
                        Some(StreamEvent::ToolCalls(calls)) => {
                            let blocked = calls
                                .iter()
                                .find_map(|(name, input)| self.guard.check_tool(name, input));
                            if let Some(blocked) = blocked {
                                if let Err(e) = child.kill().await {
                                    warn!("Failed to kill agent process: {}", e);
                                }
                                session.is_error = true;
                                session.text = blocked.to_string();
                                session.finished = true;
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        if session.cancelled {
            return Ok(session);
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !session.finished {
            session.is_error = true;
            session.text = if stderr.trim().is_empty() {
                format!("agent exited ({}) without a result", status)
            } else {
                format!("agent exited ({}): {}", status, stderr.trim())
            };
        }

        Ok(session)
    }

    async fn peer_context(&self, channel: &dyn PeerChannel, peers: &[String]) -> String {
        let mut text = String::new();

        if let Some(notes) = fail_open("cli_agent::notes", || channel.notes()).await {
            let notes: Vec<_> = notes
                .values()
                .filter(|n| n.worker_id != channel.worker_id())
                .collect();
            if !notes.is_empty() {
                text.push_str("\n## Notes from other workers\n");
                for note in notes {
                    let topic = note.topic.as_deref().unwrap_or("general");
                    text.push_str(&format!("- {} ({}): {}\n", note.worker_id, topic, note.content));
                }
            }
        }

        if let Some(inbox) = fail_open("cli_agent::inbox", || channel.inbox()).await {
            if !inbox.is_empty() {
                text.push_str("\n## Messages for you\n");
                for message in inbox {
                    text.push_str(&format!(
                        "- #{} from {} [{}] {}: {}\n",
                        message.seq, message.from, message.kind, message.topic, message.content
                    ));
                }
            }
        }

        text.push_str("\n## Coordination\n");
        if peers.is_empty() {
            text.push_str("No other worker depends on your interfaces.\n");
        } else {
            text.push_str(&format!(
                "Workers sharing interfaces with you: {}.\n",
                peers.join(", ")
            ));
        }
        text.push_str(
            "To share information, end your final answer with lines of the form\n\
             `NOTE: <what others should know>` or\n\
             `MESSAGE <worker> [info|question|decision|blocker]: <text>`.\n",
        );
        text
    }

    async fn publish_directives(&self, channel: &dyn PeerChannel, text: &str) {
        for directive in parse_directives(text) {
            match directive {
                Directive::Note(content) => {
                    fail_open("cli_agent::publish_note", || {
                        channel.publish_note(None, &content, &[])
                    })
                    .await;
                }
                Directive::Message { to, kind, content } => {
                    fail_open("cli_agent::send_message", || {
                        channel.send_message(&to, kind, "", &content)
                    })
                    .await;
                }
            }
        }
    }
}

fn task_prompt(request: &AgentRequest) -> String {
    let task = &request.task;
    let mut prompt = format!("## Task: {}\n\n{}\n", task.display_title(), request.objective);

    if !task.scope.is_empty() {
        prompt.push_str("\n## Files in scope\n");
        for path in &task.scope {
            prompt.push_str(&format!("- {}\n", path));
        }
    }
    if !task.interfaces.is_empty() {
        prompt.push_str("\n## Shared interfaces\n");
        for interface in &task.interfaces {
            prompt.push_str(&format!("- {}\n", interface));
        }
    }
    if !task.acceptance.is_empty() {
        prompt.push_str("\n## Acceptance criteria\n");
        for criterion in &task.acceptance {
            prompt.push_str(&format!("- {}\n", criterion));
        }
    }
    prompt.push_str(
        "\nWork only inside the current directory. Commit your changes with a clear \
         message when done, then reply with a short summary.\n",
    );
    prompt
}

#[async_trait]
impl AgentCapability for ClaudeCli {
    async fn invoke(
        &self,
        request: AgentRequest,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<AgentOutcome> {
        let mut prompt = task_prompt(&request);
        if let Some(channel) = &request.channel {
            prompt.push_str(&self.peer_context(channel.as_ref(), &request.peers).await);
            fail_open("cli_agent::publish_status", || {
                channel.publish_status(PeerState::Starting, "attempt started", "")
            })
            .await;
        }

        let model = self.model_for(request.tier).to_string();
        info!(
            "Worker {} attempt {} using {}",
            request.worker_id, request.attempt, model
        );

        let session = self
            .run_session(&request.workspace, &model, &prompt, &progress, &cancel)
            .await?;

        if session.cancelled {
            return Ok(AgentOutcome::Cancelled {
                cost_usd: session.cost_usd,
            });
        }

        if let Some(channel) = &request.channel {
            self.publish_directives(channel.as_ref(), &session.text).await;
        }

        if session.is_error {
            Ok(AgentOutcome::Failed {
                message: session.text,
                cost_usd: session.cost_usd,
            })
        } else {
            Ok(AgentOutcome::Completed {
                summary: session.text,
                cost_usd: session.cost_usd,
                touched_files: Vec::new(),
            })
        }
    }
}

#[async_trait]
impl PlanningCapability for ClaudeCli {
    async fn plan(
        &self,
        objective: &str,
        max_tasks: usize,
        repo_root: &Path,
    ) -> Result<serde_json::Value> {
        let prompt = format!(
            "Decompose this objective into at most {max_tasks} independent tasks that can be \
             implemented in parallel by separate engineers, each in their own copy of the repository.\n\n\
             ## Objective\n{objective}\n\n\
             Reply with a single JSON object and nothing else:\n\
             {{\"objective\": str, \"reasoning\": str, \"integration_notes\": str,\n \
             \"build_command\": str | null, \"verify_command\": str | null,\n \
             \"tasks\": [{{\"id\": \"short-kebab-id\", \"title\": str, \"objective\": str,\n \
             \"scope\": [file paths], \"coupled_with\": [task ids], \"interfaces\": [str],\n \
             \"acceptance\": [str]}}]}}\n"
        );

        let session = self
            .run_session(
                repo_root,
                &self.config.planner_model,
                &prompt,
                &ProgressReporter::noop(),
                &CancellationToken::new(),
            )
            .await?;

        if session.is_error {
            return Err(SwarmError::Agent(format!("planner failed: {}", session.text)));
        }
        info!("Planner finished (${:.2})", session.cost_usd);

        extract_json_object(&session.text).ok_or_else(|| {
            SwarmError::Validation("planner did not return a JSON plan".to_string())
        })
    }
}

#[async_trait]
impl ConflictResolver for ClaudeCli {
    async fn resolve(
        &self,
        context: &ConflictContext,
        cancel: CancellationToken,
    ) -> Result<Vec<ResolvedFile>> {
        let mut prompt = format!(
            "A merge of worker `{}` into the integration branch conflicts with work from `{}`.\n\
             Edit the conflicted files in place so both intents are preserved and no conflict \
             markers remain. Do not commit.\n\n## Conflicted files\n",
            context.right, context.left
        );
        for file in &context.files {
            prompt.push_str(&format!("\n### {}\n```\n{}\n```\n", file.path, file.content));
        }
        prompt.push_str(&format!(
            "\n## Changes from {}\n```diff\n{}\n```\n\n## Changes from {}\n```diff\n{}\n```\n",
            context.left,
            truncate(&context.left_diff, PROMPT_DIFF_CHARS),
            context.right,
            truncate(&context.right_diff, PROMPT_DIFF_CHARS)
        ));
        if !context.coordination.is_empty() {
            prompt.push_str(&format!("\n{}\n", context.coordination));
        }

        let session = self
            .run_session(
                &context.workspace,
                &self.config.escalated_model,
                &prompt,
                &ProgressReporter::noop(),
                &cancel,
            )
            .await?;
        if session.cancelled {
            return Err(SwarmError::Cancelled(context.run_id.to_string()));
        }
        if session.is_error {
            return Err(SwarmError::Agent(format!("resolver failed: {}", session.text)));
        }

        let mut resolved = Vec::with_capacity(context.files.len());
        for file in &context.files {
            let content = tokio::fs::read_to_string(context.workspace.join(&file.path)).await?;
            if has_conflict_markers(&content) {
                return Err(SwarmError::Agent(format!(
                    "conflict markers remain in {}",
                    file.path
                )));
            }
            resolved.push(ResolvedFile {
                path: file.path.clone(),
                content,
            });
        }
        Ok(resolved)
    }
}

fn review_prompt(context: &ReviewContext) -> String {
    let mut prompt = String::from(
        "Review the integrated work of several engineers who worked in parallel.\n\
         Look only for: interface mismatches between their pieces, incompatible assumptions, \
         and missing wiring between components.\n\n## Tasks\n",
    );
    for task in &context.plan.tasks {
        prompt.push_str(&format!("- {}: {}\n", task.id, task.objective));
    }
    if !context.worker_summaries.is_empty() {
        prompt.push_str("\n## Worker summaries\n");
        for (worker, summary) in &context.worker_summaries {
            prompt.push_str(&format!("- {}: {}\n", worker, summary));
        }
    }
    if !context.coordination.is_empty() {
        prompt.push_str(&format!("\n{}\n", context.coordination));
    }
    prompt.push_str(&format!(
        "\n## Diff\n```diff\n{}\n```\n",
        truncate(&context.diff, PROMPT_DIFF_CHARS)
    ));
    prompt
}

#[async_trait]
impl ReviewCapability for ClaudeCli {
    async fn review(
        &self,
        context: &ReviewContext,
        cancel: CancellationToken,
    ) -> Result<Vec<ReviewFinding>> {
        let mut prompt = review_prompt(context);
        prompt.push_str(
            "\nReply with a JSON object {\"findings\": [{\"class\": \"interface_mismatch\" | \
             \"incompatible_assumption\" | \"missing_wiring\", \"description\": str, \
             \"workers\": [ids], \"files\": [paths]}]}. Use an empty list when nothing is wrong.\n",
        );

        let session = self
            .run_session(
                &context.workspace,
                &self.config.standard_model,
                &prompt,
                &ProgressReporter::noop(),
                &cancel,
            )
            .await?;
        if session.cancelled {
            return Err(SwarmError::Cancelled(context.run_id.to_string()));
        }
        if session.is_error {
            return Err(SwarmError::Agent(format!("review failed: {}", session.text)));
        }

        #[derive(Deserialize)]
        struct Findings {
            #[serde(default)]
            findings: Vec<ReviewFinding>,
        }

        let value = extract_json_object(&session.text)
            .ok_or_else(|| SwarmError::Agent("review returned no JSON".to_string()))?;
        let parsed: Findings = serde_json::from_value(value)?;
        Ok(parsed.findings)
    }

    async fn fix(
        &self,
        context: &ReviewContext,
        findings: &[ReviewFinding],
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut prompt = review_prompt(context);
        prompt.push_str("\n## Findings to fix\n");
        for finding in findings {
            prompt.push_str(&format!(
                "- [{}] {} (workers: {})\n",
                finding.class,
                finding.description,
                finding.workers.join(", ")
            ));
        }
        prompt.push_str("\nFix these issues in place and commit the result.\n");

        let session = self
            .run_session(
                &context.workspace,
                &self.config.escalated_model,
                &prompt,
                &ProgressReporter::noop(),
                &cancel,
            )
            .await?;
        if session.cancelled {
            return Err(SwarmError::Cancelled(context.run_id.to_string()));
        }
        if session.is_error {
            return Err(SwarmError::Agent(format!("fix pass failed: {}", session.text)));
        }
        Ok(())
    }
}
