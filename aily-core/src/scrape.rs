//! Transcript scraping: read the tail of an agent's session log over SSH
//! and extract the messages the hooks may have missed.
//!
//! Claude-family agents write JSONL session files under
//! `~/.claude/projects/<cwd with slashes as dashes>/`. Each scrape tails
//! the newest file, skips everything up to the last line seen (tracked by
//! line hash in the preferences table), and turns new `user`/`assistant`
//! entries into hook-equivalent events for the router.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::ssh::SessionHost;
use crate::store::MessageStore;
use crate::types::{AgentEvent, MessageRole, MessageSource, Session};

const MAX_TAIL_LINES: usize = 500;
const MAX_CONTENT_LENGTH: usize = 5_000;
const DISCOVER_TIMEOUT: Duration = Duration::from_secs(10);
const TAIL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TranscriptScraper {
    executor: Arc<dyn SessionHost>,
    store: MessageStore,
}

impl TranscriptScraper {
    pub fn new(executor: Arc<dyn SessionHost>, store: MessageStore) -> Self {
        Self { executor, store }
    }

    /// One scrape pass for a session. Returns the newly discovered
    /// messages in transcript order; the caller feeds them to the router.
    pub async fn scrape_session(&self, session: &Session) -> Result<Vec<AgentEvent>> {
        let Some(host) = session.host.as_deref() else {
            return Ok(Vec::new());
        };
        let Some(working_dir) = session.working_dir.as_deref() else {
            return Ok(Vec::new());
        };

        let Some(log_path) = self.discover_log_path(host, working_dir).await? else {
            return Ok(Vec::new());
        };

        let tail = self
            .executor
            .run(host, &format!("tail -{MAX_TAIL_LINES} {log_path}"), TAIL_TIMEOUT)
            .await?;
        if !tail.ok() || tail.stdout.is_empty() {
            return Ok(Vec::new());
        }
        let lines: Vec<&str> = tail
            .stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let offset_key = format!("scrape_offset:{}", session.name);
        let last_seen = self.store.get_pref(&offset_key).await?;
        let new_lines = lines_after_offset(&lines, last_seen.as_deref());

        let events = parse_transcript_lines(&new_lines, &session.name, session.agent_type);

        if let Some(last) = lines.last() {
            self.store.set_pref(&offset_key, &line_hash(last)).await?;
        }

        if !events.is_empty() {
            tracing::info!(
                target = "aily::scrape",
                session = %session.name,
                count = events.len(),
                "extracted transcript messages"
            );
        }
        Ok(events)
    }

    async fn discover_log_path(&self, host: &str, working_dir: &str) -> Result<Option<String>> {
        let project_dir = sanitize_project_dir(working_dir);
        let cmd = format!("ls -t ~/.claude/projects/{project_dir}/*.jsonl 2>/dev/null | head -1");
        let out = self.executor.run(host, &cmd, DISCOVER_TIMEOUT).await?;
        let path = out.stdout.trim();
        if out.ok() && !path.is_empty() {
            Ok(Some(path.to_string()))
        } else {
            Ok(None)
        }
    }
}

/// The project directory name Claude Code derives from a working
/// directory: slashes become dashes, leading dash dropped.
pub fn sanitize_project_dir(working_dir: &str) -> String {
    let sanitized = working_dir.replace('/', "-");
    sanitized.trim_start_matches('-').to_string()
}

pub fn line_hash(line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

fn lines_after_offset<'a>(lines: &[&'a str], last_seen: Option<&str>) -> Vec<&'a str> {
    if let Some(last_seen) = last_seen {
        if let Some(index) = lines.iter().position(|line| line_hash(line) == last_seen) {
            return lines[index + 1..].to_vec();
        }
    }
    lines.to_vec()
}

/// Parse transcript lines into agent events. Entries other than
/// `user`/`assistant` (tool results, system notices) are skipped, as are
/// entries with no extractable text.
pub fn parse_transcript_lines(
    lines: &[&str],
    session_name: &str,
    agent: crate::types::AgentType,
) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    for line in lines {
        let Ok(entry) = serde_json::from_str::<Value>(line.trim()) else {
            continue;
        };
        let (role, content) = match entry.get("type").and_then(Value::as_str) {
            Some("user") => (MessageRole::User, extract_user_content(&entry)),
            Some("assistant") => (MessageRole::Assistant, extract_assistant_content(&entry)),
            _ => continue,
        };
        let Some(content) = content else { continue };

        let content = if content.len() > MAX_CONTENT_LENGTH {
            let mut end = MAX_CONTENT_LENGTH;
            while end > 0 && !content.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...(truncated)", &content[..end])
        } else {
            content
        };

        let timestamp = entry
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        events.push(AgentEvent {
            session_name: session_name.to_string(),
            agent,
            role,
            content,
            source: MessageSource::Jsonl,
            // The log has no message id; the line fingerprint is stable
            // across rescans of the same file.
            external_id: Some(format!("jsonl-{}", &line_hash(line)[..16])),
            timestamp,
        });
    }
    events
}

/// User entries carry `message.content` as a string or a block list.
fn extract_user_content(entry: &Value) -> Option<String> {
    let content = entry.pointer("/message/content")?;
    match content {
        Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Array(blocks) => collect_text_blocks(blocks),
        _ => None,
    }
}

/// Assistant entries carry a block list; only text blocks are message
/// content (tool use/results are not).
fn extract_assistant_content(entry: &Value) -> Option<String> {
    let content = entry.pointer("/message/content")?;
    match content {
        Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Array(blocks) => collect_text_blocks(blocks),
        _ => None,
    }
}

fn collect_text_blocks(blocks: &[Value]) -> Option<String> {
    let texts: Vec<&str> = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}
