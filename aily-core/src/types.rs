use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Thread titles are `[agent] <session_name>` — exact prefix, single space.
pub const AGENT_PREFIX: &str = "[agent] ";

static SESSION_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    Discord,
    Slack,
}

impl PlatformKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PlatformKind::Discord => "discord",
            PlatformKind::Slack => "slack",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "discord" => Some(PlatformKind::Discord),
            "slack" => Some(PlatformKind::Slack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Claude,
    Codex,
    Gemini,
    Opencode,
    Shell,
    Unknown,
}

impl AgentType {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Gemini => "gemini",
            AgentType::Opencode => "opencode",
            AgentType::Shell => "shell",
            AgentType::Unknown => "unknown",
        }
    }

    /// Translate external labels to canonical values. Unrecognised labels
    /// collapse to `Unknown` rather than erroring — hook payloads are not
    /// trusted to stay in sync with us.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" => AgentType::Claude,
            "codex" => AgentType::Codex,
            "gemini" => AgentType::Gemini,
            "opencode" => AgentType::Opencode,
            "shell" | "bash" | "zsh" => AgentType::Shell,
            _ => AgentType::Unknown,
        }
    }

    /// Agents whose transcript files the scraper knows how to read.
    pub fn has_transcript(self) -> bool {
        matches!(
            self,
            AgentType::Claude | AgentType::Codex | AgentType::Gemini | AgentType::Opencode
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Waiting,
    Idle,
    Archived,
    Orphaned,
    Error,
    Unreachable,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Idle => "idle",
            SessionStatus::Archived => "archived",
            SessionStatus::Orphaned => "orphaned",
            SessionStatus::Error => "error",
            SessionStatus::Unreachable => "unreachable",
        }
    }

    /// Translate inbound labels, including the legacy aliases the old
    /// bridges emitted (`closed`, `orphan`). Internals only ever see the
    /// canonical set.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "active" => Some(SessionStatus::Active),
            "waiting" => Some(SessionStatus::Waiting),
            "idle" => Some(SessionStatus::Idle),
            "archived" | "closed" => Some(SessionStatus::Archived),
            "orphaned" | "orphan" => Some(SessionStatus::Orphaned),
            "error" => Some(SessionStatus::Error),
            "unreachable" => Some(SessionStatus::Unreachable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
            MessageRole::Tool => "tool",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "system" => Some(MessageRole::System),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Jsonl,
    Discord,
    Slack,
    Tmux,
    Hook,
}

impl MessageSource {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageSource::Jsonl => "jsonl",
            MessageSource::Discord => "discord",
            MessageSource::Slack => "slack",
            MessageSource::Tmux => "tmux",
            MessageSource::Hook => "hook",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "jsonl" => Some(MessageSource::Jsonl),
            "discord" => Some(MessageSource::Discord),
            "slack" => Some(MessageSource::Slack),
            "tmux" => Some(MessageSource::Tmux),
            "hook" => Some(MessageSource::Hook),
            _ => None,
        }
    }
}

impl From<PlatformKind> for MessageSource {
    fn from(platform: PlatformKind) -> Self {
        match platform {
            PlatformKind::Discord => MessageSource::Discord,
            PlatformKind::Slack => MessageSource::Slack,
        }
    }
}

/// Authoritative session record, owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    /// Host alias the session was last seen on; `None` until observed
    /// over SSH (e.g. a session known only from a platform thread).
    pub host: Option<String>,
    pub agent_type: AgentType,
    pub status: SessionStatus,
    pub working_dir: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub last_message_preview: Option<String>,
}

/// Events driving the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    SshSeen,
    SshMissing,
    MsgInbound,
    AskQuestion,
    LifecycleClose,
    HostDown,
}

/// An assistant-side event entering the system: a hook webhook post or a
/// transcript-scraper extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub session_name: String,
    pub agent: AgentType,
    pub role: MessageRole,
    pub content: String,
    pub source: MessageSource,
    pub external_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A user-authored message arriving from a platform gateway.
#[derive(Debug, Clone)]
pub struct PlatformInbound {
    pub platform: PlatformKind,
    /// Thread the message was posted in; `None` for root-channel posts
    /// (only `!` commands are meaningful there).
    pub thread_ref: Option<String>,
    pub author: String,
    pub text: String,
    pub external_id: String,
}

/// A message the store is asked to persist.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_name: String,
    pub role: MessageRole,
    pub source: MessageSource,
    pub content: String,
    pub author: Option<String>,
    pub external_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_name: String,
    pub role: MessageRole,
    pub source: MessageSource,
    pub content: String,
    pub author: Option<String>,
    pub external_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Validate a session name for use in remote command lines and thread
/// titles: `^[A-Za-z0-9_-]{1,64}$`.
pub fn is_valid_session_name(name: &str) -> bool {
    SESSION_NAME.is_match(name)
}

/// Canonical thread title for a session.
pub fn thread_title(session_name: &str) -> String {
    format!("{AGENT_PREFIX}{session_name}")
}

/// Parse a thread title back to a session name. The `[agent] ` prefix is
/// matched exactly (case sensitive, single space); everything after it is
/// the session name verbatim.
pub fn parse_thread_title(title: &str) -> Option<&str> {
    title.strip_prefix(AGENT_PREFIX).filter(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{
        is_valid_session_name, parse_thread_title, thread_title, AgentType, SessionStatus,
    };

    #[test]
    fn session_name_validation() {
        assert!(is_valid_session_name("fix-auth_2"));
        assert!(is_valid_session_name("A"));
        assert!(!is_valid_session_name(""));
        assert!(!is_valid_session_name("has space"));
        assert!(!is_valid_session_name("semi;colon"));
        assert!(!is_valid_session_name(&"x".repeat(65)));
        assert!(is_valid_session_name(&"x".repeat(64)));
    }

    #[test]
    fn thread_title_round_trip() {
        assert_eq!(thread_title("fix-auth"), "[agent] fix-auth");
        assert_eq!(parse_thread_title("[agent] fix-auth"), Some("fix-auth"));
        // Prefix is case sensitive with exactly one space
        assert_eq!(parse_thread_title("[Agent] fix-auth"), None);
        assert_eq!(parse_thread_title("[agent]  two-spaces"), Some(" two-spaces"));
        assert_eq!(parse_thread_title("[agent] "), None);
        assert_eq!(parse_thread_title("random title"), None);
    }

    #[test]
    fn status_aliases_translate_at_boundary() {
        assert_eq!(SessionStatus::from_label("closed"), Some(SessionStatus::Archived));
        assert_eq!(SessionStatus::from_label("orphan"), Some(SessionStatus::Orphaned));
        assert_eq!(SessionStatus::from_label("ACTIVE"), Some(SessionStatus::Active));
        assert_eq!(SessionStatus::from_label("bogus"), None);
    }

    #[test]
    fn agent_labels() {
        assert_eq!(AgentType::from_label("claude-code"), AgentType::Claude);
        assert_eq!(AgentType::from_label("zsh"), AgentType::Shell);
        assert_eq!(AgentType::from_label("mystery"), AgentType::Unknown);
        assert!(AgentType::Gemini.has_transcript());
        assert!(!AgentType::Shell.has_transcript());
    }
}
