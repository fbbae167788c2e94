//! The router: every message and command flows through here.
//!
//! Inbound platform messages are resolved to sessions and injected over
//! SSH; inbound agent events (hook webhooks, transcript scrapes) are
//! deduplicated, fanned out to every enabled platform thread, and
//! published to the bus. The router owns command semantics and the echo
//! cache; it never touches a platform wire directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::adapter::{reconnect_delay, PlatformAdapter};
use crate::bus::{BusEvent, EventBus, EventKind};
use crate::commands::{parse_command, ThreadCommand, COMMAND_USAGE};
use crate::config::{Config, ThreadCleanup};
use crate::dedup::EchoCache;
use crate::error::{BridgeError, Result};
use crate::registry::SessionRegistry;
use crate::ssh::SessionHost;
use crate::store::{cap_for_wire, AppendOutcome, MessageStore};
use crate::types::{
    is_valid_session_name, thread_title, AgentEvent, AgentType, MessageRole, MessageSource,
    NewMessage, PlatformInbound, PlatformKind, Session, SessionEvent, SessionStatus,
    StoredMessage,
};

const ECHO_TTL: Duration = Duration::from_secs(300);
const ECHO_CAPACITY: usize = 8_192;

pub struct Router {
    registry: Arc<SessionRegistry>,
    store: MessageStore,
    bus: EventBus,
    executor: Arc<dyn SessionHost>,
    adapters: Vec<Arc<dyn PlatformAdapter>>,
    config: Config,
    echoes: parking_lot::Mutex<EchoCache>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct KillReport {
    pub session_killed: bool,
    pub host: Option<String>,
    pub threads_cleaned: Vec<PlatformKind>,
}

impl Router {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: MessageStore,
        bus: EventBus,
        executor: Arc<dyn SessionHost>,
        adapters: Vec<Arc<dyn PlatformAdapter>>,
        config: Config,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            executor,
            adapters,
            config,
            echoes: parking_lot::Mutex::new(EchoCache::new(ECHO_TTL, ECHO_CAPACITY)),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn executor(&self) -> &Arc<dyn SessionHost> {
        &self.executor
    }

    fn adapter(&self, kind: PlatformKind) -> Option<&Arc<dyn PlatformAdapter>> {
        self.adapters.iter().find(|a| a.kind() == kind)
    }

    /// Post the connect announcement to every platform's root channel.
    pub async fn announce(&self) {
        let text = format!(
            "aily bridge connected\n\
             Available commands:\n\
             - `!new <name> [host] [dir]` — create tmux session\n\
             - `!kill <name>` — kill tmux session\n\
             - `!sessions` — list active sessions\n\
             Hosts: `{}`",
            self.config.ssh_hosts.join("`, `")
        );
        for adapter in &self.adapters {
            match adapter.post_root(&text).await {
                Ok(message_id) => self.note_own_post(adapter.kind(), &message_id),
                Err(error) => {
                    tracing::warn!(target = "aily::router", platform = adapter.kind().as_str(), error = %error, "announce failed");
                }
            }
        }
    }

    fn note_own_post(&self, platform: PlatformKind, message_id: &str) {
        self.echoes
            .lock()
            .record(&format!("{}:{message_id}", platform.as_str()));
    }

    /// A message arrived from a platform gateway.
    pub async fn handle_platform_inbound(&self, event: PlatformInbound) {
        let echo_key = format!("{}:{}", event.platform.as_str(), event.external_id);
        if !self.echoes.lock().record(&echo_key) {
            tracing::debug!(target = "aily::router", key = %echo_key, "dropping echoed platform event");
            return;
        }

        if let Some(command) = parse_command(&event.text) {
            self.handle_command(&event, command).await;
            return;
        }

        // Plain text outside a thread has no session to go to.
        let Some(thread_ref) = event.thread_ref.clone() else {
            return;
        };
        let Some(session_name) = self.resolve_thread(event.platform, &thread_ref).await else {
            return;
        };

        match self
            .inject_and_record(
                &session_name,
                &event.text,
                event.platform.into(),
                Some(event.author.clone()),
                Some(event.external_id.clone()),
            )
            .await
        {
            Ok(_) => {}
            Err(error) => {
                let host = self
                    .registry
                    .get(&session_name)
                    .and_then(|s| s.host)
                    .unwrap_or_else(|| "unknown".to_string());
                let notice = format!(
                    "Could not deliver message to `{session_name}` on `{host}`: {error}"
                );
                self.reply(&event, &notice).await;
            }
        }
    }

    /// Resolve a thread ref to a session name: binding first, then probe
    /// the thread title and bind on match.
    async fn resolve_thread(&self, platform: PlatformKind, thread_ref: &str) -> Option<String> {
        match self.store.session_for_thread(platform, thread_ref).await {
            Ok(Some(session)) => return Some(session),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(target = "aily::router", error = %error, "binding lookup failed");
            }
        }

        let adapter = self.adapter(platform)?;
        match adapter.thread_session(thread_ref).await {
            Ok(Some(session_name)) => {
                if let Err(error) = self.store.bind_thread(platform, &session_name, thread_ref).await
                {
                    tracing::warn!(target = "aily::router", error = %error, "thread bind failed");
                }
                if let Err(error) = self.registry.observe_thread(&session_name).await {
                    tracing::warn!(target = "aily::router", error = %error, "observe thread failed");
                }
                Some(session_name)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::debug!(target = "aily::router", error = %error, "thread probe failed");
                None
            }
        }
    }

    /// Inject user text into a session and, on success, store and publish
    /// it. Serial per inbound event: resolution happened before this call;
    /// append and publish do not run when the inject fails.
    pub async fn inject_and_record(
        &self,
        session_name: &str,
        text: &str,
        source: MessageSource,
        author: Option<String>,
        external_id: Option<String>,
    ) -> Result<()> {
        let host = self.locate_host(session_name).await?;

        if let Err(error) = self.executor.inject(&host, session_name, text, true).await {
            match &error {
                BridgeError::Unreachable(_) => {
                    let _ = self.registry.transition(session_name, SessionEvent::HostDown).await;
                }
                BridgeError::NotFound(_) => {
                    let _ = self
                        .registry
                        .transition(session_name, SessionEvent::SshMissing)
                        .await;
                }
                _ => {
                    let _ = self.registry.mark_error(session_name).await;
                }
            }
            return Err(error);
        }

        let outcome = self
            .store
            .append(NewMessage {
                session_name: session_name.to_string(),
                role: MessageRole::User,
                source,
                content: text.to_string(),
                author,
                external_id,
                timestamp: Utc::now(),
            })
            .await?;

        let _ = self
            .registry
            .transition(session_name, SessionEvent::MsgInbound)
            .await;
        self.registry.touch(session_name, Some(text)).await?;

        if let AppendOutcome::Inserted(id) = outcome {
            self.publish_message(id, session_name, MessageRole::User, source, text);
        }
        Ok(())
    }

    async fn locate_host(&self, session_name: &str) -> Result<String> {
        if let Some(session) = self.registry.get(session_name) {
            if let Some(host) = session.host {
                return Ok(host);
            }
        }
        match self.executor.find_host(session_name).await? {
            Some(host) => Ok(host),
            None => Err(BridgeError::NotFound(format!(
                "session '{session_name}' not found on any host"
            ))),
        }
    }

    fn publish_message(
        &self,
        id: i64,
        session_name: &str,
        role: MessageRole,
        source: MessageSource,
        content: &str,
    ) {
        self.bus.publish(BusEvent::new(
            EventKind::MessageNew,
            Some(session_name.to_string()),
            json!({
                "id": id,
                "session_name": session_name,
                "role": role.as_str(),
                "source": source.as_str(),
                "content": cap_for_wire(content),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        ));
    }

    /// A hook webhook or transcript-scrape event.
    pub async fn handle_agent_event(&self, event: AgentEvent) -> Result<()> {
        if !is_valid_session_name(&event.session_name) {
            return Err(BridgeError::InvalidArgument(format!(
                "invalid session name '{}'",
                event.session_name
            )));
        }
        if !self.registry.contains(&event.session_name) {
            tracing::debug!(
                target = "aily::router",
                session = %event.session_name,
                "agent event for unknown session ignored"
            );
            return Ok(());
        }

        self.registry
            .set_agent_type(&event.session_name, event.agent)
            .await?;

        let outcome = self
            .store
            .append(NewMessage {
                session_name: event.session_name.clone(),
                role: event.role,
                source: event.source,
                content: event.content.clone(),
                author: Some(event.agent.as_str().to_string()),
                external_id: event.external_id.clone(),
                timestamp: event.timestamp,
            })
            .await?;

        let AppendOutcome::Inserted(id) = outcome else {
            // Duplicate: absorbed silently, no events, no posts.
            return Ok(());
        };

        let transition_event = if event.role == MessageRole::Assistant
            && looks_like_question(&event.content)
        {
            SessionEvent::AskQuestion
        } else {
            SessionEvent::MsgInbound
        };
        let _ = self
            .registry
            .transition(&event.session_name, transition_event)
            .await;
        self.registry
            .touch(&event.session_name, Some(&event.content))
            .await?;

        self.publish_message(id, &event.session_name, event.role, event.source, &event.content);

        if event.role == MessageRole::Assistant {
            self.notify_platforms(&event).await;
        }
        Ok(())
    }

    /// Fan an assistant message out to every enabled platform. Posts run
    /// in parallel and fail independently; each platform retries with
    /// backoff up to `NOTIFY_MAX_RETRIES` before giving up.
    async fn notify_platforms(&self, event: &AgentEvent) {
        let session = self.registry.get(&event.session_name);
        let tasks = self.adapters.iter().map(|adapter| {
            let adapter = adapter.clone();
            let event = event.clone();
            let session = session.clone();
            async move {
                let result = self
                    .notify_one_platform(adapter.as_ref(), &event, session.as_ref())
                    .await;
                (adapter.kind(), result)
            }
        });

        for (platform, result) in futures::future::join_all(tasks).await {
            if let Err(error) = result {
                tracing::warn!(
                    target = "aily::router",
                    platform = platform.as_str(),
                    session = %event.session_name,
                    error = %error,
                    "notification failed"
                );
                self.bus.publish(BusEvent::new(
                    EventKind::NotificationFailed,
                    Some(event.session_name.clone()),
                    json!({
                        "session_name": event.session_name,
                        "platform": platform.as_str(),
                        "reason": error.kind(),
                    }),
                ));
            }
        }
    }

    async fn notify_one_platform(
        &self,
        adapter: &dyn PlatformAdapter,
        event: &AgentEvent,
        session: Option<&Session>,
    ) -> Result<()> {
        let platform = adapter.kind();
        let title = thread_title(&event.session_name);
        let host = session.and_then(|s| s.host.as_deref()).unwrap_or("unknown");
        let starter = format!("tmux session: {title} (`{host}`)");

        let mut attempt: u32 = 0;
        loop {
            let result = async {
                let thread_ref = match self.store.binding(platform, &event.session_name).await? {
                    Some(thread_ref) => thread_ref,
                    None => {
                        let thread_ref = adapter.ensure_thread(&event.session_name, &starter).await?;
                        self.store
                            .bind_thread(platform, &event.session_name, &thread_ref)
                            .await?;
                        thread_ref
                    }
                };
                match adapter.post(&thread_ref, &event.content, false).await {
                    Ok(message_id) => {
                        self.note_own_post(platform, &message_id);
                        Ok(())
                    }
                    // A stale binding: the thread is gone, rebuild it once.
                    Err(BridgeError::NotFound(_)) => {
                        self.store.unbind_thread(platform, &event.session_name).await?;
                        let thread_ref = adapter.ensure_thread(&event.session_name, &starter).await?;
                        self.store
                            .bind_thread(platform, &event.session_name, &thread_ref)
                            .await?;
                        let message_id = adapter.post(&thread_ref, &event.content, false).await?;
                        self.note_own_post(platform, &message_id);
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() && attempt < self.config.notify_max_retries => {
                    attempt += 1;
                    let delay = match &error {
                        BridgeError::RateLimited {
                            retry_after: Some(after),
                        } => (*after).min(Duration::from_secs(30)),
                        _ => reconnect_delay(attempt),
                    };
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    // -- Commands ------------------------------------------------------------

    async fn handle_command(&self, event: &PlatformInbound, command: ThreadCommand) {
        tracing::info!(
            target = "aily::router",
            platform = event.platform.as_str(),
            author = %event.author,
            command = ?command,
            "command"
        );
        match command {
            ThreadCommand::New { name, host, dir } => {
                let reply = self.cmd_new(&name, host.as_deref(), dir.as_deref()).await;
                self.reply(event, &reply).await;
            }
            ThreadCommand::Kill { name } => {
                let reply = self.cmd_kill(&name).await;
                self.reply(event, &reply).await;
            }
            ThreadCommand::Sessions => {
                let reply = self.cmd_sessions(event.platform).await;
                self.reply(event, &reply).await;
            }
            ThreadCommand::Key(key) => {
                let Some(thread_ref) = event.thread_ref.as_deref() else {
                    self.reply(event, "Keystroke commands only work inside a session thread.")
                        .await;
                    return;
                };
                let Some(session_name) = self.resolve_thread(event.platform, thread_ref).await
                else {
                    return;
                };
                match self.send_control_key(&session_name, key).await {
                    Ok(()) => {}
                    Err(error) => {
                        let notice = format!("Could not send keystroke to `{session_name}`: {error}");
                        self.reply(event, &notice).await;
                    }
                }
            }
            ThreadCommand::Unknown(word) => {
                self.reply(event, &format!("Unknown command `{word}`. {COMMAND_USAGE}"))
                    .await;
            }
        }
    }

    pub async fn send_control_key(
        &self,
        session_name: &str,
        key: crate::ssh::ControlKey,
    ) -> Result<()> {
        let host = self.locate_host(session_name).await?;
        self.executor.send_key(&host, session_name, key).await?;
        // A keystroke counts as activity and wakes an idle session.
        let _ = self
            .registry
            .transition(session_name, SessionEvent::MsgInbound)
            .await;
        self.registry.touch(session_name, None).await?;
        Ok(())
    }

    async fn cmd_new(&self, name: &str, host: Option<&str>, dir: Option<&str>) -> String {
        match self.create_session(name, host, dir, AgentType::Unknown).await {
            Ok((session, created)) => {
                let host = session.host.as_deref().unwrap_or("unknown");
                if created {
                    format!("Created `{name}` on `{host}` + thread")
                } else {
                    format!("Session `{name}` already exists on `{host}`.")
                }
            }
            Err(BridgeError::InvalidArgument(message)) => message,
            Err(error) => format!("Failed to create `{name}`: {error}"),
        }
    }

    async fn cmd_kill(&self, name: &str) -> String {
        match self.kill_session(name).await {
            Ok(report) => {
                let mut parts = Vec::new();
                match (&report.session_killed, &report.host) {
                    (true, Some(host)) => parts.push(format!("Killed `{name}` on `{host}`")),
                    (false, Some(host)) => {
                        parts.push(format!("Failed to kill `{name}` on `{host}`"))
                    }
                    _ => parts.push(format!("tmux `{name}` not found")),
                }
                if report.threads_cleaned.is_empty() {
                    parts.push("no thread found".to_string());
                } else {
                    parts.push("thread closed".to_string());
                }
                parts.join(" / ")
            }
            Err(BridgeError::InvalidArgument(message)) => message,
            Err(error) => format!("Failed to kill `{name}`: {error}"),
        }
    }

    async fn cmd_sessions(&self, platform: PlatformKind) -> String {
        let sessions = self.registry.list(&Default::default());
        if sessions.is_empty() {
            return "No sessions found.".to_string();
        }
        let mut lines = vec!["```".to_string()];
        for session in sessions {
            let host = session.host.as_deref().unwrap_or("---");
            let sync = match session.status {
                SessionStatus::Orphaned => "orphan thread".to_string(),
                _ => match self.store.binding(platform, &session.name).await {
                    Ok(Some(_)) => "synced".to_string(),
                    _ => "no thread".to_string(),
                },
            };
            lines.push(format!(
                "  {:<20} {:<24} {:<12} {}",
                session.name,
                host,
                session.status.as_str(),
                sync
            ));
        }
        lines.push("```".to_string());
        lines.join("\n")
    }

    async fn reply(&self, event: &PlatformInbound, text: &str) {
        let Some(adapter) = self.adapter(event.platform) else {
            return;
        };
        let result = match event.thread_ref.as_deref() {
            Some(thread_ref) => adapter.post(thread_ref, text, true).await,
            None => adapter.post_root(text).await,
        };
        match result {
            Ok(message_id) => self.note_own_post(event.platform, &message_id),
            Err(error) => {
                tracing::warn!(target = "aily::router", error = %error, "command reply failed");
            }
        }
    }

    // -- Session lifecycle ---------------------------------------------------

    /// Create a session and its threads. Idempotent: an existing live
    /// session is rebound rather than recreated, and no second thread is
    /// made. Returns the session and whether tmux was actually created.
    pub async fn create_session(
        &self,
        name: &str,
        host: Option<&str>,
        dir: Option<&str>,
        agent_type: AgentType,
    ) -> Result<(Session, bool)> {
        if !is_valid_session_name(name) {
            return Err(BridgeError::InvalidArgument(
                "Invalid session name. Use only `a-z A-Z 0-9 _ -` (max 64 chars).".to_string(),
            ));
        }
        let host = host.unwrap_or_else(|| self.config.default_host());
        if !self.config.ssh_hosts.iter().any(|h| h == host) {
            return Err(BridgeError::InvalidArgument(format!(
                "Unknown host `{host}`. Available: `{}`",
                self.config.ssh_hosts.join("`, `")
            )));
        }

        let (created, actual_host) = match self.executor.find_host(name).await? {
            Some(existing_host) => (false, existing_host),
            None => {
                self.executor.create_session(host, name, dir).await?;
                (true, host.to_string())
            }
        };

        let (session, _) = self.registry.observe_live(name, &actual_host).await?;
        if agent_type != AgentType::Unknown {
            self.registry.set_agent_type(name, agent_type).await?;
        }
        if let Some(dir) = dir {
            self.registry.set_working_dir(name, dir).await?;
        }

        // Create or reuse the thread on every platform and bind it.
        let title = thread_title(name);
        let starter = format!("tmux session: {title} (`{actual_host}`)");
        for adapter in &self.adapters {
            match adapter.ensure_thread(name, &starter).await {
                Ok(thread_ref) => {
                    if let Err(error) =
                        self.store.bind_thread(adapter.kind(), name, &thread_ref).await
                    {
                        tracing::warn!(target = "aily::router", error = %error, "bind failed");
                    }
                    if created {
                        if let Ok(message_id) = adapter
                            .post(
                                &thread_ref,
                                &format!("Session `{name}` created on `{actual_host}`."),
                                true,
                            )
                            .await
                        {
                            self.note_own_post(adapter.kind(), &message_id);
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        target = "aily::router",
                        platform = adapter.kind().as_str(),
                        error = %error,
                        "thread creation failed"
                    );
                }
            }
        }

        Ok((self.registry.get(name).unwrap_or(session), created))
    }

    /// Kill a session and clean its threads per the cleanup policy.
    /// Killing an already-archived session is a no-op with no platform
    /// writes.
    pub async fn kill_session(&self, name: &str) -> Result<KillReport> {
        if !is_valid_session_name(name) {
            return Err(BridgeError::InvalidArgument(
                "Invalid session name. Use only `a-z A-Z 0-9 _ -` (max 64 chars).".to_string(),
            ));
        }

        if let Some(session) = self.registry.get(name) {
            if session.status == SessionStatus::Archived {
                return Ok(KillReport {
                    session_killed: false,
                    host: session.host,
                    threads_cleaned: Vec::new(),
                });
            }
        }

        let host = self.executor.find_host(name).await?;
        let mut session_killed = false;
        if let Some(host) = &host {
            match self.executor.kill_session(host, name).await {
                Ok(()) => session_killed = true,
                Err(BridgeError::NotFound(_)) => {}
                Err(error) => return Err(error),
            }
        }

        let threads_cleaned = self.cleanup_threads(name).await;
        let _ = self.registry.transition(name, SessionEvent::LifecycleClose).await;

        Ok(KillReport {
            session_killed,
            host,
            threads_cleaned,
        })
    }

    /// Archive or delete a session's threads per `THREAD_CLEANUP`, with a
    /// final closing notice posted first.
    pub async fn cleanup_threads(&self, name: &str) -> Vec<PlatformKind> {
        let mut cleaned = Vec::new();
        for adapter in &self.adapters {
            let platform = adapter.kind();
            let thread_ref = match self.store.binding(platform, name).await {
                Ok(Some(thread_ref)) => Some(thread_ref),
                _ => match adapter.find_thread(name).await {
                    Ok(found) => found,
                    Err(_) => None,
                },
            };
            let Some(thread_ref) = thread_ref else { continue };

            if let Ok(message_id) = adapter
                .post(&thread_ref, &format!("Session `{name}` closed."), true)
                .await
            {
                self.note_own_post(platform, &message_id);
            }

            let result = match self.config.thread_cleanup {
                ThreadCleanup::Archive => adapter.archive(&thread_ref).await,
                ThreadCleanup::Delete => {
                    let deleted = adapter.delete(&thread_ref).await;
                    if deleted.is_ok() {
                        let _ = self.store.unbind_thread(platform, name).await;
                    }
                    deleted
                }
            };
            match result {
                Ok(()) => cleaned.push(platform),
                Err(error) => {
                    tracing::warn!(
                        target = "aily::router",
                        platform = platform.as_str(),
                        error = %error,
                        "thread cleanup failed"
                    );
                }
            }
        }
        cleaned
    }

    /// Look up existing platform threads for a session and bind them.
    /// Used by the host poller when a new live session appears.
    pub async fn sync_thread_bindings(&self, name: &str) {
        for adapter in &self.adapters {
            let platform = adapter.kind();
            if matches!(self.store.binding(platform, name).await, Ok(Some(_))) {
                continue;
            }
            match adapter.find_thread(name).await {
                Ok(Some(thread_ref)) => {
                    if let Err(error) = self.store.bind_thread(platform, name, &thread_ref).await {
                        tracing::warn!(target = "aily::router", error = %error, "bind failed");
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::debug!(
                        target = "aily::router",
                        platform = platform.as_str(),
                        error = %error,
                        "thread sync failed"
                    );
                }
            }
        }
    }

    /// Page stored messages (dashboard surface), content capped for wire.
    pub async fn page_messages(
        &self,
        session_name: &str,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<StoredMessage>, i64)> {
        let (mut messages, total) = self.store.page(session_name, limit, offset).await?;
        for message in &mut messages {
            message.content = cap_for_wire(&message.content);
        }
        Ok((messages, total))
    }
}

/// An assistant message that ends in a question mark is the agent waiting
/// on the user.
fn looks_like_question(content: &str) -> bool {
    content
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.trim_end().ends_with('?'))
}
