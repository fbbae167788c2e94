//! Slack adapter: Socket Mode (WebSocket) for inbound events, the Web API
//! for posting and thread discovery.
//!
//! Slack has no thread objects — a thread is a parent message and its
//! `ts`. Thread discovery scans channel history for a parent whose first
//! line is the canonical `[agent] <name>` title. Slack also has no thread
//! archive: archiving posts a closing notice and adds a `lock` reaction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::adapter::{cap_message, reconnect_delay, NameLocks, PlatformAdapter};
use crate::error::{BridgeError, Result};
use crate::types::{parse_thread_title, thread_title, PlatformInbound, PlatformKind};

pub const SLACK_API_BASE: &str = "https://slack.com/api";
const MESSAGE_CEILING: usize = 4_000;
const HISTORY_SCAN_LIMIT: u32 = 200;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);
const KEEPALIVE_MISS_LIMIT: u32 = 3;

struct SlackInner {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    app_token: String,
    channel_id: String,
    bot_user_id: parking_lot::Mutex<Option<String>>,
    /// thread_ts -> session name, to avoid re-reading the parent message
    /// for every reply.
    thread_sessions: parking_lot::Mutex<HashMap<String, String>>,
    locks: NameLocks,
    shutdown: watch::Sender<bool>,
}

pub struct SlackAdapter {
    inner: Arc<SlackInner>,
}

impl SlackAdapter {
    pub fn new(bot_token: &str, app_token: &str, channel_id: &str) -> Self {
        Self::with_api_base(bot_token, app_token, channel_id, SLACK_API_BASE)
    }

    pub fn with_api_base(bot_token: &str, app_token: &str, channel_id: &str, api_base: &str) -> Self {
        let (shutdown, _) = watch::channel(false);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(SlackInner {
                http,
                api_base: api_base.trim_end_matches('/').to_string(),
                bot_token: bot_token.to_string(),
                app_token: app_token.to_string(),
                channel_id: channel_id.to_string(),
                bot_user_id: parking_lot::Mutex::new(None),
                thread_sessions: parking_lot::Mutex::new(HashMap::new()),
                locks: NameLocks::new(),
                shutdown,
            }),
        }
    }
}

impl SlackInner {
    fn check_envelope(endpoint: &str, value: Value) -> Result<Value> {
        if value.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            return Ok(value);
        }
        let code = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        match code {
            "ratelimited" | "rate_limited" => Err(BridgeError::RateLimited { retry_after: None }),
            "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" => Err(
                BridgeError::AuthRejected(format!("slack {endpoint}: {code}")),
            ),
            "channel_not_found" | "thread_not_found" | "message_not_found" => {
                Err(BridgeError::NotFound(format!("slack {endpoint}: {code}")))
            }
            _ => Err(BridgeError::Protocol(format!("slack {endpoint}: {code}"))),
        }
    }

    async fn web_post(&self, endpoint: &str, body: Value) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}/{endpoint}", self.api_base))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await?;
        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(BridgeError::RateLimited { retry_after });
        }
        Self::check_envelope(endpoint, response.json().await?)
    }

    async fn web_get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}/{endpoint}", self.api_base))
            .bearer_auth(&self.bot_token)
            .query(params)
            .send()
            .await?;
        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(BridgeError::RateLimited { retry_after });
        }
        Self::check_envelope(endpoint, response.json().await?)
    }

    /// Find a parent message whose first line is the thread title.
    async fn find_thread_ts(&self, title: &str) -> Result<Option<String>> {
        let history = self
            .web_get(
                "conversations.history",
                &[
                    ("channel", self.channel_id.clone()),
                    ("limit", HISTORY_SCAN_LIMIT.to_string()),
                ],
            )
            .await?;
        if let Some(messages) = history.get("messages").and_then(Value::as_array) {
            for message in messages {
                let text = message.get("text").and_then(Value::as_str).unwrap_or("");
                let first_line = text.lines().next().unwrap_or("").trim();
                if first_line == title || text.starts_with(title) {
                    if let Some(ts) = message.get("ts").and_then(Value::as_str) {
                        return Ok(Some(ts.to_string()));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Resolve a thread's session from its parent message, with caching.
    async fn session_for_thread_ts(&self, thread_ts: &str) -> Result<Option<String>> {
        if let Some(cached) = self.thread_sessions.lock().get(thread_ts).cloned() {
            return Ok(Some(cached));
        }
        let replies = self
            .web_get(
                "conversations.replies",
                &[
                    ("channel", self.channel_id.clone()),
                    ("ts", thread_ts.to_string()),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        let parent_text = replies
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|m| m.first())
            .and_then(|m| m.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let first_line = parent_text.lines().next().unwrap_or("").trim();
        let session = parse_thread_title(first_line)
            // Starter messages may carry trailing detail after the name.
            .map(|rest| rest.split_whitespace().next().unwrap_or(rest).to_string())
            .filter(|s| !s.is_empty());
        if let Some(session) = &session {
            self.thread_sessions
                .lock()
                .insert(thread_ts.to_string(), session.clone());
        }
        Ok(session)
    }

    async fn post_message(&self, thread_ts: Option<&str>, text: &str) -> Result<String> {
        let capped = cap_message(text, MESSAGE_CEILING);
        let mut body = json!({ "channel": self.channel_id, "text": capped });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = json!(ts);
        }
        let response = self.web_post("chat.postMessage", body).await?;
        response
            .get("ts")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| BridgeError::Protocol("slack chat.postMessage missing ts".into()))
    }
}

#[async_trait]
impl PlatformAdapter for SlackAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Slack
    }

    async fn connect(&self, inbound: mpsc::Sender<PlatformInbound>) -> Result<()> {
        let auth = self.inner.web_post("auth.test", json!({})).await?;
        let bot_user = auth
            .get("user_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        *self.inner.bot_user_id.lock() = Some(bot_user);
        tracing::info!(
            target = "aily::slack",
            bot = auth.get("user").and_then(serde_json::Value::as_str).unwrap_or("?"),
            "slack credentials verified"
        );

        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match run_socket_mode_once(&inner, &inbound, &mut shutdown_rx).await {
                    Ok(SocketEnd::Shutdown) => break,
                    Ok(SocketEnd::Reconnect) => attempt += 1,
                    Err(error) => {
                        attempt += 1;
                        tracing::warn!(target = "aily::slack", error = %error, "socket mode connection failed");
                    }
                }
                tokio::time::sleep(reconnect_delay(attempt)).await;
            }
            tracing::info!(target = "aily::slack", "socket mode task stopped");
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    async fn ensure_thread(&self, session_name: &str, starter_text: &str) -> Result<String> {
        let _guard = self.inner.locks.acquire(session_name).await;
        let title = thread_title(session_name);

        if let Some(ts) = self.inner.find_thread_ts(&title).await? {
            return Ok(ts);
        }

        let parent_ts = self.inner.post_message(None, starter_text).await?;
        let welcome = format!(
            "*Welcome to {title}*\n\n\
             Type a message here to forward it to the tmux session.\n\n\
             *Commands:*\n\
             `!sessions` — list all sessions\n\
             `!kill {session_name}` — kill this session + close thread"
        );
        let _ = self.inner.post_message(Some(&parent_ts), &welcome).await;

        self.inner
            .thread_sessions
            .lock()
            .insert(parent_ts.clone(), session_name.to_string());
        tracing::info!(target = "aily::slack", session = %session_name, ts = %parent_ts, "created thread");
        Ok(parent_ts)
    }

    async fn find_thread(&self, session_name: &str) -> Result<Option<String>> {
        self.inner.find_thread_ts(&thread_title(session_name)).await
    }

    async fn thread_session(&self, thread_ref: &str) -> Result<Option<String>> {
        self.inner.session_for_thread_ts(thread_ref).await
    }

    async fn post(&self, thread_ref: &str, text: &str, raw: bool) -> Result<String> {
        let content = if raw {
            text.to_string()
        } else {
            format!("*Task complete*\n{text}")
        };
        self.inner.post_message(Some(thread_ref), &content).await
    }

    async fn post_root(&self, text: &str) -> Result<String> {
        self.inner.post_message(None, text).await
    }

    async fn archive(&self, thread_ref: &str) -> Result<()> {
        let _ = self
            .inner
            .post_message(Some(thread_ref), ":lock: Thread archived. Session closed.")
            .await?;
        let _ = self
            .inner
            .web_post(
                "reactions.add",
                json!({
                    "channel": self.inner.channel_id,
                    "timestamp": thread_ref,
                    "name": "lock",
                }),
            )
            .await;
        Ok(())
    }

    async fn delete(&self, thread_ref: &str) -> Result<()> {
        // No native delete for a whole thread either; same closing notice,
        // the caller clears the binding.
        self.archive(thread_ref).await
    }
}

enum SocketEnd {
    Shutdown,
    Reconnect,
}

async fn open_socket_url(inner: &Arc<SlackInner>) -> Result<String> {
    let response = inner
        .http
        .post(format!("{}/apps.connections.open", inner.api_base))
        .bearer_auth(&inner.app_token)
        .send()
        .await?;
    let value: Value = response.json().await?;
    let value = SlackInner::check_envelope("apps.connections.open", value)?;
    let raw = value
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| BridgeError::Protocol("apps.connections.open missing url".into()))?;
    let parsed = url::Url::parse(raw)
        .map_err(|e| BridgeError::Protocol(format!("bad socket mode url: {e}")))?;
    if parsed.scheme() != "wss" && parsed.scheme() != "ws" {
        return Err(BridgeError::Protocol(format!(
            "unexpected socket mode scheme '{}'",
            parsed.scheme()
        )));
    }
    Ok(parsed.into())
}

async fn run_socket_mode_once(
    inner: &Arc<SlackInner>,
    inbound: &mpsc::Sender<PlatformInbound>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<SocketEnd> {
    let url = open_socket_url(inner).await?;
    let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
    let (mut write, mut read) = ws.split();
    tracing::info!(target = "aily::slack", "socket mode connected");

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.tick().await;
    let mut unacked: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = write.close().await;
                return Ok(SocketEnd::Shutdown);
            }
            _ = keepalive.tick() => {
                if unacked >= KEEPALIVE_MISS_LIMIT {
                    tracing::warn!(target = "aily::slack", "keepalive pongs missing, reconnecting");
                    return Ok(SocketEnd::Reconnect);
                }
                unacked += 1;
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    return Ok(SocketEnd::Reconnect);
                }
            }
            frame = read.next() => {
                let Some(Ok(frame)) = frame else { return Ok(SocketEnd::Reconnect) };
                match frame {
                    Message::Text(text) => {
                        let Ok(envelope) = serde_json::from_str::<Value>(&text) else { continue };

                        // Acknowledge immediately; Slack redelivers otherwise.
                        if let Some(envelope_id) = envelope.get("envelope_id").and_then(Value::as_str) {
                            let ack = json!({ "envelope_id": envelope_id }).to_string();
                            if write.send(Message::Text(ack)).await.is_err() {
                                return Ok(SocketEnd::Reconnect);
                            }
                        }

                        match envelope.get("type").and_then(Value::as_str) {
                            Some("disconnect") => {
                                let reason = envelope
                                    .get("reason")
                                    .and_then(Value::as_str)
                                    .unwrap_or("unknown");
                                tracing::info!(target = "aily::slack", reason, "slack requested disconnect");
                                return Ok(SocketEnd::Reconnect);
                            }
                            Some("events_api") => {
                                if let Some(event) = envelope.pointer("/payload/event") {
                                    handle_event(inner, inbound, event).await;
                                }
                            }
                            _ => {}
                        }
                    }
                    Message::Ping(data) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Message::Pong(_) => {
                        unacked = 0;
                    }
                    Message::Close(_) => return Ok(SocketEnd::Reconnect),
                    _ => {}
                }
            }
        }
    }
}

async fn handle_event(
    inner: &Arc<SlackInner>,
    inbound: &mpsc::Sender<PlatformInbound>,
    event: &Value,
) {
    if event.get("type").and_then(Value::as_str) != Some("message") {
        return;
    }
    // Skip bot echoes and message edits/joins.
    if event.get("bot_id").is_some()
        || event
            .get("subtype")
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty())
    {
        return;
    }
    if event.get("channel").and_then(Value::as_str) != Some(inner.channel_id.as_str()) {
        return;
    }
    let user = event.get("user").and_then(Value::as_str).unwrap_or_default();
    if Some(user) == inner.bot_user_id.lock().as_deref() {
        return;
    }
    let text = event
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if text.is_empty() {
        return;
    }
    let ts = event.get("ts").and_then(Value::as_str).unwrap_or_default();
    let thread_ts = event
        .get("thread_ts")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    let message = PlatformInbound {
        platform: PlatformKind::Slack,
        thread_ref: thread_ts,
        author: user.to_string(),
        text,
        external_id: ts.to_string(),
    };
    if inbound.send(message).await.is_err() {
        tracing::warn!(target = "aily::slack", "inbound channel closed");
    }
}
