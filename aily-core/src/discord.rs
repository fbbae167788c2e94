//! Discord adapter: REST v10 for thread management and posting, a raw
//! gateway connection for inbound messages.
//!
//! Thread find order: active guild threads filtered by parent channel,
//! then archived public threads, then recent channel messages carrying
//! thread metadata. Reconnects with jittered exponential backoff; a
//! heartbeat that misses three acks is treated as a dead connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

use crate::adapter::{cap_message, reconnect_delay, NameLocks, PlatformAdapter};
use crate::error::{BridgeError, Result};
use crate::types::{parse_thread_title, thread_title, PlatformInbound, PlatformKind};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const MESSAGE_CEILING: usize = 2_000;

const INTENT_GUILDS: u64 = 1;
const INTENT_GUILD_MESSAGES: u64 = 1 << 9;
const INTENT_MESSAGE_CONTENT: u64 = 1 << 15;

/// Thread channel types in the Discord API.
const CHANNEL_TYPE_PUBLIC_THREAD: i64 = 11;
const CHANNEL_TYPE_PRIVATE_THREAD: i64 = 12;

const MAX_RATE_LIMIT_RETRIES: u32 = 3;
const HEARTBEAT_MISS_LIMIT: u32 = 3;

struct DiscordInner {
    http: reqwest::Client,
    api_base: String,
    token: String,
    channel_id: String,
    guild_id: parking_lot::Mutex<Option<String>>,
    bot_user_id: parking_lot::Mutex<Option<String>>,
    locks: NameLocks,
    shutdown: watch::Sender<bool>,
}

pub struct DiscordAdapter {
    inner: Arc<DiscordInner>,
}

impl DiscordAdapter {
    pub fn new(token: &str, channel_id: &str) -> Self {
        Self::with_api_base(token, channel_id, DISCORD_API_BASE)
    }

    pub fn with_api_base(token: &str, channel_id: &str, api_base: &str) -> Self {
        let (shutdown, _) = watch::channel(false);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(DiscordInner {
                http,
                api_base: api_base.trim_end_matches('/').to_string(),
                token: token.to_string(),
                channel_id: channel_id.to_string(),
                guild_id: parking_lot::Mutex::new(None),
                bot_user_id: parking_lot::Mutex::new(None),
                locks: NameLocks::new(),
                shutdown,
            }),
        }
    }
}

impl DiscordInner {
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{}", self.api_base, path);
        let mut attempt = 0;
        loop {
            let mut builder = self
                .http
                .request(method.clone(), &url)
                .header("Authorization", format!("Bot {}", self.token));
            if let Some(body) = body {
                builder = builder.json(body);
            }
            let response = builder.send().await?;
            let status = response.status();

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<f64>().ok())
                    .map(Duration::from_secs_f64);
                attempt += 1;
                if attempt > MAX_RATE_LIMIT_RETRIES {
                    return Err(BridgeError::RateLimited { retry_after });
                }
                let wait = retry_after.unwrap_or(Duration::from_secs(1)).min(Duration::from_secs(30));
                tracing::debug!(target = "aily::discord", path, wait_ms = wait.as_millis() as u64, "rate limited, honouring retry-after");
                tokio::time::sleep(wait).await;
                continue;
            }
            if status.as_u16() == 404 {
                return Err(BridgeError::NotFound(format!("discord {path}")));
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(BridgeError::AuthRejected(format!(
                    "discord rejected request ({status})"
                )));
            }
            if status.is_server_error() {
                return Err(BridgeError::Unreachable(format!("discord {path} -> {status}")));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let mut end = body.len().min(200);
                while end > 0 && !body.is_char_boundary(end) {
                    end -= 1;
                }
                return Err(BridgeError::Protocol(format!(
                    "discord {path} -> {status}: {}",
                    &body[..end]
                )));
            }

            let text = response.text().await?;
            if text.is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }
    }

    async fn guild_id(&self) -> Result<Option<String>> {
        if let Some(cached) = self.guild_id.lock().clone() {
            return Ok(Some(cached));
        }
        let channel = self
            .request(Method::GET, &format!("/channels/{}", self.channel_id), None)
            .await?;
        let guild = channel
            .get("guild_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);
        if let Some(guild) = &guild {
            *self.guild_id.lock() = Some(guild.clone());
        }
        Ok(guild)
    }

    /// Find a thread by title: active threads under our channel, archived
    /// public threads, then recent channel messages' thread metadata.
    async fn find_thread_inner(&self, title: &str) -> Result<Option<String>> {
        if let Some(guild) = self.guild_id().await? {
            let active = self
                .request(Method::GET, &format!("/guilds/{guild}/threads/active"), None)
                .await?;
            if let Some(threads) = active.get("threads").and_then(Value::as_array) {
                for thread in threads {
                    if thread.get("name").and_then(Value::as_str) == Some(title)
                        && thread.get("parent_id").and_then(Value::as_str)
                            == Some(self.channel_id.as_str())
                    {
                        if let Some(id) = thread.get("id").and_then(Value::as_str) {
                            return Ok(Some(id.to_string()));
                        }
                    }
                }
            }
        }

        let archived = self
            .request(
                Method::GET,
                &format!("/channels/{}/threads/archived/public", self.channel_id),
                None,
            )
            .await;
        if let Ok(archived) = archived {
            if let Some(threads) = archived.get("threads").and_then(Value::as_array) {
                for thread in threads {
                    if thread.get("name").and_then(Value::as_str) == Some(title) {
                        if let Some(id) = thread.get("id").and_then(Value::as_str) {
                            return Ok(Some(id.to_string()));
                        }
                    }
                }
            }
        }

        let messages = self
            .request(
                Method::GET,
                &format!("/channels/{}/messages?limit=50", self.channel_id),
                None,
            )
            .await?;
        if let Some(messages) = messages.as_array() {
            for message in messages {
                let thread = message.get("thread");
                if let Some(thread) = thread {
                    if thread.get("name").and_then(Value::as_str) == Some(title) {
                        if let Some(id) = thread.get("id").and_then(Value::as_str) {
                            return Ok(Some(id.to_string()));
                        }
                    }
                }
            }
        }

        Ok(None)
    }

    async fn post_to(&self, channel_id: &str, content: &str) -> Result<String> {
        let capped = cap_message(content, MESSAGE_CEILING);
        let response = self
            .request(
                Method::POST,
                &format!("/channels/{channel_id}/messages"),
                Some(&json!({ "content": capped })),
            )
            .await?;
        response
            .get("id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| BridgeError::Protocol("discord message response missing id".into()))
    }
}

#[async_trait]
impl PlatformAdapter for DiscordAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Discord
    }

    async fn connect(&self, inbound: mpsc::Sender<PlatformInbound>) -> Result<()> {
        // Validate credentials before spawning anything: a bad token is an
        // unrecoverable startup failure, not a reconnect loop.
        let me = self.inner.request(Method::GET, "/users/@me", None).await?;
        let bot_id = me
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol("discord /users/@me missing id".into()))?
            .to_string();
        *self.inner.bot_user_id.lock() = Some(bot_id);
        let _ = self.inner.guild_id().await;

        tracing::info!(
            target = "aily::discord",
            bot = me.get("username").and_then(serde_json::Value::as_str).unwrap_or("?"),
            "discord credentials verified"
        );

        let inner = self.inner.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match run_gateway_once(&inner, &inbound, &mut shutdown_rx).await {
                    Ok(GatewayEnd::Shutdown) => break,
                    Ok(GatewayEnd::Reconnect) => {
                        attempt += 1;
                    }
                    Err(error) => {
                        attempt += 1;
                        tracing::warn!(target = "aily::discord", error = %error, "gateway connection failed");
                    }
                }
                tokio::time::sleep(reconnect_delay(attempt)).await;
            }
            tracing::info!(target = "aily::discord", "gateway task stopped");
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    async fn ensure_thread(&self, session_name: &str, starter_text: &str) -> Result<String> {
        let _guard = self.inner.locks.acquire(session_name).await;
        let title = thread_title(session_name);

        if let Some(thread_id) = self.inner.find_thread_inner(&title).await? {
            // Reopen if archived; a no-op on active threads.
            let _ = self
                .inner
                .request(
                    Method::PATCH,
                    &format!("/channels/{thread_id}"),
                    Some(&json!({ "archived": false })),
                )
                .await;
            return Ok(thread_id);
        }

        let starter_id = self.inner.post_to(&self.inner.channel_id, starter_text).await?;
        let thread = self
            .inner
            .request(
                Method::POST,
                &format!(
                    "/channels/{}/messages/{starter_id}/threads",
                    self.inner.channel_id
                ),
                Some(&json!({ "name": title })),
            )
            .await?;
        let thread_id = thread
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol("discord thread response missing id".into()))?
            .to_string();

        let welcome = format!(
            "**Welcome to {title}** 👋\n\n\
             Type a message here to forward it to the tmux session.\n\n\
             **Commands:**\n\
             `!sessions` — list all sessions\n\
             `!kill {session_name}` — kill this session + archive thread"
        );
        let _ = self.inner.post_to(&thread_id, &welcome).await;

        tracing::info!(target = "aily::discord", session = %session_name, thread = %thread_id, "created thread");
        Ok(thread_id)
    }

    async fn find_thread(&self, session_name: &str) -> Result<Option<String>> {
        self.inner.find_thread_inner(&thread_title(session_name)).await
    }

    async fn thread_session(&self, thread_ref: &str) -> Result<Option<String>> {
        let channel = self
            .inner
            .request(Method::GET, &format!("/channels/{thread_ref}"), None)
            .await?;
        let channel_type = channel.get("type").and_then(Value::as_i64).unwrap_or(-1);
        if channel_type != CHANNEL_TYPE_PUBLIC_THREAD && channel_type != CHANNEL_TYPE_PRIVATE_THREAD
        {
            return Ok(None);
        }
        if channel.get("parent_id").and_then(Value::as_str) != Some(self.inner.channel_id.as_str())
        {
            return Ok(None);
        }
        Ok(channel
            .get("name")
            .and_then(Value::as_str)
            .and_then(parse_thread_title)
            .map(ToOwned::to_owned))
    }

    async fn post(&self, thread_ref: &str, text: &str, raw: bool) -> Result<String> {
        let content = if raw {
            text.to_string()
        } else {
            format!("**Task complete**\n{text}")
        };
        self.inner.post_to(thread_ref, &content).await
    }

    async fn post_root(&self, text: &str) -> Result<String> {
        let channel = self.inner.channel_id.clone();
        self.inner.post_to(&channel, text).await
    }

    async fn archive(&self, thread_ref: &str) -> Result<()> {
        self.inner
            .request(
                Method::PATCH,
                &format!("/channels/{thread_ref}"),
                Some(&json!({ "archived": true })),
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, thread_ref: &str) -> Result<()> {
        self.inner
            .request(Method::DELETE, &format!("/channels/{thread_ref}"), None)
            .await?;
        Ok(())
    }
}

enum GatewayEnd {
    Shutdown,
    Reconnect,
}

async fn run_gateway_once(
    inner: &Arc<DiscordInner>,
    inbound: &mpsc::Sender<PlatformInbound>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<GatewayEnd> {
    let gateway = inner.request(Method::GET, "/gateway/bot", None).await?;
    let base = gateway
        .get("url")
        .and_then(Value::as_str)
        .unwrap_or("wss://gateway.discord.gg");
    let url = format!("{base}/?v=10&encoding=json");

    let (ws, _) = tokio_tungstenite::connect_async(&url).await?;
    let (mut write, mut read) = ws.split();
    tracing::info!(target = "aily::discord", "gateway connected");

    let mut sequence: Option<i64> = None;
    let mut heartbeat = tokio::time::interval(Duration::from_secs(41));
    let mut identified = false;
    let mut unacked: u32 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                let _ = write.close().await;
                return Ok(GatewayEnd::Shutdown);
            }
            _ = heartbeat.tick(), if identified => {
                if unacked >= HEARTBEAT_MISS_LIMIT {
                    tracing::warn!(target = "aily::discord", "heartbeat acks missing, reconnecting");
                    return Ok(GatewayEnd::Reconnect);
                }
                unacked += 1;
                let frame = json!({ "op": 1, "d": sequence });
                if write.send(Message::Text(frame.to_string())).await.is_err() {
                    return Ok(GatewayEnd::Reconnect);
                }
            }
            frame = read.next() => {
                let Some(Ok(frame)) = frame else { return Ok(GatewayEnd::Reconnect) };
                let Message::Text(text) = frame else {
                    if matches!(frame, Message::Close(_)) {
                        return Ok(GatewayEnd::Reconnect);
                    }
                    continue;
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                if let Some(seq) = value.get("s").and_then(Value::as_i64) {
                    sequence = Some(seq);
                }
                match value.get("op").and_then(Value::as_i64) {
                    // Hello: set heartbeat cadence and identify.
                    Some(10) => {
                        let interval_ms = value
                            .pointer("/d/heartbeat_interval")
                            .and_then(Value::as_u64)
                            .unwrap_or(41_250);
                        heartbeat = tokio::time::interval(Duration::from_millis(interval_ms));
                        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                        let identify = json!({
                            "op": 2,
                            "d": {
                                "token": inner.token,
                                "intents": INTENT_GUILDS | INTENT_GUILD_MESSAGES | INTENT_MESSAGE_CONTENT,
                                "properties": { "os": "linux", "browser": "aily", "device": "aily" }
                            }
                        });
                        if write.send(Message::Text(identify.to_string())).await.is_err() {
                            return Ok(GatewayEnd::Reconnect);
                        }
                        identified = true;
                    }
                    // Heartbeat ack.
                    Some(11) => {
                        unacked = 0;
                    }
                    // Dispatch.
                    Some(0) => {
                        if value.get("t").and_then(Value::as_str) == Some("MESSAGE_CREATE") {
                            if let Some(data) = value.get("d") {
                                handle_message_create(inner, inbound, data).await;
                            }
                        }
                    }
                    // Reconnect / invalid session.
                    Some(7) | Some(9) => {
                        tracing::info!(target = "aily::discord", "gateway requested reconnect");
                        return Ok(GatewayEnd::Reconnect);
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_message_create(
    inner: &Arc<DiscordInner>,
    inbound: &mpsc::Sender<PlatformInbound>,
    data: &Value,
) {
    let author = data.get("author").cloned().unwrap_or_default();
    if author.get("bot").and_then(Value::as_bool).unwrap_or(false) {
        return;
    }
    let author_id = author.get("id").and_then(Value::as_str).unwrap_or_default();
    if Some(author_id) == inner.bot_user_id.lock().as_deref() {
        return;
    }

    let channel_id = data
        .get("channel_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let content = data
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let message_id = data
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if content.is_empty() || channel_id.is_empty() {
        return;
    }

    let thread_ref = if channel_id == inner.channel_id {
        None
    } else {
        // Only forward messages from threads under our channel; anything
        // else the bot can see is not ours.
        match inner
            .request(Method::GET, &format!("/channels/{channel_id}"), None)
            .await
        {
            Ok(channel) => {
                let channel_type = channel.get("type").and_then(Value::as_i64).unwrap_or(-1);
                let is_thread = channel_type == CHANNEL_TYPE_PUBLIC_THREAD
                    || channel_type == CHANNEL_TYPE_PRIVATE_THREAD;
                let is_ours = channel.get("parent_id").and_then(Value::as_str)
                    == Some(inner.channel_id.as_str());
                if is_thread && is_ours {
                    Some(channel_id)
                } else {
                    return;
                }
            }
            Err(error) => {
                tracing::debug!(target = "aily::discord", error = %error, "channel lookup failed");
                return;
            }
        }
    };

    let event = PlatformInbound {
        platform: PlatformKind::Discord,
        thread_ref,
        author: author
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        text: content,
        external_id: message_id,
    };
    if inbound.send(event).await.is_err() {
        tracing::warn!(target = "aily::discord", "inbound channel closed");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::adapter::PlatformAdapter;

    use super::DiscordAdapter;

    async fn adapter(server: &MockServer) -> DiscordAdapter {
        DiscordAdapter::with_api_base("tok", "123", &server.uri())
    }

    #[tokio::test]
    async fn ensure_thread_finds_active_thread() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"guild_id": "g1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/guilds/g1/threads/active"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "threads": [
                    {"id": "t-other", "name": "[agent] other", "parent_id": "123"},
                    {"id": "t1", "name": "[agent] s1", "parent_id": "123"},
                    {"id": "t-foreign", "name": "[agent] s1", "parent_id": "999"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/channels/t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let thread = adapter.ensure_thread("s1", "starter").await.unwrap();
        assert_eq!(thread, "t1");
    }

    #[tokio::test]
    async fn ensure_thread_creates_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"guild_id": "g1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/guilds/g1/threads/active"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"threads": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/123/threads/archived/public"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"threads": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/123/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/123/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/123/messages/m1/threads"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "t9"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/t9/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "w1"})))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let thread = adapter.ensure_thread("s1", "tmux session: s1").await.unwrap();
        assert_eq!(thread, "t9");

        // Welcome message went into the new thread.
        let requests = server.received_requests().await.unwrap();
        assert!(requests
            .iter()
            .any(|r| r.url.path() == "/channels/t9/messages"));
    }

    #[tokio::test]
    async fn post_caps_to_message_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/t1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m1"})))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let long = "y".repeat(5_000);
        adapter.post("t1", &long, true).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let content = body["content"].as_str().unwrap();
        assert!(content.len() <= 2_000);
        assert!(content.ends_with('…'));
    }

    #[tokio::test]
    async fn rate_limit_is_retried_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/channels/t1/messages"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/channels/t1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m2"})))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        let id = adapter.post("t1", "hello", true).await.unwrap();
        assert_eq!(id, "m2");
    }

    #[tokio::test]
    async fn thread_session_parses_title_of_owned_threads_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/channels/t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": 11, "parent_id": "123", "name": "[agent] fix-auth"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/channels/t2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": 11, "parent_id": "999", "name": "[agent] foreign"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex("/channels/c[0-9]+"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "type": 0, "name": "general"
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        assert_eq!(
            adapter.thread_session("t1").await.unwrap(),
            Some("fix-auth".to_string())
        );
        assert_eq!(adapter.thread_session("t2").await.unwrap(), None);
        assert_eq!(adapter.thread_session("c42").await.unwrap(), None);
    }

    #[tokio::test]
    async fn archive_patches_thread() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/channels/t1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server).await;
        adapter.archive("t1").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["archived"], true);
    }
}
