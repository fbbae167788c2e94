//! Dashboard gateway: REST surface plus the streaming channel.
//!
//! Bearer-token auth on everything except `/healthz` and the hook
//! webhook; token-bucket rate limiting per client IP; at most
//! [`MAX_WS_CLIENTS`] concurrent streaming clients.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{middleware, routing, Json, Router as AxumRouter};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::bus::{BusEvent, EventBus, EventKind, SubscriptionFilter};
use crate::error::BridgeError;
use crate::rate_limit::RateLimiter;
use crate::registry::{SessionFilter, SessionRegistry};
use crate::router::Router;
use crate::schedulers::{run_forced_sync, SchedulerContext};
use crate::store::MessageStore;
use crate::types::{AgentType, MessageRole, MessageSource, Session, SessionStatus};

pub const MAX_WS_CLIENTS: usize = 50;
const DEFAULT_PAGE_LIMIT: u32 = 50;
const MAX_PAGE_LIMIT: u32 = 200;

pub struct ApiContext {
    pub router: Arc<Router>,
    pub registry: Arc<SessionRegistry>,
    pub store: MessageStore,
    pub bus: EventBus,
    pub sched: Arc<SchedulerContext>,
    pub token: Option<String>,
    pub limiter: RateLimiter,
    pub ws_clients: AtomicUsize,
}

type Ctx = State<Arc<ApiContext>>;

pub fn api_router(ctx: Arc<ApiContext>) -> AxumRouter {
    let protected = AxumRouter::new()
        .route("/api/sessions", routing::get(list_sessions).post(create_session))
        .route(
            "/api/sessions/{name}",
            routing::get(get_session)
                .delete(delete_session)
                .patch(patch_session),
        )
        .route("/api/sessions/bulk-delete", routing::post(bulk_delete))
        .route("/api/sessions/{name}/messages", routing::get(session_messages))
        .route("/api/sessions/{name}/export", routing::get(export_session))
        .route("/api/sessions/{name}/send", routing::post(send_to_session))
        .route("/api/sessions/{name}/sync", routing::post(sync_session))
        .route("/api/sessions/{name}/capture", routing::get(capture_session))
        .route("/api/messages/search", routing::get(search_messages))
        .route("/api/stats", routing::get(stats))
        .route(
            "/api/preferences",
            routing::get(get_preferences).put(put_preferences),
        )
        .route(
            "/api/preferences/{key}",
            routing::get(get_preference_key).put(put_preference_key),
        )
        .route("/ws", routing::get(ws_upgrade))
        .layer(middleware::from_fn_with_state(ctx.clone(), auth_middleware));

    AxumRouter::new()
        .route("/healthz", routing::get(healthz))
        .route("/api/hooks/event", routing::post(hook_event))
        .merge(protected)
        .layer(middleware::from_fn_with_state(ctx.clone(), rate_limit_middleware))
        .with_state(ctx)
}

fn error_body(code: &str, message: &str) -> Json<Value> {
    Json(json!({ "error": { "code": code, "message": message } }))
}

fn map_error(error: &BridgeError) -> (StatusCode, &'static str) {
    match error {
        BridgeError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        BridgeError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
        BridgeError::Duplicate => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
        BridgeError::Unreachable(_) => (StatusCode::BAD_GATEWAY, "UNREACHABLE"),
        BridgeError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED"),
        BridgeError::Cancelled(_) => (StatusCode::GATEWAY_TIMEOUT, "CANCELLED"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
    }
}

fn bridge_error_response(error: BridgeError) -> (StatusCode, Json<Value>) {
    let (status, code) = map_error(&error);
    (status, error_body(code, &error.to_string()))
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

async fn auth_middleware(
    State(ctx): Ctx,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> Result<axum::response::Response, (StatusCode, Json<Value>)> {
    let Some(expected) = ctx.token.as_deref().filter(|t| !t.is_empty()) else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty());

    if provided != Some(expected) {
        return Err((
            StatusCode::UNAUTHORIZED,
            error_body("UNAUTHORIZED", "Missing or invalid bearer token"),
        ));
    }
    Ok(next.run(request).await)
}

fn client_ip(request: &axum::http::Request<axum::body::Body>) -> IpAddr {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

async fn rate_limit_middleware(
    State(ctx): Ctx,
    request: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    let path = request.uri().path();
    if path == "/healthz" || path == "/ws" {
        return next.run(request).await;
    }

    // The hook webhook carries no token; it is restricted to loopback
    // peers instead (hook scripts run on or are tunnelled to this
    // machine).
    if path == "/api/hooks/event" {
        if let Some(info) = request
            .extensions()
            .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        {
            if !info.0.ip().is_loopback() {
                tracing::warn!(target = "aily::api", peer = %info.0, "hook webhook from non-loopback peer rejected");
                return (
                    StatusCode::FORBIDDEN,
                    error_body("FORBIDDEN", "hook webhook accepts loopback sources only"),
                )
                    .into_response();
            }
        }
    }

    let ip = client_ip(&request);
    match ctx.limiter.check(ip) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(target = "aily::api", %ip, path, "rate limited");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                error_body("RATE_LIMITED", "Too many requests"),
            )
                .into_response();
            let seconds = retry_after.as_secs().max(1).to_string();
            if let Ok(value) = seconds.parse::<axum::http::HeaderValue>() {
                response.headers_mut().insert("retry-after", value);
            }
            response
        }
    }
}

// ---------------------------------------------------------------------------
// Plain endpoints
// ---------------------------------------------------------------------------

async fn healthz(State(ctx): Ctx) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "aily",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": ctx.registry.stats().total,
        "ws_clients": ctx.ws_clients.load(Ordering::Relaxed),
    }))
}

#[derive(Debug, Deserialize, Default)]
struct ListSessionsQuery {
    status: Option<String>,
    host: Option<String>,
    q: Option<String>,
    sort: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_sessions(
    State(ctx): Ctx,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let status = match query.status.as_deref() {
        Some(raw) => match SessionStatus::from_label(raw) {
            Some(status) => Some(status),
            None => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    error_body("INVALID_STATUS", &format!("Unknown status: {raw}")),
                ))
            }
        },
        None => None,
    };

    let mut sessions = ctx.registry.list(&SessionFilter {
        status,
        host: query.host.clone(),
        name_contains: query.q.clone(),
    });
    sort_sessions(&mut sessions, query.sort.as_deref().unwrap_or("-last_activity_at"));

    let total = sessions.len();
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT) as usize;
    let offset = query.offset.unwrap_or(0) as usize;
    let page: Vec<&Session> = sessions.iter().skip(offset).take(limit).collect();

    Ok(Json(json!({
        "sessions": page,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

fn sort_sessions(sessions: &mut [Session], sort: &str) {
    let descending = sort.starts_with('-');
    let field = sort.trim_start_matches('-');
    match field {
        "name" => sessions.sort_by(|a, b| a.name.cmp(&b.name)),
        "created_at" => sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        "status" => sessions.sort_by(|a, b| a.status.as_str().cmp(b.status.as_str())),
        "host" => sessions.sort_by(|a, b| a.host.cmp(&b.host)),
        // Unknown fields fall back to activity ordering.
        _ => sessions.sort_by(|a, b| a.last_activity_at.cmp(&b.last_activity_at)),
    }
    if descending {
        sessions.reverse();
    }
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    name: String,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    agent_type: Option<String>,
}

async fn create_session(
    State(ctx): Ctx,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let name = body.name.trim();
    if ctx.registry.contains(name) {
        return Err((
            StatusCode::CONFLICT,
            error_body("ALREADY_EXISTS", &format!("Session '{name}' already exists")),
        ));
    }
    let agent_type = body
        .agent_type
        .as_deref()
        .map(AgentType::from_label)
        .unwrap_or(AgentType::Unknown);

    match ctx
        .router
        .create_session(name, body.host.as_deref(), None, agent_type)
        .await
    {
        Ok((session, _)) => Ok((StatusCode::CREATED, Json(json!({ "session": session })))),
        Err(error) => Err(bridge_error_response(error)),
    }
}

async fn get_session(
    State(ctx): Ctx,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(session) = ctx.registry.get(&name) else {
        return Err((
            StatusCode::NOT_FOUND,
            error_body("NOT_FOUND", &format!("Session '{name}' not found")),
        ));
    };
    let message_count = ctx.store.message_count(&name).await.unwrap_or(0);
    Ok(Json(json!({
        "session": session,
        "message_count": message_count,
    })))
}

#[derive(Debug, Deserialize)]
struct PatchSessionBody {
    #[serde(default)]
    agent_type: Option<String>,
}

async fn patch_session(
    State(ctx): Ctx,
    Path(name): Path<String>,
    Json(body): Json<PatchSessionBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !ctx.registry.contains(&name) {
        return Err((
            StatusCode::NOT_FOUND,
            error_body("NOT_FOUND", &format!("Session '{name}' not found")),
        ));
    }
    if let Some(agent_type) = body.agent_type.as_deref() {
        ctx.registry
            .set_agent_type(&name, AgentType::from_label(agent_type))
            .await
            .map_err(bridge_error_response)?;
    }
    Ok(Json(json!({ "session": ctx.registry.get(&name) })))
}

#[derive(Debug, Deserialize, Default)]
struct DeleteQuery {
    /// Also remove the session record after the kill; default keeps it
    /// archived.
    #[serde(default)]
    purge: bool,
}

async fn delete_session(
    State(ctx): Ctx,
    Path(name): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match ctx.router.kill_session(&name).await {
        Ok(report) => {
            if query.purge {
                ctx.registry.delete(&name).await.map_err(bridge_error_response)?;
            }
            Ok(Json(json!({ "result": report, "purged": query.purge })))
        }
        Err(error) => Err(bridge_error_response(error)),
    }
}

#[derive(Debug, Deserialize)]
struct BulkDeleteBody {
    names: Vec<String>,
}

async fn bulk_delete(State(ctx): Ctx, Json(body): Json<BulkDeleteBody>) -> Json<Value> {
    let mut results = Vec::new();
    for name in body.names {
        let outcome = match ctx.router.kill_session(&name).await {
            Ok(report) => json!({ "name": name, "ok": true, "result": report }),
            Err(error) => json!({ "name": name, "ok": false, "error": error.to_string() }),
        };
        results.push(outcome);
    }
    Json(json!({ "results": results }))
}

#[derive(Debug, Deserialize, Default)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
    /// Cursor form: return messages strictly older than this id.
    before: Option<i64>,
}

async fn session_messages(
    State(ctx): Ctx,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !ctx.registry.contains(&name) {
        return Err((
            StatusCode::NOT_FOUND,
            error_body("NOT_FOUND", &format!("Session '{name}' not found")),
        ));
    }
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);

    if let Some(before) = query.before {
        let mut messages = ctx
            .store
            .page_before(&name, limit, before)
            .await
            .map_err(bridge_error_response)?;
        for message in &mut messages {
            message.content = crate::store::cap_for_wire(&message.content);
        }
        let next_cursor = messages.last().map(|m| m.id);
        return Ok(Json(json!({
            "messages": messages,
            "limit": limit,
            "next_before": next_cursor,
        })));
    }

    let offset = query.offset.unwrap_or(0);
    match ctx.router.page_messages(&name, limit, offset).await {
        Ok((messages, total)) => Ok(Json(json!({
            "messages": messages,
            "total": total,
            "limit": limit,
            "offset": offset,
        }))),
        Err(error) => Err(bridge_error_response(error)),
    }
}

/// Full message export for a session, oldest first, content uncapped.
async fn export_session(
    State(ctx): Ctx,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(session) = ctx.registry.get(&name) else {
        return Err((
            StatusCode::NOT_FOUND,
            error_body("NOT_FOUND", &format!("Session '{name}' not found")),
        ));
    };
    let total = ctx.store.message_count(&name).await.map_err(bridge_error_response)?;
    let (mut messages, _) = ctx
        .store
        .page(&name, total.max(0) as u32, 0)
        .await
        .map_err(bridge_error_response)?;
    messages.reverse();
    Ok(Json(json!({ "session": session, "messages": messages })))
}

#[derive(Debug, Deserialize, Default)]
struct CaptureQuery {
    lines: Option<u32>,
}

/// On-demand pane peek. Scrollback is read live and never stored; the
/// transcript remains the authoritative message source.
async fn capture_session(
    State(ctx): Ctx,
    Path(name): Path<String>,
    Query(query): Query<CaptureQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(session) = ctx.registry.get(&name) else {
        return Err((
            StatusCode::NOT_FOUND,
            error_body("NOT_FOUND", &format!("Session '{name}' not found")),
        ));
    };
    let Some(host) = session.host else {
        return Err((
            StatusCode::NOT_FOUND,
            error_body("NOT_FOUND", &format!("Session '{name}' has no live host")),
        ));
    };
    let lines = query.lines.unwrap_or(100).min(2_000);
    match ctx.sched.executor.capture(&host, &name, lines).await {
        Ok(text) => Ok(Json(json!({ "host": host, "lines": lines, "content": text }))),
        Err(error) => Err(bridge_error_response(error)),
    }
}

#[derive(Debug, Deserialize)]
struct SendBody {
    text: String,
}

async fn send_to_session(
    State(ctx): Ctx,
    Path(name): Path<String>,
    Json(body): Json<SendBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let text = body.text.trim();
    if text.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            error_body("INVALID_ARGUMENT", "text must not be empty"),
        ));
    }
    match ctx
        .router
        .inject_and_record(
            &name,
            text,
            MessageSource::Tmux,
            Some("dashboard".to_string()),
            None,
        )
        .await
    {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(error) => Err(bridge_error_response(error)),
    }
}

async fn sync_session(
    State(ctx): Ctx,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match run_forced_sync(&ctx.sched, &name).await {
        Ok(ingested) => Ok(Json(json!({ "ok": true, "ingested": ingested }))),
        Err(error) => Err(bridge_error_response(error)),
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: String,
    #[serde(default)]
    session: Option<String>,
    limit: Option<u32>,
}

async fn search_messages(
    State(ctx): Ctx,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT);
    match ctx
        .store
        .search(&query.q, query.session.as_deref(), limit)
        .await
    {
        Ok(hits) => Ok(Json(json!({ "results": hits }))),
        Err(error) => Err(bridge_error_response(error)),
    }
}

async fn stats(State(ctx): Ctx) -> Json<Value> {
    let registry = ctx.registry.stats();
    let total_messages = ctx.store.total_messages().await.unwrap_or(0);
    Json(json!({
        "sessions": registry,
        "total_messages": total_messages,
    }))
}

async fn get_preferences(State(ctx): Ctx) -> Json<Value> {
    let raw = ctx.store.get_pref("ui").await.ok().flatten();
    let value = raw
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_else(|| json!({}));
    Json(value)
}

async fn put_preferences(
    State(ctx): Ctx,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let raw = body.to_string();
    ctx.store
        .set_pref("ui", &raw)
        .await
        .map_err(bridge_error_response)?;
    Ok(Json(json!({ "ok": true })))
}

async fn get_preference_key(
    State(ctx): Ctx,
    Path(key): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let raw = ctx
        .store
        .get_pref(&format!("ui:{key}"))
        .await
        .map_err(bridge_error_response)?;
    let value = raw
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(Value::Null);
    Ok(Json(json!({ "key": key, "value": value })))
}

async fn put_preference_key(
    State(ctx): Ctx,
    Path(key): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    ctx.store
        .set_pref(&format!("ui:{key}"), &body.to_string())
        .await
        .map_err(bridge_error_response)?;
    Ok(Json(json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Hook webhook
// ---------------------------------------------------------------------------

async fn hook_event(State(ctx): Ctx, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    // Typing indicators pass straight through to the bus.
    if let Some(kind) = body.get("type").and_then(Value::as_str) {
        if kind == "typing.start" || kind == "typing.stop" {
            if let Some(session) = body.get("session_name").and_then(Value::as_str) {
                let event_kind = if kind == "typing.start" {
                    EventKind::TypingStart
                } else {
                    EventKind::TypingStop
                };
                ctx.bus.publish(BusEvent::new(
                    event_kind,
                    Some(session.to_string()),
                    json!({ "session_name": session }),
                ));
            }
            return (StatusCode::ACCEPTED, Json(json!({ "accepted": true })));
        }
    }

    let Some(event) = parse_hook_event(&body) else {
        return (
            StatusCode::BAD_REQUEST,
            error_body("INVALID_ARGUMENT", "missing session_name or content"),
        );
    };

    // Accept immediately; platform fan-out with retries runs behind the
    // response.
    let router = ctx.router.clone();
    tokio::spawn(async move {
        if let Err(error) = router.handle_agent_event(event).await {
            tracing::warn!(target = "aily::api", error = %error, "hook event failed");
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "accepted": true })))
}

/// Parse a hook webhook body. Accepts the canonical shape plus the legacy
/// bridge `message.relayed` shape (`platform`/`source_id` fields).
fn parse_hook_event(body: &Value) -> Option<crate::types::AgentEvent> {
    let session_name = body.get("session_name")?.as_str()?.trim().to_string();
    if session_name.is_empty() {
        return None;
    }
    let content = body.get("content")?.as_str()?.trim().to_string();
    if content.is_empty() {
        return None;
    }

    let agent = body
        .get("agent")
        .and_then(Value::as_str)
        .map(AgentType::from_label)
        .unwrap_or(AgentType::Unknown);
    let role = body
        .get("role")
        .and_then(Value::as_str)
        .and_then(MessageRole::from_label)
        .unwrap_or(MessageRole::Assistant);
    let source = body
        .get("platform")
        .and_then(Value::as_str)
        .and_then(MessageSource::from_label)
        .unwrap_or(MessageSource::Hook);
    let external_id = body
        .get("external_id")
        .or_else(|| body.get("source_id"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned);
    let timestamp = body
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(crate::types::AgentEvent {
        session_name,
        agent,
        role,
        content,
        source,
        external_id,
        timestamp,
    })
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

struct WsClientSlot {
    ctx: Arc<ApiContext>,
}

impl Drop for WsClientSlot {
    fn drop(&mut self) {
        self.ctx.ws_clients.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn ws_upgrade(State(ctx): Ctx, ws: WebSocketUpgrade) -> axum::response::Response {
    let current = ctx.ws_clients.fetch_add(1, Ordering::SeqCst);
    if current >= MAX_WS_CLIENTS {
        ctx.ws_clients.fetch_sub(1, Ordering::SeqCst);
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("TOO_MANY_CLIENTS", "streaming client limit reached"),
        )
            .into_response();
    }
    let slot = WsClientSlot { ctx: ctx.clone() };
    ws.on_upgrade(move |socket| handle_ws(socket, ctx, slot))
}

async fn handle_ws(mut socket: WebSocket, ctx: Arc<ApiContext>, _slot: WsClientSlot) {
    let client_id = uuid::Uuid::new_v4().simple().to_string();
    tracing::info!(target = "aily::api", client = %client_id, "streaming client connected");
    let mut subscriber = ctx.bus.subscribe(SubscriptionFilter::default());

    // Initial heartbeat so clients can confirm the stream is live.
    let hello = BusEvent::heartbeat().to_frame().to_string();
    if socket.send(WsMessage::Text(hello.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = subscriber.recv() => {
                let Some(event) = event else { break };
                let frame = event.to_frame().to_string();
                if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                match message {
                    WsMessage::Text(text) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                        match value.get("type").and_then(Value::as_str) {
                            Some("ping") => {
                                let pong = json!({ "type": "pong" }).to_string();
                                if socket.send(WsMessage::Text(pong.into())).await.is_err() {
                                    break;
                                }
                            }
                            Some("subscribe") => {
                                let sessions: Vec<String> = value
                                    .get("sessions")
                                    .and_then(Value::as_array)
                                    .map(|names| {
                                        names
                                            .iter()
                                            .filter_map(Value::as_str)
                                            .map(ToOwned::to_owned)
                                            .collect()
                                    })
                                    .unwrap_or_default();
                                tracing::debug!(
                                    target = "aily::api",
                                    client = %client_id,
                                    filter = ?sessions,
                                    "streaming filter updated"
                                );
                                subscriber.set_filter(SubscriptionFilter::sessions(sessions));
                            }
                            _ => {}
                        }
                    }
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
    tracing::info!(target = "aily::api", client = %client_id, "streaming client disconnected");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::bus::EventBus;
    use crate::config::Config;
    use crate::error::{BridgeError, Result};
    use crate::rate_limit::RateLimiter;
    use crate::registry::SessionRegistry;
    use crate::router::Router;
    use crate::scrape::TranscriptScraper;
    use crate::schedulers::SchedulerContext;
    use crate::ssh::{CommandOutput, ControlKey, SessionHost};
    use crate::store::MessageStore;

    use super::{api_router, ApiContext};

    struct NullHost {
        hosts: Vec<String>,
    }

    #[async_trait]
    impl SessionHost for NullHost {
        fn hosts(&self) -> &[String] {
            &self.hosts
        }
        async fn list_sessions(&self, _host: &str) -> Result<BTreeSet<String>> {
            Ok(BTreeSet::new())
        }
        async fn has_session(&self, _host: &str, _name: &str) -> Result<bool> {
            Ok(false)
        }
        async fn create_session(&self, _host: &str, _name: &str, _dir: Option<&str>) -> Result<()> {
            Ok(())
        }
        async fn kill_session(&self, _host: &str, _name: &str) -> Result<()> {
            Err(BridgeError::NotFound("no sessions".into()))
        }
        async fn inject(&self, _host: &str, _name: &str, _payload: &str, _submit: bool) -> Result<()> {
            Ok(())
        }
        async fn send_key(&self, _host: &str, _name: &str, _key: ControlKey) -> Result<()> {
            Ok(())
        }
        async fn capture(&self, _host: &str, _name: &str, _lines: u32) -> Result<String> {
            Ok(String::new())
        }
        async fn session_cwd(&self, _host: &str, _name: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn run(&self, _host: &str, _cmd: &str, _timeout: Duration) -> Result<CommandOutput> {
            Ok(CommandOutput {
                status: 0,
                stdout: String::new(),
            })
        }
    }

    async fn test_ctx(token: Option<&str>, limiter: RateLimiter) -> (TempDir, Arc<ApiContext>) {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::open(&dir.path().join("aily.db")).await.unwrap();
        let bus = EventBus::new();
        let registry = Arc::new(SessionRegistry::new(store.pool().clone(), bus.clone()));
        let executor: Arc<dyn SessionHost> = Arc::new(NullHost {
            hosts: vec!["localhost".to_string()],
        });
        let config = Config::default();
        let router = Arc::new(Router::new(
            registry.clone(),
            store.clone(),
            bus.clone(),
            executor.clone(),
            Vec::new(),
            config.clone(),
        ));
        let scraper = Arc::new(TranscriptScraper::new(executor.clone(), store.clone()));
        let sched = Arc::new(SchedulerContext {
            router: router.clone(),
            registry: registry.clone(),
            executor,
            scraper,
            bus: bus.clone(),
            config,
        });
        let ctx = Arc::new(ApiContext {
            router,
            registry,
            store,
            bus,
            sched,
            token: token.map(ToOwned::to_owned),
            limiter,
            ws_clients: AtomicUsize::new(0),
        });
        (dir, ctx)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(path: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path).method("GET");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let (_dir, ctx) = test_ctx(Some("secret"), RateLimiter::new(20, 40)).await;
        let response = api_router(ctx).oneshot(get("/healthz", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_requires_bearer_token() {
        let (_dir, ctx) = test_ctx(Some("secret"), RateLimiter::new(20, 40)).await;
        let router = api_router(ctx);

        let unauthorized = router
            .clone()
            .oneshot(get("/api/sessions", None))
            .await
            .unwrap();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let wrong = router
            .clone()
            .oneshot(get("/api/sessions", Some("wrong")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = router.oneshot(get("/api/sessions", Some("secret"))).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn sessions_listing_and_detail() {
        let (_dir, ctx) = test_ctx(None, RateLimiter::new(20, 40)).await;
        ctx.registry.observe_live("s1", "localhost").await.unwrap();
        let router = api_router(ctx);

        let list = router.clone().oneshot(get("/api/sessions", None)).await.unwrap();
        let body = body_json(list).await;
        assert_eq!(body["total"], 1);
        assert_eq!(body["sessions"][0]["name"], "s1");
        assert_eq!(body["sessions"][0]["status"], "active");

        let detail = router
            .clone()
            .oneshot(get("/api/sessions/s1", None))
            .await
            .unwrap();
        assert_eq!(detail.status(), StatusCode::OK);
        let body = body_json(detail).await;
        assert_eq!(body["message_count"], 0);

        let missing = router.oneshot(get("/api/sessions/nope", None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn hook_webhook_is_unauthenticated_and_accepts() {
        let (_dir, ctx) = test_ctx(Some("secret"), RateLimiter::new(20, 40)).await;
        ctx.registry.observe_live("s1", "localhost").await.unwrap();
        let store = ctx.store.clone();
        let router = api_router(ctx);

        let request = Request::builder()
            .uri("/api/hooks/event")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "session_name": "s1",
                    "agent": "claude",
                    "role": "assistant",
                    "content": "done",
                    "external_id": "x1"
                })
                .to_string(),
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // The event is processed behind the 202.
        let mut stored = 0;
        for _ in 0..50 {
            stored = store.message_count("s1").await.unwrap();
            if stored > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored, 1);
    }

    #[tokio::test]
    async fn hook_webhook_rejects_empty_payload() {
        let (_dir, ctx) = test_ctx(None, RateLimiter::new(20, 40)).await;
        let router = api_router(ctx);
        let request = Request::builder()
            .uri("/api/hooks/event")
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "content": "no session" }).to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rate_limit_returns_retry_after() {
        let (_dir, ctx) = test_ctx(None, RateLimiter::new(1, 1)).await;
        let router = api_router(ctx);

        let first = router
            .clone()
            .oneshot(get("/api/sessions", None))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = router.oneshot(get("/api/sessions", None)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn preferences_round_trip() {
        let (_dir, ctx) = test_ctx(None, RateLimiter::new(20, 40)).await;
        let router = api_router(ctx);

        let empty = router
            .clone()
            .oneshot(get("/api/preferences", None))
            .await
            .unwrap();
        assert_eq!(body_json(empty).await, json!({}));

        let put = Request::builder()
            .uri("/api/preferences")
            .method("PUT")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "theme": "dark" }).to_string()))
            .unwrap();
        let response = router.clone().oneshot(put).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let read = router.oneshot(get("/api/preferences", None)).await.unwrap();
        assert_eq!(body_json(read).await, json!({ "theme": "dark" }));
    }

    #[tokio::test]
    async fn stats_reports_counts() {
        let (_dir, ctx) = test_ctx(None, RateLimiter::new(20, 40)).await;
        ctx.registry.observe_live("s1", "localhost").await.unwrap();
        ctx.registry.observe_live("s2", "localhost").await.unwrap();
        let router = api_router(ctx);

        let response = router.oneshot(get("/api/stats", None)).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["sessions"]["total"], 2);
        assert_eq!(body["sessions"]["by_status"]["active"], 2);
        assert_eq!(body["total_messages"], 0);
    }
}
