//! Persistent message store on SQLite.
//!
//! Single-writer, many-reader: all inserts flow through one writer task
//! that batches concurrent appends into a single transaction per commit
//! window (≤50 ms) to bound fsync rate under bursts. Readers use the
//! shared pool directly. Deduplication is enforced by the schema:
//! a partial unique index on `(session_name, external_id)` and a fallback
//! content-hash key for messages without a platform id.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::{mpsc, oneshot};

use crate::error::{BridgeError, Result};
use crate::types::{MessageRole, MessageSource, NewMessage, PlatformKind, StoredMessage};

const COMMIT_WINDOW: Duration = Duration::from_millis(50);
const MAX_BATCH: usize = 64;
const WRITE_QUEUE_DEPTH: usize = 512;

/// Content shipped over the wire is capped; storage is not.
pub const WIRE_CONTENT_CAP: usize = 4_000;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "INSERT INTO meta (key, value) VALUES ('schema_version', '1')
     ON CONFLICT(key) DO NOTHING",
    "CREATE TABLE IF NOT EXISTS sessions (
        name                 TEXT PRIMARY KEY,
        host                 TEXT,
        agent_type           TEXT NOT NULL DEFAULT 'unknown',
        status               TEXT NOT NULL DEFAULT 'active',
        working_dir          TEXT,
        created_at           TEXT NOT NULL,
        last_activity_at     TEXT NOT NULL,
        last_message_preview TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
    "CREATE TABLE IF NOT EXISTS messages (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        session_name TEXT NOT NULL,
        role         TEXT NOT NULL,
        source       TEXT NOT NULL,
        content      TEXT NOT NULL,
        author       TEXT,
        external_id  TEXT,
        dedup_hash   TEXT,
        timestamp    TEXT NOT NULL,
        ingested_at  TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_name, id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_external
        ON messages(session_name, external_id) WHERE external_id IS NOT NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_dedup
        ON messages(dedup_hash) WHERE dedup_hash IS NOT NULL",
    "CREATE TABLE IF NOT EXISTS thread_bindings (
        platform     TEXT NOT NULL,
        session_name TEXT NOT NULL,
        thread_ref   TEXT NOT NULL,
        bound_at     TEXT NOT NULL,
        PRIMARY KEY (platform, session_name)
    )",
    "CREATE INDEX IF NOT EXISTS idx_bindings_thread
        ON thread_bindings(platform, thread_ref)",
    "CREATE TABLE IF NOT EXISTS preferences (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts
        USING fts5(content, content='messages', content_rowid='id')",
    "CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
    END",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted(i64),
    Duplicate,
}

impl AppendOutcome {
    pub fn inserted_id(self) -> Option<i64> {
        match self {
            AppendOutcome::Inserted(id) => Some(id),
            AppendOutcome::Duplicate => None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub session_name: String,
    pub role: MessageRole,
    pub source: MessageSource,
    pub snippet: String,
    pub timestamp: DateTime<Utc>,
}

struct AppendRequest {
    message: NewMessage,
    reply: oneshot::Sender<Result<AppendOutcome>>,
}

#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
    writer_tx: mpsc::Sender<AppendRequest>,
}

impl MessageStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        tokio::spawn(writer_loop(pool.clone(), writer_rx));
        tracing::info!(target = "aily::store", "message store ready");
        Ok(Self { pool, writer_tx })
    }

    /// Shared read pool. The registry persists session rows through this;
    /// message rows are written only by the store's writer task.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append a message. Duplicates (by external id, or by content
    /// fingerprint within a one-second bucket) are reported, not stored.
    pub async fn append(&self, message: NewMessage) -> Result<AppendOutcome> {
        let (reply, rx) = oneshot::channel();
        self.writer_tx
            .send(AppendRequest { message, reply })
            .await
            .map_err(|_| BridgeError::Storage("message writer gone".into()))?;
        rx.await
            .map_err(|_| BridgeError::Storage("message writer dropped reply".into()))?
    }

    /// Flush the writer queue. Used during shutdown.
    pub async fn flush(&self) {
        let (reply, rx) = oneshot::channel();
        let probe = NewMessage {
            session_name: String::new(),
            role: MessageRole::System,
            source: MessageSource::Hook,
            content: String::new(),
            author: None,
            external_id: None,
            timestamp: Utc::now(),
        };
        // An empty-session probe is rejected by the writer after the
        // preceding batch commits, which is all flush needs.
        if self
            .writer_tx
            .send(AppendRequest { message: probe, reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Page a session's messages, newest first. Returns the page and the
    /// total count.
    pub async fn page(
        &self,
        session_name: &str,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<StoredMessage>, i64)> {
        let total: i64 =
            sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE session_name = ?")
                .bind(session_name)
                .fetch_one(&self.pool)
                .await?
                .get("cnt");

        let rows = sqlx::query(
            "SELECT id, session_name, role, source, content, author, external_id, timestamp
             FROM messages WHERE session_name = ?
             ORDER BY timestamp DESC, id DESC
             LIMIT ? OFFSET ?",
        )
        .bind(session_name)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok((rows.iter().map(row_to_message).collect(), total))
    }

    /// Cursor-form paging for streaming scrollback: messages strictly
    /// older than `before_id`, newest first.
    pub async fn page_before(
        &self,
        session_name: &str,
        limit: u32,
        before_id: i64,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT id, session_name, role, source, content, author, external_id, timestamp
             FROM messages WHERE session_name = ? AND id < ?
             ORDER BY timestamp DESC, id DESC
             LIMIT ?",
        )
        .bind(session_name)
        .bind(before_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    pub async fn message_count(&self, session_name: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages WHERE session_name = ?")
            .bind(session_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("cnt"))
    }

    pub async fn total_messages(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM messages")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("cnt"))
    }

    /// Full-text search over message content, optionally scoped to one
    /// session, with snippet extraction.
    pub async fn search(
        &self,
        query: &str,
        session_name: Option<&str>,
        limit: u32,
    ) -> Result<Vec<SearchHit>> {
        let fts_query = fts_match_query(query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }

        let sql = if session_name.is_some() {
            "SELECT m.id, m.session_name, m.role, m.source, m.timestamp,
                    snippet(messages_fts, 0, '[', ']', '…', 12) AS snip
             FROM messages_fts f
             JOIN messages m ON m.id = f.rowid
             WHERE messages_fts MATCH ? AND m.session_name = ?
             ORDER BY m.timestamp DESC, m.id DESC
             LIMIT ?"
        } else {
            "SELECT m.id, m.session_name, m.role, m.source, m.timestamp,
                    snippet(messages_fts, 0, '[', ']', '…', 12) AS snip
             FROM messages_fts f
             JOIN messages m ON m.id = f.rowid
             WHERE messages_fts MATCH ?
             ORDER BY m.timestamp DESC, m.id DESC
             LIMIT ?"
        };

        let mut q = sqlx::query(sql).bind(&fts_query);
        if let Some(session) = session_name {
            q = q.bind(session);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| SearchHit {
                id: row.get("id"),
                session_name: row.get("session_name"),
                role: MessageRole::from_label(row.get::<String, _>("role").as_str())
                    .unwrap_or(MessageRole::System),
                source: MessageSource::from_label(row.get::<String, _>("source").as_str())
                    .unwrap_or(MessageSource::Hook),
                snippet: row.get("snip"),
                timestamp: parse_ts(row.get::<String, _>("timestamp").as_str()),
            })
            .collect())
    }

    // -- Thread bindings ----------------------------------------------------

    pub async fn binding(&self, platform: PlatformKind, session_name: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT thread_ref FROM thread_bindings WHERE platform = ? AND session_name = ?",
        )
        .bind(platform.as_str())
        .bind(session_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("thread_ref")))
    }

    pub async fn bind_thread(
        &self,
        platform: PlatformKind,
        session_name: &str,
        thread_ref: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO thread_bindings (platform, session_name, thread_ref, bound_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(platform, session_name)
             DO UPDATE SET thread_ref = excluded.thread_ref, bound_at = excluded.bound_at",
        )
        .bind(platform.as_str())
        .bind(session_name)
        .bind(thread_ref)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unbind_thread(&self, platform: PlatformKind, session_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM thread_bindings WHERE platform = ? AND session_name = ?")
            .bind(platform.as_str())
            .bind(session_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn session_for_thread(
        &self,
        platform: PlatformKind,
        thread_ref: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT session_name FROM thread_bindings WHERE platform = ? AND thread_ref = ?",
        )
        .bind(platform.as_str())
        .bind(thread_ref)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("session_name")))
    }

    // -- Preferences / small KV ---------------------------------------------

    pub async fn get_pref(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    pub async fn set_pref(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO preferences (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Writer task
// ---------------------------------------------------------------------------

async fn writer_loop(pool: SqlitePool, mut rx: mpsc::Receiver<AppendRequest>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let deadline = Instant::now() + COMMIT_WINDOW;
        while batch.len() < MAX_BATCH {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(request)) => batch.push(request),
                Ok(None) | Err(_) => break,
            }
        }
        flush_batch(&pool, batch).await;
    }
    tracing::debug!(target = "aily::store", "writer loop stopped");
}

async fn flush_batch(pool: &SqlitePool, batch: Vec<AppendRequest>) {
    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(error) => {
            let message = format!("begin write transaction: {error}");
            for request in batch {
                let _ = request.reply.send(Err(BridgeError::Storage(message.clone())));
            }
            return;
        }
    };

    let mut outcomes = Vec::with_capacity(batch.len());
    let mut failed: Option<String> = None;

    for request in &batch {
        let msg = &request.message;
        if msg.session_name.is_empty() {
            // Flush probe — nothing to store.
            outcomes.push(Ok(AppendOutcome::Duplicate));
            continue;
        }
        let dedup_hash = match &msg.external_id {
            Some(_) => None,
            None => Some(fallback_dedup_hash(msg)),
        };
        let result = sqlx::query(
            "INSERT OR IGNORE INTO messages
             (session_name, role, source, content, author, external_id, dedup_hash, timestamp, ingested_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.session_name)
        .bind(msg.role.as_str())
        .bind(msg.source.as_str())
        .bind(&msg.content)
        .bind(&msg.author)
        .bind(&msg.external_id)
        .bind(&dedup_hash)
        .bind(msg.timestamp.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                outcomes.push(Ok(AppendOutcome::Duplicate));
            }
            Ok(done) => outcomes.push(Ok(AppendOutcome::Inserted(done.last_insert_rowid()))),
            Err(error) => {
                failed = Some(format!("message insert: {error}"));
                break;
            }
        }
    }

    if let Some(message) = failed {
        let _ = tx.rollback().await;
        for request in batch {
            let _ = request.reply.send(Err(BridgeError::Storage(message.clone())));
        }
        return;
    }

    if let Err(error) = tx.commit().await {
        let message = format!("commit write transaction: {error}");
        for request in batch {
            let _ = request.reply.send(Err(BridgeError::Storage(message.clone())));
        }
        return;
    }

    for (request, outcome) in batch.into_iter().zip(outcomes) {
        let _ = request.reply.send(outcome);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fallback dedup key for messages without a platform-assigned id:
/// session, role, source, content fingerprint, one-second bucket. Catches
/// optimistic echoes that arrive twice within the bucket.
fn fallback_dedup_hash(msg: &NewMessage) -> String {
    let mut content_hasher = Sha256::new();
    content_hasher.update(msg.content.as_bytes());
    let content_digest = content_hasher.finalize();

    let bucket = msg.timestamp.timestamp();
    let mut hasher = Sha256::new();
    hasher.update(msg.session_name.as_bytes());
    hasher.update(b"|");
    hasher.update(msg.role.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(msg.source.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(content_digest);
    hasher.update(b"|");
    hasher.update(bucket.to_be_bytes());
    format!("{:x}", hasher.finalize())
}

/// Build an FTS5 MATCH expression from free text: each whitespace token is
/// quoted so user input cannot produce query syntax errors.
fn fts_match_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .filter(|token| token.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn row_to_message(row: &SqliteRow) -> StoredMessage {
    StoredMessage {
        id: row.get("id"),
        session_name: row.get("session_name"),
        role: MessageRole::from_label(row.get::<String, _>("role").as_str())
            .unwrap_or(MessageRole::System),
        source: MessageSource::from_label(row.get::<String, _>("source").as_str())
            .unwrap_or(MessageSource::Hook),
        content: row.get("content"),
        author: row.get("author"),
        external_id: row.get("external_id"),
        timestamp: parse_ts(row.get::<String, _>("timestamp").as_str()),
    }
}

/// Truncate content for wire representations on a UTF-8 boundary, leaving
/// room for the ellipsis.
pub fn cap_for_wire(content: &str) -> String {
    if content.len() <= WIRE_CONTENT_CAP {
        return content.to_string();
    }
    let mut end = WIRE_CONTENT_CAP - 4;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &content[..end])
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use tempfile::TempDir;

    use crate::types::{MessageRole, MessageSource, NewMessage, PlatformKind};

    use super::{cap_for_wire, fts_match_query, AppendOutcome, MessageStore};

    async fn open_store() -> (TempDir, MessageStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = MessageStore::open(&dir.path().join("aily.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn msg(session: &str, content: &str, external_id: Option<&str>) -> NewMessage {
        NewMessage {
            session_name: session.to_string(),
            role: MessageRole::Assistant,
            source: MessageSource::Hook,
            content: content.to_string(),
            author: Some("claude".to_string()),
            external_id: external_id.map(ToOwned::to_owned),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn external_id_dedup_stores_once() {
        let (_dir, store) = open_store().await;

        let first = store.append(msg("s1", "done", Some("x1"))).await.unwrap();
        assert!(matches!(first, AppendOutcome::Inserted(_)));

        let second = store.append(msg("s1", "done again", Some("x1"))).await.unwrap();
        assert_eq!(second, AppendOutcome::Duplicate);

        // Same external id in another session is a different message.
        let other = store.append(msg("s2", "done", Some("x1"))).await.unwrap();
        assert!(matches!(other, AppendOutcome::Inserted(_)));

        assert_eq!(store.message_count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn fallback_hash_suppresses_near_duplicates() {
        let (_dir, store) = open_store().await;
        let ts = Utc::now();

        let mut a = msg("s1", "same words", None);
        a.timestamp = ts;
        let mut b = msg("s1", "same words", None);
        b.timestamp = ts;

        assert!(matches!(store.append(a).await.unwrap(), AppendOutcome::Inserted(_)));
        assert_eq!(store.append(b).await.unwrap(), AppendOutcome::Duplicate);

        // Outside the one-second bucket the same content is kept.
        let mut c = msg("s1", "same words", None);
        c.timestamp = ts + ChronoDuration::seconds(2);
        assert!(matches!(store.append(c).await.unwrap(), AppendOutcome::Inserted(_)));
    }

    #[tokio::test]
    async fn ids_strictly_increase_and_paging_counts() {
        let (_dir, store) = open_store().await;
        for i in 0..5 {
            store
                .append(msg("s1", &format!("message {i}"), Some(&format!("e{i}"))))
                .await
                .unwrap();
        }

        let (page, total) = store.page("s1", 2, 0).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        // Newest first
        assert!(page[0].id > page[1].id);

        let (rest, _) = store.page("s1", 10, 2).await.unwrap();
        assert_eq!(rest.len(), 3);

        let (all, _) = store.page("s1", 10, 0).await.unwrap();
        let ids: Vec<i64> = all.iter().rev().map(|m| m.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(ids, sorted, "ids strictly increasing and unique");
    }

    #[tokio::test]
    async fn cursor_paging_walks_backwards() {
        let (_dir, store) = open_store().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let outcome = store
                .append(msg("s1", &format!("message {i}"), Some(&format!("c{i}"))))
                .await
                .unwrap();
            ids.push(outcome.inserted_id().unwrap());
        }

        let first_page = store.page_before("s1", 2, ids[4]).await.unwrap();
        assert_eq!(first_page.len(), 2);
        assert_eq!(first_page[0].id, ids[3]);
        assert_eq!(first_page[1].id, ids[2]);

        let second_page = store.page_before("s1", 10, first_page[1].id).await.unwrap();
        assert_eq!(second_page.len(), 2);
        assert_eq!(second_page[1].id, ids[0]);

        assert!(store.page_before("s1", 10, ids[0]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_returns_snippets() {
        let (_dir, store) = open_store().await;
        store
            .append(msg("s1", "the refactor of the auth module is finished", Some("a")))
            .await
            .unwrap();
        store
            .append(msg("s2", "unrelated chatter about lunch", Some("b")))
            .await
            .unwrap();

        let hits = store.search("refactor auth", None, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_name, "s1");
        assert!(hits[0].snippet.contains("[refactor]"));

        let scoped = store.search("refactor", Some("s2"), 10).await.unwrap();
        assert!(scoped.is_empty());
    }

    #[tokio::test]
    async fn search_survives_hostile_queries() {
        let (_dir, store) = open_store().await;
        store.append(msg("s1", "hello world", Some("a"))).await.unwrap();
        assert!(store.search("\"unbalanced", None, 10).await.is_ok());
        assert!(store.search("", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn thread_bindings_round_trip() {
        let (_dir, store) = open_store().await;
        store
            .bind_thread(PlatformKind::Discord, "s1", "thread-1")
            .await
            .unwrap();
        assert_eq!(
            store.binding(PlatformKind::Discord, "s1").await.unwrap(),
            Some("thread-1".to_string())
        );
        assert_eq!(
            store
                .session_for_thread(PlatformKind::Discord, "thread-1")
                .await
                .unwrap(),
            Some("s1".to_string())
        );
        assert_eq!(store.binding(PlatformKind::Slack, "s1").await.unwrap(), None);

        // Rebinding replaces
        store
            .bind_thread(PlatformKind::Discord, "s1", "thread-2")
            .await
            .unwrap();
        assert_eq!(
            store.binding(PlatformKind::Discord, "s1").await.unwrap(),
            Some("thread-2".to_string())
        );

        store.unbind_thread(PlatformKind::Discord, "s1").await.unwrap();
        assert_eq!(store.binding(PlatformKind::Discord, "s1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn preferences_round_trip() {
        let (_dir, store) = open_store().await;
        assert_eq!(store.get_pref("ui").await.unwrap(), None);
        store.set_pref("ui", "{\"theme\":\"dark\"}").await.unwrap();
        assert_eq!(
            store.get_pref("ui").await.unwrap(),
            Some("{\"theme\":\"dark\"}".to_string())
        );
        store.set_pref("ui", "{}").await.unwrap();
        assert_eq!(store.get_pref("ui").await.unwrap(), Some("{}".to_string()));
    }

    #[test]
    fn wire_cap_preserves_utf8() {
        let short = "short";
        assert_eq!(cap_for_wire(short), "short");

        let long = "é".repeat(3_000); // 6000 bytes
        let capped = cap_for_wire(&long);
        assert!(capped.len() <= super::WIRE_CONTENT_CAP);
        assert!(capped.ends_with('…'));
        assert!(std::str::from_utf8(capped.as_bytes()).is_ok());
    }

    #[test]
    fn fts_query_quotes_tokens() {
        assert_eq!(fts_match_query("hello world"), "\"hello\" \"world\"");
        assert_eq!(fts_match_query("say \"hi\""), "\"say\" \"hi\"");
        assert_eq!(fts_match_query("  "), "");
    }
}
