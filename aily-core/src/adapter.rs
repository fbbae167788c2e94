//! The contract every chat platform adapter implements, plus the helpers
//! they share: message-size capping, reconnect backoff, and the per-name
//! locks that serialise concurrent `ensure_thread` calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{PlatformInbound, PlatformKind};

/// Reconnect backoff: 1 s base doubling to a 30 s cap, 20% jitter.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = 1_000u64
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(30_000);
    let jitter_cap = base_ms / 5;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    Duration::from_millis(base_ms + jitter)
}

/// Cap `text` to a platform's message-size ceiling: at most `ceiling - 4`
/// bytes of content plus a trailing ellipsis, cut on a UTF-8 boundary.
pub fn cap_message(text: &str, ceiling: usize) -> String {
    if text.len() <= ceiling {
        return text.to_string();
    }
    let mut end = ceiling.saturating_sub(4);
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// One mutex per session name, created on demand. Keeps a second
/// `ensure_thread` for the same name waiting until the first finishes, so
/// N concurrent calls create exactly one thread.
#[derive(Default)]
pub struct NameLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NameLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, name: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// A chat platform the router can post to and receive from.
///
/// Implementations own all platform wire state; the router never touches
/// the Discord/Slack APIs directly.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Validate credentials and start the gateway task. Inbound
    /// user-authored messages are delivered on `inbound`; the task
    /// reconnects with backoff until `disconnect` is called.
    async fn connect(&self, inbound: mpsc::Sender<PlatformInbound>) -> Result<()>;

    async fn disconnect(&self);

    /// Find or create the thread named `[agent] <session_name>`, reopening
    /// it when archived. Concurrent calls for one name serialise; the
    /// second observes the thread the first created.
    async fn ensure_thread(&self, session_name: &str, starter_text: &str) -> Result<String>;

    /// Look up an existing thread without creating one.
    async fn find_thread(&self, session_name: &str) -> Result<Option<String>>;

    /// Resolve a thread ref back to a session name by probing the thread's
    /// title/parent. Used when no binding exists yet.
    async fn thread_session(&self, thread_ref: &str) -> Result<Option<String>>;

    /// Post into a thread. `raw` suppresses the standard task-complete
    /// formatting. Returns the platform-assigned message id.
    async fn post(&self, thread_ref: &str, text: &str, raw: bool) -> Result<String>;

    /// Post to the root channel (command replies, announcements).
    async fn post_root(&self, text: &str) -> Result<String>;

    async fn archive(&self, thread_ref: &str) -> Result<()>;

    async fn delete(&self, thread_ref: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{cap_message, reconnect_delay, NameLocks};

    #[test]
    fn backoff_bounds_with_jitter() {
        let d1 = reconnect_delay(1);
        assert!(d1 >= Duration::from_millis(1_000));
        assert!(d1 <= Duration::from_millis(1_200));

        let d10 = reconnect_delay(10);
        assert!(d10 >= Duration::from_millis(30_000));
        assert!(d10 <= Duration::from_millis(36_000));
    }

    #[test]
    fn cap_message_is_utf8_safe() {
        assert_eq!(cap_message("short", 2_000), "short");

        let long = "x".repeat(2_500);
        let capped = cap_message(&long, 2_000);
        assert!(capped.len() <= 2_000);
        assert!(capped.ends_with('…'));

        let emoji = "🎉".repeat(600); // 2400 bytes
        let capped = cap_message(&emoji, 2_000);
        assert!(std::str::from_utf8(capped.as_bytes()).is_ok());
        assert!(capped.ends_with('…'));
    }

    #[tokio::test]
    async fn name_locks_serialise_same_name() {
        let locks = Arc::new(NameLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("same").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn name_locks_do_not_block_other_names() {
        let locks = NameLocks::new();
        let _a = locks.acquire("a").await;
        // Must not deadlock.
        let _b = locks.acquire("b").await;
    }
}
