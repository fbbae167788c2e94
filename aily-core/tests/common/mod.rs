//! Shared fakes for the pipeline tests: an in-memory session host that
//! records keystrokes and a platform adapter that records threads and
//! posts.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

use aily_core::adapter::{NameLocks, PlatformAdapter};
use aily_core::bus::EventBus;
use aily_core::config::Config;
use aily_core::error::{BridgeError, Result};
use aily_core::registry::SessionRegistry;
use aily_core::router::Router;
use aily_core::ssh::{CommandOutput, ControlKey, SessionHost};
use aily_core::store::MessageStore;
use aily_core::types::{PlatformInbound, PlatformKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectCall {
    pub host: String,
    pub session: String,
    pub payload: String,
    pub submit: bool,
}

#[derive(Default)]
pub struct RecordingHost {
    hosts: Vec<String>,
    pub live: Mutex<BTreeSet<String>>,
    pub injects: Mutex<Vec<InjectCall>>,
    pub keys: Mutex<Vec<(String, ControlKey)>>,
    pub created: Mutex<Vec<String>>,
    pub killed: Mutex<Vec<String>>,
    /// When set, inject fails with this error kind: "unreachable",
    /// "protocol" or "not_found".
    pub inject_failure: Mutex<Option<&'static str>>,
}

impl RecordingHost {
    pub fn new(hosts: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        })
    }

    pub fn add_live(&self, name: &str) {
        self.live.lock().insert(name.to_string());
    }
}

#[async_trait]
impl SessionHost for RecordingHost {
    fn hosts(&self) -> &[String] {
        &self.hosts
    }

    async fn list_sessions(&self, _host: &str) -> Result<BTreeSet<String>> {
        Ok(self.live.lock().clone())
    }

    async fn has_session(&self, _host: &str, name: &str) -> Result<bool> {
        Ok(self.live.lock().contains(name))
    }

    async fn create_session(&self, _host: &str, name: &str, _dir: Option<&str>) -> Result<()> {
        if !self.live.lock().insert(name.to_string()) {
            return Err(BridgeError::Duplicate);
        }
        self.created.lock().push(name.to_string());
        Ok(())
    }

    async fn kill_session(&self, _host: &str, name: &str) -> Result<()> {
        if !self.live.lock().remove(name) {
            return Err(BridgeError::NotFound(format!("session '{name}'")));
        }
        self.killed.lock().push(name.to_string());
        Ok(())
    }

    async fn inject(&self, host: &str, name: &str, payload: &str, submit: bool) -> Result<()> {
        if let Some(kind) = *self.inject_failure.lock() {
            return Err(match kind {
                "unreachable" => BridgeError::Unreachable(format!("host '{host}' down")),
                "not_found" => BridgeError::NotFound(format!("session '{name}'")),
                _ => BridgeError::Protocol("send-keys exited 1".into()),
            });
        }
        self.injects.lock().push(InjectCall {
            host: host.to_string(),
            session: name.to_string(),
            payload: payload.to_string(),
            submit,
        });
        Ok(())
    }

    async fn send_key(&self, _host: &str, name: &str, key: ControlKey) -> Result<()> {
        self.keys.lock().push((name.to_string(), key));
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

#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub target: String,
    pub text: String,
    pub raw: bool,
}

pub struct FakeAdapter {
    kind: PlatformKind,
    pub threads: Mutex<HashMap<String, String>>,
    pub posts: Mutex<Vec<RecordedPost>>,
    pub archived: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub creations: AtomicUsize,
    next_id: AtomicUsize,
    locks: NameLocks,
}

impl FakeAdapter {
    pub fn new(kind: PlatformKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            threads: Mutex::new(HashMap::new()),
            posts: Mutex::new(Vec::new()),
            archived: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            creations: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            locks: NameLocks::new(),
        })
    }

    pub fn preload_thread(&self, session: &str, thread_ref: &str) {
        self.threads
            .lock()
            .insert(session.to_string(), thread_ref.to_string());
    }

    pub fn posts_to(&self, target: &str) -> Vec<RecordedPost> {
        self.posts
            .lock()
            .iter()
            .filter(|p| p.target == target)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PlatformAdapter for FakeAdapter {
    fn kind(&self) -> PlatformKind {
        self.kind
    }

    async fn connect(&self, _inbound: mpsc::Sender<PlatformInbound>) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn ensure_thread(&self, session_name: &str, _starter_text: &str) -> Result<String> {
        let _guard = self.locks.acquire(session_name).await;
        if let Some(existing) = self.threads.lock().get(session_name).cloned() {
            return Ok(existing);
        }
        // Window in which a concurrent caller without the lock would
        // double-create.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let id = format!(
            "{}-thread-{}",
            self.kind.as_str(),
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        self.threads
            .lock()
            .insert(session_name.to_string(), id.clone());
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn find_thread(&self, session_name: &str) -> Result<Option<String>> {
        Ok(self.threads.lock().get(session_name).cloned())
    }

    async fn thread_session(&self, thread_ref: &str) -> Result<Option<String>> {
        Ok(self
            .threads
            .lock()
            .iter()
            .find(|(_, thread)| thread.as_str() == thread_ref)
            .map(|(session, _)| session.clone()))
    }

    async fn post(&self, thread_ref: &str, text: &str, raw: bool) -> Result<String> {
        self.posts.lock().push(RecordedPost {
            target: thread_ref.to_string(),
            text: text.to_string(),
            raw,
        });
        Ok(format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn post_root(&self, text: &str) -> Result<String> {
        self.posts.lock().push(RecordedPost {
            target: "root".to_string(),
            text: text.to_string(),
            raw: true,
        });
        Ok(format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    async fn archive(&self, thread_ref: &str) -> Result<()> {
        self.archived.lock().push(thread_ref.to_string());
        Ok(())
    }

    async fn delete(&self, thread_ref: &str) -> Result<()> {
        self.deleted.lock().push(thread_ref.to_string());
        Ok(())
    }
}

pub struct Harness {
    pub _dir: TempDir,
    pub store: MessageStore,
    pub bus: EventBus,
    pub registry: Arc<SessionRegistry>,
    pub host: Arc<RecordingHost>,
    pub adapters: Vec<Arc<FakeAdapter>>,
    pub router: Arc<Router>,
}

pub async fn harness(hosts: &[&str], platforms: &[PlatformKind]) -> Harness {
    let dir = TempDir::new().expect("tempdir");
    let store = MessageStore::open(&dir.path().join("aily.db"))
        .await
        .expect("store");
    let bus = EventBus::new();
    let registry = Arc::new(SessionRegistry::new(store.pool().clone(), bus.clone()));
    let host = RecordingHost::new(hosts);
    let adapters: Vec<Arc<FakeAdapter>> = platforms.iter().map(|p| FakeAdapter::new(*p)).collect();

    let config = Config {
        ssh_hosts: hosts.iter().map(|h| h.to_string()).collect(),
        platforms: platforms.to_vec(),
        ..Config::default()
    };

    let dyn_adapters: Vec<Arc<dyn PlatformAdapter>> = adapters
        .iter()
        .map(|a| a.clone() as Arc<dyn PlatformAdapter>)
        .collect();
    let router = Arc::new(Router::new(
        registry.clone(),
        store.clone(),
        bus.clone(),
        host.clone() as Arc<dyn SessionHost>,
        dyn_adapters,
        config,
    ));

    Harness {
        _dir: dir,
        store,
        bus,
        registry,
        host,
        adapters,
        router,
    }
}
