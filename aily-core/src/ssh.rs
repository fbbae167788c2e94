//! Host executor: runs tmux commands on SSH hosts.
//!
//! One worker task per host owns that host's command stream. Commands are
//! funneled through a bounded queue (depth 8) and executed sequentially,
//! which keeps the underlying ControlMaster channel single-writer and makes
//! per-host ordering trivial. A transport failure marks the host
//! unreachable, evicts queued operations, and gates retries behind
//! exponential backoff (1 s doubling to a 30 s cap).

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::error::{BridgeError, Result};
use crate::types::is_valid_session_name;

/// Delay between the payload keystrokes and the submit keystroke. Sending
/// both in one batch is read by some agent front-ends as a soft newline
/// instead of submit.
pub const SEND_KEYS_DELAY: Duration = Duration::from_millis(300);

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(8);
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);
const QUEUE_DEPTH: usize = 8;
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Control-key shortcuts that bypass the two-step submit rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    Interrupt,
    Eof,
    Suspend,
    LiteralQ,
    Submit,
    Escape,
}

impl ControlKey {
    pub fn tmux_key(self) -> &'static str {
        match self {
            ControlKey::Interrupt => "C-c",
            ControlKey::Eof => "C-d",
            ControlKey::Suspend => "C-z",
            ControlKey::LiteralQ => "q",
            ControlKey::Submit => "Enter",
            ControlKey::Escape => "Escape",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }
}

/// Session-host contract the router and schedulers depend on. The concrete
/// implementation shells out to `ssh`; tests substitute an in-memory fake.
#[async_trait]
pub trait SessionHost: Send + Sync {
    fn hosts(&self) -> &[String];

    async fn list_sessions(&self, host: &str) -> Result<BTreeSet<String>>;
    async fn has_session(&self, host: &str, name: &str) -> Result<bool>;
    async fn create_session(&self, host: &str, name: &str, dir: Option<&str>) -> Result<()>;
    async fn kill_session(&self, host: &str, name: &str) -> Result<()>;
    /// Inject a text payload; when `submit` is set, follow with a submit
    /// keystroke as a second invocation after [`SEND_KEYS_DELAY`].
    async fn inject(&self, host: &str, name: &str, payload: &str, submit: bool) -> Result<()>;
    async fn send_key(&self, host: &str, name: &str, key: ControlKey) -> Result<()>;
    async fn capture(&self, host: &str, name: &str, lines: u32) -> Result<String>;
    async fn session_cwd(&self, host: &str, name: &str) -> Result<Option<String>>;
    /// Run an arbitrary command on the host. Used by the transcript
    /// scraper for file discovery and tailing.
    async fn run(&self, host: &str, cmd: &str, timeout: Duration) -> Result<CommandOutput>;

    /// Find which host has a live session with this name.
    async fn find_host(&self, name: &str) -> Result<Option<String>> {
        for host in self.hosts() {
            match self.has_session(host, name).await {
                Ok(true) => return Ok(Some(host.clone())),
                Ok(false) => {}
                // An unreachable host cannot veto the others.
                Err(error) if error.is_retryable() => {}
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }
}

enum RequestKind {
    Run { cmd: String, timeout: Duration },
    Inject {
        session: String,
        payload: String,
        submit: bool,
    },
}

struct HostRequest {
    kind: RequestKind,
    reply: oneshot::Sender<Result<CommandOutput>>,
}

pub struct HostExecutor {
    hosts: Vec<String>,
    workers: HashMap<String, mpsc::Sender<HostRequest>>,
}

impl HostExecutor {
    pub fn new(hosts: Vec<String>) -> Self {
        let control_dir = default_control_dir();
        let mut workers = HashMap::new();
        for host in &hosts {
            let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
            tokio::spawn(host_worker(host.clone(), control_dir.clone(), rx));
            workers.insert(host.clone(), tx);
        }
        Self { hosts, workers }
    }

    async fn submit(&self, host: &str, kind: RequestKind) -> Result<CommandOutput> {
        let tx = self
            .workers
            .get(host)
            .ok_or_else(|| BridgeError::InvalidArgument(format!("unknown host '{host}'")))?;
        let (reply, rx) = oneshot::channel();
        tx.send(HostRequest { kind, reply })
            .await
            .map_err(|_| BridgeError::Unreachable(format!("host worker for '{host}' gone")))?;
        rx.await
            .map_err(|_| BridgeError::Unreachable(format!("host worker for '{host}' dropped reply")))?
    }

    async fn run_default(&self, host: &str, cmd: String) -> Result<CommandOutput> {
        self.submit(
            host,
            RequestKind::Run {
                cmd,
                timeout: DEFAULT_OP_TIMEOUT,
            },
        )
        .await
    }

    fn check_name(name: &str) -> Result<()> {
        if is_valid_session_name(name) {
            Ok(())
        } else {
            Err(BridgeError::InvalidArgument(format!(
                "invalid session name '{name}'"
            )))
        }
    }
}

#[async_trait]
impl SessionHost for HostExecutor {
    fn hosts(&self) -> &[String] {
        &self.hosts
    }

    async fn list_sessions(&self, host: &str) -> Result<BTreeSet<String>> {
        // `|| true` makes an empty host (no tmux server) an empty set
        // rather than a failure.
        let out = self
            .run_default(host, list_sessions_cmd().to_string())
            .await?;
        if !out.ok() {
            return Err(BridgeError::Protocol(format!(
                "tmux list-sessions exited {} on '{host}'",
                out.status
            )));
        }
        Ok(parse_session_list(&out.stdout))
    }

    async fn has_session(&self, host: &str, name: &str) -> Result<bool> {
        Self::check_name(name)?;
        let out = self.run_default(host, has_session_cmd(name)).await?;
        Ok(out.ok() && out.stdout.contains("found"))
    }

    async fn create_session(&self, host: &str, name: &str, dir: Option<&str>) -> Result<()> {
        Self::check_name(name)?;
        let out = self.run_default(host, create_session_cmd(name, dir)).await?;
        if out.ok() {
            tracing::info!(target = "aily::ssh", host = %host, session = %name, "created tmux session");
            return Ok(());
        }
        if out.stdout.contains("duplicate session") {
            return Err(BridgeError::Duplicate);
        }
        Err(BridgeError::Protocol(format!(
            "tmux new-session exited {}: {}",
            out.status,
            out.stdout.trim()
        )))
    }

    async fn kill_session(&self, host: &str, name: &str) -> Result<()> {
        Self::check_name(name)?;
        let out = self.run_default(host, kill_session_cmd(name)).await?;
        if out.ok() {
            tracing::info!(target = "aily::ssh", host = %host, session = %name, "killed tmux session");
            return Ok(());
        }
        if out.stdout.contains("can't find session") {
            return Err(BridgeError::NotFound(format!("session '{name}' on '{host}'")));
        }
        Err(BridgeError::Protocol(format!(
            "tmux kill-session exited {}: {}",
            out.status,
            out.stdout.trim()
        )))
    }

    async fn inject(&self, host: &str, name: &str, payload: &str, submit: bool) -> Result<()> {
        Self::check_name(name)?;
        let out = self
            .submit(
                host,
                RequestKind::Inject {
                    session: name.to_string(),
                    payload: payload.to_string(),
                    submit,
                },
            )
            .await?;
        if out.ok() {
            Ok(())
        } else if out.stdout.contains("can't find session") {
            Err(BridgeError::NotFound(format!("session '{name}' on '{host}'")))
        } else {
            Err(BridgeError::Protocol(format!(
                "tmux send-keys exited {}: {}",
                out.status,
                out.stdout.trim()
            )))
        }
    }

    async fn send_key(&self, host: &str, name: &str, key: ControlKey) -> Result<()> {
        Self::check_name(name)?;
        let out = self.run_default(host, send_key_cmd(name, key)).await?;
        if out.ok() {
            Ok(())
        } else if out.stdout.contains("can't find session") {
            Err(BridgeError::NotFound(format!("session '{name}' on '{host}'")))
        } else {
            Err(BridgeError::Protocol(format!(
                "tmux send-keys exited {}: {}",
                out.status,
                out.stdout.trim()
            )))
        }
    }

    async fn capture(&self, host: &str, name: &str, lines: u32) -> Result<String> {
        Self::check_name(name)?;
        if lines == 0 {
            return Ok(String::new());
        }
        let out = self.run_default(host, capture_cmd(name, lines)).await?;
        if out.ok() {
            Ok(out.stdout)
        } else if out.stdout.contains("can't find") {
            Err(BridgeError::NotFound(format!("session '{name}' on '{host}'")))
        } else {
            Err(BridgeError::Protocol(format!(
                "tmux capture-pane exited {}",
                out.status
            )))
        }
    }

    async fn session_cwd(&self, host: &str, name: &str) -> Result<Option<String>> {
        Self::check_name(name)?;
        let out = self.run_default(host, session_cwd_cmd(name)).await?;
        if out.ok() && !out.stdout.trim().is_empty() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    async fn run(&self, host: &str, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        self.submit(
            host,
            RequestKind::Run {
                cmd: cmd.to_string(),
                timeout,
            },
        )
        .await
    }

    async fn find_host(&self, name: &str) -> Result<Option<String>> {
        Self::check_name(name)?;
        let checks = self.hosts.iter().map(|host| {
            let host = host.clone();
            async move {
                match self.has_session(&host, name).await {
                    Ok(true) => Some(host),
                    _ => None,
                }
            }
        });
        Ok(futures::future::join_all(checks)
            .await
            .into_iter()
            .flatten()
            .next())
    }
}

// ---------------------------------------------------------------------------
// Command construction
// ---------------------------------------------------------------------------

fn quoted(value: &str) -> String {
    shell_words::quote(value).into_owned()
}

fn list_sessions_cmd() -> &'static str {
    "tmux list-sessions -F '#{session_name}' 2>/dev/null || true"
}

fn has_session_cmd(name: &str) -> String {
    format!("tmux has-session -t {} 2>/dev/null && echo found", quoted(name))
}

fn create_session_cmd(name: &str, dir: Option<&str>) -> String {
    let mut cmd = format!("tmux new-session -d -s {}", quoted(name));
    if let Some(dir) = dir {
        cmd.push_str(&format!(" -c {}", quoted(dir)));
    }
    cmd.push_str(" 2>&1");
    cmd
}

fn kill_session_cmd(name: &str) -> String {
    format!("tmux kill-session -t {} 2>&1", quoted(name))
}

fn inject_payload_cmd(name: &str, payload: &str) -> String {
    format!("tmux send-keys -t {} -l {} 2>&1", quoted(name), quoted(payload))
}

fn send_key_cmd(name: &str, key: ControlKey) -> String {
    format!("tmux send-keys -t {} {} 2>&1", quoted(name), key.tmux_key())
}

fn capture_cmd(name: &str, lines: u32) -> String {
    format!("tmux capture-pane -p -t {} -S -{lines} 2>&1", quoted(name))
}

fn session_cwd_cmd(name: &str) -> String {
    format!(
        "tmux display-message -t {} -p '#{{pane_current_path}}' 2>/dev/null",
        quoted(name)
    )
}

fn parse_session_list(raw: &str) -> BTreeSet<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn default_control_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".ssh")
        .join("aily-ctl")
}

fn ssh_control_args(control_dir: &std::path::Path) -> Vec<String> {
    vec![
        "-o".into(),
        "ControlMaster=auto".into(),
        "-o".into(),
        format!("ControlPath={}/%r@%h:%p", control_dir.display()),
        "-o".into(),
        "ControlPersist=300".into(),
        "-o".into(),
        "ConnectTimeout=5".into(),
        "-o".into(),
        "StrictHostKeyChecking=accept-new".into(),
        "-o".into(),
        "BatchMode=yes".into(),
    ]
}

fn backoff_delay(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct WorkerState {
    host: String,
    control_dir: PathBuf,
    retry_at: Option<Instant>,
    attempt: u32,
}

impl WorkerState {
    fn gate(&self) -> Option<BridgeError> {
        match self.retry_at {
            Some(at) if Instant::now() < at => Some(BridgeError::Unreachable(format!(
                "host '{}' unreachable, retrying later",
                self.host
            ))),
            _ => None,
        }
    }

    fn on_success(&mut self) {
        if self.attempt > 0 {
            tracing::info!(target = "aily::ssh", host = %self.host, "host reachable again");
        }
        self.attempt = 0;
        self.retry_at = None;
    }

    fn on_transport_failure(&mut self, error: &BridgeError) {
        self.attempt += 1;
        let delay = backoff_delay(self.attempt);
        self.retry_at = Some(Instant::now() + delay);
        tracing::warn!(
            target = "aily::ssh",
            host = %self.host,
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "marking host unreachable"
        );
    }

    async fn exec(&mut self, cmd: &str, timeout: Duration) -> Result<CommandOutput> {
        if let Some(error) = self.gate() {
            return Err(error);
        }
        match run_ssh_once(&self.host, &self.control_dir, cmd, timeout).await {
            Ok(out) => {
                self.on_success();
                Ok(out)
            }
            Err(error) => {
                if matches!(error, BridgeError::Unreachable(_)) {
                    self.on_transport_failure(&error);
                }
                Err(error)
            }
        }
    }
}

async fn host_worker(host: String, control_dir: PathBuf, mut rx: mpsc::Receiver<HostRequest>) {
    if let Err(error) = ensure_control_dir(&control_dir) {
        tracing::warn!(target = "aily::ssh", error = %error, "failed to create ssh control dir");
    }

    let mut state = WorkerState {
        host,
        control_dir,
        retry_at: None,
        attempt: 0,
    };
    let mut health = tokio::time::interval(HEALTH_INTERVAL);
    health.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so startup is not serialized
    // behind a health probe.
    health.tick().await;

    loop {
        tokio::select! {
            request = rx.recv() => {
                let Some(HostRequest { kind, reply }) = request else { break };
                let result = match kind {
                    RequestKind::Run { cmd, timeout } => state.exec(&cmd, timeout).await,
                    RequestKind::Inject { session, payload, submit } => {
                        run_inject(&mut state, &session, &payload, submit).await
                    }
                };
                let evict = result.as_ref().is_err_and(|e| matches!(e, BridgeError::Unreachable(_)));
                let _ = reply.send(result);
                if evict {
                    evict_pending(&state.host, &mut rx);
                }
            }
            _ = health.tick() => {
                if state.gate().is_none() {
                    if let Err(error) = state.exec("true", DEFAULT_OP_TIMEOUT).await {
                        tracing::debug!(target = "aily::ssh", host = %state.host, error = %error, "health probe failed");
                    }
                }
            }
        }
    }
}

async fn run_inject(
    state: &mut WorkerState,
    session: &str,
    payload: &str,
    submit: bool,
) -> Result<CommandOutput> {
    let first = state
        .exec(&inject_payload_cmd(session, payload), DEFAULT_OP_TIMEOUT)
        .await?;
    if !first.ok() || !submit {
        return Ok(first);
    }
    tokio::time::sleep(SEND_KEYS_DELAY).await;
    state
        .exec(&send_key_cmd(session, ControlKey::Submit), DEFAULT_OP_TIMEOUT)
        .await
}

fn evict_pending(host: &str, rx: &mut mpsc::Receiver<HostRequest>) {
    while let Ok(request) = rx.try_recv() {
        let _ = request.reply.send(Err(BridgeError::Unreachable(format!(
            "host '{host}' unreachable, queued operation evicted"
        ))));
    }
}

fn ensure_control_dir(dir: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

async fn run_ssh_once(
    host: &str,
    control_dir: &std::path::Path,
    cmd: &str,
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut command = Command::new("ssh");
    command.args(ssh_control_args(control_dir));
    command.arg(host).arg(cmd);
    command.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| BridgeError::Cancelled(format!("ssh to '{host}' timed out after {timeout:?}")))?
        .map_err(|e| BridgeError::Unreachable(format!("failed to spawn ssh for '{host}': {e}")))?;

    let status = output.status.code().unwrap_or(-1);
    // ssh itself exits 255 on connection/handshake failure; remote command
    // statuses pass through unchanged.
    if status == 255 {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BridgeError::Unreachable(format!(
            "ssh to '{host}' failed: {}",
            stderr.trim()
        )));
    }

    Ok(CommandOutput {
        status,
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
    })
}
