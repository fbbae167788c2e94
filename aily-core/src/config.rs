//! Runtime configuration.
//!
//! Environment variables win; a `.notify-env` file (the same `KEY=value`
//! format the shell hooks consume, named by `AGENT_BRIDGE_ENV`) fills in
//! anything the environment leaves unset.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};
use crate::types::PlatformKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCleanup {
    Archive,
    Delete,
}

impl ThreadCleanup {
    fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "archive" => Some(ThreadCleanup::Archive),
            "delete" => Some(ThreadCleanup::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_host: String,
    pub bind_port: u16,

    // Storage
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_interval_hours: u64,
    pub backup_retain_days: u64,

    // SSH
    pub ssh_hosts: Vec<String>,

    // Platforms
    pub platforms: Vec<PlatformKind>,
    pub discord_bot_token: String,
    pub discord_channel_id: String,
    pub slack_bot_token: String,
    pub slack_app_token: String,
    pub slack_channel_id: String,

    // Behaviour
    pub thread_cleanup: ThreadCleanup,
    pub tmux_thread_sync: bool,
    pub notify_max_retries: u32,

    // Auth
    pub dashboard_token: String,

    // Scheduler tuning
    pub poll_interval_ms: u64,
    pub scrape_interval_ms: u64,
    pub idle_after_sec: u64,
    pub orphan_retain_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 8080,
            db_path: PathBuf::from("data/aily.db"),
            backup_dir: PathBuf::from("backups"),
            backup_interval_hours: 6,
            backup_retain_days: 7,
            ssh_hosts: vec!["localhost".to_string()],
            platforms: Vec::new(),
            discord_bot_token: String::new(),
            discord_channel_id: String::new(),
            slack_bot_token: String::new(),
            slack_app_token: String::new(),
            slack_channel_id: String::new(),
            thread_cleanup: ThreadCleanup::Archive,
            tmux_thread_sync: true,
            notify_max_retries: 2,
            dashboard_token: String::new(),
            poll_interval_ms: 10_000,
            scrape_interval_ms: 3_000,
            idle_after_sec: 900,
            orphan_retain_hours: 24,
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to a
    /// `.notify-env` file when `AGENT_BRIDGE_ENV` points at one.
    pub fn from_env() -> Result<Self> {
        let mut file_env = HashMap::new();
        if let Ok(path) = std::env::var("AGENT_BRIDGE_ENV") {
            if !path.trim().is_empty() && Path::new(&path).exists() {
                file_env = load_env_file(Path::new(&path))?;
                tracing::info!(target = "aily::config", file = %path, "loaded .notify-env fallback");
            }
        }

        let get = |key: &str| -> Option<String> {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or_else(|| file_env.get(key).cloned())
        };

        let mut cfg = Config::default();

        if let Some(host) = get("DASHBOARD_HOST") {
            cfg.bind_host = host;
        }
        if let Some(port) = get("DASHBOARD_PORT") {
            cfg.bind_port = parse_num(&port, "DASHBOARD_PORT")?;
        }
        if let Some(path) = get("DASHBOARD_DB_PATH") {
            cfg.db_path = PathBuf::from(path);
        }
        if let Some(dir) = get("DASHBOARD_BACKUP_DIR") {
            cfg.backup_dir = PathBuf::from(dir);
        }

        if let Some(hosts) = get("SSH_HOSTS") {
            let parsed = split_csv(&hosts);
            if !parsed.is_empty() {
                cfg.ssh_hosts = parsed;
            }
        }

        cfg.discord_bot_token = get("DISCORD_BOT_TOKEN").unwrap_or_default();
        cfg.discord_channel_id = get("DISCORD_CHANNEL_ID").unwrap_or_default();
        cfg.slack_bot_token = get("SLACK_BOT_TOKEN").unwrap_or_default();
        cfg.slack_app_token = get("SLACK_APP_TOKEN").unwrap_or_default();
        cfg.slack_channel_id = get("SLACK_CHANNEL_ID").unwrap_or_default();

        cfg.platforms = match get("PLATFORMS") {
            Some(raw) => {
                let mut platforms = Vec::new();
                for label in split_csv(&raw) {
                    let platform = PlatformKind::from_label(&label).ok_or_else(|| {
                        BridgeError::InvalidArgument(format!("unknown platform '{label}' in PLATFORMS"))
                    })?;
                    if !platforms.contains(&platform) {
                        platforms.push(platform);
                    }
                }
                platforms
            }
            // Default: every platform whose credentials are present.
            None => {
                let mut platforms = Vec::new();
                if !cfg.discord_bot_token.is_empty() && !cfg.discord_channel_id.is_empty() {
                    platforms.push(PlatformKind::Discord);
                }
                if !cfg.slack_bot_token.is_empty()
                    && !cfg.slack_app_token.is_empty()
                    && !cfg.slack_channel_id.is_empty()
                {
                    platforms.push(PlatformKind::Slack);
                }
                platforms
            }
        };

        if let Some(policy) = get("THREAD_CLEANUP") {
            cfg.thread_cleanup = ThreadCleanup::from_label(&policy).ok_or_else(|| {
                BridgeError::InvalidArgument(format!(
                    "THREAD_CLEANUP must be 'archive' or 'delete', got '{policy}'"
                ))
            })?;
        }
        if let Some(raw) = get("TMUX_THREAD_SYNC") {
            cfg.tmux_thread_sync = raw.trim().to_ascii_lowercase() != "false";
        }
        if let Some(raw) = get("NOTIFY_MAX_RETRIES") {
            cfg.notify_max_retries = parse_num(&raw, "NOTIFY_MAX_RETRIES")?;
        }

        cfg.dashboard_token = get("DASHBOARD_TOKEN")
            .or_else(|| file_env.get("AILY_AUTH_TOKEN").cloned())
            .unwrap_or_default();

        if let Some(raw) = get("POLL_INTERVAL_MS") {
            cfg.poll_interval_ms = parse_num(&raw, "POLL_INTERVAL_MS")?;
        }
        if let Some(raw) = get("SCRAPE_INTERVAL_MS") {
            cfg.scrape_interval_ms = parse_num(&raw, "SCRAPE_INTERVAL_MS")?;
        }
        if let Some(raw) = get("IDLE_AFTER_SEC") {
            cfg.idle_after_sec = parse_num(&raw, "IDLE_AFTER_SEC")?;
        }
        if let Some(raw) = get("ORPHAN_RETAIN_HOURS") {
            cfg.orphan_retain_hours = parse_num(&raw, "ORPHAN_RETAIN_HOURS")?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations that name a platform without its credentials.
    pub fn validate(&self) -> Result<()> {
        if self.ssh_hosts.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "SSH_HOSTS must name at least one host".into(),
            ));
        }
        for platform in &self.platforms {
            match platform {
                PlatformKind::Discord => {
                    if self.discord_bot_token.is_empty() || self.discord_channel_id.is_empty() {
                        return Err(BridgeError::InvalidArgument(
                            "discord enabled but DISCORD_BOT_TOKEN/DISCORD_CHANNEL_ID unset".into(),
                        ));
                    }
                }
                PlatformKind::Slack => {
                    if self.slack_bot_token.is_empty()
                        || self.slack_app_token.is_empty()
                        || self.slack_channel_id.is_empty()
                    {
                        return Err(BridgeError::InvalidArgument(
                            "slack enabled but SLACK_BOT_TOKEN/SLACK_APP_TOKEN/SLACK_CHANNEL_ID unset"
                                .into(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn default_host(&self) -> &str {
        self.ssh_hosts.first().map(String::as_str).unwrap_or("localhost")
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| BridgeError::InvalidArgument(format!("invalid {key}: '{raw}'")))
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// Parse a `.notify-env` file: `KEY=value` lines, `#` comments, values
/// optionally quoted.
fn load_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let body = std::fs::read_to_string(path)?;
    let mut env = HashMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            env.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::types::PlatformKind;

    use super::{load_env_file, split_csv, Config, ThreadCleanup};

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.bind_port, 8080);
        assert_eq!(cfg.poll_interval_ms, 10_000);
        assert_eq!(cfg.scrape_interval_ms, 3_000);
        assert_eq!(cfg.idle_after_sec, 900);
        assert_eq!(cfg.orphan_retain_hours, 24);
        assert_eq!(cfg.notify_max_retries, 2);
        assert_eq!(cfg.thread_cleanup, ThreadCleanup::Archive);
        assert!(cfg.tmux_thread_sync);
        assert_eq!(cfg.ssh_hosts, vec!["localhost".to_string()]);
    }

    #[test]
    fn csv_splitting_ignores_blanks() {
        assert_eq!(split_csv("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_csv(" , ").is_empty());
    }

    #[test]
    fn env_file_parsing_strips_quotes_and_comments() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "# comment").unwrap();
        writeln!(file, "DISCORD_BOT_TOKEN=\"tok_abc\"").unwrap();
        writeln!(file, "SSH_HOSTS='dev-box,build-box'").unwrap();
        writeln!(file, "not a kv line").unwrap();

        let env = load_env_file(file.path()).expect("parse");
        assert_eq!(env.get("DISCORD_BOT_TOKEN").map(String::as_str), Some("tok_abc"));
        assert_eq!(env.get("SSH_HOSTS").map(String::as_str), Some("dev-box,build-box"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn validate_rejects_platform_without_credentials() {
        let cfg = Config {
            platforms: vec![PlatformKind::Discord],
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            platforms: vec![PlatformKind::Discord],
            discord_bot_token: "tok".into(),
            discord_channel_id: "123".into(),
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
