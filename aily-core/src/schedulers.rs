//! Periodic background jobs: host polling, transcript scraping, idle
//! sweeping, orphan reaping, heartbeats, snapshots.
//!
//! Every job ticks on an interval with skipped missed ticks and reports
//! into a per-component health counter; three consecutive failures
//! escalate to the bus as `component.degraded`, and the next success
//! publishes a recovery.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bus::{BusEvent, EventBus, EventKind};
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::registry::{SessionFilter, SessionRegistry};
use crate::router::Router;
use crate::scrape::TranscriptScraper;
use crate::snapshot;
use crate::ssh::SessionHost;
use crate::types::{SessionEvent, SessionStatus};

const DEGRADE_THRESHOLD: u32 = 3;
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const ORPHAN_REAP_INTERVAL: Duration = Duration::from_secs(300);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Consecutive-failure tracking for one background component.
pub struct ComponentHealth {
    name: &'static str,
    bus: EventBus,
    consecutive_failures: u32,
    degraded: bool,
}

impl ComponentHealth {
    pub fn new(name: &'static str, bus: EventBus) -> Self {
        Self {
            name,
            bus,
            consecutive_failures: 0,
            degraded: false,
        }
    }

    pub fn record(&mut self, result: &Result<()>) {
        match result {
            Ok(()) => {
                if self.degraded {
                    self.bus.publish(BusEvent::new(
                        EventKind::ConnectionStatus,
                        None,
                        json!({ "component": self.name, "status": "recovered" }),
                    ));
                }
                self.consecutive_failures = 0;
                self.degraded = false;
            }
            Err(error) => {
                self.consecutive_failures += 1;
                tracing::warn!(
                    target = "aily::sched",
                    component = self.name,
                    failures = self.consecutive_failures,
                    error = %error,
                    "scheduler pass failed"
                );
                if self.consecutive_failures == DEGRADE_THRESHOLD {
                    self.degraded = true;
                    self.bus.publish(BusEvent::new(
                        EventKind::ComponentDegraded,
                        None,
                        json!({
                            "component": self.name,
                            "consecutive_failures": self.consecutive_failures,
                        }),
                    ));
                }
            }
        }
    }

    #[cfg(test)]
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

pub struct SchedulerContext {
    pub router: Arc<Router>,
    pub registry: Arc<SessionRegistry>,
    pub executor: Arc<dyn SessionHost>,
    pub scraper: Arc<TranscriptScraper>,
    pub bus: EventBus,
    pub config: Config,
}

/// Spawn every periodic job. The returned handles are aborted at
/// shutdown.
pub fn spawn_all(ctx: Arc<SchedulerContext>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for host in ctx.config.ssh_hosts.clone() {
        handles.push(tokio::spawn(host_poller(ctx.clone(), host)));
    }
    handles.push(tokio::spawn(transcript_scraper(ctx.clone())));
    handles.push(tokio::spawn(idle_sweeper(ctx.clone())));
    handles.push(tokio::spawn(orphan_reaper(ctx.clone())));
    handles.push(tokio::spawn(heartbeat(ctx.clone())));
    handles.push(tokio::spawn(snapshotter(ctx)));
    handles
}

async fn host_poller(ctx: Arc<SchedulerContext>, host: String) {
    let mut tick = tokio::time::interval(Duration::from_millis(ctx.config.poll_interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut health = ComponentHealth::new("host_poller", ctx.bus.clone());

    loop {
        tick.tick().await;
        let result = poll_host_once(&ctx, &host).await;
        health.record(&result);
    }
}

async fn poll_host_once(ctx: &SchedulerContext, host: &str) -> Result<()> {
    let live = match ctx.executor.list_sessions(host).await {
        Ok(live) => live,
        Err(BridgeError::Unreachable(reason)) => {
            // Everything attributed to this host goes unreachable until
            // the host is seen again.
            for name in ctx.registry.sessions_on_host(host) {
                let _ = ctx.registry.transition(&name, SessionEvent::HostDown).await;
            }
            return Err(BridgeError::Unreachable(reason));
        }
        Err(error) => return Err(error),
    };

    for name in &live {
        let known = ctx.registry.contains(name);
        let (_, created) = ctx.registry.observe_live(name, host).await?;
        if created || !known {
            tracing::info!(target = "aily::sched", session = %name, host = %host, "discovered session");
            if let Ok(Some(cwd)) = ctx.executor.session_cwd(host, name).await {
                let _ = ctx.registry.set_working_dir(name, &cwd).await;
            }
            if ctx.config.tmux_thread_sync {
                ctx.router.sync_thread_bindings(name).await;
            }
        }
    }

    for name in ctx.registry.sessions_on_host(host) {
        if !live.contains(&name) {
            let _ = ctx.registry.transition(&name, SessionEvent::SshMissing).await;
        }
    }
    Ok(())
}

async fn transcript_scraper(ctx: Arc<SchedulerContext>) {
    let mut tick = tokio::time::interval(Duration::from_millis(ctx.config.scrape_interval_ms));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut health = ComponentHealth::new("transcript_scraper", ctx.bus.clone());

    loop {
        tick.tick().await;
        let result = scrape_pass(&ctx).await;
        health.record(&result);
    }
}

async fn scrape_pass(ctx: &SchedulerContext) -> Result<()> {
    let candidates = ctx.registry.list(&SessionFilter {
        status: Some(SessionStatus::Active),
        ..Default::default()
    });
    for session in candidates {
        if !session.agent_type.has_transcript() || session.working_dir.is_none() {
            continue;
        }
        let events = ctx.scraper.scrape_session(&session).await?;
        for event in events {
            ctx.router.handle_agent_event(event).await?;
        }
    }
    Ok(())
}

/// One forced rescrape, triggered from the dashboard. Publishes
/// `sync.complete` with the ingested count.
pub async fn run_forced_sync(ctx: &SchedulerContext, session_name: &str) -> Result<usize> {
    let session = ctx
        .registry
        .get(session_name)
        .ok_or_else(|| BridgeError::NotFound(format!("session '{session_name}'")))?;

    let events = ctx.scraper.scrape_session(&session).await?;
    let count = events.len();
    for event in events {
        ctx.router.handle_agent_event(event).await?;
    }
    ctx.bus.publish(BusEvent::new(
        EventKind::SyncComplete,
        Some(session_name.to_string()),
        json!({ "session_name": session_name, "ingested": count }),
    ));
    Ok(count)
}

async fn idle_sweeper(ctx: Arc<SchedulerContext>) {
    let mut tick = tokio::time::interval(IDLE_SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let idle_after = Duration::from_secs(ctx.config.idle_after_sec);
    let mut health = ComponentHealth::new("idle_sweeper", ctx.bus.clone());

    loop {
        tick.tick().await;
        let result = ctx.registry.sweep_idle(idle_after).await.map(|demoted| {
            if !demoted.is_empty() {
                tracing::info!(target = "aily::sched", count = demoted.len(), "sessions went idle");
            }
        });
        health.record(&result);
    }
}

async fn orphan_reaper(ctx: Arc<SchedulerContext>) {
    let mut tick = tokio::time::interval(ORPHAN_REAP_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let retain = Duration::from_secs(ctx.config.orphan_retain_hours * 3_600);
    let mut health = ComponentHealth::new("orphan_reaper", ctx.bus.clone());

    loop {
        tick.tick().await;
        let mut result = Ok(());
        for session in ctx.registry.orphans_older_than(retain) {
            tracing::info!(target = "aily::sched", session = %session.name, "reaping orphaned session");
            ctx.router.cleanup_threads(&session.name).await;
            if let Err(error) = ctx
                .registry
                .transition(&session.name, SessionEvent::LifecycleClose)
                .await
            {
                result = Err(error);
            }
        }
        health.record(&result);
    }
}

async fn heartbeat(ctx: Arc<SchedulerContext>) {
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tick.tick().await;
        ctx.bus.publish(BusEvent::heartbeat());
    }
}

async fn snapshotter(ctx: Arc<SchedulerContext>) {
    let mut tick =
        tokio::time::interval(Duration::from_secs(ctx.config.backup_interval_hours * 3_600));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Skip the immediate first tick; a snapshot at startup is noise.
    tick.tick().await;
    let mut health = ComponentHealth::new("snapshotter", ctx.bus.clone());

    loop {
        tick.tick().await;
        let db_path = ctx.config.db_path.clone();
        let backup_dir = ctx.config.backup_dir.clone();
        let retain = Duration::from_secs(ctx.config.backup_retain_days * 24 * 3_600);
        let result = tokio::task::spawn_blocking(move || {
            snapshot::write_snapshot(&db_path, &backup_dir)?;
            snapshot::prune_snapshots(&backup_dir, retain)?;
            Ok(())
        })
        .await
        .unwrap_or_else(|e| Err(BridgeError::Cancelled(format!("snapshot task: {e}"))));
        health.record(&result);
    }
}

#[cfg(test)]
mod tests {
    use crate::bus::{EventBus, EventKind, SubscriptionFilter};
    use crate::error::BridgeError;

    use super::ComponentHealth;

    #[tokio::test]
    async fn three_consecutive_failures_degrade_once() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(SubscriptionFilter::default());
        let mut health = ComponentHealth::new("poller", bus);

        for _ in 0..5 {
            health.record(&Err(BridgeError::Unreachable("h".into())));
        }
        assert!(health.is_degraded());

        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ComponentDegraded);
        assert_eq!(event.payload["component"], "poller");
        // Only one degraded event despite five failures.
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn recovery_publishes_connection_status() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(SubscriptionFilter::default());
        let mut health = ComponentHealth::new("poller", bus);

        for _ in 0..3 {
            health.record(&Err(BridgeError::Unreachable("h".into())));
        }
        health.record(&Ok(()));
        assert!(!health.is_degraded());

        let degraded = sub.recv().await.unwrap();
        assert_eq!(degraded.kind, EventKind::ComponentDegraded);
        let recovered = sub.recv().await.unwrap();
        assert_eq!(recovered.kind, EventKind::ConnectionStatus);
        assert_eq!(recovered.payload["status"], "recovered");
    }

    #[tokio::test]
    async fn failures_below_threshold_do_not_degrade() {
        let bus = EventBus::new();
        let mut health = ComponentHealth::new("poller", bus);
        health.record(&Err(BridgeError::Unreachable("h".into())));
        health.record(&Err(BridgeError::Unreachable("h".into())));
        health.record(&Ok(()));
        assert!(!health.is_degraded());
    }
}
