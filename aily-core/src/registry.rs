//! Authoritative in-memory session table.
//!
//! The registry owns session records: observations from SSH polling,
//! platform events, hook webhooks and user actions are merged here, the
//! status state machine is applied, every effective change is persisted to
//! the `sessions` table and published on the bus. Nothing else writes
//! session rows.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use sqlx::{Row, SqlitePool};

use crate::bus::{BusEvent, EventBus, EventKind};
use crate::error::Result;
use crate::types::{AgentType, Session, SessionEvent, SessionStatus};

/// Pure state-machine step. `None` means the event does not change the
/// status (including every event against `archived`, which is terminal).
pub fn next_status(current: SessionStatus, event: SessionEvent) -> Option<SessionStatus> {
    use SessionEvent::*;
    use SessionStatus::*;

    if current == Archived {
        return None;
    }

    let next = match event {
        SshSeen => Active,
        SshMissing => match current {
            Active | Waiting | Idle | Error => Orphaned,
            Orphaned => Orphaned,
            Unreachable => Unreachable,
            Archived => unreachable!(),
        },
        MsgInbound => match current {
            Active | Waiting | Idle | Error => Active,
            Orphaned => Orphaned,
            Unreachable => Unreachable,
            Archived => unreachable!(),
        },
        AskQuestion => match current {
            Active | Waiting | Idle | Error => Waiting,
            Orphaned => Orphaned,
            Unreachable => Unreachable,
            Archived => unreachable!(),
        },
        LifecycleClose => Archived,
        HostDown => match current {
            Active | Waiting | Idle | Error => Unreachable,
            Orphaned => Orphaned,
            Unreachable => Unreachable,
            Archived => unreachable!(),
        },
    };

    if next == current {
        None
    } else {
        Some(next)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub host: Option<String>,
    pub name_contains: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub by_host: HashMap<String, usize>,
}

pub struct SessionRegistry {
    pool: SqlitePool,
    bus: EventBus,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new(pool: SqlitePool, bus: EventBus) -> Self {
        Self {
            pool,
            bus,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Hydrate the in-memory table from the sessions table.
    pub async fn load(&self) -> Result<usize> {
        let rows = sqlx::query("SELECT * FROM sessions").fetch_all(&self.pool).await?;
        let mut sessions = HashMap::new();
        for row in &rows {
            let session = Session {
                name: row.get("name"),
                host: row.get("host"),
                agent_type: AgentType::from_label(row.get::<String, _>("agent_type").as_str()),
                status: SessionStatus::from_label(row.get::<String, _>("status").as_str())
                    .unwrap_or(SessionStatus::Orphaned),
                working_dir: row.get("working_dir"),
                created_at: parse_ts(row.get::<String, _>("created_at").as_str()),
                last_activity_at: parse_ts(row.get::<String, _>("last_activity_at").as_str()),
                last_message_preview: row.get("last_message_preview"),
            };
            sessions.insert(session.name.clone(), session);
        }
        let count = sessions.len();
        *self.sessions.write() = sessions;
        tracing::info!(target = "aily::registry", count, "loaded sessions");
        Ok(count)
    }

    pub fn get(&self, name: &str) -> Option<Session> {
        self.sessions.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.read().contains_key(name)
    }

    pub fn list(&self, filter: &SessionFilter) -> Vec<Session> {
        let sessions = self.sessions.read();
        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| filter.status.map_or(true, |status| s.status == status))
            .filter(|s| {
                filter
                    .host
                    .as_deref()
                    .map_or(true, |host| s.host.as_deref() == Some(host))
            })
            .filter(|s| {
                filter
                    .name_contains
                    .as_deref()
                    .map_or(true, |needle| s.name.contains(needle))
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        result
    }

    /// Register a session observed live over SSH. Creates it as `active`
    /// or drives an existing record through `ssh_seen`. Returns the record
    /// and whether it was newly created.
    pub async fn observe_live(&self, name: &str, host: &str) -> Result<(Session, bool)> {
        let now = Utc::now();
        let (session, created, status_changed, host_moved) = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(name) {
                Some(session) => {
                    let old_status = session.status;
                    // An idle session is still live; seeing it on a poll is
                    // not activity. Only a message or keystroke restores
                    // `active`, or the poller would undo every idle sweep.
                    if session.status != SessionStatus::Idle {
                        if let Some(next) = next_status(session.status, SessionEvent::SshSeen) {
                            session.status = next;
                        }
                    }
                    let moved = session.host.as_deref() != Some(host);
                    session.host = Some(host.to_string());
                    (session.clone(), false, session.status != old_status, moved)
                }
                None => {
                    let session = Session {
                        name: name.to_string(),
                        host: Some(host.to_string()),
                        agent_type: AgentType::Unknown,
                        status: SessionStatus::Active,
                        working_dir: None,
                        created_at: now,
                        last_activity_at: now,
                        last_message_preview: None,
                    };
                    sessions.insert(name.to_string(), session.clone());
                    (session, true, false, false)
                }
            }
        };

        self.persist(&session).await?;
        if created {
            self.publish(EventKind::SessionCreated, &session);
        } else if status_changed {
            self.publish(EventKind::SessionStatusChanged, &session);
        } else if host_moved {
            self.publish(EventKind::SessionUpdated, &session);
        }
        Ok((session, created))
    }

    /// Register a session known only from a platform thread. Creates it as
    /// `orphaned` when nothing live has been observed.
    pub async fn observe_thread(&self, name: &str) -> Result<Session> {
        if let Some(existing) = self.get(name) {
            return Ok(existing);
        }
        let now = Utc::now();
        let session = Session {
            name: name.to_string(),
            host: None,
            agent_type: AgentType::Unknown,
            status: SessionStatus::Orphaned,
            working_dir: None,
            created_at: now,
            last_activity_at: now,
            last_message_preview: None,
        };
        self.sessions.write().insert(name.to_string(), session.clone());
        self.persist(&session).await?;
        self.publish(EventKind::SessionCreated, &session);
        Ok(session)
    }

    /// Apply a state-machine event. Invalid or no-op transitions are
    /// ignored and logged, never errors.
    pub async fn transition(
        &self,
        name: &str,
        event: SessionEvent,
    ) -> Result<Option<(SessionStatus, SessionStatus)>> {
        let changed = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(name) else {
                tracing::debug!(target = "aily::registry", session = %name, ?event, "transition for unknown session ignored");
                return Ok(None);
            };
            match next_status(session.status, event) {
                Some(next) => {
                    let old = session.status;
                    session.status = next;
                    session.last_activity_at = Utc::now();
                    Some((old, next, session.clone()))
                }
                None => {
                    tracing::debug!(
                        target = "aily::registry",
                        session = %name,
                        status = session.status.as_str(),
                        ?event,
                        "transition is a no-op"
                    );
                    None
                }
            }
        };

        match changed {
            Some((old, next, session)) => {
                self.persist(&session).await?;
                self.publish(EventKind::SessionStatusChanged, &session);
                Ok(Some((old, next)))
            }
            None => Ok(None),
        }
    }

    /// Record activity on a session (message stored or keystroke sent) and
    /// refresh the preview line shown in session lists.
    pub async fn touch(&self, name: &str, preview: Option<&str>) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(name) else {
                return Ok(());
            };
            session.last_activity_at = Utc::now();
            if let Some(preview) = preview {
                session.last_message_preview = Some(preview_line(preview));
            }
            session.clone()
        };
        self.persist(&session).await
    }

    pub async fn set_agent_type(&self, name: &str, agent_type: AgentType) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(name) else {
                return Ok(());
            };
            if session.agent_type == agent_type || agent_type == AgentType::Unknown {
                return Ok(());
            }
            session.agent_type = agent_type;
            session.clone()
        };
        self.persist(&session).await?;
        self.publish(EventKind::SessionUpdated, &session);
        Ok(())
    }

    pub async fn set_working_dir(&self, name: &str, working_dir: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(name) else {
                return Ok(());
            };
            if session.working_dir.as_deref() == Some(working_dir) {
                return Ok(());
            }
            session.working_dir = Some(working_dir.to_string());
            session.clone()
        };
        self.persist(&session).await
    }

    /// Mark a session failed by an operation attributable to the session
    /// itself (e.g. inject returned a protocol error).
    pub async fn mark_error(&self, name: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write();
            let Some(session) = sessions.get_mut(name) else {
                return Ok(());
            };
            if session.status == SessionStatus::Archived || session.status == SessionStatus::Error {
                return Ok(());
            }
            session.status = SessionStatus::Error;
            session.clone()
        };
        self.persist(&session).await?;
        self.publish(EventKind::SessionStatusChanged, &session);
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let removed = self.sessions.write().remove(name);
        let Some(session) = removed else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM sessions WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        self.publish(EventKind::SessionDeleted, &session);
        Ok(true)
    }

    /// Demote `active` sessions with no activity for `idle_after` to
    /// `idle`. Returns the demoted names.
    pub async fn sweep_idle(&self, idle_after: std::time::Duration) -> Result<Vec<String>> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(idle_after).unwrap_or_else(|_| ChronoDuration::seconds(900));
        let demoted: Vec<Session> = {
            let mut sessions = self.sessions.write();
            sessions
                .values_mut()
                .filter(|s| s.status == SessionStatus::Active && s.last_activity_at < cutoff)
                .map(|s| {
                    s.status = SessionStatus::Idle;
                    s.clone()
                })
                .collect()
        };
        for session in &demoted {
            self.persist(session).await?;
            self.publish(EventKind::SessionStatusChanged, session);
        }
        Ok(demoted.iter().map(|s| s.name.clone()).collect())
    }

    /// Orphaned sessions whose last activity is older than the retention
    /// window; candidates for thread archival.
    pub fn orphans_older_than(&self, retain: std::time::Duration) -> Vec<Session> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(retain).unwrap_or_else(|_| ChronoDuration::hours(24));
        self.sessions
            .read()
            .values()
            .filter(|s| s.status == SessionStatus::Orphaned && s.last_activity_at < cutoff)
            .cloned()
            .collect()
    }

    /// Sessions currently attributed to a host.
    pub fn sessions_on_host(&self, host: &str) -> Vec<String> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.host.as_deref() == Some(host))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut by_host: HashMap<String, usize> = HashMap::new();
        for session in sessions.values() {
            *by_status.entry(session.status.as_str().to_string()).or_default() += 1;
            if let Some(host) = &session.host {
                *by_host.entry(host.clone()).or_default() += 1;
            }
        }
        RegistryStats {
            total: sessions.len(),
            by_status,
            by_host,
        }
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions
             (name, host, agent_type, status, working_dir, created_at, last_activity_at, last_message_preview)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                host = excluded.host,
                agent_type = excluded.agent_type,
                status = excluded.status,
                working_dir = excluded.working_dir,
                last_activity_at = excluded.last_activity_at,
                last_message_preview = excluded.last_message_preview",
        )
        .bind(&session.name)
        .bind(&session.host)
        .bind(session.agent_type.as_str())
        .bind(session.status.as_str())
        .bind(&session.working_dir)
        .bind(session.created_at.to_rfc3339())
        .bind(session.last_activity_at.to_rfc3339())
        .bind(&session.last_message_preview)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn publish(&self, kind: EventKind, session: &Session) {
        let payload = serde_json::to_value(session).unwrap_or_default();
        self.bus
            .publish(BusEvent::new(kind, Some(session.name.clone()), payload));
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn preview_line(content: &str) -> String {
    let flattened = content.replace('\n', " ");
    let trimmed = flattened.trim();
    if trimmed.len() <= 120 {
        return trimmed.to_string();
    }
    let mut end = 119;
    while end > 0 && !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}
