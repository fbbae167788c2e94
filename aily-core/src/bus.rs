//! In-process publish/subscribe for real-time event distribution.
//!
//! Built on a broadcast channel: every subscriber sees every published
//! event, filters are applied on the receive side, and a slow subscriber
//! observes dropped-oldest semantics surfaced as a `subscriber.lag`
//! event rather than blocking publishers.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Outbound buffer per subscriber; overflow drops the oldest events.
pub const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionCreated,
    SessionUpdated,
    SessionStatusChanged,
    SessionDeleted,
    MessageNew,
    TypingStart,
    TypingStop,
    SyncComplete,
    ConnectionStatus,
    SystemHeartbeat,
    ComponentDegraded,
    NotificationFailed,
    SubscriberLag,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::SessionCreated => "session.created",
            EventKind::SessionUpdated => "session.updated",
            EventKind::SessionStatusChanged => "session.status_changed",
            EventKind::SessionDeleted => "session.deleted",
            EventKind::MessageNew => "message.new",
            EventKind::TypingStart => "typing.start",
            EventKind::TypingStop => "typing.stop",
            EventKind::SyncComplete => "sync.complete",
            EventKind::ConnectionStatus => "connection.status",
            EventKind::SystemHeartbeat => "system.heartbeat",
            EventKind::ComponentDegraded => "component.degraded",
            EventKind::NotificationFailed => "notification.failed",
            EventKind::SubscriberLag => "subscriber.lag",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BusEvent {
    pub kind: EventKind,
    /// Session the event concerns, when any; `None` events pass every
    /// session filter.
    pub session: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(kind: EventKind, session: Option<String>, payload: Value) -> Self {
        Self {
            kind,
            session,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(EventKind::SystemHeartbeat, None, json!({}))
    }

    /// Wire frame sent to streaming clients.
    pub fn to_frame(&self) -> Value {
        json!({
            "type": self.kind.as_str(),
            "payload": self.payload,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// Subscriber-side filter: `None` means no filtering on that axis.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub kinds: Option<HashSet<EventKind>>,
    pub sessions: Option<HashSet<String>>,
}

impl SubscriptionFilter {
    pub fn sessions(names: impl IntoIterator<Item = String>) -> Self {
        let set: HashSet<String> = names.into_iter().collect();
        Self {
            kinds: None,
            // An empty subscribe set means "all sessions".
            sessions: if set.is_empty() { None } else { Some(set) },
        }
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(sessions) = &self.sessions {
            if let Some(session) = &event.session {
                if !sessions.contains(session) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self { tx }
    }

    /// Publish to all current subscribers. Returns the receiver count.
    pub fn publish(&self, event: BusEvent) -> usize {
        tracing::debug!(
            target = "aily::bus",
            kind = event.kind.as_str(),
            session = event.session.as_deref().unwrap_or(""),
            "publish"
        );
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> BusSubscriber {
        BusSubscriber {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct BusSubscriber {
    rx: broadcast::Receiver<BusEvent>,
    filter: SubscriptionFilter,
}

impl BusSubscriber {
    pub fn set_filter(&mut self, filter: SubscriptionFilter) {
        self.filter = filter;
    }

    /// Receive the next event matching the filter. When the subscriber
    /// lagged, a synthetic `subscriber.lag` event is delivered in place of
    /// the dropped ones.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target = "aily::bus", skipped, "subscriber lagged");
                    return Some(BusEvent::new(
                        EventKind::SubscriberLag,
                        None,
                        json!({ "dropped": skipped }),
                    ));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{BusEvent, EventBus, EventKind, SubscriptionFilter};

    fn event(kind: EventKind, session: &str) -> BusEvent {
        BusEvent::new(kind, Some(session.to_string()), json!({"session_name": session}))
    }

    #[tokio::test]
    async fn session_filter_passes_matching_only() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(SubscriptionFilter::sessions(["s1".to_string()]));

        bus.publish(event(EventKind::MessageNew, "s2"));
        bus.publish(event(EventKind::MessageNew, "s1"));

        let got = sub.recv().await.expect("event");
        assert_eq!(got.session.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn empty_session_set_means_all() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(SubscriptionFilter::sessions(Vec::<String>::new()));

        bus.publish(event(EventKind::MessageNew, "anything"));
        let got = sub.recv().await.expect("event");
        assert_eq!(got.session.as_deref(), Some("anything"));
    }

    #[tokio::test]
    async fn sessionless_events_pass_filters() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(SubscriptionFilter::sessions(["s1".to_string()]));

        bus.publish(BusEvent::heartbeat());
        let got = sub.recv().await.expect("event");
        assert_eq!(got.kind, EventKind::SystemHeartbeat);
    }

    #[tokio::test]
    async fn lag_surfaces_as_subscriber_lag_event() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(SubscriptionFilter::default());

        for i in 0..(super::SUBSCRIBER_BUFFER + 10) {
            bus.publish(event(EventKind::MessageNew, &format!("s{i}")));
        }

        let got = sub.recv().await.expect("event");
        assert_eq!(got.kind, EventKind::SubscriberLag);
        assert!(got.payload["dropped"].as_u64().unwrap() >= 10);
    }

    #[test]
    fn frame_shape() {
        let frame = event(EventKind::SessionCreated, "s1").to_frame();
        assert_eq!(frame["type"], "session.created");
        assert_eq!(frame["payload"]["session_name"], "s1");
        assert!(frame["timestamp"].is_string());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(BusEvent::heartbeat()), 0);
    }
}
