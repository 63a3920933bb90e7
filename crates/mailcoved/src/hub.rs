//! Fan-out of mailbox events to any number of listeners without ever
//! blocking the ingress path. Each subscriber gets its own bounded
//! ring; a slow subscriber loses its oldest queued events, never the
//! newest, and the loss is counted.

use crate::metrics_helper::MONITOR_EVENTS_DROPPED;
use msgstore::MessageSummary;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

pub const DEFAULT_EVENT_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    New,
    Removed,
    Purged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessageEvent {
    pub mailbox: String,
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<MessageSummary>,
}

impl MessageEvent {
    pub fn new_message(summary: &MessageSummary) -> Self {
        Self {
            mailbox: summary.mailbox.clone(),
            kind: EventKind::New,
            id: Some(summary.id.clone()),
            summary: Some(summary.clone()),
        }
    }

    pub fn removed(mailbox: &str, id: &str) -> Self {
        Self {
            mailbox: mailbox.to_string(),
            kind: EventKind::Removed,
            id: Some(id.to_string()),
            summary: None,
        }
    }

    pub fn purged(mailbox: &str) -> Self {
        Self {
            mailbox: mailbox.to_string(),
            kind: EventKind::Purged,
            id: None,
            summary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Mailbox(String),
    All,
}

impl Topic {
    fn matches(&self, mailbox: &str) -> bool {
        match self {
            Self::All => true,
            Self::Mailbox(name) => name == mailbox,
        }
    }
}

pub struct Hub {
    buffer: usize,
    subscribers: Mutex<Vec<Entry>>,
}

struct Entry {
    topic: Topic,
    tx: broadcast::Sender<MessageEvent>,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: Mutex::new(vec![]),
        }
    }

    /// Subscribe to one mailbox, or to every mailbox with `Topic::All`.
    /// Dropping the returned Subscription unsubscribes.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let (tx, rx) = broadcast::channel(self.buffer);
        self.subscribers.lock().push(Entry { topic, tx });
        Subscription { rx, dropped: 0 }
    }

    /// Deliver an event to every matching subscriber. Never blocks:
    /// a full subscriber ring sheds its oldest event to make room.
    /// Senders are collected under the registry lock and sent to
    /// outside it.
    pub fn publish(&self, event: MessageEvent) {
        let senders: Vec<broadcast::Sender<MessageEvent>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|entry| entry.tx.receiver_count() > 0);
            subscribers
                .iter()
                .filter(|entry| entry.topic.matches(&event.mailbox))
                .map(|entry| entry.tx.clone())
                .collect()
        };
        for tx in senders {
            tx.send(event.clone()).ok();
        }
    }

    /// Drop every subscriber; their pending receives complete with None.
    pub fn close_all(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|entry| entry.tx.receiver_count() > 0);
        subscribers.len()
    }
}

/// The read end handed to a subscriber. Events for one mailbox arrive
/// in publish order; lost events only ever come off the old end of the
/// ring and show up in `dropped`.
pub struct Subscription {
    rx: broadcast::Receiver<MessageEvent>,
    dropped: u64,
}

impl Subscription {
    /// Next event, or None once the hub has shut down.
    pub async fn recv(&mut self) -> Option<MessageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    self.dropped += n;
                    MONITOR_EVENTS_DROPPED.inc_by(n);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant: None when nothing is queued right now.
    pub fn try_recv(&mut self) -> Option<MessageEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => {
                    self.dropped += n;
                    MONITOR_EVENTS_DROPPED.inc_by(n);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// How many events this subscriber has lost to the ring.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn event(mailbox: &str, n: u32) -> MessageEvent {
        MessageEvent::removed(mailbox, &format!("{n:06}-0000000"))
    }

    #[tokio::test]
    async fn mailbox_topic_filters_and_preserves_order() {
        let hub = Hub::new(16);
        let mut sub = hub.subscribe(Topic::Mailbox("u".to_string()));
        hub.publish(event("u", 1));
        hub.publish(event("other", 2));
        hub.publish(event("u", 3));

        assert_equal!(sub.recv().await.unwrap(), event("u", 1));
        assert_equal!(sub.recv().await.unwrap(), event("u", 3));
        assert!(sub.try_recv().is_none());
        assert_equal!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn wildcard_sees_every_mailbox() {
        let hub = Hub::new(16);
        let mut sub = hub.subscribe(Topic::All);
        hub.publish(event("a", 1));
        hub.publish(event("b", 2));
        assert_equal!(sub.recv().await.unwrap().mailbox, "a");
        assert_equal!(sub.recv().await.unwrap().mailbox, "b");
    }

    #[tokio::test]
    async fn slow_subscriber_sheds_oldest_and_counts() {
        let hub = Hub::new(4);
        let mut sub = hub.subscribe(Topic::All);
        for n in 0..10 {
            hub.publish(event("u", n));
        }
        let mut received = vec![];
        while let Some(ev) = sub.try_recv() {
            received.push(ev);
        }
        // The newest four survive; the first six were shed.
        assert_equal!(received.len(), 4);
        assert_equal!(received[0], event("u", 6));
        assert_equal!(received[3], event("u", 9));
        assert_equal!(sub.dropped(), 6);
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let hub = Hub::new(4);
        let sub = hub.subscribe(Topic::All);
        assert_equal!(hub.subscriber_count(), 1);
        drop(sub);
        assert_equal!(hub.subscriber_count(), 0);
        // Publishing to nobody is fine.
        hub.publish(event("u", 1));
    }

    #[tokio::test]
    async fn close_all_completes_pending_receives() {
        let hub = Hub::new(4);
        let mut sub = hub.subscribe(Topic::All);
        hub.close_all();
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn per_subscriber_rings_are_independent() {
        let hub = Hub::new(4);
        let mut fast = hub.subscribe(Topic::All);
        let mut slow = hub.subscribe(Topic::All);
        for n in 0..4 {
            hub.publish(event("u", n));
            // The fast subscriber drains as it goes.
            assert_equal!(fast.recv().await.unwrap(), event("u", n));
        }
        for n in 4..10 {
            hub.publish(event("u", n));
            fast.recv().await.unwrap();
        }
        assert_equal!(fast.dropped(), 0);
        let mut tail = vec![];
        while let Some(ev) = slow.try_recv() {
            tail.push(ev);
        }
        assert_equal!(tail.len(), 4);
        assert_equal!(slow.dropped(), 6);
    }
}
