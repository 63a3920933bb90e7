//! The manager is the only writer-side entry point to storage. Cap
//! enforcement, retention, and event publication all live here so that
//! a storage backend only has to implement the store operations.

use crate::address::EnvelopeAddress;
use crate::hub::{Hub, MessageEvent};
use crate::metrics_helper::{
    RETENTION_PRUNED, RETENTION_RUNS, TOTAL_MSGS_REMOVED, TOTAL_MSGS_STORED,
};
use crate::policy::{AddressPolicy, PolicyError};
use chrono::{DateTime, Utc};
use mailcove_lifecycle::Shutdown;
use msgstore::{MessageSummary, NewMessage, Store, StoreError, StoredMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

pub struct MessageManager {
    store: Arc<dyn Store>,
    hub: Arc<Hub>,
    policy: AddressPolicy,
    /// Per-mailbox message count cap; zero means unlimited.
    mailbox_cap: usize,
    /// Serializes the add -> trim -> publish sequence per mailbox so
    /// that hub subscribers observe events in mutation order.
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Delivery is atomic per recipient: mailboxes that accepted keep
/// their message, and the caller learns about the rest through this.
#[derive(Debug, thiserror::Error)]
#[error("delivery failed for {} of {attempted} recipients", .store_failures.len() + .policy_rejected.len())]
pub struct DeliverError {
    pub attempted: usize,
    pub delivered: Vec<MessageSummary>,
    /// (recipient, reason) pairs the policy refused.
    pub policy_rejected: Vec<(String, String)>,
    /// (mailbox, reason) pairs the store refused.
    pub store_failures: Vec<(String, String)>,
    pub store_full: bool,
}

impl DeliverError {
    pub fn is_store_full(&self) -> bool {
        self.store_full
    }

    /// Policy-only failures were already reported per recipient at
    /// RCPT time; the transaction as a whole still succeeded.
    pub fn only_policy_rejections(&self) -> bool {
        self.store_failures.is_empty()
    }
}

impl MessageManager {
    pub fn new(
        store: Arc<dyn Store>,
        hub: Arc<Hub>,
        policy: AddressPolicy,
        mailbox_cap: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            policy,
            mailbox_cap,
            locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn policy(&self) -> &AddressPolicy {
        &self.policy
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    fn mailbox_lock(&self, mailbox: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(mailbox.to_string())
            .or_default()
            .clone()
    }

    /// Store one message for every distinct canonical mailbox among
    /// `recipients`. Recipients that canonicalize to the same mailbox
    /// are deduplicated so the message lands once.
    pub async fn deliver(
        &self,
        origin: &str,
        from: &EnvelopeAddress,
        recipients: &[EnvelopeAddress],
        source: &[u8],
    ) -> Result<Vec<MessageSummary>, DeliverError> {
        let mut mailboxes: Vec<String> = vec![];
        let mut policy_rejected = vec![];
        for rcpt in recipients {
            match self.policy.evaluate(rcpt) {
                Err(PolicyError::BadAddress(addr)) => {
                    policy_rejected.push((rcpt.to_string(), format!("malformed address: {addr}")));
                }
                Ok(verdict) if !verdict.accept || !verdict.store => {
                    tracing::debug!("policy refuses {rcpt} from {origin}");
                    policy_rejected.push((rcpt.to_string(), "refused by policy".to_string()));
                }
                Ok(verdict) => {
                    if !mailboxes.contains(&verdict.mailbox) {
                        mailboxes.push(verdict.mailbox);
                    }
                }
            }
        }

        let envelope_to: Vec<String> = recipients.iter().map(|r| r.to_string()).collect();
        let mut delivered = vec![];
        let mut store_failures = vec![];
        let mut store_full = false;

        for mailbox in &mailboxes {
            let lock = self.mailbox_lock(mailbox);
            let _guard = lock.lock().await;
            let msg = NewMessage {
                from: from.to_string(),
                to: envelope_to.clone(),
                source: source.to_vec(),
            };
            match self.store.add_message(mailbox, msg).await {
                Ok(summary) => {
                    tracing::debug!("stored {} in {mailbox} from {origin}", summary.id);
                    TOTAL_MSGS_STORED.inc();
                    self.hub.publish(MessageEvent::new_message(&summary));
                    delivered.push(summary);
                    self.trim_over_cap(mailbox).await;
                }
                Err(StoreError::StoreFull) => {
                    store_full = true;
                    store_failures.push((mailbox.clone(), "store is full".to_string()));
                }
                Err(err) => {
                    tracing::error!("failed to store message for {mailbox}: {err:#}");
                    store_failures.push((mailbox.clone(), format!("{err:#}")));
                }
            }
        }

        if policy_rejected.is_empty() && store_failures.is_empty() {
            Ok(delivered)
        } else {
            Err(DeliverError {
                attempted: recipients.len(),
                delivered,
                policy_rejected,
                store_failures,
                store_full,
            })
        }
    }

    /// Trim oldest-first until the mailbox is back under the cap.
    /// Caller holds the mailbox lock.
    async fn trim_over_cap(&self, mailbox: &str) {
        if self.mailbox_cap == 0 {
            return;
        }
        let listing = match self.store.get_messages(mailbox).await {
            Ok(listing) => listing,
            Err(err) => {
                tracing::error!("cap check for {mailbox} failed: {err:#}");
                return;
            }
        };
        if listing.len() <= self.mailbox_cap {
            return;
        }
        for victim in &listing[..listing.len() - self.mailbox_cap] {
            match self.store.remove_message(mailbox, &victim.id).await {
                Ok(true) => {
                    TOTAL_MSGS_REMOVED.with_label_values(&["cap"]).inc();
                    self.hub.publish(MessageEvent::removed(mailbox, &victim.id));
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::error!("cap trim of {} in {mailbox} failed: {err:#}", victim.id);
                }
            }
        }
    }

    pub async fn get_message(&self, mailbox: &str, id: &str) -> Result<StoredMessage, StoreError> {
        self.store.get_message(mailbox, id).await
    }

    pub async fn get_messages(&self, mailbox: &str) -> Result<Vec<MessageSummary>, StoreError> {
        self.store.get_messages(mailbox).await
    }

    pub async fn mark_seen(&self, mailbox: &str, id: &str) -> Result<(), StoreError> {
        self.store.mark_seen(mailbox, id).await
    }

    pub async fn remove_message(&self, mailbox: &str, id: &str) -> Result<bool, StoreError> {
        self.remove_with_reason(mailbox, id, "delete").await
    }

    async fn remove_with_reason(
        &self,
        mailbox: &str,
        id: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let lock = self.mailbox_lock(mailbox);
        let _guard = lock.lock().await;
        let removed = self.store.remove_message(mailbox, id).await?;
        if removed {
            TOTAL_MSGS_REMOVED.with_label_values(&[reason]).inc();
            self.hub.publish(MessageEvent::removed(mailbox, id));
        }
        Ok(removed)
    }

    pub async fn purge_messages(&self, mailbox: &str) -> Result<(), StoreError> {
        let lock = self.mailbox_lock(mailbox);
        let _guard = lock.lock().await;
        self.store.purge_messages(mailbox).await?;
        TOTAL_MSGS_REMOVED.with_label_values(&["purge"]).inc();
        self.hub.publish(MessageEvent::purged(mailbox));
        Ok(())
    }

    /// Launch the periodic retention sweep. A tick that fires while a
    /// sweep is still running is skipped rather than overlapped.
    /// A zero `max_age` disables retention entirely.
    pub fn start_retention_sweeper(self: &Arc<Self>, every: Duration, max_age: Duration) {
        if max_age.is_zero() {
            tracing::debug!("retention sweeping is disabled");
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let mut shutdown = Shutdown::subscribe();
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a restart
            // doesn't race the listeners coming up.
            ticks.tick().await;
            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        let cutoff = Utc::now()
                            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
                        match manager.sweep_before(cutoff).await {
                            Ok(0) => {}
                            Ok(pruned) => tracing::info!("retention sweep pruned {pruned} messages"),
                            Err(err) => tracing::error!("retention sweep failed: {err:#}"),
                        }
                    }
                    _ = shutdown.wait() => {
                        tracing::debug!("retention sweeper shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// One retention pass: remove every message dated before `cutoff`,
    /// through the manager's own delete path so the hub observes it.
    pub async fn sweep_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        RETENTION_RUNS.inc();
        let (tx, mut rx) = tokio::sync::mpsc::channel(32);
        self.store.enumerate_mailboxes(tx)?;
        let mut pruned = 0;
        while let Some(listing) = rx.recv().await {
            for summary in &listing.messages {
                if summary.date < cutoff {
                    if self
                        .remove_with_reason(&listing.mailbox, &summary.id, "sweep")
                        .await?
                    {
                        RETENTION_PRUNED.inc();
                        pruned += 1;
                    }
                }
            }
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hub::{EventKind, Topic};
    use k9::assert_equal;
    use msgstore::MemoryStore;

    fn manager_with(policy: AddressPolicy, cap: usize) -> Arc<MessageManager> {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(0, 0));
        MessageManager::new(store, Arc::new(Hub::new(64)), policy, cap)
    }

    fn addr(text: &str) -> EnvelopeAddress {
        EnvelopeAddress::parse(text).unwrap()
    }

    fn source(subject: &str) -> Vec<u8> {
        format!("Subject: {subject}\r\n\r\nbody\r\n").into_bytes()
    }

    #[tokio::test]
    async fn deliver_stores_and_notifies() {
        let manager = manager_with(AddressPolicy::default(), 0);
        let mut sub = manager.hub().subscribe(Topic::Mailbox("bob".to_string()));

        let delivered = manager
            .deliver(
                "127.0.0.1",
                &addr("alice@example.com"),
                &[addr("bob@example.com")],
                &source("hi"),
            )
            .await
            .unwrap();
        assert_equal!(delivered.len(), 1);
        assert_equal!(delivered[0].mailbox, "bob");
        assert_equal!(delivered[0].from, "alice@example.com");
        assert_equal!(delivered[0].to, vec!["bob@example.com".to_string()]);
        assert_equal!(delivered[0].subject, "hi");

        let event = sub.recv().await.unwrap();
        assert_equal!(event.kind, EventKind::New);
        assert_equal!(event.id.as_deref(), Some(delivered[0].id.as_str()));
    }

    #[tokio::test]
    async fn recipients_collapsing_to_one_mailbox_store_once() {
        let manager = manager_with(AddressPolicy::default(), 0);
        manager
            .deliver(
                "origin",
                &addr("a@x.example"),
                &[addr("bob@one.example"), addr("Bob@two.example")],
                &source("dup"),
            )
            .await
            .unwrap();
        let listing = manager.get_messages("bob").await.unwrap();
        assert_equal!(listing.len(), 1);
        // Both envelope recipients are still recorded on the message.
        assert_equal!(listing[0].to.len(), 2);
    }

    #[tokio::test]
    async fn cap_trims_oldest_and_publishes_removals() {
        let manager = manager_with(AddressPolicy::default(), 3);
        let mut sub = manager.hub().subscribe(Topic::Mailbox("u".to_string()));
        for n in 0..5 {
            manager
                .deliver(
                    "origin",
                    &addr("a@x.example"),
                    &[addr("u@y.example")],
                    &source(&format!("m{n}")),
                )
                .await
                .unwrap();
        }

        let listing = manager.get_messages("u").await.unwrap();
        assert_equal!(listing.len(), 3);
        assert_equal!(listing[0].subject, "m2");
        assert_equal!(listing[2].subject, "m4");

        let mut new_events = 0;
        let mut removed_events = 0;
        while let Some(event) = sub.try_recv() {
            match event.kind {
                EventKind::New => new_events += 1,
                EventKind::Removed => removed_events += 1,
                EventKind::Purged => unreachable!(),
            }
        }
        assert_equal!(new_events, 5);
        assert_equal!(removed_events, 2);
    }

    #[tokio::test]
    async fn policy_rejections_are_reported_not_fatal() {
        let policy = AddressPolicy {
            default_store: false,
            store_domains: vec!["allowed.com".to_string()],
            ..Default::default()
        };
        let manager = manager_with(policy, 0);
        let err = manager
            .deliver(
                "origin",
                &addr("a@x.example"),
                &[addr("ok@allowed.com"), addr("nope@other.com")],
                &source("partial"),
            )
            .await
            .unwrap_err();
        assert_equal!(err.delivered.len(), 1);
        assert_equal!(err.policy_rejected.len(), 1);
        assert!(err.only_policy_rejections());
        assert!(!err.is_store_full());
        assert_equal!(manager.get_messages("ok").await.unwrap().len(), 1);
        assert_equal!(manager.get_messages("nope").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn full_store_is_reported_as_such() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(1, 0));
        let manager =
            MessageManager::new(store, Arc::new(Hub::new(8)), AddressPolicy::default(), 0);
        manager
            .deliver(
                "origin",
                &addr("a@x.example"),
                &[addr("u@y.example")],
                &source("first"),
            )
            .await
            .unwrap();
        let err = manager
            .deliver(
                "origin",
                &addr("a@x.example"),
                &[addr("v@y.example")],
                &source("second"),
            )
            .await
            .unwrap_err();
        assert!(err.is_store_full());
        assert!(!err.only_policy_rejections());
    }

    #[tokio::test]
    async fn remove_and_purge_notify_subscribers() {
        let manager = manager_with(AddressPolicy::default(), 0);
        let mut sub = manager.hub().subscribe(Topic::All);
        let delivered = manager
            .deliver(
                "origin",
                &addr("a@x.example"),
                &[addr("u@y.example"), addr("w@y.example")],
                &source("x"),
            )
            .await
            .unwrap();
        sub.try_recv().unwrap();
        sub.try_recv().unwrap();

        assert!(manager.remove_message("u", &delivered[0].id).await.unwrap());
        let event = sub.try_recv().unwrap();
        assert_equal!(event.kind, EventKind::Removed);
        // Removing again is quiet.
        assert!(!manager.remove_message("u", &delivered[0].id).await.unwrap());
        assert!(sub.try_recv().is_none());

        manager.purge_messages("w").await.unwrap();
        let event = sub.try_recv().unwrap();
        assert_equal!(event.kind, EventKind::Purged);
        assert_equal!(event.mailbox, "w");
    }

    #[tokio::test]
    async fn seen_flag_round_trip() {
        let manager = manager_with(AddressPolicy::default(), 0);
        let delivered = manager
            .deliver(
                "origin",
                &addr("a@x.example"),
                &[addr("u@y.example")],
                &source("x"),
            )
            .await
            .unwrap();
        manager.mark_seen("u", &delivered[0].id).await.unwrap();
        assert!(manager.get_messages("u").await.unwrap()[0].seen);
    }

    #[tokio::test]
    async fn sweep_prunes_only_expired_messages() {
        let manager = manager_with(AddressPolicy::default(), 0);
        let mut sub = manager.hub().subscribe(Topic::All);
        let old_date = (Utc::now() - chrono::Duration::hours(2)).to_rfc2822();
        let fresh_date = (Utc::now() - chrono::Duration::minutes(1)).to_rfc2822();
        manager
            .deliver(
                "origin",
                &addr("a@x.example"),
                &[addr("u@y.example")],
                format!("Date: {old_date}\r\nSubject: stale\r\n\r\nbody\r\n").as_bytes(),
            )
            .await
            .unwrap();
        manager
            .deliver(
                "origin",
                &addr("a@x.example"),
                &[addr("u@y.example")],
                format!("Date: {fresh_date}\r\nSubject: fresh\r\n\r\nbody\r\n").as_bytes(),
            )
            .await
            .unwrap();
        sub.try_recv().unwrap();
        sub.try_recv().unwrap();

        let pruned = manager
            .sweep_before(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_equal!(pruned, 1);
        let listing = manager.get_messages("u").await.unwrap();
        assert_equal!(listing.len(), 1);
        assert_equal!(listing[0].subject, "fresh");
        let event = sub.try_recv().unwrap();
        assert_equal!(event.kind, EventKind::Removed);
    }

    #[tokio::test]
    async fn concurrent_delivers_keep_per_mailbox_order() {
        let manager = manager_with(AddressPolicy::default(), 0);
        let mut sub = manager.hub().subscribe(Topic::Mailbox("u".to_string()));
        let mut tasks = vec![];
        for n in 0..10 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .deliver(
                        "origin",
                        &addr("a@x.example"),
                        &[addr("u@y.example")],
                        &source(&format!("c{n}")),
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let listing = manager.get_messages("u").await.unwrap();
        assert_equal!(listing.len(), 10);
        let ids: std::collections::HashSet<String> =
            listing.iter().map(|s| s.id.clone()).collect();
        assert_equal!(ids.len(), 10);

        // Each subscriber sees the new events in arrival (seq) order.
        let mut last_seq = 0;
        let mut events = 0;
        while let Some(event) = sub.try_recv() {
            let seq = event.summary.unwrap().seq;
            assert!(seq > last_seq);
            last_seq = seq;
            events += 1;
        }
        assert_equal!(events as u64 + sub.dropped(), 10);
    }
}
