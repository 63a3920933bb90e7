use crate::{
    headers, render_id, MailboxListing, MessageSummary, NewMessage, Store, StoreError,
    StoredMessage,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

/// Fully in-memory backend. Source bytes live on the heap and nothing
/// survives a restart. I/O errors are impossible; the only way an add
/// can fail is the soft cap on total held messages.
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    mailboxes: Mutex<HashMap<String, Arc<Mutex<Mailbox>>>>,
    total: AtomicUsize,
    /// Zero means unlimited.
    max_total: usize,
    /// Single-message size ceiling; zero means unlimited.
    max_message_bytes: usize,
}

#[derive(Default)]
struct Mailbox {
    next_seq: u64,
    messages: Vec<StoredMessage>,
}

impl MemoryStore {
    pub fn new(max_total: usize, max_message_bytes: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                mailboxes: Mutex::new(HashMap::new()),
                total: AtomicUsize::new(0),
                max_total,
                max_message_bytes,
            }),
        }
    }

    fn mailbox(&self, name: &str) -> Option<Arc<Mutex<Mailbox>>> {
        self.inner.mailboxes.lock().get(name).cloned()
    }

    fn mailbox_or_create(&self, name: &str) -> Arc<Mutex<Mailbox>> {
        self.inner
            .mailboxes
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// A mailbox exists only while it holds messages.
    fn forget_if_empty(&self, name: &str) {
        let mut mailboxes = self.inner.mailboxes.lock();
        if let Some(mbox) = mailboxes.get(name) {
            if mbox.lock().messages.is_empty() {
                mailboxes.remove(name);
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn add_message(
        &self,
        mailbox: &str,
        msg: NewMessage,
    ) -> Result<MessageSummary, StoreError> {
        msg.validate()?;
        if self.inner.max_message_bytes > 0 && msg.source.len() > self.inner.max_message_bytes {
            return Err(StoreError::TooLarge {
                size: msg.source.len() as u64,
                limit: self.inner.max_message_bytes as u64,
            });
        }
        if self.inner.max_total > 0 && self.inner.total.load(Ordering::Relaxed) >= self.inner.max_total
        {
            return Err(StoreError::StoreFull);
        }

        let hdr = headers::extract(&msg.source);
        let mbox = self.mailbox_or_create(mailbox);
        let summary = {
            let mut mbox = mbox.lock();
            mbox.next_seq += 1;
            let seq = mbox.next_seq;
            let summary = MessageSummary {
                mailbox: mailbox.to_string(),
                id: render_id(seq),
                seq,
                from: msg.from,
                to: msg.to,
                subject: hdr.subject,
                date: hdr
                    .date
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
                size: msg.source.len() as u64,
                seen: false,
            };
            mbox.messages.push(StoredMessage {
                summary: summary.clone(),
                source: msg.source,
            });
            summary
        };
        self.inner.total.fetch_add(1, Ordering::Relaxed);
        Ok(summary)
    }

    async fn get_message(&self, mailbox: &str, id: &str) -> Result<StoredMessage, StoreError> {
        let mbox = self
            .mailbox(mailbox)
            .ok_or_else(|| StoreError::not_found(mailbox, id))?;
        let mbox = mbox.lock();
        mbox.messages
            .iter()
            .find(|m| m.summary.id == id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(mailbox, id))
    }

    async fn get_messages(&self, mailbox: &str) -> Result<Vec<MessageSummary>, StoreError> {
        match self.mailbox(mailbox) {
            Some(mbox) => Ok(mbox.lock().messages.iter().map(|m| m.summary.clone()).collect()),
            None => Ok(vec![]),
        }
    }

    async fn mark_seen(&self, mailbox: &str, id: &str) -> Result<(), StoreError> {
        let mbox = self
            .mailbox(mailbox)
            .ok_or_else(|| StoreError::not_found(mailbox, id))?;
        let mut mbox = mbox.lock();
        let msg = mbox
            .messages
            .iter_mut()
            .find(|m| m.summary.id == id)
            .ok_or_else(|| StoreError::not_found(mailbox, id))?;
        msg.summary.seen = true;
        Ok(())
    }

    async fn remove_message(&self, mailbox: &str, id: &str) -> Result<bool, StoreError> {
        let Some(mbox) = self.mailbox(mailbox) else {
            return Ok(false);
        };
        let removed = {
            let mut mbox = mbox.lock();
            match mbox.messages.iter().position(|m| m.summary.id == id) {
                Some(idx) => {
                    mbox.messages.remove(idx);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.inner.total.fetch_sub(1, Ordering::Relaxed);
            self.forget_if_empty(mailbox);
        }
        Ok(removed)
    }

    async fn purge_messages(&self, mailbox: &str) -> Result<(), StoreError> {
        if let Some(mbox) = self.inner.mailboxes.lock().remove(mailbox) {
            let count = mbox.lock().messages.len();
            self.inner.total.fetch_sub(count, Ordering::Relaxed);
        }
        Ok(())
    }

    fn enumerate_mailboxes(&self, sender: Sender<MailboxListing>) -> Result<(), StoreError> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mailboxes: Vec<(String, Arc<Mutex<Mailbox>>)> = inner
                .mailboxes
                .lock()
                .iter()
                .map(|(name, mbox)| (name.clone(), mbox.clone()))
                .collect();
            for (name, mbox) in mailboxes {
                let listing = MailboxListing {
                    mailbox: name,
                    messages: mbox.lock().messages.iter().map(|m| m.summary.clone()).collect(),
                };
                if sender.send(listing).await.is_err() {
                    // Receiver gave up; stop walking.
                    break;
                }
            }
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
