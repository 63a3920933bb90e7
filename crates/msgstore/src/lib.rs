use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc::Sender;

pub mod headers;
pub mod local_disk;
pub mod memory;

pub use local_disk::LocalDiskStore;
pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no message {id} in mailbox {mailbox}")]
    NotFound { mailbox: String, id: String },

    #[error("store is full")]
    StoreFull,

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("malformed message: {0}")]
    BadInput(String),

    #[error("storage I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn not_found(mailbox: &str, id: &str) -> Self {
        Self::NotFound {
            mailbox: mailbox.to_string(),
            id: id.to_string(),
        }
    }
}

/// Headers-only view of a captured message. This is what listings and
/// the mailbox index carry; the raw source is loaded separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessageSummary {
    pub mailbox: String,
    pub id: String,
    /// Arrival sequence within the mailbox. Listing order sorts on this,
    /// not on the rendered id.
    pub seq: u64,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub date: DateTime<Utc>,
    pub size: u64,
    pub seen: bool,
}

/// A full message: the summary plus the verbatim source bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub summary: MessageSummary,
    pub source: Vec<u8>,
}

/// Envelope data captured on the ingress path, before the store has
/// assigned an id or inspected the headers.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from: String,
    pub to: Vec<String>,
    pub source: Vec<u8>,
}

impl NewMessage {
    /// The stored source must be newline terminated; anything else was
    /// truncated somewhere between DATA capture and here.
    fn validate(&self) -> Result<(), StoreError> {
        if !self.source.ends_with(b"\n") {
            return Err(StoreError::BadInput(
                "source is not newline terminated".to_string(),
            ));
        }
        Ok(())
    }
}

/// One mailbox worth of summaries, produced by `Store::enumerate_mailboxes`.
/// The snapshot is internally consistent: it never exposes a message in a
/// partially-constructed state.
#[derive(Debug, Clone)]
pub struct MailboxListing {
    pub mailbox: String,
    pub messages: Vec<MessageSummary>,
}

/// Render a message id from its arrival sequence and a random
/// discriminator. The discriminator keeps ids unique across a
/// crash-recovered sequence counter.
pub fn render_id(seq: u64) -> String {
    let suffix: u32 = rand::random();
    format!("{seq:06}-{suffix:08x}")
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Assign an id, persist source and summary, and return the summary.
    /// Concurrent adds to distinct mailboxes may proceed in parallel;
    /// adds within one mailbox are serialized so that ids are monotone
    /// in arrival order.
    async fn add_message(
        &self,
        mailbox: &str,
        msg: NewMessage,
    ) -> Result<MessageSummary, StoreError>;

    /// Load the full message, including its source bytes.
    async fn get_message(&self, mailbox: &str, id: &str) -> Result<StoredMessage, StoreError>;

    /// Headers-only summaries sorted by arrival, oldest first.
    /// An unknown mailbox yields an empty list, not an error.
    async fn get_messages(&self, mailbox: &str) -> Result<Vec<MessageSummary>, StoreError>;

    /// Idempotent; `NotFound` if the message does not exist.
    async fn mark_seen(&self, mailbox: &str, id: &str) -> Result<(), StoreError>;

    /// Returns true if the message existed and was removed, false if it
    /// was already gone. "Already gone" is not an error.
    async fn remove_message(&self, mailbox: &str, id: &str) -> Result<bool, StoreError>;

    /// Remove every message in the mailbox. Succeeds on empty.
    async fn purge_messages(&self, mailbox: &str) -> Result<(), StoreError>;

    /// Walk every mailbox, emitting one `MailboxListing` per mailbox to
    /// the provided channel. Dropping the receiver stops the walk.
    /// Mailboxes mutated during the walk may or may not be observed,
    /// but each listing is a consistent snapshot.
    fn enumerate_mailboxes(&self, sender: Sender<MailboxListing>) -> Result<(), StoreError>;

    /// Flush and release any backend resources.
    async fn shutdown(&self) -> Result<(), StoreError>;
}

/// Parameters handed to a storage constructor. `path` is required by
/// disk-backed stores and ignored by in-memory ones.
#[derive(Debug, Clone, Default)]
pub struct StoreParams {
    pub path: Option<PathBuf>,
    /// fsync message data before rename.
    pub flush: bool,
    /// Soft cap on total messages for stores without a natural limit.
    /// Zero means unlimited.
    pub max_total_messages: usize,
    /// Ceiling on a single message's source size, enforced by
    /// `add_message` with `TooLarge`. Zero means unlimited.
    pub max_message_bytes: usize,
}

pub type StoreConstructor = fn(&StoreParams) -> anyhow::Result<Arc<dyn Store>>;

static REGISTRY: OnceLock<Mutex<HashMap<String, StoreConstructor>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, StoreConstructor>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a storage backend constructor under a type name.
/// Later registrations replace earlier ones.
pub fn register_store(kind: &str, constructor: StoreConstructor) {
    registry()
        .lock()
        .unwrap()
        .insert(kind.to_string(), constructor);
}

/// Construct a store by registered type name.
pub fn make_store(kind: &str, params: &StoreParams) -> anyhow::Result<Arc<dyn Store>> {
    let constructor = registry()
        .lock()
        .unwrap()
        .get(kind)
        .copied()
        .ok_or_else(|| anyhow::anyhow!("no storage backend registered as '{kind}'"))?;
    constructor(params)
}

/// Register the two reference backends under their conventional names.
pub fn register_builtin_stores() {
    register_store("memory", |params| {
        Ok(Arc::new(MemoryStore::new(
            params.max_total_messages,
            params.max_message_bytes,
        )))
    });
    register_store("file", |params| {
        let path = params
            .path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("file storage requires a path"))?;
        Ok(Arc::new(LocalDiskStore::new(
            path,
            params.flush,
            params.max_message_bytes,
        )?))
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    #[test]
    fn id_rendering_is_sortable_within_width() {
        let a = render_id(1);
        let b = render_id(2);
        assert_equal!(&a[..6], "000001");
        assert_equal!(&b[..6], "000002");
        assert!(a < b);
    }

    #[test]
    fn registry_round_trip() {
        register_builtin_stores();
        let store = make_store("memory", &StoreParams::default()).unwrap();
        drop(store);
        assert!(make_store("bogus", &StoreParams::default()).is_err());
        assert!(make_store("file", &StoreParams::default()).is_err());
    }

    #[test]
    fn unterminated_source_is_rejected() {
        let msg = NewMessage {
            from: "a@example.com".to_string(),
            to: vec!["b@example.com".to_string()],
            source: b"Subject: x\r\n\r\nbody".to_vec(),
        };
        assert!(matches!(msg.validate(), Err(StoreError::BadInput(_))));
    }
}
