use crate::{
    headers, render_id, MailboxListing, MessageSummary, NewMessage, Store, StoreError,
    StoredMessage,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::sync::mpsc::Sender;

const INDEX_FILE: &str = "index.bin";
const INDEX_VERSION: u32 = 1;
const RAW_EXT: &str = "eml";
const META_EXT: &str = "meta";

/// On-disk backend. Each mailbox is a directory named by the hex digest
/// of its canonical name, bucketed under a two-character prefix so no
/// directory accumulates an unbounded child count:
///
/// ```text
/// <root>/<hh>/<digest>/<id>.eml    raw source, verbatim
/// <root>/<hh>/<digest>/<id>.meta   bincode MessageSummary
/// <root>/<hh>/<digest>/index.bin   bincode MailboxIndex
/// ```
///
/// Every write lands in a temp file first and is renamed into place, so
/// readers observe either the old or the new state, never a torn one.
/// The digest keeps characters like `:` out of paths on every platform.
pub struct LocalDiskStore {
    root: PathBuf,
    flush: bool,
    /// Single-message size ceiling; zero means unlimited.
    max_message_bytes: usize,
    locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MailboxIndex {
    version: u32,
    mailbox: String,
    next_seq: u64,
    entries: Vec<MessageSummary>,
}

impl MailboxIndex {
    fn empty(mailbox: &str) -> Self {
        Self {
            version: INDEX_VERSION,
            mailbox: mailbox.to_string(),
            next_seq: 0,
            entries: vec![],
        }
    }
}

impl LocalDiskStore {
    pub fn new(root: &Path, flush: bool, max_message_bytes: usize) -> anyhow::Result<Self> {
        fs::create_dir_all(root)
            .map_err(|err| anyhow::anyhow!("creating storage root {}: {err}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            flush,
            max_message_bytes,
            locks: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Serializes mutations within one mailbox. Reads go lock-free and
    /// rely on rename atomicity instead.
    fn mailbox_lock(&self, mailbox: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(mailbox.to_string())
            .or_default()
            .clone()
    }

    fn mailbox_dir(&self, mailbox: &str) -> PathBuf {
        let digest = hex_digest(mailbox);
        self.root.join(&digest[..2]).join(&digest)
    }
}

fn hex_digest(name: &str) -> String {
    let digest = Sha256::digest(name.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn persist_file(dir: &Path, file_name: &str, data: &[u8], flush: bool) -> Result<(), StoreError> {
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    if flush {
        temp.as_file_mut().sync_data()?;
    }
    temp.persist(dir.join(file_name))
        .map_err(|err| StoreError::Io(err.error))?;
    Ok(())
}

fn save_index(dir: &Path, index: &MailboxIndex, flush: bool) -> Result<(), StoreError> {
    let data = bincode::serialize(index)
        .map_err(|err| StoreError::Other(anyhow::anyhow!("encoding index: {err}")))?;
    persist_file(dir, INDEX_FILE, &data, flush)
}

/// Load a mailbox index, falling back to a directory scan of the
/// per-message sidecars when the index is missing or unreadable.
fn load_index(dir: &Path, mailbox: &str) -> Result<MailboxIndex, StoreError> {
    match fs::read(dir.join(INDEX_FILE)) {
        Ok(data) => match bincode::deserialize::<MailboxIndex>(&data) {
            Ok(index) if index.version == INDEX_VERSION => return Ok(index),
            Ok(index) => {
                tracing::warn!(
                    "index for {mailbox} has version {}, rebuilding",
                    index.version
                );
            }
            Err(err) => {
                tracing::warn!("index for {mailbox} is unreadable ({err}), rebuilding");
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    rebuild_index(dir, mailbox)
}

fn rebuild_index(dir: &Path, mailbox: &str) -> Result<MailboxIndex, StoreError> {
    let mut index = MailboxIndex::empty(mailbox);
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
            continue;
        }
        match fs::read(&path).map_err(StoreError::from).and_then(|data| {
            bincode::deserialize::<MessageSummary>(&data)
                .map_err(|err| StoreError::BadInput(format!("sidecar {}: {err}", path.display())))
        }) {
            Ok(summary) => index.entries.push(summary),
            Err(err) => {
                tracing::warn!("skipping unreadable sidecar {}: {err}", path.display());
            }
        }
    }
    index.entries.sort_by_key(|s| s.seq);
    index.next_seq = index.entries.last().map(|s| s.seq).unwrap_or(0);
    Ok(index)
}

fn remove_mailbox_dir(dir: &Path) {
    // Only succeeds once the mailbox directory is empty; the prefix
    // directory likewise. Failure is unremarkable.
    fs::remove_dir(dir).ok();
    if let Some(prefix) = dir.parent() {
        fs::remove_dir(prefix).ok();
    }
}

#[async_trait]
impl Store for LocalDiskStore {
    async fn add_message(
        &self,
        mailbox: &str,
        msg: NewMessage,
    ) -> Result<MessageSummary, StoreError> {
        msg.validate()?;
        if self.max_message_bytes > 0 && msg.source.len() > self.max_message_bytes {
            return Err(StoreError::TooLarge {
                size: msg.source.len() as u64,
                limit: self.max_message_bytes as u64,
            });
        }
        let _guard = self.mailbox_lock(mailbox).lock_owned().await;
        let dir = self.mailbox_dir(mailbox);
        let mailbox = mailbox.to_string();
        let flush = self.flush;

        tokio::task::spawn_blocking(move || -> Result<MessageSummary, StoreError> {
            fs::create_dir_all(&dir)?;
            let mut index = load_index(&dir, &mailbox)?;
            let seq = index.next_seq + 1;
            let id = render_id(seq);
            let hdr = headers::extract(&msg.source);
            let summary = MessageSummary {
                mailbox: mailbox.clone(),
                id: id.clone(),
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

            persist_file(&dir, &format!("{id}.{RAW_EXT}"), &msg.source, flush)?;
            let meta = bincode::serialize(&summary)
                .map_err(|err| StoreError::Other(anyhow::anyhow!("encoding sidecar: {err}")))?;
            persist_file(&dir, &format!("{id}.{META_EXT}"), &meta, flush)?;

            index.next_seq = seq;
            index.entries.push(summary.clone());
            save_index(&dir, &index, flush)?;
            Ok(summary)
        })
        .await
        .map_err(anyhow::Error::from)?
    }

    async fn get_message(&self, mailbox: &str, id: &str) -> Result<StoredMessage, StoreError> {
        let dir = self.mailbox_dir(mailbox);
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || -> Result<StoredMessage, StoreError> {
            let index = load_index(&dir, &mailbox)?;
            let summary = index
                .entries
                .into_iter()
                .find(|s| s.id == id)
                .ok_or_else(|| StoreError::not_found(&mailbox, &id))?;
            let source = match fs::read(dir.join(format!("{id}.{RAW_EXT}"))) {
                Ok(source) => source,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Err(StoreError::not_found(&mailbox, &id));
                }
                Err(err) => return Err(err.into()),
            };
            Ok(StoredMessage { summary, source })
        })
        .await
        .map_err(anyhow::Error::from)?
    }

    async fn get_messages(&self, mailbox: &str) -> Result<Vec<MessageSummary>, StoreError> {
        let dir = self.mailbox_dir(mailbox);
        let mailbox = mailbox.to_string();
        tokio::task::spawn_blocking(move || Ok(load_index(&dir, &mailbox)?.entries))
            .await
            .map_err(anyhow::Error::from)?
    }

    async fn mark_seen(&self, mailbox: &str, id: &str) -> Result<(), StoreError> {
        let _guard = self.mailbox_lock(mailbox).lock_owned().await;
        let dir = self.mailbox_dir(mailbox);
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        let flush = self.flush;
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut index = load_index(&dir, &mailbox)?;
            let entry = index
                .entries
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or_else(|| StoreError::not_found(&mailbox, &id))?;
            if entry.seen {
                return Ok(());
            }
            entry.seen = true;
            let meta = bincode::serialize(entry)
                .map_err(|err| StoreError::Other(anyhow::anyhow!("encoding sidecar: {err}")))?;
            persist_file(&dir, &format!("{id}.{META_EXT}"), &meta, flush)?;
            save_index(&dir, &index, flush)
        })
        .await
        .map_err(anyhow::Error::from)?
    }

    async fn remove_message(&self, mailbox: &str, id: &str) -> Result<bool, StoreError> {
        let _guard = self.mailbox_lock(mailbox).lock_owned().await;
        let dir = self.mailbox_dir(mailbox);
        let mailbox = mailbox.to_string();
        let id = id.to_string();
        let flush = self.flush;
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let mut index = load_index(&dir, &mailbox)?;
            let Some(pos) = index.entries.iter().position(|s| s.id == id) else {
                return Ok(false);
            };
            index.entries.remove(pos);
            fs::remove_file(dir.join(format!("{id}.{RAW_EXT}"))).ok();
            fs::remove_file(dir.join(format!("{id}.{META_EXT}"))).ok();
            if index.entries.is_empty() {
                fs::remove_file(dir.join(INDEX_FILE)).ok();
                remove_mailbox_dir(&dir);
            } else {
                save_index(&dir, &index, flush)?;
            }
            Ok(true)
        })
        .await
        .map_err(anyhow::Error::from)?
    }

    async fn purge_messages(&self, mailbox: &str) -> Result<(), StoreError> {
        let _guard = self.mailbox_lock(mailbox).lock_owned().await;
        let dir = self.mailbox_dir(mailbox);
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            remove_mailbox_dir(&dir);
            Ok(())
        })
        .await
        .map_err(anyhow::Error::from)?
    }

    fn enumerate_mailboxes(&self, sender: Sender<MailboxListing>) -> Result<(), StoreError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let Ok(prefixes) = fs::read_dir(&root) else {
                return;
            };
            for prefix in prefixes.flatten() {
                if !prefix.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                let Ok(mailboxes) = fs::read_dir(prefix.path()) else {
                    continue;
                };
                for mbox_dir in mailboxes.flatten() {
                    let dir = mbox_dir.path();
                    if !dir.is_dir() {
                        continue;
                    }
                    // The directory name is a digest; the real name lives
                    // in the index. A mailbox whose index is gone cannot
                    // be named here and is skipped.
                    let index = match fs::read(dir.join(INDEX_FILE))
                        .map_err(StoreError::from)
                        .and_then(|data| {
                            bincode::deserialize::<MailboxIndex>(&data).map_err(|err| {
                                StoreError::BadInput(format!("index {}: {err}", dir.display()))
                            })
                        }) {
                        Ok(index) => index,
                        Err(err) => {
                            tracing::warn!("skipping mailbox at {}: {err}", dir.display());
                            continue;
                        }
                    };
                    if index.entries.is_empty() {
                        continue;
                    }
                    let listing = MailboxListing {
                        mailbox: index.mailbox,
                        messages: index.entries,
                    };
                    if sender.blocking_send(listing).is_err() {
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn msg(n: u32) -> NewMessage {
        NewMessage {
            from: "sender@example.com".to_string(),
            to: vec!["u@example.com".to_string()],
            source: format!("Subject: msg {n}\r\n\r\nbody {n}\r\n").into_bytes(),
        }
    }

    #[tokio::test]
    async fn add_get_round_trip() {
        let location = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
        let summary = store.add_message("u@example.com", msg(7)).await.unwrap();
        assert_equal!(summary.seq, 1);
        assert_equal!(summary.subject, "msg 7");

        let loaded = store.get_message("u@example.com", &summary.id).await.unwrap();
        assert_equal!(loaded.source, b"Subject: msg 7\r\n\r\nbody 7\r\n".to_vec());
        assert_equal!(loaded.summary, summary);
    }

    #[tokio::test]
    async fn listing_survives_reopen() {
        let location = tempfile::tempdir().unwrap();
        {
            let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
            for n in 0..3 {
                store.add_message("u", msg(n)).await.unwrap();
            }
        }
        let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
        let listing = store.get_messages("u").await.unwrap();
        assert_equal!(listing.len(), 3);
        assert_equal!(listing[0].subject, "msg 0");
        assert_equal!(listing[2].subject, "msg 2");
    }

    #[tokio::test]
    async fn missing_index_is_rebuilt_from_sidecars() {
        let location = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
        for n in 0..3 {
            store.add_message("u", msg(n)).await.unwrap();
        }
        let dir = store.mailbox_dir("u");
        fs::remove_file(dir.join(INDEX_FILE)).unwrap();

        let listing = store.get_messages("u").await.unwrap();
        assert_equal!(listing.len(), 3);
        for pair in listing.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
        // Sequence numbering continues past the rebuilt high-water mark.
        let summary = store.add_message("u", msg(9)).await.unwrap();
        assert_equal!(summary.seq, 4);
    }

    #[tokio::test]
    async fn mark_seen_survives_reopen() {
        let location = tempfile::tempdir().unwrap();
        let id = {
            let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
            let summary = store.add_message("u", msg(1)).await.unwrap();
            store.mark_seen("u", &summary.id).await.unwrap();
            summary.id
        };
        let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
        let listing = store.get_messages("u").await.unwrap();
        assert_equal!(listing[0].id, id);
        assert!(listing[0].seen);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_cleans_up() {
        let location = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
        let summary = store.add_message("u", msg(1)).await.unwrap();
        let dir = store.mailbox_dir("u");
        assert!(dir.exists());

        assert!(store.remove_message("u", &summary.id).await.unwrap());
        assert!(!store.remove_message("u", &summary.id).await.unwrap());
        assert!(!dir.exists());
        assert!(matches!(
            store.get_message("u", &summary.id).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn purge_removes_everything() {
        let location = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
        for n in 0..4 {
            store.add_message("u", msg(n)).await.unwrap();
        }
        store.purge_messages("u").await.unwrap();
        assert_equal!(store.get_messages("u").await.unwrap(), vec![]);
        assert!(!store.mailbox_dir("u").exists());
        store.purge_messages("u").await.unwrap();
    }

    #[tokio::test]
    async fn oversize_message_is_refused() {
        let location = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(location.path(), false, 16).unwrap();
        let err = store.add_message("u", msg(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { limit: 16, .. }));
        assert!(!store.mailbox_dir("u").exists());
    }

    #[tokio::test]
    async fn enumeration_reports_named_mailboxes() {
        let location = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(location.path(), false, 0).unwrap();
        store.add_message("alpha", msg(1)).await.unwrap();
        store.add_message("beta", msg(2)).await.unwrap();
        store.add_message("beta", msg(3)).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        store.enumerate_mailboxes(tx).unwrap();
        let mut seen = HashMap::new();
        while let Some(listing) = rx.recv().await {
            seen.insert(listing.mailbox.clone(), listing.messages.len());
        }
        assert_equal!(seen.get("alpha"), Some(&1));
        assert_equal!(seen.get("beta"), Some(&2));
    }
}
