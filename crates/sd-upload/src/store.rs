//! Local persistence of file records and revisions.
//!
//! Every write goes through a [`Transaction`]: changes are staged, then
//! either saved as a unit or dropped. Readers outside a transaction see the
//! last saved snapshot, never a half-applied one.
//!
//! [`LocalStore`] keeps the committed snapshot in memory and, when opened on
//! a path, persists it as JSON with an atomic write (temp file + rename).
//! In-memory ciphertext stays in the snapshot but is never written out.

use parking_lot::{Mutex, MutexGuard, RwLock};
use sd_core::{RevisionId, UploadId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{StoreError, UploadError};
use crate::model::{FileRecord, Revision};

pub trait Repository: Send + Sync {
    /// Start a write transaction. Writers are serialised.
    fn begin(&self) -> Box<dyn Transaction + '_>;

    /// Committed revision, read outside any transaction.
    fn revision(&self, id: &RevisionId) -> Option<Revision>;

    /// Committed file record, read outside any transaction.
    fn file(&self, upload: &UploadId) -> Option<FileRecord>;
}

pub trait Transaction {
    fn fetch_revision(&self, id: &RevisionId) -> Option<Revision>;
    fn fetch_file(&self, upload: &UploadId) -> Option<FileRecord>;
    fn put_revision(&mut self, revision: Revision);
    fn remove_revision(&mut self, id: &RevisionId);
    fn put_file(&mut self, file: FileRecord);

    /// Apply every staged change. On error nothing is applied.
    fn save(self: Box<Self>) -> Result<(), StoreError>;

    /// Drop every staged change.
    fn rollback(self: Box<Self>);
}

/// Run `f` in a transaction, saving on success and rolling back on error.
pub fn transact<T>(
    repo: &dyn Repository,
    f: impl FnOnce(&mut dyn Transaction) -> Result<T, UploadError>,
) -> Result<T, UploadError> {
    let mut tx = repo.begin();
    match f(tx.as_mut()) {
        Ok(value) => match tx.save() {
            Ok(()) => Ok(value),
            Err(e) => {
                warn!("store save failed, changes rolled back: {e}");
                Err(UploadError::Persistence(e))
            }
        },
        Err(e) => {
            tx.rollback();
            Err(e)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    files: BTreeMap<String, FileRecord>,
    revisions: BTreeMap<String, Revision>,
}

/// JSON-backed (or purely in-memory) repository
pub struct LocalStore {
    path: Option<PathBuf>,
    committed: RwLock<StoreData>,
    writer: Mutex<()>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            committed: RwLock::new(StoreData::default()),
            writer: Mutex::new(()),
        }
    }

    /// Load or create a store at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            StoreData::default()
        };
        debug!(
            path = %path.display(),
            files = data.files.len(),
            revisions = data.revisions.len(),
            "opened local store"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            committed: RwLock::new(data),
            writer: Mutex::new(()),
        })
    }

    /// All committed file records
    pub fn files(&self) -> Vec<FileRecord> {
        self.committed.read().files.values().cloned().collect()
    }

    fn flush(&self, data: &StoreData) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(data)?;

        // Atomic write: write to temp file, then rename
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl Repository for LocalStore {
    fn begin(&self) -> Box<dyn Transaction + '_> {
        Box::new(LocalTransaction {
            store: self,
            _writer: self.writer.lock(),
            files: BTreeMap::new(),
            revisions: BTreeMap::new(),
        })
    }

    fn revision(&self, id: &RevisionId) -> Option<Revision> {
        self.committed.read().revisions.get(id.as_str()).cloned()
    }

    fn file(&self, upload: &UploadId) -> Option<FileRecord> {
        self.committed.read().files.get(&upload.to_string()).cloned()
    }
}

struct LocalTransaction<'a> {
    store: &'a LocalStore,
    _writer: MutexGuard<'a, ()>,
    /// `None` marks a staged removal
    files: BTreeMap<String, Option<FileRecord>>,
    revisions: BTreeMap<String, Option<Revision>>,
}

impl Transaction for LocalTransaction<'_> {
    fn fetch_revision(&self, id: &RevisionId) -> Option<Revision> {
        match self.revisions.get(id.as_str()) {
            Some(staged) => staged.clone(),
            None => self.store.revision(id),
        }
    }

    fn fetch_file(&self, upload: &UploadId) -> Option<FileRecord> {
        match self.files.get(&upload.to_string()) {
            Some(staged) => staged.clone(),
            None => self.store.file(upload),
        }
    }

    fn put_revision(&mut self, revision: Revision) {
        self.revisions.insert(revision.id.to_string(), Some(revision));
    }

    fn remove_revision(&mut self, id: &RevisionId) {
        self.revisions.insert(id.to_string(), None);
    }

    fn put_file(&mut self, file: FileRecord) {
        self.files.insert(file.upload_id.to_string(), Some(file));
    }

    fn save(self: Box<Self>) -> Result<(), StoreError> {
        let LocalTransaction {
            store,
            _writer,
            files,
            revisions,
        } = *self;
        if files.is_empty() && revisions.is_empty() {
            return Ok(());
        }

        let mut next = store.committed.read().clone();
        for (key, staged) in files {
            match staged {
                Some(file) => next.files.insert(key, file),
                None => next.files.remove(&key),
            };
        }
        for (key, staged) in revisions {
            match staged {
                Some(rev) => next.revisions.insert(key, rev),
                None => next.revisions.remove(&key),
            };
        }

        store.flush(&next)?;
        *store.committed.write() = next;
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!(
            files = self.files.len(),
            revisions = self.revisions.len(),
            "transaction rolled back"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockContent;
    use sd_core::{FileState, NodeId, ShareId, UploadState};

    fn record(upload: UploadId) -> FileRecord {
        FileRecord {
            upload_id: upload,
            file_id: None,
            share: ShareId::new("S1"),
            parent: NodeId::new("P1"),
            name: "a.txt".into(),
            mime_type: "text/plain".into(),
            state: FileState::Draft,
            active_revision: None,
            revision_draft: None,
            size: 0,
        }
    }

    #[test]
    fn saved_changes_are_visible() {
        let store = LocalStore::in_memory();
        let upload = UploadId::new();
        let rev = Revision::placeholder(upload);

        transact(&store, |tx| {
            tx.put_file(record(upload));
            tx.put_revision(rev.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(store.revision(&rev.id), Some(rev));
        assert!(store.file(&upload).is_some());
    }

    #[test]
    fn failed_closure_leaves_snapshot_untouched() {
        let store = LocalStore::in_memory();
        let upload = UploadId::new();
        let rev = Revision::placeholder(upload);
        transact(&store, |tx| {
            tx.put_revision(rev.clone());
            Ok(())
        })
        .unwrap();

        let result: Result<(), _> = transact(&store, |tx| {
            let mut changed = tx.fetch_revision(&rev.id).unwrap();
            changed.state = UploadState::Sealed;
            tx.put_revision(changed);
            Err(UploadError::invalid_state("boom"))
        });

        assert!(result.is_err());
        assert_eq!(store.revision(&rev.id).unwrap().state, UploadState::None);
    }

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = LocalStore::in_memory();
        let rev = Revision::placeholder(UploadId::new());
        let mut tx = store.begin();
        tx.put_revision(rev.clone());
        assert!(tx.fetch_revision(&rev.id).is_some());
        assert!(store.revision(&rev.id).is_none());
        tx.remove_revision(&rev.id);
        assert!(tx.fetch_revision(&rev.id).is_none());
        tx.rollback();
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let upload = UploadId::new();
        {
            let store = LocalStore::open(&path).unwrap();
            transact(&store, |tx| {
                tx.put_file(record(upload));
                Ok(())
            })
            .unwrap();
        }
        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.file(&upload).unwrap().name, "a.txt");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn in_memory_ciphertext_stays_out_of_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let mut rev = Revision::placeholder(UploadId::new());
        rev.state = UploadState::Encrypted;
        rev.blocks = vec![crate::model::Block {
            index: 0,
            plain_size: 4,
            enc_size: 8,
            hash: "00".repeat(32),
            uploaded: false,
            upload_url: None,
            content: BlockContent::Memory(bytes::Bytes::from_static(b"secret!!")),
        }];
        let store = LocalStore::open(&path).unwrap();
        transact(&store, |tx| {
            tx.put_revision(rev.clone());
            Ok(())
        })
        .unwrap();

        // the live snapshot keeps the bytes for this process
        assert_eq!(store.revision(&rev.id).unwrap().blocks[0].content, rev.blocks[0].content);

        let json = std::fs::read_to_string(&path).unwrap();
        assert!(!json.contains("secret"));
        let reopened = LocalStore::open(&path).unwrap();
        assert_eq!(reopened.revision(&rev.id).unwrap().blocks[0].content, BlockContent::Released);
    }

    #[test]
    fn write_failure_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = LocalStore::open(&path).unwrap();
        let upload = UploadId::new();

        // a directory where the temp file should go makes the write fail
        std::fs::create_dir(path.with_extension("tmp")).unwrap();
        let result = transact(&store, |tx| {
            tx.put_file(record(upload));
            Ok(())
        });

        assert!(matches!(result, Err(UploadError::Persistence(_))));
        assert!(store.file(&upload).is_none());
    }
}
