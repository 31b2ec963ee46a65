//! Shared fixtures for sd-upload integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use sd_core::config::UploadConfig;
use sd_core::{RevisionId, UploadId};
use sd_crypto::NodeKey;
use sd_upload::model::{FileRecord, Revision};
use sd_upload::{
    ContentSource, FileDraft, LocalStore, LoopbackDrive, ParentFolder, Repository, Signer, StageContext,
    StoreError, Transaction,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Harness {
    pub drive: Arc<LoopbackDrive>,
    pub repo: Arc<FlakyRepository>,
    pub ctx: StageContext,
    pub parent_key: NodeKey,
    pub signer: Signer,
}

impl Harness {
    pub fn new(config: UploadConfig) -> Self {
        let drive = Arc::new(LoopbackDrive::new());
        let repo = Arc::new(FlakyRepository::default());
        let ctx = StageContext::new(drive.clone(), drive.clone(), repo.clone(), config);
        Self {
            drive,
            repo,
            ctx,
            parent_key: sd_crypto::generate_key(),
            signer: Signer {
                address: "alice@example.com".into(),
                key: sd_crypto::generate_key(),
            },
        }
    }

    pub fn small_blocks(max_block_size: usize) -> Self {
        Self::new(UploadConfig {
            max_block_size,
            ..Default::default()
        })
    }

    pub fn parent(&self) -> ParentFolder {
        ParentFolder::new("S1", "P1", self.parent_key.clone()).unwrap()
    }

    pub fn draft(&self, name: &str, data: &[u8]) -> FileDraft {
        FileDraft::new_file(
            self.parent(),
            name,
            ContentSource::Memory(data.to_vec().into()),
            self.signer.clone(),
        )
    }

    /// Occupy `name` in the parent folder.
    pub fn take_name(&self, name: &str) {
        let parent = self.parent();
        let hash = sd_crypto::name_hash(&parent.hash_key, name);
        self.drive.take_name(&parent.share, &parent.node, hash);
    }

    /// Fetch every stored block of the draft's revision and decrypt it.
    pub fn download(&self, draft: &FileDraft) -> Vec<u8> {
        let file_id = draft.file_id.as_ref().unwrap();
        let mut out = Vec::new();
        for index in 0..draft.revision.blocks.len() as u32 {
            let blob = self.drive.blob(&draft.revision.id, index).unwrap();
            out.extend(sd_crypto::decrypt_block(&draft.content_key, index, file_id.as_str(), &blob).unwrap());
        }
        out
    }
}

/// Local store whose saves can be made to fail.
pub struct FlakyRepository {
    inner: LocalStore,
    fail_saves: AtomicBool,
    saves: Mutex<usize>,
}

impl Default for FlakyRepository {
    fn default() -> Self {
        Self {
            inner: LocalStore::in_memory(),
            fail_saves: AtomicBool::new(false),
            saves: Mutex::new(0),
        }
    }
}

impl FlakyRepository {
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

struct FlakyTransaction<'a> {
    inner: Box<dyn Transaction + 'a>,
    fail: bool,
    saves: &'a Mutex<usize>,
}

impl Repository for FlakyRepository {
    fn begin(&self) -> Box<dyn Transaction + '_> {
        Box::new(FlakyTransaction {
            inner: self.inner.begin(),
            fail: self.fail_saves.load(Ordering::SeqCst),
            saves: &self.saves,
        })
    }

    fn revision(&self, id: &RevisionId) -> Option<Revision> {
        self.inner.revision(id)
    }

    fn file(&self, upload: &UploadId) -> Option<FileRecord> {
        self.inner.file(upload)
    }
}

impl Transaction for FlakyTransaction<'_> {
    fn fetch_revision(&self, id: &RevisionId) -> Option<Revision> {
        self.inner.fetch_revision(id)
    }

    fn fetch_file(&self, upload: &UploadId) -> Option<FileRecord> {
        self.inner.fetch_file(upload)
    }

    fn put_revision(&mut self, revision: Revision) {
        self.inner.put_revision(revision)
    }

    fn remove_revision(&mut self, id: &RevisionId) {
        self.inner.remove_revision(id)
    }

    fn put_file(&mut self, file: FileRecord) {
        self.inner.put_file(file)
    }

    fn save(self: Box<Self>) -> Result<(), StoreError> {
        let this = *self;
        if this.fail {
            this.inner.rollback();
            return Err(StoreError::Unavailable("injected save failure".into()));
        }
        this.inner.save()?;
        *this.saves.lock() += 1;
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        self.inner.rollback()
    }
}
