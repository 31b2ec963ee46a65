//! In-process drive backend.
//!
//! Implements both [`DriveApi`] and [`BlockTransport`] against in-memory
//! state, enforcing the server rules the pipeline depends on: name hash
//! uniqueness per folder, manifest/blob agreement on commit, possession
//! proof before commit, and single commit per revision. Fault injection
//! hooks let tests and the CLI demo exercise the recovery paths.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use bytes::Bytes;
use parking_lot::Mutex;
use sd_core::{FileId, NodeId, RevisionId, ShareId};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, trace};

use crate::api::{
    codes, ApiError, BlockTransport, BlockUploadLink, BlockUploadRequest, CommitRequest, CreateFileRequest,
    CreatedFile, DriveApi, VerificationData, VerificationSubmission,
};

const CODE_LEN: usize = 32;

#[derive(Default)]
pub struct LoopbackDrive {
    state: Mutex<DriveState>,
}

#[derive(Default)]
struct DriveState {
    /// Taken name hashes, keyed by `share/parent`
    names: HashMap<String, HashSet<String>>,
    files: HashMap<FileId, RemoteFile>,
    revisions: HashMap<RevisionId, RemoteRevision>,
    links: HashMap<String, PendingBlock>,
    blobs: HashMap<(RevisionId, u32), StoredBlob>,
    next_id: u64,
    puts: usize,
    commits: usize,
    faults: Faults,
}

struct RemoteFile {
    content_key_packet: String,
}

struct RemoteRevision {
    file: FileId,
    declared: BTreeMap<u32, String>,
    code: Option<Vec<u8>>,
    verified: BTreeSet<u32>,
    committed: bool,
    xattrs: Option<String>,
}

struct PendingBlock {
    revision: RevisionId,
    index: u32,
    hash: String,
}

struct StoredBlob {
    hash: String,
    data: Bytes,
}

#[derive(Default)]
struct Faults {
    stale_availability: bool,
    fail_availability: bool,
    fail_puts: HashSet<u32>,
    fail_commit: Option<u32>,
    lose_commit_response: bool,
    commit_response_delay: Option<Duration>,
    put_delay: Option<Duration>,
}

fn folder_key(share: &ShareId, parent: &NodeId) -> String {
    format!("{share}/{parent}")
}

fn not_found(what: impl std::fmt::Display) -> ApiError {
    ApiError::response(codes::NOT_FOUND, format!("{what} not found"))
}

impl DriveState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{}", self.next_id)
    }

    fn new_revision(&mut self, file: &FileId) -> RevisionId {
        let id = RevisionId::new(self.next("R"));
        self.revisions.insert(
            id.clone(),
            RemoteRevision {
                file: file.clone(),
                declared: BTreeMap::new(),
                code: None,
                verified: BTreeSet::new(),
                committed: false,
                xattrs: None,
            },
        );
        id
    }

    fn open_revision(&mut self, id: &RevisionId) -> Result<&mut RemoteRevision, ApiError> {
        let revision = self.revisions.get_mut(id).ok_or_else(|| not_found(format!("revision {id}")))?;
        if revision.committed {
            return Err(ApiError::response(
                codes::REVISION_ALREADY_COMMITTED,
                format!("revision {id} is already committed"),
            ));
        }
        Ok(revision)
    }

    fn commit(&mut self, request: &CommitRequest) -> Result<(), ApiError> {
        let blobs_match = {
            let revision = self.open_revision(&request.revision_id)?;
            let declared: Vec<&String> = revision.declared.values().collect();
            declared.len() == request.block_hashes.len()
                && revision.declared.keys().copied().eq(0..request.block_hashes.len() as u32)
                && declared.iter().zip(&request.block_hashes).all(|(d, r)| *d == r)
        };
        let stored = request.block_hashes.iter().enumerate().all(|(i, hash)| {
            self.blobs
                .get(&(request.revision_id.clone(), i as u32))
                .is_some_and(|blob| &blob.hash == hash)
        });
        if !blobs_match || !stored {
            return Err(ApiError::response(
                codes::BLOCKS_UPLOADED_WRONGLY,
                "manifest does not match uploaded blocks",
            ));
        }

        let revision = self.open_revision(&request.revision_id)?;
        if !request.block_hashes.is_empty() && revision.verified.is_empty() {
            return Err(ApiError::response(codes::VERIFICATION_REQUIRED, "block verification required"));
        }
        revision.committed = true;
        revision.xattrs = request.xattrs.clone();
        Ok(())
    }
}

impl LoopbackDrive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `hash` as used by a child of `parent`.
    pub fn take_name(&self, share: &ShareId, parent: &NodeId, hash: impl Into<String>) {
        self.state
            .lock()
            .names
            .entry(folder_key(share, parent))
            .or_default()
            .insert(hash.into());
    }

    /// The next availability check reports every hash as free.
    pub fn stale_availability_once(&self) {
        self.state.lock().faults.stale_availability = true;
    }

    pub fn fail_availability(&self, fail: bool) {
        self.state.lock().faults.fail_availability = fail;
    }

    /// The next PUT of block `index` fails.
    pub fn fail_next_put(&self, index: u32) {
        self.state.lock().faults.fail_puts.insert(index);
    }

    /// Every PUT sleeps this long before storing.
    pub fn delay_puts(&self, delay: Duration) {
        self.state.lock().faults.put_delay = Some(delay);
    }

    /// The next commit is rejected with `code`.
    /// The next commit is applied, but its response arrives `delay` later.
    pub fn delay_next_commit_response(&self, delay: Duration) {
        self.state.lock().faults.commit_response_delay = Some(delay);
    }

    pub fn fail_next_commit(&self, code: u32) {
        self.state.lock().faults.fail_commit = Some(code);
    }

    /// The next commit is applied but its response is lost.
    pub fn lose_next_commit_response(&self) {
        self.state.lock().faults.lose_commit_response = true;
    }

    /// Forget a stored block, as if its upload never landed.
    pub fn drop_blob(&self, revision: &RevisionId, index: u32) {
        self.state.lock().blobs.remove(&(revision.clone(), index));
    }

    pub fn blob(&self, revision: &RevisionId, index: u32) -> Option<Bytes> {
        self.state
            .lock()
            .blobs
            .get(&(revision.clone(), index))
            .map(|b| b.data.clone())
    }

    pub fn put_count(&self) -> usize {
        self.state.lock().puts
    }

    pub fn commit_count(&self) -> usize {
        self.state.lock().commits
    }

    pub fn stored_block_count(&self, revision: &RevisionId) -> usize {
        self.state.lock().blobs.keys().filter(|(r, _)| r == revision).count()
    }

    pub fn is_committed(&self, revision: &RevisionId) -> bool {
        self.state.lock().revisions.get(revision).is_some_and(|r| r.committed)
    }

    pub fn verified_blocks(&self, revision: &RevisionId) -> Vec<u32> {
        self.state
            .lock()
            .revisions
            .get(revision)
            .map(|r| r.verified.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Register a file draft without name or key checks.
    pub fn create_draft_for_tests(&self, share: &ShareId, parent: &NodeId) -> CreatedFile {
        let mut state = self.state.lock();
        let file_id = FileId::new(state.next("F"));
        let hash = format!("test-{file_id}");
        state.names.entry(folder_key(share, parent)).or_default().insert(hash);
        state.files.insert(
            file_id.clone(),
            RemoteFile {
                content_key_packet: String::new(),
            },
        );
        let revision_id = state.new_revision(&file_id);
        CreatedFile { file_id, revision_id }
    }
}

#[async_trait]
impl DriveApi for LoopbackDrive {
    async fn check_available_hashes(
        &self,
        share: &ShareId,
        parent: &NodeId,
        hashes: Vec<String>,
    ) -> Result<Vec<String>, ApiError> {
        let mut state = self.state.lock();
        if state.faults.fail_availability {
            return Err(ApiError::Transport("availability service unreachable".into()));
        }
        if std::mem::take(&mut state.faults.stale_availability) {
            return Ok(hashes);
        }
        let taken = state.names.get(&folder_key(share, parent));
        Ok(hashes
            .into_iter()
            .filter(|h| !taken.is_some_and(|t| t.contains(h)))
            .collect())
    }

    async fn create_file(&self, request: CreateFileRequest) -> Result<CreatedFile, ApiError> {
        let mut state = self.state.lock();
        let key = folder_key(&request.share_id, &request.parent_link_id);
        if state.names.get(&key).is_some_and(|t| t.contains(&request.name_hash)) {
            return Err(ApiError::response(codes::NAME_ALREADY_EXISTS, "a file with that name already exists"));
        }
        state.names.entry(key).or_default().insert(request.name_hash);

        let file_id = FileId::new(state.next("F"));
        state.files.insert(
            file_id.clone(),
            RemoteFile {
                content_key_packet: request.content_key_packet,
            },
        );
        let revision_id = state.new_revision(&file_id);
        debug!(file = %file_id, revision = %revision_id, "loopback file created");
        Ok(CreatedFile { file_id, revision_id })
    }

    async fn create_revision(&self, _share: &ShareId, file: &FileId) -> Result<RevisionId, ApiError> {
        let mut state = self.state.lock();
        if !state.files.contains_key(file) {
            return Err(not_found(format!("file {file}")));
        }
        Ok(state.new_revision(file))
    }

    async fn request_block_upload(&self, request: BlockUploadRequest) -> Result<BlockUploadLink, ApiError> {
        let mut state = self.state.lock();
        state
            .open_revision(&request.revision_id)?
            .declared
            .insert(request.index, request.hash.clone());
        let url = format!("loopback://{}/{}/{}", request.revision_id, request.index, state.next(""));
        state.links.insert(
            url.clone(),
            PendingBlock {
                revision: request.revision_id,
                index: request.index,
                hash: request.hash,
            },
        );
        Ok(BlockUploadLink { url })
    }

    async fn request_verification(
        &self,
        _share: &ShareId,
        file: &FileId,
        revision: &RevisionId,
    ) -> Result<VerificationData, ApiError> {
        let mut state = self.state.lock();
        let packet = state
            .files
            .get(file)
            .map(|f| f.content_key_packet.clone())
            .ok_or_else(|| not_found(format!("file {file}")))?;
        let remote = state.open_revision(revision)?;
        let code = remote.code.get_or_insert_with(|| {
            let seed = sd_blocks::hash_bytes(revision.as_str().as_bytes());
            seed.as_bytes()[..CODE_LEN].to_vec()
        });
        Ok(VerificationData {
            content_key_packet: packet,
            verification_code: B64.encode(code),
        })
    }

    async fn submit_verification(&self, submission: VerificationSubmission) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        let key = (submission.revision_id.clone(), submission.index);
        let body = match state.blobs.get(&key) {
            Some(blob) => sd_crypto::block_body(&blob.data)
                .map(<[u8]>::to_vec)
                .map_err(|e| ApiError::response(codes::VERIFICATION_REQUIRED, e.to_string()))?,
            None => return Err(not_found(format!("block {} of {}", submission.index, submission.revision_id))),
        };
        let remote = state.open_revision(&submission.revision_id)?;
        let code = remote
            .code
            .clone()
            .ok_or_else(|| ApiError::response(codes::VERIFICATION_REQUIRED, "no verification requested"))?;

        let token = B64
            .decode(&submission.token)
            .map_err(|e| ApiError::response(codes::VERIFICATION_REQUIRED, format!("malformed token: {e}")))?;
        if token != sd_crypto::xor_prefix(&body, &code) {
            return Err(ApiError::response(codes::VERIFICATION_REQUIRED, "verification token mismatch"));
        }
        remote.verified.insert(submission.index);
        Ok(())
    }

    async fn commit_revision(&self, request: CommitRequest) -> Result<(), ApiError> {
        let delay = {
            let mut state = self.state.lock();
            state.commits += 1;
            if let Some(code) = state.faults.fail_commit.take() {
                return Err(ApiError::response(code, "injected commit failure"));
            }
            state.commit(&request)?;
            debug!(revision = %request.revision_id, blocks = request.block_hashes.len(), "loopback revision committed");
            if std::mem::take(&mut state.faults.lose_commit_response) {
                return Err(ApiError::Transport("connection reset after commit".into()));
            }
            state.faults.commit_response_delay.take()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn fetch_revision_xattrs(
        &self,
        _share: &ShareId,
        file: &FileId,
        revision: &RevisionId,
    ) -> Result<Option<String>, ApiError> {
        let state = self.state.lock();
        let remote = state
            .revisions
            .get(revision)
            .filter(|r| &r.file == file)
            .ok_or_else(|| not_found(format!("revision {revision} of file {file}")))?;
        Ok(remote.xattrs.clone())
    }
}

#[async_trait]
impl BlockTransport for LoopbackDrive {
    async fn put(&self, url: &str, data: Bytes) -> Result<(), ApiError> {
        let delay = self.state.lock().faults.put_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.puts += 1;
        let (revision, index, hash) = match state.links.get(url) {
            Some(link) => (link.revision.clone(), link.index, link.hash.clone()),
            None => return Err(ApiError::Transport(format!("unknown upload url {url}"))),
        };
        if state.faults.fail_puts.remove(&index) {
            return Err(ApiError::Transport(format!("injected failure for block {index}")));
        }
        if !sd_blocks::blake3::matches_hex(&data, &hash) {
            return Err(ApiError::Transport(format!("block {index} body does not match its hash")));
        }
        trace!(revision = %revision, block = index, bytes = data.len(), "loopback block stored");
        state.links.remove(url);
        state.blobs.insert((revision, index), StoredBlob { hash, data });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn share() -> ShareId {
        ShareId::new("S1")
    }

    fn parent() -> NodeId {
        NodeId::new("P1")
    }

    #[tokio::test]
    async fn taken_hashes_are_filtered() {
        let drive = LoopbackDrive::new();
        drive.take_name(&share(), &parent(), "a");

        let free = drive
            .check_available_hashes(&share(), &parent(), vec!["a".into(), "b".into()])
            .await
            .unwrap();

        assert_eq!(free, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn stale_check_applies_once() {
        let drive = LoopbackDrive::new();
        drive.take_name(&share(), &parent(), "a");
        drive.stale_availability_once();

        let first = drive.check_available_hashes(&share(), &parent(), vec!["a".into()]).await.unwrap();
        let second = drive.check_available_hashes(&share(), &parent(), vec!["a".into()]).await.unwrap();

        assert_eq!(first, vec!["a".to_string()]);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn commit_rejects_missing_blob() {
        let drive = LoopbackDrive::new();
        let created = drive.create_draft_for_tests(&share(), &parent());
        let data = Bytes::from_static(b"ciphertext");
        let hash = sd_blocks::hash_to_hex(&sd_blocks::hash_bytes(&data));
        let link = drive
            .request_block_upload(BlockUploadRequest {
                share_id: share(),
                revision_id: created.revision_id.clone(),
                index: 0,
                hash: hash.clone(),
                size: data.len() as u64,
            })
            .await
            .unwrap();
        drive.put(&link.url, data).await.unwrap();
        drive.drop_blob(&created.revision_id, 0);

        let err = drive
            .commit_revision(CommitRequest {
                share_id: share(),
                file_id: created.file_id,
                revision_id: created.revision_id,
                manifest_signature: String::new(),
                signature_address: String::new(),
                block_hashes: vec![hash],
                xattrs: None,
            })
            .await
            .unwrap_err();

        assert!(err.is_code(codes::BLOCKS_UPLOADED_WRONGLY));
    }

    #[tokio::test]
    async fn second_commit_is_already_committed() {
        let drive = LoopbackDrive::new();
        let created = drive.create_draft_for_tests(&share(), &parent());
        let request = CommitRequest {
            share_id: share(),
            file_id: created.file_id,
            revision_id: created.revision_id.clone(),
            manifest_signature: String::new(),
            signature_address: String::new(),
            block_hashes: Vec::new(),
            xattrs: Some("x".into()),
        };

        drive.commit_revision(request.clone()).await.unwrap();
        let err = drive.commit_revision(request).await.unwrap_err();

        assert!(err.is_code(codes::REVISION_ALREADY_COMMITTED));
        assert!(drive.is_committed(&created.revision_id));
        assert_eq!(drive.commit_count(), 2);
    }

    #[tokio::test]
    async fn put_to_unknown_url_fails() {
        let drive = LoopbackDrive::new();
        let err = drive.put("loopback://nowhere", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
        assert_eq!(drive.put_count(), 1);
    }
}
