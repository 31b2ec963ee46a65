//! Upload data model: drafts, revisions, blocks, and file records
//!
//! `Revision`, `Block` and `FileRecord` are what the local store persists.
//! `FileDraft` is the in-memory owner of one upload and never persisted
//! whole; it carries key material.

use bytes::Bytes;
use sd_core::{FileId, FileState, NodeId, RevisionId, ShareId, UploadId, UploadState};
use sd_crypto::{AddressKey, ContentKey, HashKey, NodeKey};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

/// Folder the upload lands in, with the key material its children need
#[derive(Debug, Clone)]
pub struct ParentFolder {
    pub share: ShareId,
    pub node: NodeId,
    pub key: NodeKey,
    pub hash_key: HashKey,
}

impl ParentFolder {
    pub fn new(share: impl Into<ShareId>, node: impl Into<NodeId>, key: NodeKey) -> anyhow::Result<Self> {
        let hash_key = sd_crypto::derive_hash_key(&key)?;
        Ok(Self {
            share: share.into(),
            node: node.into(),
            key,
            hash_key,
        })
    }
}

/// Identity that signs names, key packets and manifests
#[derive(Debug, Clone)]
pub struct Signer {
    pub address: String,
    pub key: AddressKey,
}

/// Where plaintext comes from
#[derive(Debug, Clone)]
pub enum ContentSource {
    Path(PathBuf),
    Memory(Bytes),
}

impl ContentSource {
    pub fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
        match self {
            Self::Path(path) => Ok(Box::new(std::io::BufReader::new(std::fs::File::open(path)?))),
            Self::Memory(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
        }
    }

    /// Unix seconds, when the source has one
    pub fn modification_time(&self) -> Option<u64> {
        match self {
            Self::Path(path) => std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            Self::Memory(_) => None,
        }
    }
}

/// One in-flight upload.
///
/// Stages mutate `revision` only after the matching store transaction has
/// been saved, so this copy never runs ahead of persisted state.
#[derive(Debug)]
pub struct FileDraft {
    pub upload_id: UploadId,
    pub parent: ParentFolder,
    /// Desired name; replaced by the discovered one once the draft exists remotely
    pub name: String,
    pub mime_type: String,
    pub source: ContentSource,
    pub signer: Signer,
    pub node_key: NodeKey,
    pub content_key: ContentKey,
    /// `Some` for a revision of an existing file, or once the file draft exists
    pub file_id: Option<FileId>,
    pub revision: Revision,
    /// Phase 1 of sealing already succeeded
    pub remote_sealed: bool,
}

impl FileDraft {
    /// Upload of a brand new file.
    pub fn new_file(parent: ParentFolder, name: impl Into<String>, source: ContentSource, signer: Signer) -> Self {
        let name = name.into();
        let upload_id = UploadId::new();
        Self {
            upload_id,
            mime_type: guess_mime_type(&name).to_string(),
            parent,
            name,
            source,
            signer,
            node_key: sd_crypto::generate_key(),
            content_key: sd_crypto::generate_key(),
            file_id: None,
            revision: Revision::placeholder(upload_id),
            remote_sealed: false,
        }
    }

    /// New revision of an existing file whose keys the caller already holds.
    ///
    /// Revisions share the file's content key packet, so `content_key` must
    /// be the key that packet wraps.
    pub fn new_revision(
        parent: ParentFolder,
        file_id: FileId,
        name: impl Into<String>,
        node_key: NodeKey,
        content_key: ContentKey,
        source: ContentSource,
        signer: Signer,
    ) -> Self {
        let name = name.into();
        let upload_id = UploadId::new();
        Self {
            upload_id,
            mime_type: guess_mime_type(&name).to_string(),
            parent,
            name,
            source,
            signer,
            node_key,
            content_key,
            file_id: Some(file_id),
            revision: Revision::placeholder(upload_id),
            remote_sealed: false,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Initial local record for this upload.
    pub fn file_record(&self) -> FileRecord {
        FileRecord {
            upload_id: self.upload_id,
            file_id: self.file_id.clone(),
            share: self.parent.share.clone(),
            parent: self.parent.node.clone(),
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
            state: FileState::Draft,
            active_revision: None,
            revision_draft: Some(self.revision.id.clone()),
            size: 0,
        }
    }
}

/// One version of a file's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub upload_id: UploadId,
    pub state: UploadState,
    /// Plaintext size in bytes
    pub size: u64,
    /// Sorted by index
    pub blocks: Vec<Block>,
    pub xattrs: Option<ExtendedAttributes>,
    pub manifest_signature: Option<String>,
}

impl Revision {
    pub fn placeholder(upload_id: UploadId) -> Self {
        Self {
            id: RevisionId::local(&upload_id),
            upload_id,
            state: UploadState::None,
            size: 0,
            blocks: Vec::new(),
            xattrs: None,
            manifest_signature: None,
        }
    }

    pub fn all_uploaded(&self) -> bool {
        self.blocks.iter().all(|b| b.uploaded)
    }

    pub fn block(&self, index: u32) -> Option<&Block> {
        self.blocks.iter().find(|b| b.index == index)
    }

    /// Ciphertext hashes in index order
    pub fn block_hashes(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().map(|b| b.hash.as_str())
    }

    /// Forget every transfer so the next run re-uploads all blocks.
    pub fn rollback_uploaded(&mut self) {
        for block in &mut self.blocks {
            block.uploaded = false;
            block.upload_url = None;
        }
        self.state = UploadState::Encrypted;
    }
}

/// One encrypted chunk of a revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// 0-based, defines reassembly order
    pub index: u32,
    pub plain_size: u64,
    pub enc_size: u64,
    /// Hex BLAKE3 of the ciphertext; the block's remote key
    pub hash: String,
    pub uploaded: bool,
    pub upload_url: Option<String>,
    pub content: BlockContent,
}

/// Ciphertext held in memory or spilled to disk.
///
/// Only spilled paths are persisted. In-memory ciphertext lives as long as
/// the process and reads back from a store file as `Released`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "StoredContent", from = "StoredContent")]
pub enum BlockContent {
    Memory(Bytes),
    Spilled(PathBuf),
    /// Dropped after sealing, or never persisted
    Released,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
enum StoredContent {
    Spilled(PathBuf),
    Released,
}

impl From<BlockContent> for StoredContent {
    fn from(content: BlockContent) -> Self {
        match content {
            BlockContent::Spilled(path) => Self::Spilled(path),
            BlockContent::Memory(_) | BlockContent::Released => Self::Released,
        }
    }
}

impl From<StoredContent> for BlockContent {
    fn from(stored: StoredContent) -> Self {
        match stored {
            StoredContent::Spilled(path) => Self::Spilled(path),
            StoredContent::Released => Self::Released,
        }
    }
}

impl BlockContent {
    /// `None` once the ciphertext has been released.
    pub fn load(&self) -> std::io::Result<Option<Vec<u8>>> {
        match self {
            Self::Memory(data) => Ok(Some(data.to_vec())),
            Self::Spilled(path) => match std::fs::read(path) {
                Ok(data) => Ok(Some(data)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            },
            Self::Released => Ok(None),
        }
    }

    /// Remove spilled ciphertext, ignoring files already gone.
    pub fn discard(&self) {
        if let Self::Spilled(path) = self {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), "failed to remove spilled block: {e}");
                }
            }
        }
    }
}

/// Local bookkeeping for one uploaded file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub upload_id: UploadId,
    pub file_id: Option<FileId>,
    pub share: ShareId,
    pub parent: NodeId,
    pub name: String,
    pub mime_type: String,
    pub state: FileState,
    pub active_revision: Option<RevisionId>,
    /// At most one revision draft per file
    pub revision_draft: Option<RevisionId>,
    pub size: u64,
}

/// Revision metadata, encrypted under the node key before commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtendedAttributes {
    pub common: CommonAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommonAttributes {
    /// Unix seconds
    pub modification_time: Option<u64>,
    pub size: u64,
    pub block_sizes: Vec<u64>,
    pub digests: Digests,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digests {
    #[serde(rename = "SHA1")]
    pub sha1: String,
}

/// Candidate name and its collision hash; lives for one probing round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameHashPair {
    pub name: String,
    pub hash: String,
}

/// Decrypted content key plus the server's challenge, used once
#[derive(Debug)]
pub struct VerificationInfo {
    pub content_key: ContentKey,
    pub code: Vec<u8>,
}

fn guess_mime_type(name: &str) -> &'static str {
    let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("txt") | Some("md") => "text/plain",
        Some("json") => "application/json",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("mp4") => "video/mp4",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(index: u32, uploaded: bool) -> Block {
        Block {
            index,
            plain_size: 4,
            enc_size: 44,
            hash: format!("{index:064x}"),
            uploaded,
            upload_url: uploaded.then(|| format!("loopback://{index}")),
            content: BlockContent::Memory(vec![index as u8; 44].into()),
        }
    }

    #[test]
    fn rollback_clears_every_flag() {
        let mut rev = Revision::placeholder(UploadId::new());
        rev.blocks = vec![block(0, true), block(1, true)];
        rev.state = UploadState::Uploaded;

        rev.rollback_uploaded();

        assert_eq!(rev.state, UploadState::Encrypted);
        assert!(rev.blocks.iter().all(|b| !b.uploaded && b.upload_url.is_none()));
    }

    #[test]
    fn empty_revision_counts_as_uploaded() {
        let rev = Revision::placeholder(UploadId::new());
        assert!(rev.all_uploaded());
        assert!(rev.id.is_local());
    }

    #[test]
    fn xattrs_use_pascal_case_keys() {
        let xattrs = ExtendedAttributes {
            common: CommonAttributes {
                modification_time: Some(1_700_000_000),
                size: 10,
                block_sizes: vec![4, 4, 2],
                digests: Digests {
                    sha1: "a9993e364706816aba3e25717850c26c9cd0d89d".into(),
                },
            },
        };
        let json = serde_json::to_string(&xattrs).unwrap();
        assert!(json.contains("\"Common\""));
        assert!(json.contains("\"BlockSizes\":[4,4,2]"));
        assert!(json.contains("\"SHA1\""));
        let back: ExtendedAttributes = serde_json::from_str(&json).unwrap();
        assert_eq!(back, xattrs);
    }

    #[test]
    fn memory_ciphertext_is_not_persisted() {
        let content = BlockContent::Memory(Bytes::from_static(&[0xFF, 0x00, 0x10]));
        let json = serde_json::to_string(&content).unwrap();
        assert_eq!(json, r#"{"kind":"released"}"#);
        let back: BlockContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, BlockContent::Released);
    }

    #[test]
    fn spilled_path_is_persisted() {
        let content = BlockContent::Spilled(PathBuf::from("/tmp/spill/0.blk"));
        let json = serde_json::to_string(&content).unwrap();
        assert_eq!(json, r#"{"kind":"spilled","path":"/tmp/spill/0.blk"}"#);
        let back: BlockContent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn mime_type_from_extension() {
        assert_eq!(guess_mime_type("Report.PDF"), "application/pdf");
        assert_eq!(guess_mime_type("noext"), "application/octet-stream");
    }
}
