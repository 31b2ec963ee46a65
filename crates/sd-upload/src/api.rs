//! Remote collaborators: the drive API and the raw block transport
//!
//! Wire format belongs to the network layer; these traits carry the
//! requests the pipeline needs, with binary fields already base64-armored.

use async_trait::async_trait;
use bytes::Bytes;
use sd_core::{FileId, NodeId, RevisionId, ShareId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Server response codes the pipeline reacts to
pub mod codes {
    /// Blocks in the manifest do not match what the server received
    pub const BLOCKS_UPLOADED_WRONGLY: u32 = 2000;
    /// Commit attempted before a block was proven
    pub const VERIFICATION_REQUIRED: u32 = 2001;
    /// A sibling already uses this name hash
    pub const NAME_ALREADY_EXISTS: u32 = 2500;
    pub const NOT_FOUND: u32 = 2501;
    pub const REVISION_ALREADY_COMMITTED: u32 = 2511;
    pub const QUOTA_EXCEEDED: u32 = 200_001;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("server error {code}: {message}")]
    Response { code: u32, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ApiError {
    pub fn response(code: u32, message: impl Into<String>) -> Self {
        Self::Response {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Response { code, .. } => Some(*code),
            Self::Transport(_) => None,
        }
    }

    pub fn is_code(&self, expected: u32) -> bool {
        self.code() == Some(expected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFileRequest {
    pub share_id: ShareId,
    pub parent_link_id: NodeId,
    pub armored_name: String,
    pub name_hash: String,
    /// Node key locked by the node passphrase
    pub node_key: String,
    /// Passphrase wrapped under the parent key
    pub node_passphrase: String,
    pub node_passphrase_signature: String,
    pub signature_address: String,
    pub content_key_packet: String,
    pub content_key_packet_signature: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedFile {
    pub file_id: FileId,
    pub revision_id: RevisionId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockUploadRequest {
    pub share_id: ShareId,
    pub revision_id: RevisionId,
    pub index: u32,
    /// Hex BLAKE3 of the ciphertext
    pub hash: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockUploadLink {
    pub url: String,
}

/// Server challenge for one revision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationData {
    /// Content key wrapped under the node key, base64
    pub content_key_packet: String,
    /// Random challenge bytes, base64
    pub verification_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSubmission {
    pub share_id: ShareId,
    pub revision_id: RevisionId,
    pub index: u32,
    /// base64 of `prefix XOR code`
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    pub share_id: ShareId,
    pub file_id: FileId,
    pub revision_id: RevisionId,
    pub manifest_signature: String,
    pub signature_address: String,
    /// Hex ciphertext hashes in index order
    pub block_hashes: Vec<String>,
    /// Extended attributes encrypted under the node key, base64
    pub xattrs: Option<String>,
}

#[async_trait]
pub trait DriveApi: Send + Sync {
    /// Subset of `hashes` not used by any child of `parent`.
    async fn check_available_hashes(
        &self,
        share: &ShareId,
        parent: &NodeId,
        hashes: Vec<String>,
    ) -> Result<Vec<String>, ApiError>;

    async fn create_file(&self, request: CreateFileRequest) -> Result<CreatedFile, ApiError>;

    async fn create_revision(&self, share: &ShareId, file: &FileId) -> Result<RevisionId, ApiError>;

    async fn request_block_upload(
        &self,
        request: BlockUploadRequest,
    ) -> Result<BlockUploadLink, ApiError>;

    async fn request_verification(
        &self,
        share: &ShareId,
        file: &FileId,
        revision: &RevisionId,
    ) -> Result<VerificationData, ApiError>;

    async fn submit_verification(&self, submission: VerificationSubmission) -> Result<(), ApiError>;

    async fn commit_revision(&self, request: CommitRequest) -> Result<(), ApiError>;

    /// Encrypted extended attributes of a committed revision, base64.
    async fn fetch_revision_xattrs(
        &self,
        share: &ShareId,
        file: &FileId,
        revision: &RevisionId,
    ) -> Result<Option<String>, ApiError>;
}

/// Raw ciphertext PUT to a URL handed out by [`DriveApi::request_block_upload`].
///
/// `Ok` means the bytes were stored, not merely accepted for transfer.
#[async_trait]
pub trait BlockTransport: Send + Sync {
    async fn put(&self, url: &str, data: Bytes) -> Result<(), ApiError>;
}
