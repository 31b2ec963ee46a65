use sd_core::{RevisionId, UploadId};
use thiserror::Error;

use crate::api::ApiError;

/// Failures surfaced by a pipeline run.
///
/// Cancellation is not represented here; see `PipelineOutcome::Cancelled`.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("name discovery failed: {0}")]
    Naming(#[from] NamingError),

    #[error("draft creation failed: {0}")]
    DraftCreation(#[source] ApiError),

    #[error("{} of {total} blocks failed to transfer (indices {failed:?}): {first}", .failed.len())]
    BlockTransfer {
        failed: Vec<u32>,
        total: usize,
        first: String,
    },

    #[error("block verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("server rejected uploaded blocks; revision {0} rolled back for re-upload")]
    BlocksUploadedWrongly(RevisionId),

    #[error("seal failed: {0}")]
    Seal(#[source] ApiError),

    #[error("revision {0} already committed with a different digest")]
    DigestMismatch(RevisionId),

    #[error("insufficient space to commit revision {0}")]
    InsufficientSpace(RevisionId),

    #[error("revision {revision} sealed remotely but not locally: {source}")]
    LocalSealFailed {
        revision: RevisionId,
        #[source]
        source: StoreError,
    },

    #[error("local persistence failed: {0}")]
    Persistence(#[from] StoreError),

    #[error("invalid upload state: {0}")]
    InvalidState(String),

    #[error("crypto error: {0}")]
    Crypto(#[source] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether resubmitting the same draft can succeed.
    ///
    /// Transport hiccups, block transfers, seal failures and local store
    /// errors resume from persisted state. Server rejections of the draft
    /// itself, integrity failures and quota do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Naming(e) => !matches!(e, NamingError::NoHashableCandidates),
            Self::DraftCreation(e) => matches!(e, ApiError::Transport(_)),
            Self::Verification(VerificationError::Request(ApiError::Transport(_))) => true,
            Self::Verification(_) => false,
            Self::BlockTransfer { .. }
            | Self::BlocksUploadedWrongly(_)
            | Self::Seal(_)
            | Self::LocalSealFailed { .. }
            | Self::Persistence(_) => true,
            Self::DigestMismatch(_)
            | Self::InsufficientSpace(_)
            | Self::InvalidState(_)
            | Self::Crypto(_)
            | Self::Io(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum NamingError {
    #[error("availability check failed: {0}")]
    AvailabilityCheck(#[source] ApiError),

    #[error("no candidate name in the batch could be hashed")]
    NoHashableCandidates,

    #[error("gave up after {0} name clashes")]
    TooManyClashes(u32),
}

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("revision {0} not found in local store")]
    MissingRevision(RevisionId),

    #[error("block {index} of revision {revision} not found")]
    MissingBlock { revision: RevisionId, index: u32 },

    #[error("local ciphertext for block {index} of revision {revision} is missing")]
    MissingBlockContent { revision: RevisionId, index: u32 },

    #[error("verification request failed: {0}")]
    Request(#[source] ApiError),

    #[error("invalid verification response: {0}")]
    InvalidResponse(String),

    #[error("server rejected verification token: {0}")]
    Rejected(#[source] ApiError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("no file record for upload {0}")]
    MissingFile(UploadId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        let transport = || ApiError::Transport("connection reset".into());
        let retryable = [
            UploadError::Naming(NamingError::AvailabilityCheck(transport())),
            UploadError::Naming(NamingError::TooManyClashes(4)),
            UploadError::DraftCreation(transport()),
            UploadError::Verification(VerificationError::Request(transport())),
            UploadError::BlockTransfer {
                failed: vec![1],
                total: 3,
                first: "reset".into(),
            },
            UploadError::BlocksUploadedWrongly(RevisionId::new("R1")),
            UploadError::Seal(ApiError::response(500, "busy")),
            UploadError::LocalSealFailed {
                revision: RevisionId::new("R1"),
                source: StoreError::Unavailable("disk".into()),
            },
            UploadError::Persistence(StoreError::Unavailable("disk".into())),
        ];
        for err in &retryable {
            assert!(err.is_retryable(), "{err} should be retryable");
        }
    }

    #[test]
    fn rejections_and_integrity_failures_are_permanent() {
        let permanent = [
            UploadError::Naming(NamingError::NoHashableCandidates),
            UploadError::DraftCreation(ApiError::response(2501, "parent gone")),
            UploadError::Verification(VerificationError::MissingRevision(RevisionId::new("R1"))),
            UploadError::Verification(VerificationError::Rejected(ApiError::response(2000, "bad token"))),
            UploadError::DigestMismatch(RevisionId::new("R1")),
            UploadError::InsufficientSpace(RevisionId::new("R1")),
            UploadError::invalid_state("not uploaded"),
            UploadError::Crypto(anyhow::anyhow!("bad key")),
            UploadError::Io(std::io::Error::other("unreadable")),
        ];
        for err in &permanent {
            assert!(!err.is_retryable(), "{err} should be permanent");
        }
    }
}
