pub mod config;
pub mod error;
pub mod types;

pub use error::{SdError, SdResult};
pub use types::{FileId, FileState, NodeId, NodeRef, RevisionId, ShareId, UploadId, UploadState};
