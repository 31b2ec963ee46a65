use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SdError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Share (volume root) a node lives in
    ShareId
);
string_id!(
    /// Folder or file link identifier
    NodeId
);
string_id!(
    /// Server-assigned file identifier
    FileId
);

/// Revision identifier: a `local-` placeholder until the server assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(String);

const LOCAL_PREFIX: &str = "local-";

impl RevisionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Placeholder id used before the remote draft exists.
    pub fn local(upload_id: &UploadId) -> Self {
        Self(format!("{LOCAL_PREFIX}{upload_id}"))
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RevisionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Process-local token identifying one in-flight upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(uuid::Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, SdError> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SdError::InvalidId(format!("upload id '{s}': {e}")))
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node addressed within its share
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub share: ShareId,
    pub node: NodeId,
}

impl NodeRef {
    pub fn new(share: impl Into<ShareId>, node: impl Into<NodeId>) -> Self {
        Self {
            share: share.into(),
            node: node.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.share, self.node)
    }
}

/// Upload progress of a revision.
///
/// Ordered: a revision only ever moves forward, except for the
/// `Uploaded → Encrypted` rollback after a rejected manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum UploadState {
    /// Local skeleton only
    #[default]
    None,
    /// Remote file or revision draft exists
    Created,
    /// Blocks encrypted and hashed locally
    Encrypted,
    /// Every block confirmed by the transport
    Uploaded,
    /// Committed remotely and locally
    Sealed,
}

/// State of a file record in the local store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FileState {
    /// Created locally, no remote counterpart yet
    #[default]
    Draft,
    /// Remote draft exists, content upload in progress
    Uploading,
    /// Active revision sealed
    Active,
    /// Upload failed permanently
    Failed,
}
