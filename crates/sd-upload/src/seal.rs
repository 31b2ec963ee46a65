//! Revision sealing, in two phases.
//!
//! Phase 1 commits the revision remotely: signed manifest plus encrypted
//! extended attributes. Phase 2 records the seal locally and activates the
//! file. A draft whose phase 1 succeeded carries `remote_sealed`, so a
//! retry after a local failure goes straight to phase 2.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use sd_core::{FileId, FileState, UploadState};
use tracing::{debug, error, info, warn};

use crate::api::{codes, ApiError, CommitRequest};
use crate::error::{StoreError, UploadError};
use crate::model::{BlockContent, ExtendedAttributes, FileDraft, Revision};
use crate::pipeline::{Stage, StageContext, StageStatus};
use crate::store::transact;

pub struct SealRevisionStage;

#[async_trait]
impl Stage for SealRevisionStage {
    fn name(&self) -> &'static str {
        "seal"
    }

    async fn run(&self, draft: &mut FileDraft, ctx: &StageContext) -> Result<StageStatus, UploadError> {
        if draft.revision.state == UploadState::Sealed {
            return Ok(StageStatus::Done);
        }
        let file_id = draft
            .file_id
            .clone()
            .ok_or_else(|| UploadError::invalid_state("sealing before the file draft exists"))?;

        if !draft.remote_sealed {
            check_sealable(&draft.revision, ctx.config.max_block_size)?;
            let request = build_commit_request(draft, &file_id)?;

            // a commit abandoned mid-flight may still land; the next run
            // resolves it through the already-committed digest check
            let Some(result) = ctx.cancellable(ctx.api.commit_revision(request)).await else {
                info!(upload_id = %draft.upload_id, revision = %draft.revision.id, "seal cancelled during commit");
                return Ok(StageStatus::Interrupted);
            };
            if let Err(e) = result {
                handle_commit_error(draft, &file_id, ctx, e).await?;
            }
            draft.remote_sealed = true;
            debug!(upload_id = %draft.upload_id, revision = %draft.revision.id, "revision committed remotely");
        }

        seal_locally(draft, ctx)?;
        info!(upload_id = %draft.upload_id, name = %draft.name, revision = %draft.revision.id, "revision sealed");
        Ok(StageStatus::Done)
    }
}

/// Refuse to commit anything the server would not reassemble correctly.
fn check_sealable(revision: &Revision, max_block_size: usize) -> Result<(), UploadError> {
    if revision.state != UploadState::Uploaded || !revision.all_uploaded() {
        return Err(UploadError::invalid_state(format!(
            "revision {} is not fully uploaded (state {:?})",
            revision.id, revision.state
        )));
    }
    let expected = sd_blocks::expected_block_sizes(revision.size, max_block_size);
    let actual: Vec<u64> = revision.blocks.iter().map(|b| b.plain_size).collect();
    if expected != actual {
        return Err(UploadError::invalid_state(format!(
            "revision {} has block sizes {actual:?}, expected {expected:?}",
            revision.id
        )));
    }
    if revision.blocks.iter().enumerate().any(|(i, b)| b.index as usize != i) {
        return Err(UploadError::invalid_state(format!(
            "revision {} blocks are not contiguous from 0",
            revision.id
        )));
    }
    Ok(())
}

pub fn build_commit_request(draft: &FileDraft, file_id: &FileId) -> Result<CommitRequest, UploadError> {
    let revision = &draft.revision;
    let manifest_signature =
        sd_crypto::manifest_signature(&draft.signer.key, revision.block_hashes()).map_err(UploadError::Crypto)?;
    let xattrs = match &revision.xattrs {
        Some(attrs) => Some(encrypt_xattrs(draft, attrs)?),
        None => None,
    };

    Ok(CommitRequest {
        share_id: draft.parent.share.clone(),
        file_id: file_id.clone(),
        revision_id: revision.id.clone(),
        manifest_signature,
        signature_address: draft.signer.address.clone(),
        block_hashes: revision.block_hashes().map(str::to_owned).collect(),
        xattrs,
    })
}

fn encrypt_xattrs(draft: &FileDraft, attrs: &ExtendedAttributes) -> Result<String, UploadError> {
    let json = serde_json::to_vec(attrs).map_err(|e| UploadError::Crypto(e.into()))?;
    let sealed = sd_crypto::encrypt_message(&draft.node_key, &json).map_err(UploadError::Crypto)?;
    Ok(B64.encode(sealed))
}

/// Map a failed commit. `Ok` means the revision is committed after all.
async fn handle_commit_error(
    draft: &mut FileDraft,
    file_id: &FileId,
    ctx: &StageContext,
    err: ApiError,
) -> Result<(), UploadError> {
    let revision_id = draft.revision.id.clone();
    match err.code() {
        Some(codes::BLOCKS_UPLOADED_WRONGLY) => {
            warn!(upload_id = %draft.upload_id, revision = %revision_id, "server rejected blocks, rolling back uploads");
            let mut revision = draft.revision.clone();
            revision.rollback_uploaded();
            transact(ctx.repo.as_ref(), |tx| {
                tx.put_revision(revision.clone());
                Ok(())
            })?;
            draft.revision = revision;
            Err(UploadError::BlocksUploadedWrongly(revision_id))
        }
        Some(codes::REVISION_ALREADY_COMMITTED) => {
            if committed_digest_matches(draft, file_id, ctx).await? {
                info!(upload_id = %draft.upload_id, revision = %revision_id, "revision already committed with our content");
                Ok(())
            } else {
                Err(UploadError::DigestMismatch(revision_id))
            }
        }
        Some(codes::QUOTA_EXCEEDED) => Err(UploadError::InsufficientSpace(revision_id)),
        _ => Err(UploadError::Seal(err)),
    }
}

/// Compare the SHA-1 recorded in the committed revision with ours.
async fn committed_digest_matches(
    draft: &FileDraft,
    file_id: &FileId,
    ctx: &StageContext,
) -> Result<bool, UploadError> {
    let Some(local) = draft.revision.xattrs.as_ref() else {
        return Ok(false);
    };
    let remote = ctx
        .api
        .fetch_revision_xattrs(&draft.parent.share, file_id, &draft.revision.id)
        .await
        .map_err(UploadError::Seal)?;
    let Some(armored) = remote else {
        return Ok(false);
    };

    let decoded: Option<ExtendedAttributes> = B64
        .decode(armored)
        .ok()
        .and_then(|sealed| sd_crypto::decrypt_message(&draft.node_key, &sealed).ok())
        .and_then(|json| serde_json::from_slice(&json).ok());
    match decoded {
        Some(remote) => Ok(remote.common.digests.sha1 == local.common.digests.sha1),
        None => {
            warn!(upload_id = %draft.upload_id, "committed revision has unreadable extended attributes");
            Ok(false)
        }
    }
}

/// Phase 2: revision sealed, ciphertext released, file active.
fn seal_locally(draft: &mut FileDraft, ctx: &StageContext) -> Result<(), UploadError> {
    let mut revision = draft.revision.clone();
    let revision_id = revision.id.clone();
    let released: Vec<BlockContent> = revision
        .blocks
        .iter_mut()
        .map(|b| std::mem::replace(&mut b.content, BlockContent::Released))
        .collect();
    revision.state = UploadState::Sealed;
    if revision.manifest_signature.is_none() {
        revision.manifest_signature = Some(
            sd_crypto::manifest_signature(&draft.signer.key, revision.block_hashes()).map_err(UploadError::Crypto)?,
        );
    }

    let result = transact(ctx.repo.as_ref(), |tx| {
        let mut file = tx
            .fetch_file(&draft.upload_id)
            .ok_or(StoreError::MissingFile(draft.upload_id))?;
        file.state = FileState::Active;
        file.active_revision = Some(revision_id.clone());
        file.revision_draft = None;
        file.size = revision.size;
        file.name = draft.name.clone();
        tx.put_file(file);
        tx.put_revision(revision.clone());
        Ok(())
    });

    match result {
        Ok(()) => {
            released.iter().for_each(BlockContent::discard);
            draft.revision = revision;
            Ok(())
        }
        Err(UploadError::Persistence(source)) => {
            error!(upload_id = %draft.upload_id, revision = %revision_id, "remote seal succeeded but local seal failed: {source}");
            Err(UploadError::LocalSealFailed {
                revision: revision_id,
                source,
            })
        }
        Err(e) => Err(e),
    }
}
