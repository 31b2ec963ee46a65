//! Block possession proof before commit.
//!
//! The server returns the content key packet and a random code; we unwrap
//! the key with the node key, re-open the uploaded ciphertext, and answer
//! with `body prefix XOR code` for each verified block.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use sd_core::{FileId, RevisionId, UploadState};
use sd_crypto::ContentKey;
use tracing::{debug, info};

use crate::api::{codes, VerificationData, VerificationSubmission};
use crate::error::{UploadError, VerificationError};
use crate::model::{FileDraft, VerificationInfo};
use crate::pipeline::{Stage, StageContext, StageStatus};
use crate::store::Repository;

pub struct VerifyBlocksStage;

#[async_trait]
impl Stage for VerifyBlocksStage {
    fn name(&self) -> &'static str {
        "verify-blocks"
    }

    async fn run(&self, draft: &mut FileDraft, ctx: &StageContext) -> Result<StageStatus, UploadError> {
        if draft.revision.state == UploadState::Sealed || draft.remote_sealed {
            return Ok(StageStatus::Done);
        }
        if draft.revision.state != UploadState::Uploaded {
            return Err(UploadError::invalid_state(format!(
                "cannot verify revision {} in state {:?}",
                draft.revision.id, draft.revision.state
            )));
        }
        if draft.revision.blocks.is_empty() {
            debug!(upload_id = %draft.upload_id, "no blocks, skipping verification");
            return Ok(StageStatus::Done);
        }
        let file_id = draft
            .file_id
            .clone()
            .ok_or_else(|| UploadError::invalid_state("verifying before the file draft exists"))?;

        let Some(response) = ctx
            .cancellable(ctx.api.request_verification(&draft.parent.share, &file_id, &draft.revision.id))
            .await
        else {
            return Ok(StageStatus::Interrupted);
        };
        let data = match response {
            Ok(data) => data,
            Err(e) if e.is_code(codes::REVISION_ALREADY_COMMITTED) => {
                // the seal stage decides whether that commit was ours
                info!(upload_id = %draft.upload_id, revision = %draft.revision.id, "revision already committed, skipping verification");
                return Ok(StageStatus::Done);
            }
            Err(e) => return Err(VerificationError::Request(e).into()),
        };
        let info = decode_verification(&draft.node_key, &data)?;

        let indices: Vec<u32> = if ctx.config.verify_all_blocks {
            draft.revision.blocks.iter().map(|b| b.index).collect()
        } else {
            vec![0]
        };

        for index in indices {
            let token = block_token(ctx.repo.as_ref(), &draft.revision.id, &file_id, index, &info)?;
            let submission = VerificationSubmission {
                share_id: draft.parent.share.clone(),
                revision_id: draft.revision.id.clone(),
                index,
                token: B64.encode(token),
            };
            match ctx.cancellable(ctx.api.submit_verification(submission)).await {
                None => return Ok(StageStatus::Interrupted),
                Some(result) => result.map_err(VerificationError::Rejected)?,
            }
            debug!(upload_id = %draft.upload_id, block = index, "block verified");
        }

        info!(upload_id = %draft.upload_id, revision = %draft.revision.id, "revision verified");
        Ok(StageStatus::Done)
    }
}

/// Unwrap the server's content key packet and decode its challenge.
pub fn decode_verification(
    node_key: &sd_crypto::NodeKey,
    data: &VerificationData,
) -> Result<VerificationInfo, VerificationError> {
    let packet = B64
        .decode(&data.content_key_packet)
        .map_err(|e| VerificationError::InvalidResponse(format!("content key packet: {e}")))?;
    let code = B64
        .decode(&data.verification_code)
        .map_err(|e| VerificationError::InvalidResponse(format!("verification code: {e}")))?;
    let content_key: ContentKey = sd_crypto::unwrap_key(node_key, &packet)
        .map_err(|e| VerificationError::InvalidResponse(format!("content key: {e}")))?;
    Ok(VerificationInfo { content_key, code })
}

/// Raw token for one block, read from the persisted revision.
pub fn block_token(
    repo: &dyn Repository,
    revision_id: &RevisionId,
    file_id: &FileId,
    index: u32,
    info: &VerificationInfo,
) -> Result<Vec<u8>, UploadError> {
    let revision = repo
        .revision(revision_id)
        .ok_or_else(|| VerificationError::MissingRevision(revision_id.clone()))?;
    let block = revision.block(index).ok_or_else(|| VerificationError::MissingBlock {
        revision: revision_id.clone(),
        index,
    })?;
    let encrypted = block.content.load()?.ok_or_else(|| VerificationError::MissingBlockContent {
        revision: revision_id.clone(),
        index,
    })?;

    sd_crypto::verification_token(&info.content_key, index, file_id.as_str(), &encrypted, &info.code)
        .map_err(UploadError::Crypto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DriveApi;
    use crate::draft::{finalize_draft, register_draft};
    use crate::encryptor::EncryptBlocksStage;
    use crate::loopback::LoopbackDrive;
    use crate::model::{BlockContent, ContentSource, ParentFolder, Signer};
    use crate::store::{transact, LocalStore};
    use crate::transfer::UploadBlocksStage;
    use sd_core::config::UploadConfig;
    use std::sync::Arc;

    async fn uploaded(drive: &Arc<LoopbackDrive>, config: UploadConfig, data: &[u8]) -> (FileDraft, StageContext) {
        let ctx = StageContext::new(drive.clone(), drive.clone(), Arc::new(LocalStore::in_memory()), config);
        let parent = ParentFolder::new("S1", "P1", sd_crypto::generate_key()).unwrap();
        let signer = Signer {
            address: "me@example.com".into(),
            key: sd_crypto::generate_key(),
        };
        let mut draft = FileDraft::new_file(parent, "v.bin", ContentSource::Memory(data.to_vec().into()), signer);
        register_draft(ctx.repo.as_ref(), &draft).unwrap();
        let request = crate::draft::build_create_request(
            &draft,
            &crate::model::NameHashPair {
                name: "v.bin".into(),
                hash: "h-v".into(),
            },
        )
        .unwrap();
        let created = drive.create_file(request).await.unwrap();
        finalize_draft(ctx.repo.as_ref(), &mut draft, created.file_id, created.revision_id, "v.bin".into())
            .unwrap();
        EncryptBlocksStage.run(&mut draft, &ctx).await.unwrap();
        UploadBlocksStage.run(&mut draft, &ctx).await.unwrap();
        (draft, ctx)
    }

    #[tokio::test]
    async fn first_block_is_verified() {
        let drive = Arc::new(LoopbackDrive::new());
        let config = UploadConfig {
            max_block_size: 16,
            ..Default::default()
        };
        let (mut draft, ctx) = uploaded(&drive, config, &[7u8; 40]).await;

        let status = VerifyBlocksStage.run(&mut draft, &ctx).await.unwrap();

        assert_eq!(status, StageStatus::Done);
        assert_eq!(drive.verified_blocks(&draft.revision.id), vec![0]);
    }

    #[tokio::test]
    async fn verify_all_covers_every_block() {
        let drive = Arc::new(LoopbackDrive::new());
        let config = UploadConfig {
            max_block_size: 16,
            verify_all_blocks: true,
            ..Default::default()
        };
        let (mut draft, ctx) = uploaded(&drive, config, &[7u8; 40]).await;

        VerifyBlocksStage.run(&mut draft, &ctx).await.unwrap();

        assert_eq!(drive.verified_blocks(&draft.revision.id), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_revision_skips_the_server() {
        let drive = Arc::new(LoopbackDrive::new());
        let (mut draft, ctx) = uploaded(&drive, UploadConfig::default(), b"").await;

        VerifyBlocksStage.run(&mut draft, &ctx).await.unwrap();

        assert!(drive.verified_blocks(&draft.revision.id).is_empty());
    }

    #[tokio::test]
    async fn released_ciphertext_is_reported() {
        let drive = Arc::new(LoopbackDrive::new());
        let (mut draft, ctx) = uploaded(&drive, UploadConfig::default(), b"abc").await;
        let mut revision = draft.revision.clone();
        revision.blocks[0].content = BlockContent::Released;
        transact(ctx.repo.as_ref(), |tx| {
            tx.put_revision(revision.clone());
            Ok(())
        })
        .unwrap();
        draft.revision = revision;

        let err = VerifyBlocksStage.run(&mut draft, &ctx).await.unwrap_err();

        assert!(matches!(
            err,
            UploadError::Verification(VerificationError::MissingBlockContent { index: 0, .. })
        ));
    }

    #[test]
    fn undecodable_response_is_invalid() {
        let node: sd_crypto::NodeKey = sd_crypto::generate_key();
        let data = VerificationData {
            content_key_packet: "not base64!".into(),
            verification_code: B64.encode([1u8; 8]),
        };
        assert!(matches!(
            decode_verification(&node, &data),
            Err(VerificationError::InvalidResponse(_))
        ));
    }

    #[test]
    fn token_needs_the_persisted_revision() {
        let store = LocalStore::in_memory();
        let info = VerificationInfo {
            content_key: sd_crypto::generate_key(),
            code: vec![1, 2, 3],
        };
        let err = block_token(&store, &RevisionId::new("R9"), &FileId::new("F9"), 0, &info).unwrap_err();
        assert!(matches!(
            err,
            UploadError::Verification(VerificationError::MissingRevision(_))
        ));
    }
}
