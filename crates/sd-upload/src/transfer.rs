//! Block upload: request a link per block, re-check its hash, PUT it.
//!
//! Blocks go out in parallel (bounded by `block_concurrency`) and in any
//! order; only the index fixes reassembly. A block is marked uploaded only
//! after the transport confirms the PUT, and failed blocks leave their
//! siblings' progress intact for the next run.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use sd_core::{RevisionId, ShareId, UploadState};
use tracing::{debug, info, warn};

use crate::api::BlockUploadRequest;
use crate::error::UploadError;
use crate::model::{Block, FileDraft};
use crate::pipeline::{Stage, StageContext, StageStatus};
use crate::store::transact;

pub struct UploadBlocksStage;

enum BlockOutcome {
    Uploaded { index: u32, url: String },
    Failed { index: u32, reason: String },
    Cancelled,
}

#[async_trait]
impl Stage for UploadBlocksStage {
    fn name(&self) -> &'static str {
        "upload-blocks"
    }

    fn weight(&self) -> u32 {
        4
    }

    async fn run(&self, draft: &mut FileDraft, ctx: &StageContext) -> Result<StageStatus, UploadError> {
        match draft.revision.state {
            UploadState::Uploaded | UploadState::Sealed => return Ok(StageStatus::Done),
            UploadState::Encrypted => {}
            other => {
                return Err(UploadError::invalid_state(format!(
                    "cannot upload blocks of revision {} in state {other:?}",
                    draft.revision.id
                )))
            }
        }

        let pending: Vec<Block> = draft.revision.blocks.iter().filter(|b| !b.uploaded).cloned().collect();
        let total = draft.revision.blocks.len();
        debug!(upload_id = %draft.upload_id, pending = pending.len(), total, "uploading blocks");

        let share = draft.parent.share.clone();
        let revision_id = draft.revision.id.clone();
        let outcomes: Vec<BlockOutcome> = stream::iter(pending)
            .map(|block| upload_one(ctx, &share, &revision_id, block))
            .buffer_unordered(ctx.config.block_concurrency.max(1))
            .collect()
            .await;

        let mut confirmed = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled = false;
        for outcome in outcomes {
            match outcome {
                BlockOutcome::Uploaded { index, url } => confirmed.push((index, url)),
                BlockOutcome::Failed { index, reason } => failed.push((index, reason)),
                BlockOutcome::Cancelled => cancelled = true,
            }
        }

        let mut revision = draft.revision.clone();
        for (index, url) in &confirmed {
            if let Some(block) = revision.blocks.iter_mut().find(|b| b.index == *index) {
                block.uploaded = true;
                block.upload_url = Some(url.clone());
            }
        }
        if !cancelled && failed.is_empty() && revision.all_uploaded() {
            revision.state = UploadState::Uploaded;
        }

        if revision != draft.revision {
            transact(ctx.repo.as_ref(), |tx| {
                tx.put_revision(revision.clone());
                Ok(())
            })?;
            draft.revision = revision;
        }

        if cancelled {
            return Ok(StageStatus::Interrupted);
        }
        if !failed.is_empty() {
            failed.sort_by_key(|(index, _)| *index);
            let first = failed[0].1.clone();
            return Err(UploadError::BlockTransfer {
                failed: failed.into_iter().map(|(index, _)| index).collect(),
                total,
                first,
            });
        }

        info!(upload_id = %draft.upload_id, blocks = total, "blocks uploaded");
        Ok(StageStatus::Done)
    }
}

async fn upload_one(ctx: &StageContext, share: &ShareId, revision: &RevisionId, block: Block) -> BlockOutcome {
    let index = block.index;
    let fail = |reason: String| {
        warn!(revision = %revision, block = index, "block upload failed: {reason}");
        BlockOutcome::Failed { index, reason }
    };

    let data = match block.content.load() {
        Ok(Some(data)) => data,
        Ok(None) => return fail("local ciphertext missing".into()),
        Err(e) => return fail(format!("reading ciphertext: {e}")),
    };
    // never trust a block whose bytes no longer match the declared hash
    if !sd_blocks::blake3::matches_hex(&data, &block.hash) {
        return fail("ciphertext does not match its declared hash".into());
    }

    let request = BlockUploadRequest {
        share_id: share.clone(),
        revision_id: revision.clone(),
        index,
        hash: block.hash.clone(),
        size: data.len() as u64,
    };
    let link = match ctx.cancellable(ctx.api.request_block_upload(request)).await {
        None => return BlockOutcome::Cancelled,
        Some(Ok(link)) => link,
        Some(Err(e)) => return fail(format!("requesting upload link: {e}")),
    };

    match ctx.cancellable(ctx.transport.put(&link.url, Bytes::from(data))).await {
        None => BlockOutcome::Cancelled,
        Some(Ok(())) => {
            debug!(revision = %revision, block = index, "block stored");
            BlockOutcome::Uploaded { index, url: link.url }
        }
        Some(Err(e)) => fail(format!("transfer: {e}")),
    }
}
