//! Block encryption: split → encrypt → hash, in parallel batches.
//!
//! Runs on the blocking pool. Plaintext is read sequentially (feeding the
//! whole-file SHA-1), and each batch of blocks is encrypted with rayon.
//! Ciphertext stays in memory or is spilled to `spill_dir`.

use async_trait::async_trait;
use rayon::prelude::*;
use sd_blocks::{BlockReader, PlainBlock, Sha1Digest};
use sd_core::{FileId, UploadId, UploadState};
use sd_crypto::ContentKey;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::UploadError;
use crate::model::{Block, BlockContent, CommonAttributes, ContentSource, Digests, ExtendedAttributes, FileDraft};
use crate::pipeline::{Stage, StageContext, StageStatus};
use crate::store::transact;

pub struct EncryptBlocksStage;

#[async_trait]
impl Stage for EncryptBlocksStage {
    fn name(&self) -> &'static str {
        "encrypt-blocks"
    }

    fn weight(&self) -> u32 {
        3
    }

    async fn run(&self, draft: &mut FileDraft, ctx: &StageContext) -> Result<StageStatus, UploadError> {
        if draft.revision.state >= UploadState::Encrypted {
            return Ok(StageStatus::Done);
        }
        if draft.revision.state != UploadState::Created {
            return Err(UploadError::invalid_state(format!(
                "cannot encrypt revision {} in state {:?}",
                draft.revision.id, draft.revision.state
            )));
        }
        let file_id = draft
            .file_id
            .clone()
            .ok_or_else(|| UploadError::invalid_state("encrypting before the file draft exists"))?;

        let job = EncryptJob {
            upload_id: draft.upload_id,
            file_id,
            source: draft.source.clone(),
            key: draft.content_key.clone(),
            max_block_size: ctx.config.max_block_size,
            spill_dir: ctx.config.spill_dir.clone(),
            cancel: ctx.cancel.clone(),
        };
        let produced = tokio::task::spawn_blocking(move || job.run())
            .await
            .map_err(|e| UploadError::Crypto(anyhow::anyhow!("encryption task failed: {e}")))??;

        let Some(content) = produced else {
            return Ok(StageStatus::Interrupted);
        };

        let mut revision = draft.revision.clone();
        revision.size = content.size;
        revision.blocks = content.blocks;
        revision.xattrs = Some(ExtendedAttributes {
            common: CommonAttributes {
                modification_time: draft.source.modification_time(),
                size: content.size,
                block_sizes: revision.blocks.iter().map(|b| b.plain_size).collect(),
                digests: Digests { sha1: content.sha1 },
            },
        });
        revision.state = UploadState::Encrypted;

        if let Err(e) = transact(ctx.repo.as_ref(), |tx| {
            tx.put_revision(revision.clone());
            Ok(())
        }) {
            revision.blocks.iter().for_each(|b| b.content.discard());
            return Err(e);
        }

        info!(
            upload_id = %draft.upload_id,
            blocks = revision.blocks.len(),
            bytes = revision.size,
            "content encrypted"
        );
        draft.revision = revision;
        Ok(StageStatus::Done)
    }
}

struct EncryptJob {
    upload_id: UploadId,
    file_id: FileId,
    source: ContentSource,
    key: ContentKey,
    max_block_size: usize,
    spill_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

struct EncryptedContent {
    blocks: Vec<Block>,
    size: u64,
    sha1: String,
}

impl EncryptJob {
    /// `Ok(None)` when cancelled between batches.
    fn run(self) -> Result<Option<EncryptedContent>, UploadError> {
        if let Some(dir) = &self.spill_dir {
            std::fs::create_dir_all(dir)?;
        }

        let reader = self.source.open()?;
        let mut blocks_in = BlockReader::new(reader, self.max_block_size).map_err(UploadError::Crypto)?;
        let batch_size = rayon::current_num_threads().max(1) * 2;

        let mut digest = Sha1Digest::new();
        let mut size = 0u64;
        let mut blocks = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                debug!(upload_id = %self.upload_id, "encryption cancelled");
                blocks.iter().for_each(|b: &Block| b.content.discard());
                return Ok(None);
            }

            let mut batch: Vec<PlainBlock> = Vec::with_capacity(batch_size);
            for next in blocks_in.by_ref().take(batch_size) {
                let plain = next.map_err(|e| UploadError::Io(std::io::Error::other(e)))?;
                digest.update(&plain.data);
                size += plain.data.len() as u64;
                batch.push(plain);
            }
            if batch.is_empty() {
                break;
            }

            let encrypted: Result<Vec<Block>, UploadError> =
                batch.par_iter().map(|plain| self.encrypt_one(plain)).collect();
            match encrypted {
                Ok(done) => blocks.extend(done),
                Err(e) => {
                    blocks.iter().for_each(|b| b.content.discard());
                    return Err(e);
                }
            }
        }

        Ok(Some(EncryptedContent {
            blocks,
            size,
            sha1: digest.finalize_hex(),
        }))
    }

    fn encrypt_one(&self, plain: &PlainBlock) -> Result<Block, UploadError> {
        let ciphertext = sd_crypto::encrypt_block(&self.key, plain.index, self.file_id.as_str(), &plain.data)
            .map_err(UploadError::Crypto)?;
        let hash = sd_blocks::hash_to_hex(&sd_blocks::hash_bytes(&ciphertext));
        let enc_size = ciphertext.len() as u64;

        let content = match &self.spill_dir {
            Some(dir) => BlockContent::Spilled(spill(dir, &self.upload_id, plain.index, &ciphertext)?),
            None => BlockContent::Memory(ciphertext.into()),
        };

        Ok(Block {
            index: plain.index,
            plain_size: plain.data.len() as u64,
            enc_size,
            hash,
            uploaded: false,
            upload_url: None,
            content,
        })
    }
}

fn spill(dir: &Path, upload_id: &UploadId, index: u32, ciphertext: &[u8]) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("{upload_id}-{index:06}.blk"));
    std::fs::write(&path, ciphertext)?;
    Ok(path)
}
