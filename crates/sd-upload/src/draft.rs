//! File and revision draft creation.
//!
//! Reserves the remote identity of the upload: a new file (with name
//! discovery and clash retry) or a new revision of an existing file. The
//! server-assigned ids land in the local store in one transaction.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use sd_core::{FileId, FileState, RevisionId, UploadState};
use sd_crypto::{KeyMaterial, Passphrase};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::api::{codes, CreateFileRequest, CreatedFile};
use crate::error::{NamingError, StoreError, UploadError};
use crate::model::{FileDraft, NameHashPair};
use crate::names::ValidNameDiscoverer;
use crate::pipeline::{Stage, StageContext, StageStatus};
use crate::store::{transact, Repository};

pub struct CreateDraftStage;

#[async_trait]
impl Stage for CreateDraftStage {
    fn name(&self) -> &'static str {
        "create-draft"
    }

    async fn run(&self, draft: &mut FileDraft, ctx: &StageContext) -> Result<StageStatus, UploadError> {
        if !draft.revision.id.is_local() {
            return Ok(StageStatus::Done);
        }

        match draft.file_id.clone() {
            Some(file_id) => create_revision(draft, file_id, ctx).await,
            None => create_file(draft, ctx).await,
        }
    }
}

async fn create_revision(
    draft: &mut FileDraft,
    file_id: FileId,
    ctx: &StageContext,
) -> Result<StageStatus, UploadError> {
    let Some(result) = ctx
        .cancellable(ctx.api.create_revision(&draft.parent.share, &file_id))
        .await
    else {
        return Ok(StageStatus::Interrupted);
    };
    let revision_id = result.map_err(UploadError::DraftCreation)?;

    let name = draft.name.clone();
    finalize_draft(ctx.repo.as_ref(), draft, file_id, revision_id, name)?;
    info!(upload_id = %draft.upload_id, revision = %draft.revision.id, "revision draft created");
    Ok(StageStatus::Done)
}

async fn create_file(draft: &mut FileDraft, ctx: &StageContext) -> Result<StageStatus, UploadError> {
    let discoverer = ValidNameDiscoverer::new(ctx.api.as_ref(), ctx.config.name_probe_step);
    let mut rejected = HashSet::new();
    let mut clashes = 0u32;

    loop {
        let pair = match discoverer
            .find_available(
                &draft.parent.share,
                &draft.parent.node,
                &draft.name,
                &draft.parent.hash_key,
                &rejected,
                &ctx.cancel,
            )
            .await
        {
            Ok(Some(pair)) => pair,
            Ok(None) => return Ok(StageStatus::Interrupted),
            Err(e) => return Err(e.into()),
        };

        let request = build_create_request(draft, &pair)?;
        let Some(result) = ctx.cancellable(ctx.api.create_file(request)).await else {
            return Ok(StageStatus::Interrupted);
        };

        match result {
            Ok(CreatedFile { file_id, revision_id }) => {
                finalize_draft(ctx.repo.as_ref(), draft, file_id, revision_id, pair.name)?;
                info!(
                    upload_id = %draft.upload_id,
                    name = %draft.name,
                    revision = %draft.revision.id,
                    "file draft created"
                );
                return Ok(StageStatus::Done);
            }
            Err(e) if e.is_code(codes::NAME_ALREADY_EXISTS) => {
                clashes += 1;
                if clashes > ctx.config.max_name_clash_retries {
                    return Err(NamingError::TooManyClashes(clashes).into());
                }
                warn!(upload_id = %draft.upload_id, name = %pair.name, clashes, "name taken at creation, rediscovering");
                rejected.insert(pair.hash);
            }
            Err(e) => return Err(UploadError::DraftCreation(e)),
        }
    }
}

/// Armor the candidate name and the node's key packets for the create call.
///
/// Called once per candidate: the armored name is re-encrypted each time.
pub fn build_create_request(draft: &FileDraft, pair: &NameHashPair) -> Result<CreateFileRequest, UploadError> {
    let signer = &draft.signer.key;
    let crypto = |e: anyhow::Error| UploadError::Crypto(e);

    let armored_name = sd_crypto::encrypt_name(&draft.parent.key, &pair.name).map_err(crypto)?;

    let passphrase: Passphrase = sd_crypto::generate_key();
    let node_key = B64.encode(sd_crypto::wrap_key(&passphrase, &draft.node_key).map_err(crypto)?);
    let node_passphrase = B64.encode(sd_crypto::wrap_key(&draft.parent.key, &passphrase).map_err(crypto)?);
    let node_passphrase_signature =
        sd_crypto::sign_detached(signer, node_passphrase.as_bytes()).map_err(crypto)?;

    let content_key_packet =
        B64.encode(sd_crypto::wrap_key(&draft.node_key, &draft.content_key).map_err(crypto)?);
    let content_key_packet_signature =
        sd_crypto::sign_detached(signer, draft.content_key.as_bytes()).map_err(crypto)?;

    Ok(CreateFileRequest {
        share_id: draft.parent.share.clone(),
        parent_link_id: draft.parent.node.clone(),
        armored_name,
        name_hash: pair.hash.clone(),
        node_key,
        node_passphrase,
        node_passphrase_signature,
        signature_address: draft.signer.address.clone(),
        content_key_packet,
        content_key_packet_signature,
        mime_type: draft.mime_type.clone(),
    })
}

/// Persist the server ids, then adopt them in the draft.
///
/// On a failed save the draft keeps its placeholder revision.
pub fn finalize_draft(
    repo: &dyn Repository,
    draft: &mut FileDraft,
    file_id: FileId,
    revision_id: RevisionId,
    name: String,
) -> Result<(), UploadError> {
    let mut revision = draft.revision.clone();
    let placeholder = revision.id.clone();
    revision.id = revision_id;
    revision.state = UploadState::Created;

    transact(repo, |tx| {
        let mut file = tx
            .fetch_file(&draft.upload_id)
            .ok_or(StoreError::MissingFile(draft.upload_id))?;
        file.file_id = Some(file_id.clone());
        file.name = name.clone();
        file.state = FileState::Uploading;
        file.revision_draft = Some(revision.id.clone());

        tx.remove_revision(&placeholder);
        tx.put_revision(revision.clone());
        tx.put_file(file);
        Ok(())
    })?;

    draft.revision = revision;
    draft.file_id = Some(file_id);
    draft.name = name;
    Ok(())
}

/// Record a new draft in the store: its file record and placeholder revision.
///
/// A draft that was registered before (a resubmission) is left untouched.
pub fn register_draft(repo: &dyn Repository, draft: &FileDraft) -> Result<(), UploadError> {
    transact(repo, |tx| {
        if tx.fetch_file(&draft.upload_id).is_none() {
            tx.put_file(draft.file_record());
        }
        if tx.fetch_revision(&draft.revision.id).is_none() {
            tx.put_revision(draft.revision.clone());
        }
        Ok(())
    })
}
