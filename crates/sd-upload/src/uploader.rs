//! Upload scheduler.
//!
//! Each submitted draft runs its pipeline on its own tokio task. A
//! semaphore bounds how many pipelines run at once; the rest wait for a
//! permit. Every upload has its own cancellation token, and results come
//! back as [`UploadEvent`]s on an unbounded channel.

use parking_lot::Mutex;
use sd_core::{FileState, UploadId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::draft::register_draft;
use crate::error::{StoreError, UploadError};
use crate::model::{BlockContent, FileDraft, Revision};
use crate::operations::OperationsFactory;
use crate::pipeline::{run_pipeline, PipelineOutcome, Progress, ProgressFn, StageContext};
use crate::store::{transact, Repository};

/// Stage reported for an upload cancelled while waiting for a permit
pub const QUEUED: &str = "queued";

#[derive(Debug)]
pub enum UploadEvent {
    Progress(Progress),
    Finished(UploadReport),
}

/// Final state of one submitted upload.
///
/// The draft is handed back so a failed or cancelled upload can be
/// resubmitted and resume from its persisted state.
#[derive(Debug)]
pub struct UploadReport {
    pub upload_id: UploadId,
    pub draft: FileDraft,
    pub result: Result<PipelineOutcome, UploadError>,
}

pub struct FileUploader {
    ctx: StageContext,
    operations: Arc<dyn OperationsFactory>,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashMap<UploadId, CancellationToken>>>,
    events: mpsc::UnboundedSender<UploadEvent>,
}

impl FileUploader {
    pub fn new(
        ctx: StageContext,
        operations: Arc<dyn OperationsFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let concurrency = ctx.config.concurrency.max(1);
        info!(concurrency, "uploader ready");
        let uploader = Self {
            ctx,
            operations,
            permits: Arc::new(Semaphore::new(concurrency)),
            running: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (uploader, rx)
    }

    /// Register `draft` locally and schedule its pipeline.
    pub fn submit(&self, draft: FileDraft) -> Result<UploadId, UploadError> {
        let upload_id = draft.upload_id;
        let cancel = CancellationToken::new();
        {
            let mut running = self.running.lock();
            if running.contains_key(&upload_id) {
                return Err(UploadError::invalid_state(format!("upload {upload_id} is already running")));
            }
            register_draft(self.ctx.repo.as_ref(), &draft)?;
            running.insert(upload_id, cancel.clone());
        }

        let ctx = self.ctx.with_cancel(cancel);
        let operations = self.operations.clone();
        let permits = self.permits.clone();
        let running = self.running.clone();
        let events = self.events.clone();
        debug!(upload_id = %upload_id, name = %draft.name, "upload submitted");

        tokio::spawn(async move {
            let mut draft = draft;
            let progress_events = events.clone();
            let progress: ProgressFn = Box::new(move |p| {
                let _ = progress_events.send(UploadEvent::Progress(p));
            });

            let permit = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            let result = match permit {
                Some(_permit) => {
                    let stages = operations.make(&draft);
                    run_pipeline(&stages, &mut draft, &ctx, Some(&progress)).await
                }
                None => {
                    info!(upload_id = %upload_id, "upload cancelled while queued");
                    Ok(PipelineOutcome::Cancelled { stage: QUEUED })
                }
            };

            if let Err(e) = &result {
                if e.is_retryable() {
                    info!(upload_id = %upload_id, "upload failed, can be resubmitted: {e}");
                } else {
                    match mark_failed(ctx.repo.as_ref(), upload_id) {
                        Ok(Some(revision)) => draft.revision = revision,
                        Ok(None) => {}
                        Err(mark) => warn!(upload_id = %upload_id, "could not record failure ({e}): {mark}"),
                    }
                }
            }

            running.lock().remove(&upload_id);
            let _ = events.send(UploadEvent::Finished(UploadReport {
                upload_id,
                draft,
                result,
            }));
        });

        Ok(upload_id)
    }

    /// Request cancellation of one upload. `false` if it is not running.
    pub fn cancel(&self, upload_id: &UploadId) -> bool {
        match self.running.lock().get(upload_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let running = self.running.lock();
        info!(count = running.len(), "cancelling all uploads");
        running.values().for_each(CancellationToken::cancel);
    }

    pub fn in_flight(&self) -> usize {
        self.running.lock().len()
    }
}

/// Record a permanent failure and drop the draft revision's ciphertext.
fn mark_failed(repo: &dyn Repository, upload_id: UploadId) -> Result<Option<Revision>, UploadError> {
    let mut released = Vec::new();
    let revision = transact(repo, |tx| {
        let mut file = tx.fetch_file(&upload_id).ok_or(StoreError::MissingFile(upload_id))?;
        file.state = FileState::Failed;
        let revision = file
            .revision_draft
            .as_ref()
            .and_then(|id| tx.fetch_revision(id))
            .map(|mut revision| {
                for block in &mut revision.blocks {
                    released.push(std::mem::replace(&mut block.content, BlockContent::Released));
                }
                revision
            });
        if let Some(revision) = &revision {
            tx.put_revision(revision.clone());
        }
        tx.put_file(file);
        Ok(revision)
    })?;
    released.iter().for_each(BlockContent::discard);
    Ok(revision)
}
