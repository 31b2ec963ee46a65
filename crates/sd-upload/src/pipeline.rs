//! Stage driver.
//!
//! A pipeline is an ordered list of boxed [`Stage`]s run strictly in
//! sequence against one [`FileDraft`]. The driver checks the cancellation
//! token before every stage, stops at the first error, and reports progress
//! by accumulated stage weight. It never retries.

use async_trait::async_trait;
use sd_core::config::UploadConfig;
use sd_core::UploadId;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{BlockTransport, DriveApi};
use crate::error::UploadError;
use crate::model::FileDraft;
use crate::store::Repository;

/// Collaborators shared by every stage of one pipeline run
#[derive(Clone)]
pub struct StageContext {
    pub api: Arc<dyn DriveApi>,
    pub transport: Arc<dyn BlockTransport>,
    pub repo: Arc<dyn Repository>,
    pub config: Arc<UploadConfig>,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(
        api: Arc<dyn DriveApi>,
        transport: Arc<dyn BlockTransport>,
        repo: Arc<dyn Repository>,
        config: UploadConfig,
    ) -> Self {
        Self {
            api,
            transport,
            repo,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Same collaborators, different cancellation scope.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    /// Await `fut` unless the run is cancelled first.
    pub async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            value = fut => Some(value),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Done,
    /// Stopped early on cancellation; persisted state is consistent
    Interrupted,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Share of the total progress this stage accounts for
    fn weight(&self) -> u32 {
        1
    }

    async fn run(&self, draft: &mut FileDraft, ctx: &StageContext) -> Result<StageStatus, UploadError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    Cancelled { stage: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub upload_id: UploadId,
    pub stage: &'static str,
    pub completed: u32,
    pub total: u32,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        f64::from(self.completed) / f64::from(self.total)
    }
}

/// Progress callback, called after each completed stage
pub type ProgressFn = Box<dyn Fn(Progress) + Send + Sync>;

/// Run `stages` in order against `draft`.
pub async fn run_pipeline(
    stages: &[Box<dyn Stage>],
    draft: &mut FileDraft,
    ctx: &StageContext,
    progress: Option<&ProgressFn>,
) -> Result<PipelineOutcome, UploadError> {
    let total: u32 = stages.iter().map(|s| s.weight()).sum();
    let mut completed = 0;

    for stage in stages {
        if ctx.cancel.is_cancelled() {
            info!(upload_id = %draft.upload_id, stage = stage.name(), "upload cancelled before stage");
            return Ok(PipelineOutcome::Cancelled { stage: stage.name() });
        }

        debug!(upload_id = %draft.upload_id, stage = stage.name(), "stage starting");
        match stage.run(draft, ctx).await {
            Ok(StageStatus::Done) => {
                completed += stage.weight();
                debug!(upload_id = %draft.upload_id, stage = stage.name(), "stage finished");
                if let Some(cb) = progress {
                    cb(Progress {
                        upload_id: draft.upload_id,
                        stage: stage.name(),
                        completed,
                        total,
                    });
                }
            }
            Ok(StageStatus::Interrupted) => {
                info!(upload_id = %draft.upload_id, stage = stage.name(), "upload cancelled during stage");
                return Ok(PipelineOutcome::Cancelled { stage: stage.name() });
            }
            Err(e) => {
                warn!(upload_id = %draft.upload_id, stage = stage.name(), error = %e, "stage failed");
                return Err(e);
            }
        }
    }

    info!(upload_id = %draft.upload_id, name = %draft.name, revision = %draft.revision.id, "upload completed");
    Ok(PipelineOutcome::Completed)
}
