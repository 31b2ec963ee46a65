//! sd-upload: encrypted file upload pipeline
//!
//! An upload is a [`FileDraft`] carried through five stages:
//!
//! ```text
//! create-draft → encrypt-blocks → upload-blocks → verify-blocks → seal
//! ```
//!
//! Each stage persists its progress through a [`Repository`] transaction
//! before touching the in-memory draft, so a failed or cancelled upload can
//! be resubmitted and resumes where it stopped. [`FileUploader`] schedules
//! many drafts with bounded concurrency.

pub mod api;
pub mod draft;
pub mod encryptor;
pub mod error;
pub mod loopback;
pub mod model;
pub mod names;
pub mod operations;
pub mod pipeline;
pub mod seal;
pub mod store;
pub mod transfer;
pub mod uploader;
pub mod verify;

pub use api::{ApiError, BlockTransport, DriveApi};
pub use error::{NamingError, StoreError, UploadError, VerificationError};
pub use loopback::LoopbackDrive;
pub use model::{ContentSource, FileDraft, FileRecord, ParentFolder, Revision, Signer};
pub use operations::{OperationsFactory, UploadOperationsFactory};
pub use pipeline::{run_pipeline, PipelineOutcome, Progress, Stage, StageContext, StageStatus};
pub use store::{LocalStore, Repository, Transaction};
pub use uploader::{FileUploader, UploadEvent, UploadReport};
