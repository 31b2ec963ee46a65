//! Stage list construction per draft.

use crate::draft::CreateDraftStage;
use crate::encryptor::EncryptBlocksStage;
use crate::model::FileDraft;
use crate::pipeline::Stage;
use crate::seal::SealRevisionStage;
use crate::transfer::UploadBlocksStage;
use crate::verify::VerifyBlocksStage;

/// Builds the ordered stages that carry one draft to a sealed revision.
pub trait OperationsFactory: Send + Sync {
    fn make(&self, draft: &FileDraft) -> Vec<Box<dyn Stage>>;
}

/// create → encrypt → upload → verify → seal
#[derive(Debug, Default, Clone, Copy)]
pub struct UploadOperationsFactory;

impl OperationsFactory for UploadOperationsFactory {
    fn make(&self, _draft: &FileDraft) -> Vec<Box<dyn Stage>> {
        vec![
            Box::new(CreateDraftStage),
            Box::new(EncryptBlocksStage),
            Box::new(UploadBlocksStage),
            Box::new(VerifyBlocksStage),
            Box::new(SealRevisionStage),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentSource, ParentFolder, Signer};

    #[test]
    fn stages_are_ordered_and_weighted() {
        let parent = ParentFolder::new("S1", "P1", sd_crypto::generate_key()).unwrap();
        let signer = Signer {
            address: "me@example.com".into(),
            key: sd_crypto::generate_key(),
        };
        let draft = FileDraft::new_file(parent, "a.txt", ContentSource::Memory("x".into()), signer);

        let stages = UploadOperationsFactory.make(&draft);

        let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["create-draft", "encrypt-blocks", "upload-blocks", "verify-blocks", "seal"]);
        let weights: Vec<u32> = stages.iter().map(|s| s.weight()).collect();
        assert_eq!(weights, [1, 3, 4, 1, 1]);
    }
}
