pub mod artifact;
pub mod model_metadata;
pub mod model_storage;

pub use artifact::{ArtifactFormat, ArtifactSpec};
pub use model_metadata::{CompileSettings, ModelKind, ModelMetadata};
pub use model_storage::{
    load_backbone, load_classifier, load_metadata, load_model_with_metadata,
    log_metadata_info, save_model_with_metadata, save_module,
};
