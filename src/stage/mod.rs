//! Stage images and stage graph helpers

pub mod artifact_import;
pub mod container;
pub mod dockerfile;
pub mod image;

pub use artifact_import::{
    generate_artifact_import_stage, ArtifactImport, ArtifactImportStage, ImportAnchor, Stage,
};
pub use container::StageImageContainer;
pub use dockerfile::DockerfileImageBuilder;
pub use image::{BuildOptions, StageImage, StageSettings, StageState};
