//! Stage input/output contracts.
//!
//! Stages exchange data only through files. Each stage declares the files it
//! reads and writes as [`ArtifactSpec`]s; inputs are checked before a stage
//! starts and outputs after it finished.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::components::model_evaluation::Score;
use crate::error::StageError;
use crate::ml::ImageFolder;
use crate::model::model_metadata::ModelKind;
use crate::model::model_storage::load_metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    /// Downloaded dataset archive (non-empty file)
    Archive,
    /// One subdirectory of images per class
    ImageFolder,
    /// tar.gz model bundle of the given kind
    ModelBundle(ModelKind),
    /// `{"loss": .., "accuracy": ..}`
    ScoresJson,
}

impl fmt::Display for ArtifactFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactFormat::Archive => write!(f, "dataset archive"),
            ArtifactFormat::ImageFolder => write!(f, "labeled image folder"),
            ArtifactFormat::ModelBundle(kind) => write!(f, "{kind} model bundle"),
            ArtifactFormat::ScoresJson => write!(f, "scores file"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub path: PathBuf,
    pub format: ArtifactFormat,
}

impl ArtifactSpec {
    pub fn new(path: impl Into<PathBuf>, format: ArtifactFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    fn violation(&self, reason: impl Into<String>) -> StageError {
        StageError::Contract {
            path: self.path.clone(),
            format: self.format.to_string(),
            reason: reason.into(),
        }
    }

    /// Verify the artifact exists and has the declared format
    pub fn check(&self) -> Result<(), StageError> {
        let path: &Path = &self.path;
        if !path.exists() {
            return Err(self.violation("does not exist"));
        }

        match self.format {
            ArtifactFormat::Archive => {
                let size = std::fs::metadata(path)
                    .map_err(|e| self.violation(e.to_string()))?
                    .len();
                if !path.is_file() || size == 0 {
                    return Err(self.violation("not a non-empty file"));
                }
            }
            ArtifactFormat::ImageFolder => {
                ImageFolder::scan(path).map_err(|e| self.violation(e.to_string()))?;
            }
            ArtifactFormat::ModelBundle(expected) => {
                let metadata = load_metadata(path).map_err(|e| self.violation(e.to_string()))?;
                if metadata.kind != expected {
                    return Err(self.violation(format!("contains a {} model", metadata.kind)));
                }
            }
            ArtifactFormat::ScoresJson => {
                let content =
                    std::fs::read_to_string(path).map_err(|e| self.violation(e.to_string()))?;
                serde_json::from_str::<Score>(&content)
                    .map_err(|e| self.violation(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::generator::tests::write_image_folder;

    #[test]
    fn test_missing_artifact() {
        let spec = ArtifactSpec::new("/nonexistent/data.zip", ArtifactFormat::Archive);
        let err = spec.check().unwrap_err();
        assert_eq!(
            err.to_string(),
            "stage artifact /nonexistent/data.zip is not a valid dataset archive: does not exist"
        );
    }

    #[test]
    fn test_empty_archive_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.zip");
        std::fs::write(&path, b"").unwrap();
        assert!(ArtifactSpec::new(&path, ArtifactFormat::Archive).check().is_err());
    }

    #[test]
    fn test_image_folder() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ArtifactSpec::new(dir.path(), ArtifactFormat::ImageFolder);
        assert!(spec.check().is_err());

        write_image_folder(dir.path(), &[("Normal", 1), ("Tumor", 1)]);
        assert!(spec.check().is_ok());
    }

    #[test]
    fn test_scores_json_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.json");
        let spec = ArtifactSpec::new(&path, ArtifactFormat::ScoresJson);

        std::fs::write(&path, r#"{"loss": 0.5, "accuracy": 0.75}"#).unwrap();
        assert!(spec.check().is_ok());

        std::fs::write(&path, r#"{"loss": 0.5}"#).unwrap();
        assert!(spec.check().is_err());

        std::fs::write(&path, r#"{"loss": 0.5, "accuracy": 0.75, "f1": 0.1}"#).unwrap();
        assert!(spec.check().is_err());
    }

    #[test]
    fn test_not_a_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        std::fs::write(&path, b"garbage").unwrap();
        let spec = ArtifactSpec::new(&path, ArtifactFormat::ModelBundle(ModelKind::Classifier));
        assert!(matches!(spec.check(), Err(StageError::Contract { .. })));
    }
}
