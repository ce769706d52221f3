//! Model bundle persistence.
//!
//! A bundle is a single tar.gz file with two entries:
//! - metadata.json   - [`ModelMetadata`] (architecture, labels, compile settings)
//! - model.bin       - module record written by `BinBytesRecorder`

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::error::ModelError;
use crate::ml::{CnnClassifier, Vgg16};
use crate::model::model_metadata::{ModelKind, ModelMetadata};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

fn append_entry<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), ModelError> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

/// Save metadata and weights into one tar.gz bundle.
///
/// Returns the path actually written; `.tar.gz` is appended when `output_path`
/// has no `.gz` extension.
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf, ModelError> {
    let tar_gz_path = if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    };

    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let encoder = GzEncoder::new(File::create(&tar_gz_path)?, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    append_entry(&mut tar_builder, METADATA_ENTRY, metadata.to_json_string()?.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    tar_builder.into_inner()?.finish()?;

    Ok(tar_gz_path)
}

/// Read one named entry out of a bundle
fn read_entry(tar_gz_path: &Path, entry_name: &'static str) -> Result<Vec<u8>, ModelError> {
    let mut archive = Archive::new(GzDecoder::new(File::open(tar_gz_path)?));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(entry_name) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(ModelError::MissingEntry {
        path: tar_gz_path.to_path_buf(),
        entry: entry_name,
    })
}

/// Load bundle metadata only
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata, ModelError> {
    let json = read_entry(tar_gz_path, METADATA_ENTRY)?;
    let json = String::from_utf8_lossy(&json);
    ModelMetadata::from_json_string(&json)
}

/// Load metadata and weights in one pass
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>), ModelError> {
    let mut archive = Archive::new(GzDecoder::new(File::open(tar_gz_path)?));

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();

        match path.as_str() {
            METADATA_ENTRY => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            MODEL_ENTRY => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    let missing = |entry| ModelError::MissingEntry {
        path: tar_gz_path.to_path_buf(),
        entry,
    };
    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(missing(METADATA_ENTRY)),
        (_, None) => Err(missing(MODEL_ENTRY)),
    }
}

/// Serialize any module and save it as a bundle
pub fn save_module<B: Backend, M: Module<B>>(
    output_path: &Path,
    metadata: &ModelMetadata,
    module: M,
) -> Result<PathBuf, ModelError> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let binary = recorder
        .record(module.into_record(), ())
        .map_err(|e| ModelError::Record(format!("{e:?}")))?;
    let path = save_model_with_metadata(output_path, metadata, &binary)?;
    log_metadata_info(&path, metadata);
    Ok(path)
}

fn expect_kind(path: &Path, metadata: &ModelMetadata, expected: ModelKind) -> Result<(), ModelError> {
    if metadata.kind != expected {
        return Err(ModelError::WrongKind {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            found: metadata.kind.to_string(),
        });
    }
    Ok(())
}

/// Load a backbone bundle
pub fn load_backbone<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(ModelMetadata, Vgg16<B>), ModelError> {
    let (metadata, binary) = load_model_with_metadata(path)?;
    expect_kind(path, &metadata, ModelKind::Backbone)?;

    let model = metadata.backbone.init::<B>(device)?;
    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(binary, device)
        .map_err(|e| ModelError::Record(format!("{e:?}")))?;

    Ok((metadata, model.load_record(record)))
}

/// Load a classifier bundle.
///
/// Records do not carry trainability, so the frozen prefix stored in the
/// metadata is applied again.
pub fn load_classifier<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(ModelMetadata, CnnClassifier<B>), ModelError> {
    let (metadata, binary) = load_model_with_metadata(path)?;
    expect_kind(path, &metadata, ModelKind::Classifier)?;
    let config = metadata.classifier_config().ok_or(ModelError::MissingEntry {
        path: path.to_path_buf(),
        entry: "num_classes",
    })?;

    let model = config.init::<B>(device)?;
    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(binary, device)
        .map_err(|e| ModelError::Record(format!("{e:?}")))?;
    let model = model.load_record(record).freeze_backbone(metadata.frozen_layers);

    Ok((metadata, model))
}

/// Log a one-line description of a saved bundle
pub fn log_metadata_info(path: &Path, metadata: &ModelMetadata) {
    tracing::info!(
        kind = %metadata.kind,
        input = %format!("{}x{}", metadata.backbone.image_height, metadata.backbone.image_width),
        include_top = metadata.backbone.include_top,
        classes = ?metadata.num_classes,
        frozen_layers = metadata.frozen_layers,
        epochs = metadata.num_epochs,
        "Model saved at: {}",
        path.display()
    );
}
