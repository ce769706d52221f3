//! Stage drivers against a local dataset server.

use axum::{routing::get, Router};
use image::{ImageFormat, Rgb, RgbImage};
use std::io::{Cursor, Write};
use std::path::Path;

use cnn_classifier::config::ConfigurationManager;
use cnn_classifier::error::StageError;
use cnn_classifier::model::{load_metadata, ArtifactFormat, ModelKind};
use cnn_classifier::pipeline::{run_all, run_stage, Stage, StageName};

fn png(shade: u8) -> Vec<u8> {
    let mut bytes = Vec::new();
    RgbImage::from_pixel(40, 40, Rgb([shade, shade, shade]))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

const IMAGES_PER_CLASS: usize = 10;

/// Zipped `kidney-ct-scan-image/{Normal,Tumor}/*.png`
fn dataset_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (class, shade) in [("Normal", 20u8), ("Tumor", 220u8)] {
        for i in 0..IMAGES_PER_CLASS {
            writer
                .start_file(format!("kidney-ct-scan-image/{class}/scan_{i}.png"), options)
                .unwrap();
            writer.write_all(&png(shade)).unwrap();
        }
    }
    writer.finish().unwrap().into_inner()
}

async fn serve_dataset() -> String {
    let archive = dataset_zip();
    let app = Router::new().route(
        "/data.zip",
        get(move || {
            let archive = archive.clone();
            async move { archive }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/data.zip")
}

fn write_config(root: &Path, source_url: &str) -> ConfigurationManager {
    let artifacts = root.join("artifacts");
    let config = format!(
        r#"
artifacts_root: {a}
data_ingestion:
  root_dir: {a}/data_ingestion
  source_URL: {source_url}
  local_data_file: {a}/data_ingestion/data.zip
  unzip_dir: {a}/data_ingestion
prepare_base_model:
  root_dir: {a}/prepare_base_model
  base_model_path: {a}/prepare_base_model/base_model.tar.gz
  updated_base_model_path: {a}/prepare_base_model/base_model_updated.tar.gz
training:
  root_dir: {a}/training
  trained_model_path: {a}/training/model.tar.gz
evaluation:
  scores_path: {a}/scores.json
device: cpu
"#,
        a = artifacts.display()
    );
    let params = r#"
AUGMENTATION: true
IMAGE_SIZE: [32, 32, 3]
BATCH_SIZE: 2
INCLUDE_TOP: false
EPOCHS: 1
CLASSES: 2
WEIGHTS: none
LEARNING_RATE: 0.01
BACKBONE_CHANNELS: [4, 4, 8, 8, 8]
"#;
    let config_path = root.join("config.yaml");
    let params_path = root.join("params.yaml");
    std::fs::write(&config_path, config).unwrap();
    std::fs::write(&params_path, params).unwrap();
    ConfigurationManager::new(&config_path, &params_path).unwrap()
}

#[tokio::test]
async fn test_data_ingestion_stage_produces_image_folder() {
    let dir = tempfile::tempdir().unwrap();
    let manager = write_config(dir.path(), &serve_dataset().await);

    run_stage(StageName::DataIngestion, &manager).await.unwrap();

    let outputs = Stage::new(StageName::DataIngestion, &manager).outputs();
    assert_eq!(outputs.len(), 2);
    for output in &outputs {
        output.check().unwrap();
    }
    let images = outputs
        .iter()
        .find(|o| o.format == ArtifactFormat::ImageFolder)
        .unwrap();
    assert!(images.path.join("Tumor/scan_2.png").exists());

    // rerun replaces the extraction
    run_stage(StageName::DataIngestion, &manager).await.unwrap();
    assert_eq!(
        std::fs::read_dir(images.path.join("Normal")).unwrap().count(),
        IMAGES_PER_CLASS
    );
}

#[tokio::test]
async fn test_training_needs_prepared_model() {
    let dir = tempfile::tempdir().unwrap();
    let manager = write_config(dir.path(), &serve_dataset().await);
    run_stage(StageName::DataIngestion, &manager).await.unwrap();

    let err = run_stage(StageName::Training, &manager).await.unwrap_err();
    match err {
        StageError::Contract { path, .. } => {
            assert!(path.ends_with("base_model_updated.tar.gz"))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_evaluation_needs_trained_model() {
    let dir = tempfile::tempdir().unwrap();
    let manager = write_config(dir.path(), "http://127.0.0.1:9/data.zip");

    let err = run_stage(StageName::Evaluation, &manager).await.unwrap_err();
    assert!(matches!(err, StageError::Contract { .. }));
    assert!(!dir.path().join("artifacts/scores.json").exists());
}

#[tokio::test]
async fn test_unreachable_source_fails_ingestion() {
    let dir = tempfile::tempdir().unwrap();
    let manager = write_config(dir.path(), "http://127.0.0.1:9/data.zip");

    let err = run_stage(StageName::DataIngestion, &manager).await.unwrap_err();
    assert!(matches!(err, StageError::Ingestion(_)));
}

#[tokio::test]
async fn test_run_all_produces_every_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let manager = write_config(dir.path(), &serve_dataset().await);

    run_all(&manager).await.unwrap();

    for name in StageName::ALL {
        for output in Stage::new(name, &manager).outputs() {
            output.check().unwrap();
        }
    }

    let artifacts = dir.path().join("artifacts");
    let base = load_metadata(&artifacts.join("prepare_base_model/base_model.tar.gz")).unwrap();
    assert_eq!(base.kind, ModelKind::Backbone);
    assert_eq!(base.backbone.channels, [4, 4, 8, 8, 8]);

    let trained = load_metadata(&artifacts.join("training/model.tar.gz")).unwrap();
    assert_eq!(trained.num_epochs, 1);
    assert_eq!(trained.class_labels, ["Normal", "Tumor"]);

    let scores: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(artifacts.join("scores.json")).unwrap()).unwrap();
    assert!(scores["loss"].as_f64().unwrap().is_finite());
    let accuracy = scores["accuracy"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&accuracy));
}
