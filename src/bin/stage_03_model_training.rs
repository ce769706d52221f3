//! Stage driver: fine-tune the classifier.

use cnn_classifier::config::{CONFIG_FILE_PATH, PARAMS_FILE_PATH};
use cnn_classifier::pipeline::{drive, StageName};
use std::path::Path;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    drive(
        &[StageName::Training],
        Path::new(CONFIG_FILE_PATH),
        Path::new(PARAMS_FILE_PATH),
    )
    .await
}
