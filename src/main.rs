//! `cnn-classifier`: training pipeline, single-image prediction and the
//! prediction service behind one command.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cnn_classifier::config::{ConfigurationManager, CONFIG_FILE_PATH, PARAMS_FILE_PATH};
use cnn_classifier::logging::LoggingConfig;
use cnn_classifier::ml::dispatch;
use cnn_classifier::pipeline::{drive, ImageClassifier, LoadClassifier, StageName};
use cnn_classifier::server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "cnn-classifier", version, about = "Kidney CT scan tumor/normal classifier")]
struct Cli {
    /// Structural configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE_PATH)]
    config: PathBuf,

    /// Hyperparameter file
    #[arg(long, global = true, default_value = PARAMS_FILE_PATH)]
    params: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run all four training stages in order
    Run,
    /// Run a single stage
    Stage {
        #[arg(value_enum)]
        name: StageName,
    },
    /// Classify one image
    Predict {
        image: PathBuf,
        /// Model bundle (defaults to `prediction.model_path`)
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Start the upload-and-predict HTTP service
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: SocketAddr,
        #[arg(long, default_value = "uploads")]
        upload_dir: PathBuf,
        /// Model bundle (defaults to `prediction.model_path`)
        #[arg(long)]
        model: Option<PathBuf>,
    },
}

fn load_classifier(cli: &Cli, model: Option<PathBuf>) -> anyhow::Result<Arc<dyn ImageClassifier>> {
    let manager = ConfigurationManager::new(&cli.config, &cli.params).context("failed to load configuration")?;
    let model_path = model.unwrap_or_else(|| manager.get_prediction_config().model_path);
    dispatch(manager.device(), LoadClassifier { model_path: model_path.clone() })
        .with_context(|| format!("failed to load model {}", model_path.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Run | Command::Stage { .. } => {
            let stages = match &cli.command {
                Command::Stage { name } => vec![*name],
                _ => StageName::ALL.to_vec(),
            };
            // scoped logging follows the current thread
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(drive(&stages, &cli.config, &cli.params))
        }
        Command::Predict { image, model } => {
            dotenvy::dotenv().ok();
            let logging = LoggingConfig::default().build().context("failed to set up logging")?;
            let _scope = logging.scoped();

            let classifier = load_classifier(&cli, model.clone())?;
            let diagnosis = classifier
                .predict(image)
                .with_context(|| format!("failed to classify {}", image.display()))?;
            println!("{}", serde_json::json!([{ "image": diagnosis }]));
            Ok(())
        }
        Command::Serve { addr, upload_dir, model } => {
            dotenvy::dotenv().ok();
            let logging = LoggingConfig::default().build().context("failed to set up logging")?;
            logging.install_global().context("a global logger is already installed")?;

            let classifier = load_classifier(&cli, model.clone())?;
            let state = AppState::new(classifier, upload_dir.clone());
            tokio::runtime::Runtime::new()?
                .block_on(serve(*addr, state))
                .context("prediction service failed")
        }
    }
}
