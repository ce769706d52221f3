//! Experiment tracking.
//!
//! A run records the training parameters, the evaluation metrics and the
//! model bundle. `file:` URIs (or plain paths) keep runs on disk, `http(s):`
//! URIs talk to an MLflow tracking server over its REST API.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use crate::error::TrackingError;

const DEFAULT_EXPERIMENT_ID: &str = "0";

/// Everything logged for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunRecord {
    pub params: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, f64>,
    /// Model bundle stored under `artifacts/model/`
    #[serde(skip)]
    pub model: Option<PathBuf>,
}

impl RunRecord {
    /// Flatten a serializable parameter struct into string params
    pub fn with_params<T: Serialize>(mut self, params: &T) -> Result<Self, TrackingError> {
        if let Value::Object(map) = serde_json::to_value(params)? {
            for (key, value) in map {
                let value = match value {
                    Value::String(s) => s,
                    Value::Null => "None".to_string(),
                    other => other.to_string(),
                };
                self.params.insert(key, value);
            }
        }
        Ok(self)
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    pub fn with_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.model = Some(path.into());
        self
    }
}

pub trait ExperimentTracker {
    /// Log a finished run and return its id
    fn log_run(&self, run: &RunRecord) -> impl Future<Output = Result<String, TrackingError>> + Send;
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn model_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model.tar.gz".to_string())
}

/// Runs stored as directories: `<root>/<experiment>/<run_id>/`
#[derive(Debug, Clone)]
pub struct FileTracker {
    root: PathBuf,
    experiment_id: String,
}

impl FileTracker {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            experiment_id: DEFAULT_EXPERIMENT_ID.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(&self.experiment_id).join(run_id)
    }

    fn write_run(&self, run_id: &str, run: &RunRecord) -> Result<(), TrackingError> {
        let start_time = now_millis();
        let run_dir = self.run_dir(run_id);
        std::fs::create_dir_all(&run_dir)?;

        std::fs::write(run_dir.join("params.json"), serde_json::to_string_pretty(&run.params)?)?;
        std::fs::write(run_dir.join("metrics.json"), serde_json::to_string_pretty(&run.metrics)?)?;

        if let Some(model) = &run.model {
            let model_dir = run_dir.join("artifacts").join("model");
            std::fs::create_dir_all(&model_dir)?;
            std::fs::copy(model, model_dir.join(model_file_name(model)))?;
        }

        let meta = json!({
            "run_id": run_id,
            "experiment_id": self.experiment_id,
            "status": "FINISHED",
            "start_time": start_time,
            "end_time": now_millis(),
        });
        std::fs::write(run_dir.join("meta.json"), serde_json::to_string_pretty(&meta)?)?;
        Ok(())
    }
}

impl ExperimentTracker for FileTracker {
    async fn log_run(&self, run: &RunRecord) -> Result<String, TrackingError> {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        self.write_run(&run_id, run)?;
        tracing::info!("Logged run {} to {}", run_id, self.run_dir(&run_id).display());
        Ok(run_id)
    }
}

#[derive(Debug, Clone)]
struct BasicAuth {
    username: String,
    password: Option<String>,
}

/// MLflow tracking server client
#[derive(Debug, Clone)]
pub struct MlflowTracker {
    base_url: String,
    experiment_id: String,
    auth: Option<BasicAuth>,
    client: reqwest::Client,
}

impl MlflowTracker {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            experiment_id: DEFAULT_EXPERIMENT_ID.to_string(),
            auth: None,
            client: reqwest::Client::new(),
        }
    }

    /// Credentials from `MLFLOW_TRACKING_USERNAME` / `MLFLOW_TRACKING_PASSWORD`
    pub fn with_env_credentials(mut self) -> Self {
        if let Ok(username) = std::env::var("MLFLOW_TRACKING_USERNAME") {
            self.auth = Some(BasicAuth {
                username,
                password: std::env::var("MLFLOW_TRACKING_PASSWORD").ok(),
            });
        }
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(BasicAuth {
            username: username.into(),
            password: Some(password.into()),
        });
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(auth) => request.basic_auth(&auth.username, auth.password.as_ref()),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, TrackingError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(TrackingError::Server {
            status: status.as_u16(),
            body,
        })
    }

    async fn post(&self, endpoint: &str, body: Value) -> Result<Value, TrackingError> {
        let url = format!("{}/api/2.0/mlflow/{}", self.base_url, endpoint);
        let request = self.authorize(self.client.post(&url).json(&body));
        let response = Self::check(request.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn create_run(&self) -> Result<String, TrackingError> {
        let response = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": self.experiment_id,
                    "start_time": now_millis(),
                }),
            )
            .await?;
        response["run"]["info"]["run_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| TrackingError::Response(format!("runs/create returned no run id: {response}")))
    }

    async fn log_batch(&self, run_id: &str, run: &RunRecord) -> Result<(), TrackingError> {
        let timestamp = now_millis();
        let params: Vec<Value> = run
            .params
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value}))
            .collect();
        let metrics: Vec<Value> = run
            .metrics
            .iter()
            .map(|(key, value)| json!({"key": key, "value": value, "timestamp": timestamp, "step": 0}))
            .collect();

        self.post(
            "runs/log-batch",
            json!({"run_id": run_id, "params": params, "metrics": metrics}),
        )
        .await?;
        Ok(())
    }

    async fn upload_model(&self, run_id: &str, model: &Path) -> Result<(), TrackingError> {
        let url = format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}/artifacts/model/{}",
            self.base_url,
            self.experiment_id,
            run_id,
            model_file_name(model)
        );
        let bytes = tokio::fs::read(model).await?;
        tracing::info!("Uploading model artifact ({} bytes)", bytes.len());
        let request = self.authorize(self.client.put(&url).body(bytes));
        Self::check(request.send().await?).await?;
        Ok(())
    }

    async fn finish_run(&self, run_id: &str, status: &str) -> Result<(), TrackingError> {
        self.post(
            "runs/update",
            json!({"run_id": run_id, "status": status, "end_time": now_millis()}),
        )
        .await?;
        Ok(())
    }
}

impl ExperimentTracker for MlflowTracker {
    async fn log_run(&self, run: &RunRecord) -> Result<String, TrackingError> {
        let run_id = self.create_run().await?;

        let logged = async {
            self.log_batch(&run_id, run).await?;
            if let Some(model) = &run.model {
                self.upload_model(&run_id, model).await?;
            }
            Ok::<_, TrackingError>(())
        }
        .await;

        match logged {
            Ok(()) => {
                self.finish_run(&run_id, "FINISHED").await?;
                tracing::info!("Logged run {} to {}", run_id, self.base_url);
                Ok(run_id)
            }
            Err(err) => {
                if let Err(update_err) = self.finish_run(&run_id, "FAILED").await {
                    tracing::warn!("Could not mark run {} as failed: {}", run_id, update_err);
                }
                Err(err)
            }
        }
    }
}

/// Tracker selected from a tracking URI
#[derive(Debug, Clone)]
pub enum Tracker {
    File(FileTracker),
    Mlflow(MlflowTracker),
}

impl Tracker {
    pub fn from_uri(uri: &str) -> Result<Self, TrackingError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(TrackingError::UnsupportedUri(uri.to_string()));
        }

        match url::Url::parse(uri) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                Ok(Tracker::Mlflow(MlflowTracker::new(uri).with_env_credentials()))
            }
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(|path| Tracker::File(FileTracker::new(path)))
                .map_err(|_| TrackingError::UnsupportedUri(uri.to_string())),
            // single letters are Windows drive prefixes
            Ok(url) if url.scheme().len() > 1 => Err(TrackingError::UnsupportedUri(uri.to_string())),
            _ => Ok(Tracker::File(FileTracker::new(uri))),
        }
    }

    pub fn is_file_store(&self) -> bool {
        matches!(self, Tracker::File(_))
    }
}

impl ExperimentTracker for Tracker {
    async fn log_run(&self, run: &RunRecord) -> Result<String, TrackingError> {
        match self {
            Tracker::File(tracker) => tracker.log_run(run).await,
            Tracker::Mlflow(tracker) => tracker.log_run(run).await,
        }
    }
}
