//! Upload-and-predict HTTP service.

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::pipeline::{Diagnosis, ImageClassifier};

const INDEX_HTML: &str = include_str!("../static/index.html");
const SCRIPT_JS: &str = include_str!("../static/js/script.js");

/// Largest accepted request body
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub classifier: Arc<dyn ImageClassifier>,
    /// Uploads are stored here while they are classified
    pub upload_dir: PathBuf,
}

impl AppState {
    pub fn new(classifier: Arc<dyn ImageClassifier>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            classifier,
            upload_dir: upload_dir.into(),
        }
    }
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("prediction failed: {}", self);
        }
        (status, Json(json!({"status": "error", "detail": self.to_string()}))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/static/js/script.js", get(script))
        .route("/health", get(health))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn script() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript")], SCRIPT_JS)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Extension of the uploaded file name, if it is a plain alphanumeric one
fn upload_extension(file_name: Option<&str>) -> String {
    file_name
        .and_then(|name| Path::new(name).extension())
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "img".to_string())
}

async fn predict(State(state): State<AppState>, multipart: Multipart) -> Response {
    match classify_upload(&state, multipart).await {
        Ok(diagnosis) => Json(json!({"status": "success", "prediction": diagnosis})).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn classify_upload(state: &AppState, mut multipart: Multipart) -> Result<Diagnosis, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        if !content_type.starts_with("image/") {
            return Err(ApiError::BadRequest("File must be an image".to_string()));
        }

        let extension = upload_extension(field.file_name());
        let bytes = field.bytes().await?;

        tokio::fs::create_dir_all(&state.upload_dir).await?;
        let path = state
            .upload_dir
            .join(format!("{}.{}", uuid::Uuid::new_v4(), extension));
        tokio::fs::write(&path, &bytes).await?;
        tracing::info!("Received {} ({} bytes) as {}", content_type, bytes.len(), path.display());

        let classifier = state.classifier.clone();
        let image = path.clone();
        let result = tokio::task::spawn_blocking(move || classifier.predict(&image)).await;

        if let Err(err) = tokio::fs::remove_file(&path).await {
            tracing::warn!("Could not remove upload {}: {}", path.display(), err);
        }

        return match result {
            Ok(Ok(diagnosis)) => Ok(diagnosis),
            Ok(Err(err)) => Err(ApiError::Internal(err.to_string())),
            Err(join_err) => Err(ApiError::Internal(join_err.to_string())),
        };
    }

    Err(ApiError::BadRequest("missing multipart field `file`".to_string()))
}

/// Serve until Ctrl-C
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Prediction service listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("Could not listen for Ctrl-C: {}", err);
            }
            tracing::info!("Shutting down");
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_extension() {
        assert_eq!(upload_extension(Some("scan.PNG")), "png");
        assert_eq!(upload_extension(Some("scan.jpeg")), "jpeg");
        assert_eq!(upload_extension(Some("../../etc/passwd")), "img");
        assert_eq!(upload_extension(Some("a.t;rm")), "img");
        assert_eq!(upload_extension(None), "img");
    }
}
