//! HTTP service with a stub classifier.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

use cnn_classifier::error::PredictionError;
use cnn_classifier::pipeline::{Diagnosis, ImageClassifier};
use cnn_classifier::server::{router, AppState};

const BOUNDARY: &str = "XBOUNDARYX";

#[derive(Default)]
struct CountingClassifier {
    calls: AtomicUsize,
    fail: bool,
}

impl ImageClassifier for CountingClassifier {
    fn predict(&self, image_path: &Path) -> Result<Diagnosis, PredictionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(image_path.exists(), "upload must exist while it is classified");
        if self.fail {
            return Err(PredictionError::Inference("model exploded".to_string()));
        }
        Ok(Diagnosis::Tumor)
    }
}

fn multipart(field: &str, content_type: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"scan.png\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/predict")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn setup(fail: bool) -> (Arc<CountingClassifier>, tempfile::TempDir, axum::Router) {
    let classifier = Arc::new(CountingClassifier {
        fail,
        ..Default::default()
    });
    let uploads = tempfile::tempdir().unwrap();
    let app = router(AppState::new(classifier.clone(), uploads.path().join("uploads")));
    (classifier, uploads, app)
}

#[tokio::test]
async fn test_predict_success() {
    let (classifier, uploads, app) = setup(false);

    let response = app.oneshot(multipart("file", "image/png", b"png bytes")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["prediction"], "Tumor");

    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    let leftover = std::fs::read_dir(uploads.path().join("uploads")).unwrap().count();
    assert_eq!(leftover, 0);
}

#[tokio::test]
async fn test_non_image_is_rejected_without_inference() {
    let (classifier, _uploads, app) = setup(false);

    let response = app
        .oneshot(multipart("file", "text/plain", b"hello"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["status"], "error");
    assert!(body["detail"].as_str().unwrap().contains("image"));
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_file_field() {
    let (classifier, _uploads, app) = setup(false);

    let response = app
        .oneshot(multipart("upload", "image/png", b"png bytes"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_classifier_failure_is_internal_error() {
    let (classifier, uploads, app) = setup(true);

    let response = app.oneshot(multipart("file", "image/jpeg", b"jpeg")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["status"], "error");
    assert!(body["detail"].as_str().unwrap().contains("model exploded"));

    assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read_dir(uploads.path().join("uploads")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_index_and_health() {
    let (_, _uploads, app) = setup(false);

    let response = app
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("/static/js/script.js"));

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(json_body(response).await["status"], "ok");
}
