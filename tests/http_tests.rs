//! Integration tests for the HTTP API, driven through the router without a socket

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{
    test_pipeline, test_pipeline_from, text_components, DownModel, EchoModel, FixedModel,
    TestPipeline,
};
use http_body_util::BodyExt;
use pdfqa::http_server::{router, ServerState};
use pdfqa::llm::LanguageModel;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "pdfqa-test-boundary";

fn app(t: &TestPipeline) -> Router {
    let state = ServerState {
        pipeline: Arc::clone(&t.pipeline),
        pdf_name: t.config.pdf_name(),
    };
    router(state, &t.config.api_root)
}

fn setup(llm: Arc<dyn LanguageModel>) -> (TestPipeline, Router) {
    let t = test_pipeline(llm);
    let app = app(&t);
    (t, app)
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn ask(query: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/ask/")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "query": query }).to_string()))
        .unwrap()
}

fn multipart_upload(field: &str, filename: &str, content: &str) -> Request<Body> {
    let body = format!(
        "--{b}\r\n\
         Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
         Content-Type: application/pdf\r\n\
         \r\n\
         {content}\r\n\
         --{b}--\r\n",
        b = BOUNDARY,
    );
    Request::builder()
        .method("POST")
        .uri("/api/upload-pdf/")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_root_reports_running() {
    let (_t, app) = setup(Arc::new(EchoModel));

    for uri in ["/api/", "/api"] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let (status, body) = send(app.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"]
            .as_str()
            .unwrap()
            .starts_with("RAG pipeline is running"));
    }
}

#[tokio::test]
async fn test_ask_before_any_document() {
    let (_t, app) = setup(Arc::new(EchoModel));

    let (status, body) = send(app, ask("Anything there?")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "error": "No PDF has been processed yet. Please ensure temp.pdf exists." })
    );
}

#[tokio::test]
async fn test_upload_then_ask() {
    let (t, app) = setup(Arc::new(EchoModel));

    let (status, body) = send(
        app.clone(),
        multipart_upload("file", "guide.pdf", "Borrowing rules keep data races out."),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["message"],
        "File 'guide.pdf' uploaded successfully. RAG pipeline will reload shortly."
    );
    assert_eq!(
        std::fs::read_to_string(t.pdf_path()).unwrap(),
        "Borrowing rules keep data races out."
    );

    // No watcher here; reload as the watcher would
    t.pipeline.reload().await.unwrap();

    let (status, body) = send(app, ask("What keeps data races out?")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "answer": "Borrowing rules keep data races out.", "course_link": null })
    );
}

#[tokio::test]
async fn test_upload_without_trailing_slash() {
    let (t, app) = setup(Arc::new(EchoModel));

    let mut request = multipart_upload("file", "notes.pdf", "notes");
    *request.uri_mut() = "/api/upload-pdf".parse().unwrap();
    let (status, _) = send(app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(t.pdf_path().exists());
}

#[tokio::test]
async fn test_upload_without_file_field() {
    let (t, app) = setup(Arc::new(EchoModel));

    let (status, body) = send(app, multipart_upload("attachment", "x.pdf", "data")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Could not upload file:"));
    assert!(!t.pdf_path().exists());
}

#[tokio::test]
async fn test_upload_write_failure() {
    let t = test_pipeline_from(text_components(Arc::new(EchoModel)), |config| {
        config.pdf_path = config.pdf_path.parent().unwrap().join("missing/temp.pdf");
    });
    let app = app(&t);

    let (status, body) = send(app, multipart_upload("file", "guide.pdf", "content")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.get("message").is_none());
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Could not upload file:"));
    assert!(!t.pdf_path().exists());
}

#[tokio::test]
async fn test_link_answer_is_classified() {
    let (t, app) = setup(Arc::new(FixedModel("https://example.com/course/101")));
    t.write_document("Course catalogue.");
    t.pipeline.reload().await.unwrap();

    let (status, body) = send(app, ask("Where is the course?")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "answer": null, "course_link": "https://example.com/course/101" })
    );
}

#[tokio::test]
async fn test_llm_failure_is_server_error() {
    let (t, app) = setup(Arc::new(DownModel));
    t.write_document("Anything at all.");
    t.pipeline.reload().await.unwrap();

    let (status, body) = send(app, ask("Hello?")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn test_status_reports_pipeline_state() {
    let (t, app) = setup(Arc::new(EchoModel));

    let status_request = || Request::builder().uri("/api/status").body(Body::empty()).unwrap();

    let (_, body) = send(app.clone(), status_request()).await;
    assert_eq!(body["state"], "uninitialized");
    assert_eq!(body["document"], "temp.pdf");

    t.write_document("Ready now.");
    t.pipeline.reload().await.unwrap();

    let (_, body) = send(app, status_request()).await;
    assert_eq!(body["state"], "ready");
    assert_eq!(body["generation"], 1);
    assert_eq!(body["chunks"], 1);
}
