use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::classify::classify_answer;
use crate::models::{ErrorResponse, MessageResponse, QueryRequest};
use crate::pipeline::Pipeline;

#[derive(Clone)]
pub struct ServerState {
    pub pipeline: Arc<Pipeline>,
    /// Name of the watched document, for user-facing messages
    pub pdf_name: String,
}

/// Join the API root and a route path ("/api" + "/ask/" = "/api/ask/")
fn api_path(root: &str, path: &str) -> String {
    format!("{}{}", root.trim_end_matches('/'), path)
}

/// Build the router with every route mounted under `api_root`
pub fn router(state: ServerState, api_root: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route(&api_path(api_root, "/"), get(root))
        .route(&api_path(api_root, "/status"), get(status))
        .route(
            &api_path(api_root, "/upload-pdf/"),
            post(upload_pdf).layer(DefaultBodyLimit::disable()),
        )
        .route(
            &api_path(api_root, "/upload-pdf"),
            post(upload_pdf).layer(DefaultBodyLimit::disable()),
        )
        .route(&api_path(api_root, "/ask/"), post(ask_question))
        .route(&api_path(api_root, "/ask"), post(ask_question));

    let bare_root = api_root.trim_end_matches('/');
    if !bare_root.is_empty() {
        app = app.route(bare_root, get(root));
    }

    app.layer(cors).with_state(Arc::new(state))
}

/// Serve `app` on `addr` until `shutdown` is cancelled
pub async fn start_server(
    addr: &str,
    app: Router,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    log::info!("HTTP server stopped");
    Ok(())
}

/// Liveness/info endpoint
async fn root() -> impl IntoResponse {
    Json(MessageResponse {
        message: "RAG pipeline is running. See /status for pipeline state.".to_string(),
    })
}

async fn status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.pipeline.status())
}

fn error_body(message: String) -> Json<ErrorResponse> {
    Json(ErrorResponse { error: message })
}

/// Write the uploaded file over the watched document. The watcher picks up the
/// change and reloads; this handler does not wait for it.
async fn upload_pdf(
    State(state): State<Arc<ServerState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    match save_upload(&state, multipart).await {
        Ok(filename) => {
            log::info!(
                "📄 {} uploaded successfully and saved as {:?}.",
                filename,
                state.pipeline.pdf_path()
            );
            Json(MessageResponse {
                message: format!(
                    "File '{}' uploaded successfully. RAG pipeline will reload shortly.",
                    filename
                ),
            })
            .into_response()
        }
        Err(e) => {
            log::error!("Upload failed: {}", e);
            error_body(format!("Could not upload file: {}", e)).into_response()
        }
    }
}

async fn save_upload(
    state: &ServerState,
    multipart: Result<Multipart, MultipartRejection>,
) -> anyhow::Result<String> {
    let mut multipart = multipart?;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| state.pdf_name.clone());
        let bytes = field.bytes().await?;

        tokio::fs::write(state.pipeline.pdf_path(), &bytes).await?;
        return Ok(filename);
    }

    anyhow::bail!("missing 'file' field")
}

async fn ask_question(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<QueryRequest>,
) -> Response {
    let Some(chain) = state.pipeline.current() else {
        return error_body(format!(
            "No PDF has been processed yet. Please ensure {} exists.",
            state.pdf_name
        ))
        .into_response();
    };

    log::info!("Question for generation {}: {}", chain.generation(), request.query);

    match chain.invoke(&request.query).await {
        Ok(output) => {
            log::debug!(
                "Answered {:?} from {} retrieved chunks",
                output.standalone_question,
                output.sources.len()
            );
            Json(classify_answer(&output.answer)).into_response()
        }
        Err(e) => {
            log::error!("QA chain failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, error_body(e.to_string())).into_response()
        }
    }
}
