use pdfqa::embeddings::load_embedder;
use pdfqa::http_server::{self, ServerState};
use pdfqa::llm::OpenAiChat;
use pdfqa::pdf_parser::PdfLoader;
use pdfqa::watcher::spawn_watcher;
use pdfqa::{AppConfig, Components, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::load()?;
    log::info!("Watched document: {:?}", config.pdf_path);
    log::info!("Index directory: {:?}", config.index_dir);

    if config.llm.api_key.is_none() {
        log::warn!("OPENAI_API_KEY is not set; questions will fail until it is configured");
    }

    let components = Components {
        loader: Arc::new(PdfLoader),
        embedder: load_embedder(config.model_dir.as_ref()),
        llm: Arc::new(OpenAiChat::new(&config.llm)?),
    };
    let pipeline = Arc::new(Pipeline::new(&config, components)?);

    // A broken document must not keep the service from starting
    if let Err(e) = pipeline.reload().await {
        log::error!("Initial pipeline load failed: {}", e);
    }

    let shutdown = CancellationToken::new();
    let watcher = spawn_watcher(
        Arc::clone(&pipeline),
        Duration::from_millis(config.debounce_ms),
        shutdown.child_token(),
    )?;

    let app = http_server::router(
        ServerState {
            pipeline: Arc::clone(&pipeline),
            pdf_name: config.pdf_name(),
        },
        &config.api_root,
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        log::info!("Shutdown requested");
        signal_token.cancel();
    });

    let served = http_server::start_server(&config.bind_addr, app, shutdown.clone()).await;

    shutdown.cancel();
    watcher.shutdown().await;
    pipeline.teardown().await;

    log::info!("pdfqa stopped");
    served
}
