use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to ingest {path}: {source}")]
    Ingest {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{path} produced no text chunks")]
    EmptyDocument { path: String },

    #[error("failed to build index: {0}")]
    Index(#[source] anyhow::Error),

    #[error("reload task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("LLM returned no choices")]
    EmptyResponse,

    #[error("LLM API key is not configured")]
    MissingApiKey,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("retrieval failed: {0}")]
    Retrieval(#[source] anyhow::Error),
}
