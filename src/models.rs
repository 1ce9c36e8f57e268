use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk in the source document
    pub index: usize,
    pub content: String,
    pub metadata: Option<ChunkMetadata>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// File the chunk was cut from
    pub source: String,
    /// Chunk type: "pdf", "text"
    pub chunk_type: String,
    /// Estimated page count of the source document
    pub page_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: i64,
    pub chunk_index: usize,
    pub content: String,
    pub metadata: Option<ChunkMetadata>,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

/// Exactly one of the two fields is populated per response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub answer: Option<String>,
    pub course_link: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Uninitialized,
    Empty,
    Ready,
    Reloading,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    /// Generation of the installed chain, 0 before the first load
    pub generation: u64,
    pub chunks: usize,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub document: String,
}

impl PipelineStatus {
    pub fn new(document: String) -> Self {
        Self {
            state: PipelineState::Uninitialized,
            generation: 0,
            chunks: 0,
            loaded_at: None,
            last_error: None,
            document,
        }
    }
}
