use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::chunker::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};

/// Config file read when `PDFQA_CONFIG` is not set
pub const DEFAULT_CONFIG_FILE: &str = "pdfqa.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Address the HTTP server binds to
    pub bind_addr: String,

    /// Prefix all routes are mounted under (e.g. "/api"); empty for none
    pub api_root: String,

    /// The single watched document; uploads overwrite it
    pub pdf_path: PathBuf,

    /// Directory holding persisted index generations
    pub index_dir: PathBuf,

    pub chunk_size: usize,
    pub chunk_overlap: usize,

    /// Chunks handed to the model per question
    pub top_k: usize,

    /// Directory with model.onnx + tokenizer.json (if None, keyword retrieval only)
    pub model_dir: Option<PathBuf>,

    pub llm: LlmConfig,

    /// Question/answer pairs kept in conversational memory
    pub memory_turns: usize,

    /// Quiet period after the last write to the document before reloading
    /// (at least 50 ms)
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            api_root: "/api".to_string(),
            pdf_path: PathBuf::from("temp.pdf"),
            index_dir: PathBuf::from("faiss_index"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            top_k: 4,
            model_dir: None,
            llm: LlmConfig::default(),
            memory_turns: 10,
            debounce_ms: 500,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            timeout_secs: 120,
        }
    }
}

impl AppConfig {
    /// Load settings: optional JSON file, then environment overrides
    pub fn load() -> Result<Self> {
        let explicit = std::env::var("PDFQA_CONFIG").ok();
        let path = PathBuf::from(explicit.as_deref().unwrap_or(DEFAULT_CONFIG_FILE));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else if explicit.is_some() {
            bail!("Config file not found: {:?}", path);
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("PDFQA_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("PDFQA_PDF_PATH") {
            self.pdf_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PDFQA_INDEX_DIR") {
            self.index_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PDFQA_MODEL_DIR") {
            self.model_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("OPENAI_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = lookup("OPENAI_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("PDFQA_LLM_MODEL") {
            self.llm.model = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_overlap >= self.chunk_size {
            bail!(
                "Invalid chunking: size {} with overlap {}",
                self.chunk_size,
                self.chunk_overlap
            );
        }
        if self.top_k == 0 {
            bail!("top_k must be at least 1");
        }
        if self.pdf_path.file_name().is_none() {
            bail!("pdf_path must name a file: {:?}", self.pdf_path);
        }
        if !self.api_root.is_empty() && !self.api_root.starts_with('/') {
            bail!("api_root must start with '/': {}", self.api_root);
        }
        Ok(())
    }

    /// File name of the watched document, as shown to users
    pub fn pdf_name(&self) -> String {
        self.pdf_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.pdf_path.to_string_lossy().to_string())
    }
}
