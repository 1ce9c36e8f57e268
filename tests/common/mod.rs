//! Common test utilities: offline stand-ins for the model and a pipeline
//! wired to a temp directory.

#![allow(dead_code)]

use async_trait::async_trait;
use pdfqa::embeddings::Embedder;
use pdfqa::error::LlmError;
use pdfqa::llm::{ChatMessage, LanguageModel, Role};
use pdfqa::pdf_parser::{DocumentLoader, LoadedDocument, PlainTextLoader};
use pdfqa::{AppConfig, Components, Pipeline};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use tempfile::TempDir;

static INIT: Once = Once::new();

/// Initialize logging for tests
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Answers with the top retrieved chunk; condenses follow-ups to themselves.
pub struct EchoModel;

#[async_trait]
impl LanguageModel for EchoModel {
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        if let Some((_, context)) = system.split_once("----------------\n") {
            return Ok(context.split("\n\n").next().unwrap_or_default().to_string());
        }

        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let question = prompt
            .split_once("Follow Up Input: ")
            .and_then(|(_, rest)| rest.split_once("\nStandalone question:"))
            .map(|(q, _)| q)
            .unwrap_or(prompt);
        Ok(question.to_string())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Always replies with the same text
pub struct FixedModel(pub &'static str);

#[async_trait]
impl LanguageModel for FixedModel {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        Ok(self.0.to_string())
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Always fails like an overloaded provider
pub struct DownModel;

#[async_trait]
impl LanguageModel for DownModel {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String, LlmError> {
        Err(LlmError::Api {
            status: 503,
            body: "provider unavailable".to_string(),
        })
    }

    fn name(&self) -> &str {
        "down"
    }
}

/// Hashed bag-of-words vectors
pub struct BagOfWordsEmbedder;

impl Embedder for BagOfWordsEmbedder {
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; 64];
                for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
                    let bucket = word
                        .to_lowercase()
                        .bytes()
                        .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize));
                    v[bucket % 64] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Reads the document as plain text but blows up on a corrupt marker, the
/// way PDF parsers do on malformed input
pub struct FragileLoader;

impl DocumentLoader for FragileLoader {
    fn load(&self, path: &Path) -> anyhow::Result<LoadedDocument> {
        let document = PlainTextLoader.load(path)?;
        if document.text.starts_with("%CORRUPT") {
            panic!("malformed cross-reference table");
        }
        Ok(document)
    }
}

pub struct TestPipeline {
    pub dir: TempDir,
    pub config: AppConfig,
    pub pipeline: Arc<Pipeline>,
}

impl TestPipeline {
    pub fn pdf_path(&self) -> PathBuf {
        self.config.pdf_path.clone()
    }

    pub fn write_document(&self, text: &str) {
        std::fs::write(self.pdf_path(), text).unwrap();
    }
}

/// `<dir>/temp.pdf` and `<dir>/faiss_index`, retrieving one chunk
pub fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        pdf_path: dir.join("temp.pdf"),
        index_dir: dir.join("faiss_index"),
        top_k: 1,
        ..AppConfig::default()
    }
}

/// Plain-text loader, no embeddings
pub fn text_components(llm: Arc<dyn LanguageModel>) -> Components {
    Components {
        loader: Arc::new(PlainTextLoader),
        embedder: None,
        llm,
    }
}

/// Pipeline over `<tmp>/temp.pdf` read as plain text, retrieving one chunk
pub fn test_pipeline(llm: Arc<dyn LanguageModel>) -> TestPipeline {
    test_pipeline_from(text_components(llm), |_| {})
}

pub fn test_pipeline_with(
    llm: Arc<dyn LanguageModel>,
    embedder: Option<Arc<dyn Embedder>>,
) -> TestPipeline {
    let components = Components {
        embedder,
        ..text_components(llm)
    };
    test_pipeline_from(components, |_| {})
}

pub fn test_pipeline_from(
    components: Components,
    customize: impl FnOnce(&mut AppConfig),
) -> TestPipeline {
    init_test_logging();

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    customize(&mut config);

    let pipeline = Arc::new(Pipeline::new(&config, components).unwrap());

    TestPipeline {
        dir,
        config,
        pipeline,
    }
}
