use anyhow::{anyhow, Context, Result};
use ndarray::Array2;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokenizers::Tokenizer;

const MAX_SEQ_LENGTH: usize = 256;

/// Outputs tried in order: a pooled sentence vector, else per-token states
const SENTENCE_OUTPUT: &str = "sentence_embedding";
const TOKEN_OUTPUT: &str = "last_hidden_state";

/// Anything that can turn text into vectors. Blocking.
pub trait Embedder: Send + Sync {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Embedder returned no vector"))
    }
}

/// Sentence embedding model exported to ONNX in the sentence-transformers
/// layout, e.g. all-MiniLM-L6-v2.
///
/// Setup instructions:
/// 1. Export or download the ONNX model from HuggingFace
/// 2. Place model files in the configured model directory:
///    - model.onnx
///    - tokenizer.json
///
/// Models exposing `last_hidden_state` are mean-pooled over the attention
/// mask; models exposing `sentence_embedding` are used as is. Vectors are
/// L2-normalized either way.
///
/// Model: https://huggingface.co/sentence-transformers/all-MiniLM-L6-v2
pub struct EmbeddingModel {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    /// BERT-style exports also take segment ids
    needs_token_type_ids: bool,
    pooled_output: bool,
}

fn ort_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow!("ONNX runtime error: {}", e)
}

impl EmbeddingModel {
    /// Initialize embedding model from local files
    ///
    /// Expected directory structure:
    /// ```text
    /// <model_dir>/
    /// ├── model.onnx
    /// └── tokenizer.json
    /// ```
    pub fn new(model_dir: &Path) -> Result<Self> {
        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() {
            return Err(anyhow!(
                "Model file not found at {:?}. Please download the ONNX model first.",
                model_path
            ));
        }

        if !tokenizer_path.exists() {
            return Err(anyhow!(
                "Tokenizer file not found at {:?}. Please download tokenizer.json first.",
                tokenizer_path
            ));
        }

        let builder = Session::builder().map_err(ort_err)?;
        let builder = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_err)?;
        let builder = builder.with_intra_threads(4).map_err(ort_err)?;
        let session = builder
            .commit_from_file(&model_path)
            .map_err(ort_err)
            .context("Failed to load ONNX model")?;

        let needs_token_type_ids = session.inputs.iter().any(|i| i.name == "token_type_ids");
        let output_names: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
        let pooled_output = if output_names.contains(&SENTENCE_OUTPUT) {
            true
        } else if output_names.contains(&TOKEN_OUTPUT) {
            false
        } else {
            return Err(anyhow!(
                "Model at {:?} has neither `{}` nor `{}` output (found {:?})",
                model_path,
                SENTENCE_OUTPUT,
                TOKEN_OUTPUT,
                output_names
            ));
        };

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        log::info!(
            "Embedding model loaded from {:?} (pooled output: {}, token type ids: {})",
            model_dir,
            pooled_output,
            needs_token_type_ids
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            needs_token_type_ids,
            pooled_output,
        })
    }

    /// Normalize embeddings to unit length (for cosine similarity)
    pub fn normalize(embedding: &[f32]) -> Vec<f32> {
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return embedding.to_vec();
        }
        embedding.iter().map(|x| x / norm).collect()
    }

    /// Compute cosine similarity between two embeddings
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }

        let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot_product / (norm_a * norm_b)
    }
}

/// Average token states over the attention mask.
///
/// `states` is a row-major `[batch, seq_len, hidden]` tensor and `mask` a
/// row-major `[batch, seq_len]` matrix of 0/1.
pub fn mean_pool(
    states: &[f32],
    mask: &[i64],
    batch: usize,
    seq_len: usize,
) -> Result<Vec<Vec<f32>>> {
    if batch == 0
        || seq_len == 0
        || mask.len() != batch * seq_len
        || states.len() % (batch * seq_len) != 0
    {
        return Err(anyhow!(
            "Token states of length {} do not fit batch {} x {} tokens",
            states.len(),
            batch,
            seq_len
        ));
    }
    let hidden = states.len() / (batch * seq_len);

    let pooled = (0..batch)
        .map(|b| {
            let mut sum = vec![0.0f32; hidden];
            let mut count = 0.0f32;
            for t in 0..seq_len {
                if mask[b * seq_len + t] == 0 {
                    continue;
                }
                let offset = (b * seq_len + t) * hidden;
                for (acc, v) in sum.iter_mut().zip(&states[offset..offset + hidden]) {
                    *acc += v;
                }
                count += 1.0;
            }
            if count > 0.0 {
                sum.iter_mut().for_each(|x| *x /= count);
            }
            sum
        })
        .collect();

    Ok(pooled)
}

impl Embedder for EmbeddingModel {
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let batch_size = texts.len();
        // Pad to the longest sequence in the batch, capped at MAX_SEQ_LENGTH
        let seq_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(0)
            .clamp(1, MAX_SEQ_LENGTH);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        let mut token_type_ids = Vec::with_capacity(batch_size * seq_len);

        for encoding in &encodings {
            let ids = encoding.get_ids();
            let mask = encoding.get_attention_mask();
            let types = encoding.get_type_ids();

            for i in 0..seq_len {
                input_ids.push(ids.get(i).copied().unwrap_or(0) as i64);
                attention_mask.push(mask.get(i).copied().unwrap_or(0) as i64);
                token_type_ids.push(types.get(i).copied().unwrap_or(0) as i64);
            }
        }

        let mask_values = attention_mask.clone();
        let shape = (batch_size, seq_len);
        let input_ids =
            Tensor::from_array(Array2::from_shape_vec(shape, input_ids)?).map_err(ort_err)?;
        let attention_mask =
            Tensor::from_array(Array2::from_shape_vec(shape, attention_mask)?).map_err(ort_err)?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("Embedding session lock poisoned"))?;

        let outputs = if self.needs_token_type_ids {
            let token_type_ids = Tensor::from_array(Array2::from_shape_vec(shape, token_type_ids)?)
                .map_err(ort_err)?;
            session.run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ])
        } else {
            session.run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
            ])
        }
        .map_err(ort_err)
        .context("ONNX inference failed")?;

        let output_name = if self.pooled_output {
            SENTENCE_OUTPUT
        } else {
            TOKEN_OUTPUT
        };
        let output = outputs
            .get(output_name)
            .ok_or_else(|| anyhow!("Model produced no `{}` output", output_name))?;
        let (_, data) = output.try_extract_tensor::<f32>().map_err(ort_err)?;

        let vectors = if self.pooled_output {
            let dim = data.len() / batch_size;
            if dim == 0 {
                return Err(anyhow!("Model produced an empty embedding"));
            }
            data.chunks_exact(dim).map(|row| row.to_vec()).collect()
        } else {
            mean_pool(data, &mask_values, batch_size, seq_len)?
        };

        Ok(vectors.iter().map(|v| EmbeddingModel::normalize(v)).collect())
    }
}

/// Try to load the model from `model_dir` and run one trial embedding. A
/// missing, broken or incompatible model is not fatal: retrieval falls back
/// to keyword search.
pub fn load_embedder(model_dir: Option<&PathBuf>) -> Option<Arc<dyn Embedder>> {
    let dir = model_dir?;
    let loaded = EmbeddingModel::new(dir).and_then(|model| {
        model
            .embed("embedding model self-check")
            .context("Trial embedding failed")?;
        Ok(model)
    });

    match loaded {
        Ok(model) => Some(Arc::new(model)),
        Err(e) => {
            log::warn!("⚠️ Embedding model not available: {:#}", e);
            log::warn!("   Continuing without embeddings (BM25-only retrieval)");
            None
        }
    }
}
