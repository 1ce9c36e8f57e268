use crate::chain::QaChain;
use crate::chunker::{self, RecursiveTextSplitter};
use crate::config::AppConfig;
use crate::db::{self, IndexMeta};
use crate::embeddings::Embedder;
use crate::error::PipelineError;
use crate::llm::LanguageModel;
use crate::models::{PipelineState, PipelineStatus};
use crate::pdf_parser::{DocumentLoader, LoadedDocument};
use crate::search::VectorIndex;
use anyhow::anyhow;
use arc_swap::ArcSwapOption;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;

/// The external collaborators a pipeline is wired from
#[derive(Clone)]
pub struct Components {
    pub loader: Arc<dyn DocumentLoader>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub llm: Arc<dyn LanguageModel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Loaded { generation: u64, chunks: usize },
    /// The watched file does not exist; the slot is now empty
    Missing,
}

/// Owns the current QA chain and rebuilds it from the watched document.
///
/// Readers take a snapshot with [`Pipeline::current`] and keep using it for
/// the whole request, even if a reload swaps in a newer chain meanwhile.
pub struct Pipeline {
    pdf_path: PathBuf,
    index_dir: PathBuf,
    splitter: RecursiveTextSplitter,
    top_k: usize,
    memory_turns: usize,
    components: Components,
    chain: ArcSwapOption<QaChain>,
    reload_lock: Mutex<()>,
    next_generation: AtomicU64,
    status: RwLock<PipelineStatus>,
}

impl Pipeline {
    pub fn new(config: &AppConfig, components: Components) -> anyhow::Result<Self> {
        let splitter = RecursiveTextSplitter::new(config.chunk_size, config.chunk_overlap)?;

        // Number past whatever a previous run left on disk
        let next_generation = db::latest_generation(&config.index_dir)?
            .map_or(1, |(generation, _)| generation + 1);

        Ok(Self {
            pdf_path: config.pdf_path.clone(),
            index_dir: config.index_dir.clone(),
            splitter,
            top_k: config.top_k,
            memory_turns: config.memory_turns,
            components,
            chain: ArcSwapOption::empty(),
            reload_lock: Mutex::new(()),
            next_generation: AtomicU64::new(next_generation),
            status: RwLock::new(PipelineStatus::new(config.pdf_name())),
        })
    }

    pub fn pdf_path(&self) -> &Path {
        &self.pdf_path
    }

    /// Snapshot of the installed chain, if any
    pub fn current(&self) -> Option<Arc<QaChain>> {
        self.chain.load_full()
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut PipelineStatus)) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
    }

    /// Rebuild the chain from the watched file and swap it in.
    ///
    /// Reloads are serialized. On failure the previously installed chain stays
    /// in place and the error is recorded in the status. While no chain is
    /// installed, a persisted index built from the same document is reopened
    /// instead of rebuilt.
    pub async fn reload(&self) -> Result<ReloadOutcome, PipelineError> {
        let _guard = self.reload_lock.lock().await;

        log::info!("🔄 Reloading RAG pipeline from {:?}...", self.pdf_path);
        self.update_status(|s| s.state = PipelineState::Reloading);

        let exists = match tokio::fs::try_exists(&self.pdf_path).await {
            Ok(exists) => exists,
            Err(e) => {
                return Err(self.record_failure(PipelineError::Ingest {
                    path: self.pdf_path.to_string_lossy().to_string(),
                    source: e.into(),
                }))
            }
        };

        if !exists {
            log::warn!(
                "⚠️ {:?} not found. RAG pipeline not loaded.",
                self.pdf_path
            );
            self.chain.store(None);
            self.update_status(|s| {
                s.state = PipelineState::Empty;
                s.chunks = 0;
                s.last_error = None;
            });
            return Ok(ReloadOutcome::Missing);
        }

        // Reloads are serialized, so the number is only claimed on success
        let generation = self.next_generation.load(Ordering::SeqCst);
        let reuse = self.current().is_none();

        let index = match self.build_index(generation, reuse).await {
            Ok(index) => index,
            Err(e) => return Err(self.record_failure(e)),
        };

        let generation = index.meta().generation;
        self.next_generation.fetch_max(generation + 1, Ordering::SeqCst);
        let chunks = index.len();

        let chain = QaChain::new(
            index,
            Arc::clone(&self.components.llm),
            self.memory_turns,
            self.top_k,
        );
        self.chain.store(Some(Arc::new(chain)));

        self.update_status(|s| {
            s.state = PipelineState::Ready;
            s.generation = generation;
            s.chunks = chunks;
            s.loaded_at = Some(chrono::Utc::now());
            s.last_error = None;
        });

        match db::prune_generations(&self.index_dir, generation) {
            Ok(removed) if removed > 0 => log::debug!("Pruned {} stale index files", removed),
            Ok(_) => {}
            Err(e) => log::warn!("Failed to prune old index generations: {}", e),
        }

        log::info!(
            "✅ RAG pipeline reloaded successfully (generation {}, {} chunks, model {}).",
            generation,
            chunks,
            self.components.llm.name()
        );
        Ok(ReloadOutcome::Loaded { generation, chunks })
    }

    /// Log a failed reload and restore the state of whatever chain is kept
    fn record_failure(&self, e: PipelineError) -> PipelineError {
        let kept = self.current().is_some();
        log::error!(
            "Reload failed, {}: {}",
            if kept { "keeping previous chain" } else { "no chain loaded" },
            e
        );
        self.update_status(|s| {
            s.state = if kept {
                PipelineState::Ready
            } else {
                PipelineState::Empty
            };
            s.last_error = Some(e.to_string());
        });
        e
    }

    /// Ingest the watched file and persist it as index `generation`.
    /// Runs on the blocking pool.
    async fn build_index(
        &self,
        generation: u64,
        reuse: bool,
    ) -> Result<VectorIndex, PipelineError> {
        let pdf_path = self.pdf_path.clone();
        let index_dir = self.index_dir.clone();
        let splitter = self.splitter.clone();
        let loader = Arc::clone(&self.components.loader);
        let embedder = self.components.embedder.clone();

        tokio::task::spawn_blocking(move || {
            let source = pdf_path.to_string_lossy().to_string();
            let ingest_err = |e: anyhow::Error| PipelineError::Ingest {
                path: source.clone(),
                source: e,
            };

            let bytes = std::fs::read(&pdf_path).map_err(|e| ingest_err(e.into()))?;
            let fingerprint = fingerprint(&bytes, &splitter);

            if reuse {
                if let Some(index) = reopen_matching(&index_dir, &fingerprint, embedder.clone()) {
                    return Ok(index);
                }
            }

            let document = load_guarded(loader.as_ref(), &pdf_path).map_err(ingest_err)?;
            let chunks = chunker::chunk_document(&document, &source, &splitter);
            if chunks.is_empty() {
                return Err(PipelineError::EmptyDocument { path: source });
            }

            let meta = IndexMeta {
                generation,
                source,
                fingerprint,
                chunk_count: chunks.len(),
                has_embeddings: false,
                created_at: chrono::Utc::now().timestamp(),
            };

            VectorIndex::build(&index_dir, meta, &chunks, embedder).map_err(PipelineError::Index)
        })
        .await?
    }

    /// Drop the installed chain. Requests after this see "not ready".
    pub async fn teardown(&self) {
        let _guard = self.reload_lock.lock().await;
        self.chain.store(None);
        self.update_status(|s| {
            s.state = PipelineState::Empty;
            s.chunks = 0;
        });
        log::info!("RAG pipeline torn down");
    }
}

/// Identifies a document together with how it was split
fn fingerprint(bytes: &[u8], splitter: &RecursiveTextSplitter) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.update(format!("{}:{}", splitter.chunk_size(), splitter.chunk_overlap()).as_bytes());
    hex::encode(hasher.finalize())
}

/// Reopen the newest persisted generation if it was built from the same
/// document with the same embedding setup
fn reopen_matching(
    index_dir: &Path,
    fingerprint: &str,
    embedder: Option<Arc<dyn Embedder>>,
) -> Option<VectorIndex> {
    let (_, path) = db::latest_generation(index_dir).ok().flatten()?;
    let wants_embeddings = embedder.is_some();

    match VectorIndex::open(&path, embedder) {
        Ok(index)
            if index.meta().fingerprint == fingerprint
                && index.meta().has_embeddings == wants_embeddings
                && !index.is_empty() =>
        {
            log::info!("Reusing persisted index {:?} for unchanged document", path);
            Some(index)
        }
        Ok(_) => None,
        Err(e) => {
            log::warn!("Ignoring unreadable persisted index {:?}: {}", path, e);
            None
        }
    }
}

/// Run the loader, turning a panic on a malformed file into an error
fn load_guarded(loader: &dyn DocumentLoader, path: &Path) -> anyhow::Result<LoadedDocument> {
    panic::catch_unwind(AssertUnwindSafe(|| loader.load(path)))
        .map_err(|payload| {
            anyhow!("document loader panicked: {}", panic_message(payload.as_ref()))
        })?
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
