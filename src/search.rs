use crate::db::{self, IndexMeta};
use crate::embeddings::{Embedder, EmbeddingModel};
use crate::models::{Chunk, ChunkMetadata, SearchResult};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const BM25_WEIGHT: f32 = 0.3;
const VECTOR_WEIGHT: f32 = 0.7;

/// Chunks embedded per model call while building
const EMBED_BATCH_SIZE: usize = 32;

/// One persisted index generation.
///
/// The connection stays open for the lifetime of the index, so a chain that is
/// still answering a request keeps working after a newer generation replaced
/// (and pruned) this one.
pub struct VectorIndex {
    path: PathBuf,
    conn: Mutex<Connection>,
    meta: IndexMeta,
    embedder: Option<Arc<dyn Embedder>>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("path", &self.path)
            .field("meta", &self.meta)
            .field("embedder", &self.embedder.is_some())
            .finish()
    }
}

impl VectorIndex {
    /// Embed `chunks` and persist them as generation `meta.generation` under
    /// `index_dir`. Always starts from an empty database.
    pub fn build(
        index_dir: &Path,
        mut meta: IndexMeta,
        chunks: &[Chunk],
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Self> {
        let path = db::generation_path(index_dir, meta.generation);
        let mut conn = db::init_database(&path)?;

        let embeddings = match &embedder {
            Some(model) => Some(embed_chunks(model.as_ref(), chunks)?),
            None => None,
        };

        db::insert_chunks(&mut conn, chunks, embeddings.as_deref())?;

        meta.chunk_count = chunks.len();
        meta.has_embeddings = embeddings.is_some();
        db::write_meta(&conn, &meta)?;

        log::info!(
            "Built index generation {} at {:?} ({} chunks, embeddings: {})",
            meta.generation,
            path,
            meta.chunk_count,
            meta.has_embeddings
        );

        Ok(Self {
            path,
            conn: Mutex::new(conn),
            meta,
            embedder,
        })
    }

    /// Reopen a persisted index generation
    pub fn open(path: &Path, embedder: Option<Arc<dyn Embedder>>) -> Result<Self> {
        let conn = db::get_connection(path)?;
        let meta = db::read_meta(&conn)?
            .ok_or_else(|| anyhow!("Index at {:?} has no metadata", path))?;

        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            meta,
            embedder,
        })
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn len(&self) -> usize {
        self.meta.chunk_count
    }

    pub fn is_empty(&self) -> bool {
        self.meta.chunk_count == 0
    }

    /// Return the `limit` chunks most relevant to `query`.
    ///
    /// Algorithm:
    /// 1. BM25 search via FTS5 (keyword matching)
    /// 2. If embeddings are available, cosine similarity against every chunk
    /// 3. Merge with weighted scores: 0.7 * vec_score + 0.3 * bm25_score
    ///
    /// Without any keyword hit and without embeddings, the leading chunks of the
    /// document are returned so the model always gets some context.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        // Query inference runs before the connection lock is taken
        let query_embedding = match (&self.embedder, self.meta.has_embeddings) {
            (Some(model), true) => Some(EmbeddingModel::normalize(&model.embed(query)?)),
            _ => None,
        };

        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Index connection lock poisoned"))?;

        let bm25 = bm25_search(&conn, query, limit * 3)?;

        let results = match query_embedding {
            Some(embedding) => hybrid_search(&conn, &embedding, &bm25, limit)?,
            None if !bm25.is_empty() => {
                let mut results = bm25;
                results.truncate(limit);
                results
            }
            None => leading_chunks(&conn, limit)?,
        };

        log::debug!(
            "Retrieved {} chunks from generation {} for query: {}",
            results.len(),
            self.meta.generation,
            query
        );

        Ok(results)
    }
}

fn embed_chunks(model: &dyn Embedder, chunks: &[Chunk]) -> Result<Vec<Vec<f32>>> {
    let mut embeddings = Vec::with_capacity(chunks.len());

    for batch in chunks.chunks(EMBED_BATCH_SIZE) {
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let vectors = model
            .embed_batch(&texts)
            .context("Failed to generate chunk embeddings")?;

        if vectors.len() != texts.len() {
            return Err(anyhow!(
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                texts.len()
            ));
        }
        embeddings.extend(vectors);
    }

    log::debug!("✓ Generated {} embeddings", embeddings.len());
    Ok(embeddings)
}

/// Turn free text into an FTS5 query: every word quoted, OR-ed together.
/// Returns None when the text has no searchable words.
pub fn to_fts_query(text: &str) -> Option<String> {
    let mut terms: Vec<String> = Vec::new();

    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        if !terms.contains(&word) {
            terms.push(word);
        }
    }

    if terms.is_empty() {
        return None;
    }

    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR "),
    )
}

/// BM25 search; scores are relative to the best hit, in (0, 1], higher is better
fn bm25_search(conn: &Connection, query: &str, limit: usize) -> Result<Vec<SearchResult>> {
    let Some(fts_query) = to_fts_query(query) else {
        return Ok(vec![]);
    };

    let mut stmt = conn.prepare(
        "SELECT c.id, c.chunk_index, c.content, c.metadata, rank
         FROM chunks_fts
         JOIN chunks c ON chunks_fts.rowid = c.id
         WHERE chunks_fts MATCH ?
         ORDER BY rank
         LIMIT ?",
    )?;

    let mut results = stmt
        .query_map(params![fts_query, limit as i64], |row| {
            let mut result = parse_search_row(row)?;
            // FTS5 rank is the negated BM25 score: more negative is better
            let rank: f64 = row.get(4)?;
            result.score = -rank as f32;
            Ok(result)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    normalize_bm25(&mut results);
    Ok(results)
}

/// Scale BM25 scores so the best hit scores 1.0
fn normalize_bm25(results: &mut [SearchResult]) {
    let best = results.iter().map(|r| r.score).fold(0.0f32, f32::max);
    for result in results.iter_mut() {
        result.score = if best > 0.0 {
            (result.score / best).max(0.0)
        } else {
            1.0
        };
    }
}

fn hybrid_search(
    conn: &Connection,
    query_embedding: &[f32],
    bm25: &[SearchResult],
    limit: usize,
) -> Result<Vec<SearchResult>> {
    let bm25_scores: HashMap<i64, f32> = bm25.iter().map(|r| (r.chunk_id, r.score)).collect();

    let mut stmt = conn.prepare(
        "SELECT id, chunk_index, content, metadata, embedding FROM chunks",
    )?;

    let mut results: Vec<SearchResult> = stmt
        .query_map([], |row| {
            let result = parse_search_row(row)?;
            let blob: Option<Vec<u8>> = row.get(4)?;
            Ok((result, blob))
        })?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|(mut result, blob)| {
            let vec_score = blob
                .map(|b| db::bytes_to_f32_vec(&b))
                .filter(|e| !e.is_empty())
                .map(|e| {
                    EmbeddingModel::cosine_similarity(
                        query_embedding,
                        &EmbeddingModel::normalize(&e),
                    )
                })
                .unwrap_or(0.0);
            let bm25_score = bm25_scores.get(&result.chunk_id).copied().unwrap_or(0.0);

            result.score = VECTOR_WEIGHT * vec_score + BM25_WEIGHT * bm25_score;
            result
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.chunk_index.cmp(&b.chunk_index))
    });
    results.truncate(limit);

    Ok(results)
}

fn leading_chunks(conn: &Connection, limit: usize) -> Result<Vec<SearchResult>> {
    let mut stmt = conn.prepare(
        "SELECT id, chunk_index, content, metadata FROM chunks ORDER BY chunk_index LIMIT ?",
    )?;
    let results = stmt
        .query_map(params![limit as i64], parse_search_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

/// Parse the first four columns (id, chunk_index, content, metadata)
fn parse_search_row(row: &rusqlite::Row) -> rusqlite::Result<SearchResult> {
    let metadata_str: Option<String> = row.get(3)?;
    let metadata: Option<ChunkMetadata> =
        metadata_str.and_then(|s| serde_json::from_str(&s).ok());

    Ok(SearchResult {
        chunk_id: row.get(0)?,
        chunk_index: row.get::<_, i64>(1)? as usize,
        content: row.get(2)?,
        metadata,
        score: 0.0,
    })
}
