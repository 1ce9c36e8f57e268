use crate::models::Chunk;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Metadata stored alongside each index generation
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub generation: u64,
    pub source: String,
    /// SHA-256 of the source file bytes and the splitter settings
    pub fingerprint: String,
    pub chunk_count: usize,
    pub has_embeddings: bool,
    pub created_at: i64,
}

/// Path of the SQLite file holding a given index generation
pub fn generation_path(index_dir: &Path, generation: u64) -> PathBuf {
    index_dir.join(format!("index-{}.db", generation))
}

/// Create a fresh index database, replacing any file already at `db_path`
pub fn init_database(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create index directory {:?}", parent))?;
    }

    for suffix in ["", "-journal"] {
        let mut stale = db_path.as_os_str().to_owned();
        stale.push(suffix);
        let stale = PathBuf::from(stale);
        if stale.exists() {
            std::fs::remove_file(&stale)
                .with_context(|| format!("Failed to remove stale index {:?}", stale))?;
        }
    }

    // Write-once, read-many: the default rollback journal keeps each
    // generation a single file.
    let conn = Connection::open(db_path).context("Failed to open database")?;

    create_schema(&conn)?;

    log::debug!("Index database initialized at {:?}", db_path);
    Ok(conn)
}

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS index_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            generation INTEGER NOT NULL,
            source TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            chunk_count INTEGER NOT NULL,
            has_embeddings INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            metadata TEXT, -- JSON: {source, chunk_type, page_count}
            embedding BLOB, -- little-endian f32 array
            created_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            content,
            tokenize = 'porter unicode61'
        )",
        [],
    )?;

    // Keep FTS5 in sync with the chunks table
    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
            INSERT INTO chunks_fts(rowid, content) VALUES (new.id, new.content);
        END",
        [],
    )?;

    conn.execute(
        "CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
            DELETE FROM chunks_fts WHERE rowid = old.id;
        END",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_chunks_index ON chunks(chunk_index)",
        [],
    )?;

    Ok(())
}

/// Open an existing index database
pub fn get_connection(db_path: &Path) -> Result<Connection> {
    if !db_path.exists() {
        anyhow::bail!("Index database not found at {:?}", db_path);
    }
    Connection::open(db_path).context("Failed to open database connection")
}

/// Insert chunks (and their embeddings, when present) in one transaction
pub fn insert_chunks(
    conn: &mut Connection,
    chunks: &[Chunk],
    embeddings: Option<&[Vec<f32>]>,
) -> Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO chunks (chunk_index, content, metadata, embedding, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )?;

        for (idx, chunk) in chunks.iter().enumerate() {
            let metadata_json = serde_json::to_string(&chunk.metadata).ok();
            let embedding_blob = embeddings
                .and_then(|e| e.get(idx))
                .map(|e| f32_vec_to_bytes(e));

            stmt.execute(params![
                chunk.index as i64,
                chunk.content,
                metadata_json,
                embedding_blob,
                chunk.created_at,
            ])
            .context("Failed to insert chunk")?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn write_meta(conn: &Connection, meta: &IndexMeta) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO index_meta
            (id, generation, source, fingerprint, chunk_count, has_embeddings, created_at)
         VALUES (1, ?, ?, ?, ?, ?, ?)",
        params![
            meta.generation as i64,
            meta.source,
            meta.fingerprint,
            meta.chunk_count as i64,
            meta.has_embeddings as i32,
            meta.created_at,
        ],
    )?;
    Ok(())
}

pub fn read_meta(conn: &Connection) -> Result<Option<IndexMeta>> {
    let meta = conn
        .query_row(
            "SELECT generation, source, fingerprint, chunk_count, has_embeddings, created_at
             FROM index_meta WHERE id = 1",
            [],
            |row| {
                Ok(IndexMeta {
                    generation: row.get::<_, i64>(0)? as u64,
                    source: row.get(1)?,
                    fingerprint: row.get(2)?,
                    chunk_count: row.get::<_, i64>(3)? as usize,
                    has_embeddings: row.get::<_, i32>(4)? != 0,
                    created_at: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(meta)
}

/// Newest index generation persisted in `index_dir`, if any
pub fn latest_generation(index_dir: &Path) -> Result<Option<(u64, PathBuf)>> {
    if !index_dir.exists() {
        return Ok(None);
    }

    let mut latest: Option<u64> = None;
    for entry in std::fs::read_dir(index_dir)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        let generation = name
            .strip_prefix("index-")
            .and_then(|rest| rest.strip_suffix(".db"))
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(generation) = generation {
            latest = Some(latest.map_or(generation, |g| g.max(generation)));
        }
    }

    Ok(latest.map(|g| (g, generation_path(index_dir, g))))
}

/// Remove every index generation in `index_dir` except `keep`.
/// Returns the number of files removed.
pub fn prune_generations(index_dir: &Path, keep: u64) -> Result<usize> {
    let keep_name = format!("index-{}.db", keep);
    let mut removed = 0;

    for entry in std::fs::read_dir(index_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();

        // Also catches leftover -journal files of old generations
        if !name.starts_with("index-") || name.starts_with(&keep_name) {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                removed += 1;
                log::debug!("Removed stale index file: {}", name);
            }
            Err(e) => log::warn!("Failed to remove stale index file {}: {}", name, e),
        }
    }

    Ok(removed)
}

/// Convert bytes to f32 vector (embedding deserialization)
pub fn bytes_to_f32_vec(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Convert f32 vector to bytes (embedding serialization)
pub fn f32_vec_to_bytes(vec: &[f32]) -> Vec<u8> {
    vec.iter().flat_map(|f| f.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_chunk(index: usize, content: &str) -> Chunk {
        Chunk {
            index,
            content: content.to_string(),
            metadata: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_init_database() {
        let dir = tempdir().unwrap();
        let db_path = generation_path(dir.path(), 1);

        let conn = init_database(&db_path).unwrap();
        assert!(db_path.exists());

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"chunks".to_string()));
        assert!(tables.contains(&"index_meta".to_string()));
        assert!(tables.contains(&"chunks_fts".to_string()));
    }

    #[test]
    fn test_init_database_starts_from_scratch() {
        let dir = tempdir().unwrap();
        let db_path = generation_path(dir.path(), 1);

        let mut conn = init_database(&db_path).unwrap();
        insert_chunks(&mut conn, &[sample_chunk(0, "old content")], None).unwrap();
        drop(conn);

        let conn = init_database(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_insert_chunks_feeds_fts() {
        let dir = tempdir().unwrap();
        let mut conn = init_database(&generation_path(dir.path(), 3)).unwrap();

        let chunks = vec![
            sample_chunk(0, "rust ownership rules"),
            sample_chunk(1, "borrow checker details"),
        ];
        let embeddings = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        insert_chunks(&mut conn, &chunks, Some(&embeddings)).unwrap();

        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks_fts WHERE chunks_fts MATCH 'borrow'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);

        let blob: Vec<u8> = conn
            .query_row("SELECT embedding FROM chunks WHERE chunk_index = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(bytes_to_f32_vec(&blob), vec![0.0, 1.0]);
    }

    #[test]
    fn test_meta_round_trip() {
        let dir = tempdir().unwrap();
        let conn = init_database(&generation_path(dir.path(), 7)).unwrap();

        assert!(read_meta(&conn).unwrap().is_none());

        let meta = IndexMeta {
            generation: 7,
            source: "temp.pdf".to_string(),
            fingerprint: "abc".to_string(),
            chunk_count: 12,
            has_embeddings: false,
            created_at: 1_700_000_000,
        };
        write_meta(&conn, &meta).unwrap();
        assert_eq!(read_meta(&conn).unwrap(), Some(meta));
    }

    #[test]
    fn test_get_connection_missing() {
        let dir = tempdir().unwrap();
        assert!(get_connection(&dir.path().join("nope.db")).is_err());
    }

    #[test]
    fn test_prune_generations() {
        let dir = tempdir().unwrap();
        for generation in 1..=3 {
            init_database(&generation_path(dir.path(), generation)).unwrap();
        }
        std::fs::write(dir.path().join("unrelated.txt"), "keep me").unwrap();

        let removed = prune_generations(dir.path(), 3).unwrap();
        assert!(removed >= 2);

        assert!(!generation_path(dir.path(), 1).exists());
        assert!(!generation_path(dir.path(), 2).exists());
        assert!(generation_path(dir.path(), 3).exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_latest_generation() {
        let dir = tempdir().unwrap();
        assert_eq!(latest_generation(&dir.path().join("absent")).unwrap(), None);
        assert_eq!(latest_generation(dir.path()).unwrap(), None);

        for generation in [2, 10, 9] {
            init_database(&generation_path(dir.path(), generation)).unwrap();
        }
        std::fs::write(dir.path().join("index-notes.db"), "").unwrap();

        assert_eq!(
            latest_generation(dir.path()).unwrap(),
            Some((10, generation_path(dir.path(), 10)))
        );
    }

    #[test]
    fn test_f32_serialization() {
        let original = vec![1.0, 2.5, -3.7, 0.0, 100.5];
        let bytes = f32_vec_to_bytes(&original);
        assert_eq!(bytes.len(), original.len() * 4);
        assert_eq!(bytes_to_f32_vec(&bytes), original);

        assert!(bytes_to_f32_vec(&[]).is_empty());
    }
}
