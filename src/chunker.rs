use crate::models::{Chunk, ChunkMetadata};
use crate::pdf_parser::LoadedDocument;
use anyhow::{bail, Result};
use std::collections::VecDeque;

pub const DEFAULT_CHUNK_SIZE: usize = 500; // characters
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;

/// Tried in order; the empty separator splits into single characters.
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Recursive character splitter
///
/// Key principles:
/// 1. Prefer paragraph boundaries, then lines, then words, then characters
/// 2. Never emit a chunk longer than `chunk_size` characters
/// 3. Carry up to `chunk_overlap` characters of context into the next chunk
#[derive(Debug, Clone)]
pub struct RecursiveTextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl RecursiveTextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }
        if chunk_overlap >= chunk_size {
            bail!(
                "chunk overlap ({}) must be smaller than chunk size ({})",
                chunk_overlap,
                chunk_size
            );
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split text into trimmed, non-empty chunks in document order
    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let mut separator = "";
        let mut remaining: &[&str] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() || text.contains(sep) {
                separator = sep;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            if piece.chars().count() < self.chunk_size {
                pending.push(piece);
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge_splits(&pending));
                pending.clear();
            }

            if remaining.is_empty() {
                let piece = piece.trim();
                if !piece.is_empty() {
                    chunks.push(piece.to_string());
                }
            } else {
                chunks.extend(self.split_recursive(piece, remaining));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge_splits(&pending));
        }

        chunks
    }

    /// Greedily pack small pieces into chunks, keeping a tail of the previous
    /// chunk (at most `chunk_overlap` characters) as the start of the next one.
    fn merge_splits(&self, splits: &[&str]) -> Vec<String> {
        let mut merged = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0;

        for split in splits {
            let len = split.chars().count();

            if total + len > self.chunk_size && !window.is_empty() {
                push_joined(&mut merged, &window);

                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    match window.pop_front() {
                        Some((_, first_len)) => total -= first_len,
                        None => break,
                    }
                }
            }

            window.push_back((split, len));
            total += len;
        }

        push_joined(&mut merged, &window);
        merged
    }
}

impl Default for RecursiveTextSplitter {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

fn push_joined(out: &mut Vec<String>, window: &VecDeque<(&str, usize)>) {
    let joined: String = window.iter().map(|(s, _)| *s).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

/// Split on `separator`, attaching each separator to the piece that follows it.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    if separator.is_empty() {
        return text
            .char_indices()
            .map(|(i, c)| &text[i..i + c.len_utf8()])
            .collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(&text[start..idx]);
        }
        start = idx;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces.retain(|p| !p.is_empty());
    pieces
}

/// Split a loaded document into ordered chunks. Form feeds are treated as page
/// breaks, and no chunk spans two pages.
pub fn chunk_document(
    document: &LoadedDocument,
    source: &str,
    splitter: &RecursiveTextSplitter,
) -> Vec<Chunk> {
    let now = chrono::Utc::now().timestamp();

    let chunks: Vec<Chunk> = document
        .text
        .split('\u{c}')
        .flat_map(|page| splitter.split_text(page))
        .enumerate()
        .map(|(index, content)| Chunk {
            index,
            content,
            metadata: Some(ChunkMetadata {
                source: source.to_string(),
                chunk_type: document.kind.to_string(),
                page_count: document.page_count,
            }),
            created_at: now,
        })
        .collect();

    log::info!("Created {} chunks from {}", chunks.len(), source);

    chunks
}
